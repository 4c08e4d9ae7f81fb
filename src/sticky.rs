//! Sticky sessions
//!
//! A [`StickySession`] routes its first request normally and captures the
//! [`StickyTarget`] stamped on the response. Every later request of the
//! session carries that target and goes straight to the same host.
//!
//! Requests issued while the first one is still in flight wait for it
//! instead of racing their own discoveries. If the discovery fails or is
//! cancelled the session goes back to unpinned and exactly one waiter
//! becomes the next discoverer.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::sync::{Arc, Mutex};
use switchyard_observability::RoutingMetrics;
use tokio::sync::oneshot;
use tracing::debug;

use crate::channel::{Channel, ResponseFuture};
use crate::request::{Endpoint, Request, StickyTarget};
use crate::sync::lock;

type PendingDiscovery = Shared<BoxFuture<'static, ()>>;

enum SessionState {
    Unpinned,
    Discovering(PendingDiscovery),
    Pinned(StickyTarget),
}

/// What a request does next, decided under the session lock
enum Step {
    Pinned(StickyTarget),
    Wait(PendingDiscovery),
    Discover(Discovery),
}

struct SessionInner {
    delegate: Arc<dyn Channel>,
    channel_name: Arc<str>,
    metrics: Arc<RoutingMetrics>,
    state: Mutex<SessionState>,
}

impl SessionInner {
    fn next_step(self: &Arc<Self>) -> Step {
        let mut state = lock(&self.state);
        match &*state {
            SessionState::Pinned(target) => Step::Pinned(target.clone()),
            SessionState::Discovering(pending) => Step::Wait(pending.clone()),
            SessionState::Unpinned => {
                let (done, finished) = oneshot::channel::<()>();
                let pending = finished.map(|_| ()).boxed().shared();
                *state = SessionState::Discovering(pending);
                Step::Discover(Discovery {
                    inner: Arc::clone(self),
                    done: Some(done),
                })
            }
        }
    }
}

/// The one in-flight request that decides a session's host.
///
/// Dropping it without [`Discovery::finish`] returns the session to
/// unpinned and wakes the waiters.
struct Discovery {
    inner: Arc<SessionInner>,
    done: Option<oneshot::Sender<()>>,
}

impl Discovery {
    fn finish(mut self, target: Option<StickyTarget>) {
        let inner = &self.inner;
        let result = match target {
            Some(target) => {
                debug!(
                    channel = %inner.channel_name,
                    host = %target.host(),
                    "Sticky session pinned"
                );
                *lock(&inner.state) = SessionState::Pinned(target);
                "pinned"
            }
            None => {
                debug!(channel = %inner.channel_name, "Sticky discovery failed, unpinning");
                *lock(&inner.state) = SessionState::Unpinned;
                "failed"
            }
        };
        inner.metrics.record_sticky_discovery(&inner.channel_name, result);
        self.done.take();
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        if self.done.is_none() {
            return;
        }
        *lock(&self.inner.state) = SessionState::Unpinned;
        self.inner
            .metrics
            .record_sticky_discovery(&self.inner.channel_name, "cancelled");
        debug!(channel = %self.inner.channel_name, "Sticky discovery cancelled");
    }
}

/// A sequence of requests bound to one host
#[derive(Clone)]
pub struct StickySession {
    inner: Arc<SessionInner>,
}

impl StickySession {
    /// Host this session is bound to, once discovered
    pub fn target(&self) -> Option<StickyTarget> {
        match &*lock(&self.inner.state) {
            SessionState::Pinned(target) => Some(target.clone()),
            _ => None,
        }
    }
}

impl Channel for StickySession {
    fn execute(&self, endpoint: &Endpoint, mut request: Request) -> ResponseFuture {
        let inner = Arc::clone(&self.inner);
        let endpoint = endpoint.clone();
        async move {
            loop {
                match inner.next_step() {
                    Step::Pinned(target) => {
                        request.attachments_mut().insert(target);
                        return inner.delegate.execute(&endpoint, request).await;
                    }
                    Step::Wait(pending) => pending.await,
                    Step::Discover(discovery) => {
                        let result = inner.delegate.execute(&endpoint, request).await;
                        let target = result
                            .as_ref()
                            .ok()
                            .and_then(|response| response.sticky_target().cloned());
                        discovery.finish(target);
                        return result;
                    }
                }
            }
        }
        .boxed()
    }
}

impl fmt::Debug for StickySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StickySession")
            .field("channel_name", &self.inner.channel_name)
            .field("target", &self.target())
            .finish()
    }
}

/// Factory for sticky sessions over one service channel
#[derive(Clone)]
pub struct StickyChannels {
    delegate: Arc<dyn Channel>,
    channel_name: Arc<str>,
    metrics: Arc<RoutingMetrics>,
}

impl StickyChannels {
    pub fn new(
        delegate: Arc<dyn Channel>,
        channel_name: impl Into<Arc<str>>,
        metrics: Arc<RoutingMetrics>,
    ) -> Self {
        Self {
            delegate,
            channel_name: channel_name.into(),
            metrics,
        }
    }

    /// Start a new, unpinned session
    pub fn session(&self) -> StickySession {
        StickySession {
            inner: Arc::new(SessionInner {
                delegate: Arc::clone(&self.delegate),
                channel_name: Arc::clone(&self.channel_name),
                metrics: Arc::clone(&self.metrics),
                state: Mutex::new(SessionState::Unpinned),
            }),
        }
    }
}

impl fmt::Debug for StickyChannels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StickyChannels")
            .field("channel_name", &self.channel_name)
            .finish()
    }
}
