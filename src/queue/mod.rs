//! Queuing in front of node selection
//!
//! [`QueuedChannel`] turns a [`LimitedChannel`] into a [`Channel`]: requests
//! that cannot be dispatched right away wait in a bounded [`FairQueue`] and
//! are scheduled as capacity frees up.
//!
//! Scheduling is triggered after every enqueue and whenever a dispatched
//! request completes or is dropped. Concurrent triggers coalesce through a
//! counter: the first caller drains, later callers only bump the counter and
//! return, and the draining caller loops until the counter is unchanged
//! across a full drain.
//!
//! Producers reserve a slot in an atomic size counter and append to a
//! staging list. Only the draining caller touches the [`FairQueue`], moving
//! staged requests into it before each drain, so producers never wait on a
//! drain in progress.

pub mod fair;

use futures::future::{self, FutureExt};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchyard_core_resilience::SharedClock;
use switchyard_observability::QueueMetrics;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn, Instrument, Span};

pub use fair::{Attempt, DrainStats, FairQueue, QueueKey};

use crate::channel::{on_completion, Admission, Channel, LimitedChannel, ResponseFuture};
use crate::context::RoutingContext;
use crate::error::RoutingError;
use crate::request::{Endpoint, Request, Response};
use crate::sync::lock;

/// A request waiting for capacity
struct DeferredCall {
    endpoint: Endpoint,
    request: Request,
    response: oneshot::Sender<Result<Response, RoutingError>>,
    enqueued_at: u64,
    span: Span,
}

struct QueueInner {
    channel_name: Arc<str>,
    delegate: Arc<dyn LimitedChannel>,
    /// Touched only by the caller currently draining
    queue: Mutex<FairQueue<DeferredCall>>,
    staged: Mutex<VecDeque<(QueueKey, DeferredCall)>>,
    /// Staged plus queued requests
    size: AtomicUsize,
    schedule_requests: AtomicUsize,
    max_size: usize,
    clock: SharedClock,
    runtime: Handle,
    metrics: QueueMetrics,
}

impl QueueInner {
    /// Run scheduling rounds, or hand the work to the caller already doing so
    fn schedule(self: &Arc<Self>) {
        if self.schedule_requests.fetch_add(1, Ordering::AcqRel) > 0 {
            return;
        }
        let mut observed = 1;
        loop {
            self.drain();
            match self.schedule_requests.compare_exchange(
                observed,
                0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => observed = current,
            }
        }
    }

    fn drain(self: &Arc<Self>) {
        let mut queue = lock(&self.queue);
        let staged = std::mem::take(&mut *lock(&self.staged));
        for (key, call) in staged {
            // The size reservation keeps the queue within its bound
            if let Err(call) = queue.push(key, call) {
                self.size.fetch_sub(1, Ordering::AcqRel);
                call.span
                    .in_scope(|| warn!("Queue over capacity while staging, dropping request"));
            }
        }
        if queue.is_empty() {
            return;
        }

        let stats = queue.run_rounds(|call| self.try_dispatch(call));
        let resolved = stats.dispatched + stats.discarded;
        let size = self.size.fetch_sub(resolved, Ordering::AcqRel) - resolved;
        self.metrics.set_queued(size);

        if resolved > 0 {
            debug!(
                channel = %self.channel_name,
                dispatched = stats.dispatched,
                discarded = stats.discarded,
                remaining = queue.len(),
                "Drained request queue"
            );
        }
    }

    fn try_dispatch(self: &Arc<Self>, call: DeferredCall) -> Attempt<DeferredCall> {
        if call.response.is_closed() {
            self.metrics.record_rejection("cancelled");
            call.span.in_scope(|| debug!("Caller went away while queued, discarding"));
            return Attempt::Discarded;
        }

        let DeferredCall {
            endpoint,
            request,
            mut response,
            enqueued_at,
            span,
        } = call;

        let future = match self.delegate.maybe_execute(&endpoint, request) {
            Admission::Admitted(future) => future,
            Admission::Refused(request) => {
                return Attempt::Refused(DeferredCall {
                    endpoint,
                    request,
                    response,
                    enqueued_at,
                    span,
                });
            }
        };

        let waited = Duration::from_nanos(self.clock.nanos().saturating_sub(enqueued_at));
        self.metrics.record_queue_time(waited.as_secs_f64());
        span.in_scope(|| debug!(queue_time = ?waited, "Dispatched queued request"));

        let future = self.schedule_on_completion(future);
        self.runtime.spawn(
            async move {
                tokio::select! {
                    result = future => {
                        let _ = response.send(result);
                    }
                    _ = response.closed() => {
                        debug!("Caller went away after dispatch, cancelling request");
                    }
                }
            }
            .instrument(span),
        );
        Attempt::Dispatched
    }

    fn schedule_on_completion(self: &Arc<Self>, future: ResponseFuture) -> ResponseFuture {
        let inner = Arc::clone(self);
        on_completion(future, move |_| inner.schedule()).boxed()
    }

    fn enqueue(self: &Arc<Self>, endpoint: &Endpoint, request: Request) -> ResponseFuture {
        let (tx, rx) = oneshot::channel();
        let key = QueueKey::for_request(&request);
        let span = tracing::debug_span!(
            "queued_request",
            channel = %self.channel_name,
            endpoint = %endpoint,
            key = %key,
        );
        let call = DeferredCall {
            endpoint: endpoint.clone(),
            request,
            response: tx,
            enqueued_at: self.clock.nanos(),
            span,
        };

        let reserved = self
            .size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
                (size < self.max_size).then_some(size + 1)
            });
        let Ok(previous) = reserved else {
            warn!(
                channel = %self.channel_name,
                max_size = self.max_size,
                "Request queue is full, rejecting request"
            );
            self.metrics.record_rejection("queue_full");
            return future::ready(Err(RoutingError::QueueFull {
                max_size: self.max_size,
            }))
            .boxed();
        };
        lock(&self.staged).push_back((key, call));
        self.metrics.set_queued(previous + 1);

        self.schedule();
        rx.map(|received| received.unwrap_or(Err(RoutingError::Cancelled)))
            .boxed()
    }
}

/// Bounded fair queue in front of a [`LimitedChannel`]
#[derive(Clone)]
pub struct QueuedChannel {
    inner: Arc<QueueInner>,
}

impl QueuedChannel {
    pub fn new(
        channel_name: impl Into<Arc<str>>,
        delegate: Arc<dyn LimitedChannel>,
        max_size: usize,
        context: &RoutingContext,
    ) -> Self {
        let channel_name = channel_name.into();
        let metrics = context.metrics().queue(&channel_name);
        Self {
            inner: Arc::new(QueueInner {
                channel_name,
                delegate,
                queue: Mutex::new(FairQueue::new(max_size)),
                staged: Mutex::new(VecDeque::new()),
                size: AtomicUsize::new(0),
                schedule_requests: AtomicUsize::new(0),
                max_size,
                clock: context.clock().clone(),
                runtime: context.runtime().clone(),
                metrics,
            }),
        }
    }

    /// Requests currently waiting
    pub fn queued(&self) -> usize {
        self.inner.size.load(Ordering::Acquire)
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// Run a scheduling pass now
    pub fn schedule(&self) {
        self.inner.schedule();
    }
}

impl Channel for QueuedChannel {
    fn execute(&self, endpoint: &Endpoint, request: Request) -> ResponseFuture {
        let inner = &self.inner;
        let request = if inner.size.load(Ordering::Acquire) == 0 {
            match inner.delegate.maybe_execute(endpoint, request) {
                Admission::Admitted(future) => return inner.schedule_on_completion(future),
                Admission::Refused(request) => request,
            }
        } else {
            request
        };
        inner.enqueue(endpoint, request)
    }
}

impl fmt::Debug for QueuedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedChannel")
            .field("channel_name", &self.inner.channel_name)
            .field("queued", &self.inner.size.load(Ordering::Relaxed))
            .field("max_size", &self.inner.max_size)
            .finish()
    }
}
