//! Channel abstractions
//!
//! A [`Channel`] always accepts a request and returns a future of its
//! response. A [`LimitedChannel`] may refuse a request when it has no
//! capacity, handing the request back so the caller can try elsewhere or
//! queue it. Every routing component is one of these two and wraps another.
//!
//! ```text
//!   Channel            LimitedChannel            LimitedChannel        Channel
//! QueuedChannel ──▶ NodeSelectionChannel ──▶ ConcurrencyLimited ──▶ NeverFail ──▶ transport
//! ```

use futures::future::{self, BoxFuture, FutureExt};
use pin_project::{pin_project, pinned_drop};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use switchyard_observability::RoutingMetrics;
use tracing::error;

use crate::error::RoutingError;
use crate::request::{Endpoint, Request, Response};

/// In-flight response
pub type ResponseFuture = BoxFuture<'static, Result<Response, RoutingError>>;

/// A request sink that always accepts
pub trait Channel: Send + Sync {
    fn execute(&self, endpoint: &Endpoint, request: Request) -> ResponseFuture;
}

impl<C: Channel + ?Sized> Channel for Arc<C> {
    fn execute(&self, endpoint: &Endpoint, request: Request) -> ResponseFuture {
        (**self).execute(endpoint, request)
    }
}

/// Outcome of offering a request to a [`LimitedChannel`]
pub enum Admission {
    /// The request was dispatched
    Admitted(ResponseFuture),
    /// No capacity; ownership of the request is returned
    Refused(Request),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Admission::Admitted(_) => f.write_str("Admitted"),
            Admission::Refused(_) => f.write_str("Refused"),
        }
    }
}

/// A request sink that may refuse for lack of capacity
pub trait LimitedChannel: Send + Sync {
    fn maybe_execute(&self, endpoint: &Endpoint, request: Request) -> Admission;
}

impl<C: LimitedChannel + ?Sized> LimitedChannel for Arc<C> {
    fn maybe_execute(&self, endpoint: &Endpoint, request: Request) -> Admission {
        (**self).maybe_execute(endpoint, request)
    }
}

/// Classification of a completed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// 1xx, 2xx, 3xx
    Success,
    /// 4xx other than 429
    ClientError,
    /// 429
    TooManyRequests,
    /// 503
    Unavailable,
    /// Any other 5xx
    ServerError,
    /// The transport returned an error instead of a response
    TransportFailure,
}

impl ResponseClass {
    pub fn of(result: &Result<Response, RoutingError>) -> Self {
        match result {
            Ok(response) => Self::from_status(response.status()),
            Err(_) => ResponseClass::TransportFailure,
        }
    }

    pub fn from_status(status: http::StatusCode) -> Self {
        match status.as_u16() {
            429 => ResponseClass::TooManyRequests,
            503 => ResponseClass::Unavailable,
            code if code >= 500 => ResponseClass::ServerError,
            code if code >= 400 => ResponseClass::ClientError,
            _ => ResponseClass::Success,
        }
    }

    /// Server asked the client to slow down (429, 503)
    pub fn is_qos(self) -> bool {
        matches!(
            self,
            ResponseClass::TooManyRequests | ResponseClass::Unavailable
        )
    }

    /// The host itself failed: 5xx (including 503) or a transport error.
    /// 429 is excluded.
    pub fn is_server_failure(self) -> bool {
        matches!(
            self,
            ResponseClass::ServerError
                | ResponseClass::Unavailable
                | ResponseClass::TransportFailure
        )
    }

    /// Metric label value
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseClass::Success => "success",
            ResponseClass::ClientError => "client_error",
            ResponseClass::TooManyRequests => "too_many_requests",
            ResponseClass::Unavailable => "unavailable",
            ResponseClass::ServerError => "server_error",
            ResponseClass::TransportFailure => "transport_failure",
        }
    }
}

impl fmt::Display for ResponseClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream host identity.
///
/// `index` is the host's position in the service when it joined; it names
/// the host in metrics and stays fixed across reloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostInfo {
    uri: Arc<str>,
    index: usize,
}

impl HostInfo {
    pub fn new(uri: impl Into<Arc<str>>, index: usize) -> Self {
        Self {
            uri: uri.into(),
            index,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn shared_uri(&self) -> Arc<str> {
        Arc::clone(&self.uri)
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.uri, self.index)
    }
}

/// A selectable upstream: host identity plus its limited channel
#[derive(Clone)]
pub struct HostChannel {
    host: HostInfo,
    channel: Arc<dyn LimitedChannel>,
}

impl HostChannel {
    pub fn new(host: HostInfo, channel: Arc<dyn LimitedChannel>) -> Self {
        Self { host, channel }
    }

    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    pub fn uri(&self) -> &str {
        self.host.uri()
    }

    pub fn channel(&self) -> &Arc<dyn LimitedChannel> {
        &self.channel
    }

    pub fn maybe_execute(&self, endpoint: &Endpoint, request: Request) -> Admission {
        self.channel.maybe_execute(endpoint, request)
    }
}

impl fmt::Debug for HostChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostChannel")
            .field("host", &self.host)
            .finish()
    }
}

/// Future that reports its outcome exactly once.
///
/// The callback receives `Some(result)` when the inner future completes, or
/// `None` when the future is dropped first.
#[pin_project(PinnedDrop)]
pub struct Completion<F, C>
where
    C: FnOnce(Option<&Result<Response, RoutingError>>),
{
    #[pin]
    future: F,
    on_complete: Option<C>,
}

/// Attach a completion callback to `future`
pub fn on_completion<F, C>(future: F, on_complete: C) -> Completion<F, C>
where
    F: Future<Output = Result<Response, RoutingError>>,
    C: FnOnce(Option<&Result<Response, RoutingError>>),
{
    Completion {
        future,
        on_complete: Some(on_complete),
    }
}

impl<F, C> Future for Completion<F, C>
where
    F: Future<Output = Result<Response, RoutingError>>,
    C: FnOnce(Option<&Result<Response, RoutingError>>),
{
    type Output = Result<Response, RoutingError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.future.poll(cx));
        if let Some(on_complete) = this.on_complete.take() {
            on_complete(Some(&result));
        }
        Poll::Ready(result)
    }
}

#[pinned_drop]
impl<F, C> PinnedDrop for Completion<F, C>
where
    C: FnOnce(Option<&Result<Response, RoutingError>>),
{
    fn drop(self: Pin<&mut Self>) {
        if let Some(on_complete) = self.project().on_complete.take() {
            on_complete(None);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Contains panics raised by a transport.
///
/// Panics while building or polling the transport future become
/// [`RoutingError::ChannelPanicked`], so completion bookkeeping upstream
/// always observes an outcome.
pub struct NeverFailChannel {
    delegate: Arc<dyn Channel>,
    channel_name: Arc<str>,
    metrics: Arc<RoutingMetrics>,
}

impl NeverFailChannel {
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

    fn contained(
        channel_name: &str,
        metrics: &RoutingMetrics,
        payload: &(dyn Any + Send),
    ) -> RoutingError {
        let message = panic_message(payload);
        error!(
            channel = channel_name,
            panic = %message,
            "Transport channel panicked"
        );
        metrics.record_channel_panic(channel_name);
        RoutingError::ChannelPanicked(message)
    }
}

impl Channel for NeverFailChannel {
    fn execute(&self, endpoint: &Endpoint, request: Request) -> ResponseFuture {
        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.delegate.execute(endpoint, request)
        })) {
            Ok(future) => future,
            Err(payload) => {
                let err = Self::contained(&self.channel_name, &self.metrics, &*payload);
                return future::ready(Err(err)).boxed();
            }
        };

        let channel_name = Arc::clone(&self.channel_name);
        let metrics = Arc::clone(&self.metrics);
        AssertUnwindSafe(future)
            .catch_unwind()
            .map(move |outcome| match outcome {
                Ok(result) => result,
                Err(payload) => Err(Self::contained(&channel_name, &metrics, &*payload)),
            })
            .boxed()
    }
}

impl fmt::Debug for NeverFailChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NeverFailChannel")
            .field("channel_name", &self.channel_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn endpoint() -> Endpoint {
        Endpoint::new("svc", "op", Method::GET)
    }

    struct PanicsOnExecute;

    impl Channel for PanicsOnExecute {
        fn execute(&self, _: &Endpoint, _: Request) -> ResponseFuture {
            panic!("boom on execute");
        }
    }

    struct PanicsOnPoll;

    impl Channel for PanicsOnPoll {
        fn execute(&self, _: &Endpoint, _: Request) -> ResponseFuture {
            future::lazy(|_| -> Result<Response, RoutingError> {
                panic!("{}", String::from("boom on poll"))
            })
            .boxed()
        }
    }

    struct AlwaysOk;

    impl Channel for AlwaysOk {
        fn execute(&self, _: &Endpoint, _: Request) -> ResponseFuture {
            future::ready(Ok(Response::ok())).boxed()
        }
    }

    #[test]
    fn test_classification() {
        let cases = [
            (200, ResponseClass::Success),
            (204, ResponseClass::Success),
            (302, ResponseClass::Success),
            (400, ResponseClass::ClientError),
            (404, ResponseClass::ClientError),
            (429, ResponseClass::TooManyRequests),
            (500, ResponseClass::ServerError),
            (502, ResponseClass::ServerError),
            (503, ResponseClass::Unavailable),
        ];
        for (code, expected) in cases {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(ResponseClass::from_status(status), expected, "status {}", code);
        }

        let failed: Result<Response, RoutingError> = Err(RoutingError::Transport("reset".into()));
        assert_eq!(ResponseClass::of(&failed), ResponseClass::TransportFailure);
    }

    #[test]
    fn test_failure_predicates() {
        assert!(ResponseClass::TooManyRequests.is_qos());
        assert!(ResponseClass::Unavailable.is_qos());
        assert!(!ResponseClass::ServerError.is_qos());

        assert!(ResponseClass::Unavailable.is_server_failure());
        assert!(ResponseClass::TransportFailure.is_server_failure());
        assert!(!ResponseClass::TooManyRequests.is_server_failure());
        assert!(!ResponseClass::ClientError.is_server_failure());
    }

    #[tokio::test]
    async fn test_panic_on_execute_is_contained() {
        let channel = NeverFailChannel::new(
            Arc::new(PanicsOnExecute),
            "svc",
            RoutingMetrics::detached(),
        );
        let result = channel.execute(&endpoint(), Request::new()).await;
        match result {
            Err(RoutingError::ChannelPanicked(message)) => assert_eq!(message, "boom on execute"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_on_poll_is_contained() {
        let metrics = RoutingMetrics::detached();
        let channel = NeverFailChannel::new(Arc::new(PanicsOnPoll), "svc", Arc::clone(&metrics));
        let result = channel.execute(&endpoint(), Request::new()).await;
        match result {
            Err(RoutingError::ChannelPanicked(message)) => assert_eq!(message, "boom on poll"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_healthy_channel_passes_through() {
        let channel = NeverFailChannel::new(Arc::new(AlwaysOk), "svc", RoutingMetrics::detached());
        let response = channel.execute(&endpoint(), Request::new()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_completion_reports_result_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let future = on_completion(future::ready(Ok(Response::ok())), move |outcome| {
            assert!(matches!(outcome, Some(Ok(_))));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        future.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_completion_reports_cancellation() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&cancelled);
        let future = on_completion(future::pending(), move |outcome| {
            assert!(outcome.is_none());
            seen.fetch_add(1, Ordering::SeqCst);
        });

        drop(future);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }
}
