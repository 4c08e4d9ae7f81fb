/*!
 * End-to-end routing tests over an in-memory transport
 *
 * These tests drive a full `ServiceChannel` and verify:
 * - Pin-until-error host movement (5xx moves the pin, 429 does not)
 * - Fair queuing across routing keys when hosts are saturated
 * - Queue overflow and cancellation of queued requests
 * - Sticky session discovery under concurrency
 * - Live reload keeping per-host limiter state
 * - Panic containment and metrics export
 */

use futures::FutureExt;
use http::{Method, StatusCode};
use prometheus::Registry;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use switchyard::logging::init_test_logging;
use switchyard::prelude::*;
use switchyard::{LimiterConfig, LimiterKind, NodeSelectionStrategy, ResponseFuture};
use switchyard_observability::RoutingMetrics;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

/// What the next request served by any host will see
#[derive(Debug, Clone, Copy)]
enum Outcome {
    Status(u16),
    ConnectionReset,
    Panic,
}

/// Shared state behind every host transport of one test
#[derive(Default)]
struct Backend {
    script: Mutex<VecDeque<Outcome>>,
    served: Mutex<Vec<(String, String)>>,
    gate: Option<Arc<Semaphore>>,
}

impl Backend {
    fn immediate() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Default::default()
        })
    }

    fn script(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    /// Host URI of every transport call, in order
    fn hosts(&self) -> Vec<String> {
        self.served.lock().unwrap().iter().map(|(h, _)| h.clone()).collect()
    }

    /// Request body of every transport call, in order
    fn bodies(&self) -> Vec<String> {
        self.served.lock().unwrap().iter().map(|(_, b)| b.clone()).collect()
    }

    fn factory(self: &Arc<Self>) -> impl ChannelFactory + 'static {
        let backend = Arc::clone(self);
        move |uri: &str| -> switchyard::Result<Arc<dyn Channel>> {
            Ok(Arc::new(HostTransport {
                uri: uri.to_string(),
                backend: Arc::clone(&backend),
            }))
        }
    }
}

struct HostTransport {
    uri: String,
    backend: Arc<Backend>,
}

impl Channel for HostTransport {
    fn execute(&self, _: &Endpoint, request: Request) -> ResponseFuture {
        let body = String::from_utf8_lossy(request.body()).into_owned();
        self.backend
            .served
            .lock()
            .unwrap()
            .push((self.uri.clone(), body));
        let outcome = self
            .backend
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Status(200));
        if let Outcome::Panic = outcome {
            panic!("transport for {} blew up", self.uri);
        }

        let gate = self.backend.gate.clone();
        async move {
            if let Some(gate) = gate {
                gate.acquire().await.unwrap().forget();
            }
            match outcome {
                Outcome::Status(code) => Ok(Response::new(StatusCode::from_u16(code).unwrap())),
                _ => Err(RoutingError::Transport("connection reset".into())),
            }
        }
        .boxed()
    }
}

fn uris(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| format!("https://{}.internal", n)).collect()
}

fn endpoint() -> Endpoint {
    Endpoint::new("ledger", "post", Method::POST)
}

/// One request at a time per host
fn single_slot() -> LimiterConfig {
    LimiterConfig {
        kind: LimiterKind::Aimd,
        initial_limit: 1.0,
        min_limit: 1.0,
        max_limit: 1.0,
        ..Default::default()
    }
}

fn service(config: ServiceConfig, backend: &Arc<Backend>) -> ServiceChannel {
    init_test_logging();
    let context = RoutingContext::current().unwrap().with_seed(42);
    ServiceChannel::new(config, context, backend.factory()).unwrap()
}

#[tokio::test]
async fn test_pin_moves_once_after_server_error() {
    let backend = Backend::immediate();
    let mut config = ServiceConfig::new("ledger", uris(&["a", "b", "c"]));
    config.node_selection_strategy = NodeSelectionStrategy::PinUntilErrorNoReshuffle;
    let service = service(config, &backend);

    backend.script([
        Outcome::Status(200),
        Outcome::Status(200),
        Outcome::Status(500),
        Outcome::Status(200),
    ]);
    for _ in 0..4 {
        let _ = service.execute(&endpoint(), Request::new()).await;
    }

    let hosts = backend.hosts();
    assert_eq!(hosts[0], hosts[1]);
    assert_eq!(hosts[1], hosts[2]);
    assert_ne!(hosts[3], hosts[2], "the 500 moves the pin exactly once");
}

#[tokio::test]
async fn test_rate_limited_host_keeps_pin() {
    let backend = Backend::immediate();
    let service = service(ServiceConfig::new("ledger", uris(&["a", "b", "c"])), &backend);

    backend.script(std::iter::repeat(Outcome::Status(429)).take(6));
    for _ in 0..6 {
        let response = service.execute(&endpoint(), Request::new()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    let hosts = backend.hosts();
    assert!(hosts.iter().all(|h| h == &hosts[0]), "429 never moves the pin: {:?}", hosts);
}

#[tokio::test]
async fn test_transport_failure_moves_pin() {
    let backend = Backend::immediate();
    let service = service(ServiceConfig::new("ledger", uris(&["a", "b"])), &backend);

    backend.script([Outcome::ConnectionReset]);
    let result = service.execute(&endpoint(), Request::new()).await;
    assert!(matches!(result, Err(RoutingError::Transport(_))));
    service.execute(&endpoint(), Request::new()).await.unwrap();

    let hosts = backend.hosts();
    assert_ne!(hosts[0], hosts[1]);
}

#[tokio::test]
async fn test_routing_keys_share_capacity_fairly() {
    let backend = Backend::gated();
    let mut config = ServiceConfig::new("ledger", uris(&["a"]));
    config.limiter = single_slot();
    let service = service(config, &backend);

    let blocker = service.execute(&endpoint(), Request::with_body("blocker"));
    let mut waiting = Vec::new();
    for m in 0..2 {
        for key in ["tenant-a", "tenant-b", "tenant-c"] {
            let request =
                Request::with_body(format!("{}/{}", key, m)).with_routing_key(RoutingKey::new(key));
            waiting.push(tokio::spawn(service.execute(&endpoint(), request)));
        }
    }
    assert_eq!(service.queued(), 6);

    backend.release(1);
    blocker.await.unwrap();
    while backend.bodies().len() < 7 {
        backend.release(1);
        tokio::task::yield_now().await;
    }
    backend.release(7);
    for handle in waiting {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(
        backend.bodies(),
        vec![
            "blocker",
            "tenant-a/0",
            "tenant-b/0",
            "tenant-c/0",
            "tenant-a/1",
            "tenant-b/1",
            "tenant-c/1",
        ]
    );
}

#[tokio::test]
async fn test_full_queue_fails_fast() {
    let backend = Backend::gated();
    let mut config = ServiceConfig::new("ledger", uris(&["a"]));
    config.limiter = single_slot();
    config.max_queue_size = 2;
    let service = service(config, &backend);

    let _running = service.execute(&endpoint(), Request::new());
    let _first = service.execute(&endpoint(), Request::new());
    let _second = service.execute(&endpoint(), Request::new());

    let overflow = service.execute(&endpoint(), Request::new()).await;
    match overflow {
        Err(err) => {
            assert!(matches!(err, RoutingError::QueueFull { max_size: 2 }));
            assert!(err.is_capacity_exhausted());
        }
        Ok(_) => panic!("queue should be full"),
    }
}

#[tokio::test]
async fn test_cancelled_queued_request_never_reaches_transport() {
    let backend = Backend::gated();
    let mut config = ServiceConfig::new("ledger", uris(&["a"]));
    config.limiter = single_slot();
    let service = service(config, &backend);

    let blocker = service.execute(&endpoint(), Request::with_body("blocker"));
    let mut abandoned =
        tokio_test::task::spawn(service.execute(&endpoint(), Request::with_body("abandoned")));
    tokio_test::assert_pending!(abandoned.poll());
    drop(abandoned);

    backend.release(1);
    blocker.await.unwrap();
    backend.release(1);
    service
        .execute(&endpoint(), Request::with_body("after"))
        .await
        .unwrap();

    assert_eq!(backend.bodies(), vec!["blocker", "after"]);
    assert_eq!(service.queued(), 0);
}

#[tokio::test]
async fn test_sticky_session_discovers_once() {
    let backend = Backend::gated();
    let mut config = ServiceConfig::new("ledger", uris(&["a", "b", "c"]));
    config.node_selection_strategy = NodeSelectionStrategy::RoundRobin;
    let service = service(config, &backend);
    let session = service.sticky_channels().session();

    let handles: Vec<_> = (0..5)
        .map(|i| tokio::spawn(session.execute(&endpoint(), Request::with_body(i.to_string()))))
        .collect();
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert_eq!(backend.hosts().len(), 1, "one discovery request in flight");

    backend.release(5);
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let hosts = backend.hosts();
    assert_eq!(hosts.len(), 5);
    assert!(hosts.iter().all(|h| h == &hosts[0]));
    assert_eq!(session.target().map(|t| t.uri().to_string()), Some(hosts[0].clone()));
}

#[tokio::test]
async fn test_sticky_target_removed_by_reload() {
    let backend = Backend::immediate();
    let service = service(ServiceConfig::new("ledger", uris(&["a", "b"])), &backend);
    let session = service.sticky_channels().session();

    session.execute(&endpoint(), Request::new()).await.unwrap();
    let pinned = session.target().unwrap().uri().to_string();
    let survivor: Vec<String> = uris(&["a", "b"]).into_iter().filter(|u| u != &pinned).collect();
    service.reload(survivor).unwrap();

    let result = session.execute(&endpoint(), Request::new()).await;
    assert!(matches!(result, Err(RoutingError::StickyTargetGone(uri)) if uri == pinned));
}

#[tokio::test]
async fn test_reload_keeps_limiter_state_of_surviving_hosts() {
    let backend = Backend::immediate();
    let mut config = ServiceConfig::new("ledger", uris(&["a"]));
    config.limiter = LimiterConfig {
        kind: LimiterKind::Aimd,
        initial_limit: 20.0,
        ..Default::default()
    };
    let service = service(config, &backend);

    backend.script([Outcome::Status(503), Outcome::Status(503)]);
    for _ in 0..2 {
        let _ = service.execute(&endpoint(), Request::new()).await;
    }
    let a = "https://a.internal";
    let backed_off = service.host_channel(a).unwrap().limiter().limit();
    assert!(backed_off < 20.0);

    service.reload(uris(&["a", "b"])).unwrap();

    assert_eq!(service.host_channel(a).unwrap().limiter().limit(), backed_off);
    let b = service.host_channel("https://b.internal").unwrap();
    assert_eq!(b.limiter().limit(), 20.0);
    assert_eq!(b.host().index(), 1);
}

#[tokio::test]
async fn test_transport_panic_is_contained() {
    let backend = Backend::immediate();
    let service = service(ServiceConfig::new("ledger", uris(&["a"])), &backend);

    backend.script([Outcome::Panic]);
    let result = service.execute(&endpoint(), Request::new()).await;
    assert!(matches!(result, Err(RoutingError::ChannelPanicked(_))));

    let host = service.host_channel("https://a.internal").unwrap();
    assert_eq!(host.limiter().inflight(), 0);
    service.execute(&endpoint(), Request::new()).await.unwrap();
}

#[tokio::test]
async fn test_metrics_are_exported() {
    let backend = Backend::immediate();
    init_test_logging();
    let registry = Registry::new();
    let context = RoutingContext::new(Handle::current(), &registry).unwrap();
    let service = ServiceChannel::new(
        ServiceConfig::new("ledger", uris(&["a", "b"])),
        context,
        backend.factory(),
    )
    .unwrap();

    service.execute(&endpoint(), Request::new()).await.unwrap();

    let text = switchyard_observability::metrics_text(&registry).unwrap();
    assert!(text.contains("switchyard_requests_total"));
    assert!(text.contains("channel=\"ledger\""));
    assert!(text.contains("outcome=\"success\""));
}

#[tokio::test]
async fn test_services_share_one_metrics_registry() {
    init_test_logging();
    let backend = Backend::immediate();
    let registry = Registry::new();
    let metrics = Arc::new(RoutingMetrics::new(&registry).unwrap());

    let services: Vec<ServiceChannel> = ["ledger", "audit"]
        .iter()
        .map(|name| {
            let context = RoutingContext::current()
                .unwrap()
                .with_metrics(Arc::clone(&metrics));
            ServiceChannel::new(
                ServiceConfig::new(*name, uris(&[*name])),
                context,
                backend.factory(),
            )
            .unwrap()
        })
        .collect();

    for service in &services {
        service.execute(&endpoint(), Request::new()).await.unwrap();
    }

    let text = switchyard_observability::metrics_text(&registry).unwrap();
    assert!(text.contains("channel=\"ledger\""));
    assert!(text.contains("channel=\"audit\""));
}
