//! Node selection: which host serves a request
//!
//! [`NodeSelectionChannel`] is the [`LimitedChannel`] that sits between the
//! fair queue and the per-host limited channels. It honours sticky targets,
//! delegates everything else to the configured strategy, and stamps the
//! serving host onto successful responses so sticky sessions can pin to it.

pub mod balanced;
pub mod node_list;
pub mod pin_until_error;

use futures::future::{self, FutureExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

pub use balanced::{BalancedSelector, CLIENT_ERROR_WEIGHT, FAILURE_WEIGHT};
pub use node_list::NodeListKind;
pub use pin_until_error::PinUntilErrorSelector;

use crate::channel::{Admission, HostChannel, HostInfo, LimitedChannel, ResponseClass};
use crate::context::RoutingContext;
use crate::error::RoutingError;
use crate::request::{Endpoint, Request, StickyTarget};
use crate::sync::{read, write};

/// How requests are spread across the hosts of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeSelectionStrategy {
    /// Stick to one host until it fails; reshuffle the order periodically
    #[default]
    PinUntilError,
    /// Stick to one host until it fails; never reshuffle
    PinUntilErrorNoReshuffle,
    /// Score-based balancing across all hosts
    RoundRobin,
}

/// A strategy over a set of hosts
pub trait NodeSelector: Send + Sync + fmt::Debug {
    fn maybe_execute(&self, endpoint: &Endpoint, request: Request) -> Admission;

    /// Replace the host set; state for hosts that remain is kept
    fn update_hosts(&self, hosts: &[HostChannel]);
}

/// Tuning inputs for the selection strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionSettings {
    pub failure_half_life: Duration,
    pub reshuffle_interval: Duration,
    pub reshuffle_jitter: Duration,
}

impl Default for SelectionSettings {
    fn default() -> Self {
        Self {
            failure_half_life: Duration::from_secs(30),
            reshuffle_interval: Duration::from_secs(600),
            reshuffle_jitter: Duration::from_secs(30),
        }
    }
}

/// Stamps the serving host onto successful responses
struct StickyStamping {
    host: HostInfo,
    delegate: Arc<dyn LimitedChannel>,
}

impl LimitedChannel for StickyStamping {
    fn maybe_execute(&self, endpoint: &Endpoint, request: Request) -> Admission {
        match self.delegate.maybe_execute(endpoint, request) {
            Admission::Admitted(future) => {
                let host = self.host.clone();
                Admission::Admitted(
                    future
                        .map(move |result| {
                            result.map(|mut response| {
                                if ResponseClass::from_status(response.status())
                                    == ResponseClass::Success
                                {
                                    response.attachments_mut().insert(StickyTarget::new(host));
                                }
                                response
                            })
                        })
                        .boxed(),
                )
            }
            refused => refused,
        }
    }
}

fn stamped(hosts: Vec<HostChannel>) -> Vec<HostChannel> {
    hosts
        .into_iter()
        .map(|host| {
            let info = host.host().clone();
            HostChannel::new(
                info.clone(),
                Arc::new(StickyStamping {
                    host: info,
                    delegate: Arc::clone(host.channel()),
                }),
            )
        })
        .collect()
}

/// Routes each request to one host of a service
pub struct NodeSelectionChannel {
    channel_name: Arc<str>,
    strategy: NodeSelectionStrategy,
    selector: Box<dyn NodeSelector>,
    hosts: RwLock<Arc<Vec<HostChannel>>>,
}

impl NodeSelectionChannel {
    pub fn new(
        channel_name: impl Into<Arc<str>>,
        strategy: NodeSelectionStrategy,
        hosts: Vec<HostChannel>,
        settings: SelectionSettings,
        context: &RoutingContext,
    ) -> Self {
        let channel_name = channel_name.into();
        let hosts = stamped(hosts);
        let selector: Box<dyn NodeSelector> = match strategy {
            NodeSelectionStrategy::PinUntilError
            | NodeSelectionStrategy::PinUntilErrorNoReshuffle => {
                let kind = if strategy == NodeSelectionStrategy::PinUntilError {
                    NodeListKind::Reshuffling
                } else {
                    NodeListKind::Constant
                };
                Box::new(PinUntilErrorSelector::new(
                    Arc::clone(&channel_name),
                    kind,
                    &hosts,
                    settings.reshuffle_interval,
                    settings.reshuffle_jitter,
                    context.clock().clone(),
                    Arc::clone(context.rng()),
                    Arc::clone(context.metrics()),
                ))
            }
            NodeSelectionStrategy::RoundRobin => Box::new(BalancedSelector::new(
                &hosts,
                context.clock().clone(),
                Arc::clone(context.rng()),
                settings.failure_half_life,
            )),
        };

        info!(
            channel = %channel_name,
            ?strategy,
            hosts = hosts.len(),
            "Created node selection channel"
        );

        Self {
            channel_name,
            strategy,
            selector,
            hosts: RwLock::new(Arc::new(hosts)),
        }
    }

    pub fn strategy(&self) -> NodeSelectionStrategy {
        self.strategy
    }

    pub fn hosts(&self) -> Vec<HostInfo> {
        read(&self.hosts).iter().map(|h| h.host().clone()).collect()
    }

    /// Replace the host set for a live reload
    pub fn update_hosts(&self, hosts: Vec<HostChannel>) {
        let hosts = stamped(hosts);
        self.selector.update_hosts(&hosts);
        *write(&self.hosts) = Arc::new(hosts);
    }
}

impl LimitedChannel for NodeSelectionChannel {
    fn maybe_execute(&self, endpoint: &Endpoint, request: Request) -> Admission {
        let hosts = Arc::clone(&read(&self.hosts));
        if hosts.is_empty() {
            return Admission::Admitted(future::ready(Err(RoutingError::NoHosts)).boxed());
        }

        let sticky = request.sticky_target().map(|target| {
            hosts
                .iter()
                .position(|host| host.uri() == target.uri())
                .ok_or_else(|| target.uri().to_string())
        });
        match sticky {
            Some(Ok(position)) => hosts[position].maybe_execute(endpoint, request),
            Some(Err(uri)) => {
                warn!(
                    channel = %self.channel_name,
                    target = %uri,
                    "Sticky target is no longer part of the service"
                );
                Admission::Admitted(
                    future::ready(Err(RoutingError::StickyTargetGone(uri))).boxed(),
                )
            }
            None => self.selector.maybe_execute(endpoint, request),
        }
    }
}

impl fmt::Debug for NodeSelectionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSelectionChannel")
            .field("channel_name", &self.channel_name)
            .field("selector", &self.selector)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Response;
    use http::{Method, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        status: StatusCode,
        hits: AtomicUsize,
    }

    impl LimitedChannel for Counting {
        fn maybe_execute(&self, _: &Endpoint, _: Request) -> Admission {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Admission::Admitted(future::ready(Ok(Response::new(self.status))).boxed())
        }
    }

    fn counting(status: StatusCode) -> Arc<Counting> {
        Arc::new(Counting {
            status,
            hits: AtomicUsize::new(0),
        })
    }

    fn endpoint() -> Endpoint {
        Endpoint::new("svc", "op", Method::GET)
    }

    fn channel(
        strategy: NodeSelectionStrategy,
        hosts: &[(usize, Arc<Counting>)],
    ) -> NodeSelectionChannel {
        let hosts = hosts
            .iter()
            .map(|(index, channel)| {
                HostChannel::new(
                    HostInfo::new(format!("https://host-{}", index), *index),
                    Arc::clone(channel) as Arc<dyn LimitedChannel>,
                )
            })
            .collect();
        let context = RoutingContext::current().unwrap().with_seed(3);
        NodeSelectionChannel::new("svc", strategy, hosts, SelectionSettings::default(), &context)
    }

    async fn execute(
        channel: &NodeSelectionChannel,
        request: Request,
    ) -> crate::error::Result<Response> {
        match channel.maybe_execute(&endpoint(), request) {
            Admission::Admitted(future) => future.await,
            Admission::Refused(_) => panic!("expected admission"),
        }
    }

    #[test]
    fn test_strategy_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            strategy: NodeSelectionStrategy,
        }
        for (name, expected) in [
            ("PIN_UNTIL_ERROR", NodeSelectionStrategy::PinUntilError),
            (
                "PIN_UNTIL_ERROR_NO_RESHUFFLE",
                NodeSelectionStrategy::PinUntilErrorNoReshuffle,
            ),
            ("ROUND_ROBIN", NodeSelectionStrategy::RoundRobin),
        ] {
            let parsed: Wrapper = toml::from_str(&format!("strategy = \"{}\"", name)).unwrap();
            assert_eq!(parsed.strategy, expected);
        }
    }

    #[tokio::test]
    async fn test_no_hosts_fails_fast() {
        let channel = channel(NodeSelectionStrategy::RoundRobin, &[]);
        let result = execute(&channel, Request::new()).await;
        assert!(matches!(result, Err(RoutingError::NoHosts)));
    }

    #[tokio::test]
    async fn test_success_is_stamped_with_serving_host() {
        let only = counting(StatusCode::OK);
        let channel = channel(NodeSelectionStrategy::PinUntilError, &[(4, only)]);
        let response = execute(&channel, Request::new()).await.unwrap();
        let target = response.sticky_target().expect("stamped");
        assert_eq!(target.uri(), "https://host-4");
        assert_eq!(target.host().index(), 4);
    }

    #[tokio::test]
    async fn test_failures_are_not_stamped() {
        let only = counting(StatusCode::INTERNAL_SERVER_ERROR);
        let channel = channel(NodeSelectionStrategy::RoundRobin, &[(0, only)]);
        let response = execute(&channel, Request::new()).await.unwrap();
        assert!(response.sticky_target().is_none());
    }

    #[tokio::test]
    async fn test_sticky_target_bypasses_selection() {
        let hosts: Vec<_> = (0..4).map(|i| (i, counting(StatusCode::OK))).collect();
        let channel = channel(NodeSelectionStrategy::RoundRobin, &hosts);

        for _ in 0..5 {
            let mut request = Request::new();
            request
                .attachments_mut()
                .insert(StickyTarget::new(HostInfo::new("https://host-2", 2)));
            execute(&channel, request).await.unwrap();
        }
        assert_eq!(hosts[2].1.hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_sticky_target_gone() {
        let channel = channel(NodeSelectionStrategy::RoundRobin, &[(0, counting(StatusCode::OK))]);
        let mut request = Request::new();
        request
            .attachments_mut()
            .insert(StickyTarget::new(HostInfo::new("https://removed", 7)));
        let result = execute(&channel, request).await;
        assert!(matches!(
            result,
            Err(RoutingError::StickyTargetGone(uri)) if uri == "https://removed"
        ));
    }

    #[tokio::test]
    async fn test_update_hosts() {
        let channel = channel(
            NodeSelectionStrategy::PinUntilErrorNoReshuffle,
            &[(0, counting(StatusCode::OK))],
        );
        assert_eq!(channel.hosts().len(), 1);

        let replacement = counting(StatusCode::OK);
        channel.update_hosts(vec![HostChannel::new(
            HostInfo::new("https://host-1", 1),
            Arc::clone(&replacement) as Arc<dyn LimitedChannel>,
        )]);
        execute(&channel, Request::new()).await.unwrap();
        assert_eq!(replacement.hits.load(Ordering::SeqCst), 1);
        assert_eq!(channel.strategy(), NodeSelectionStrategy::PinUntilErrorNoReshuffle);
    }
}
