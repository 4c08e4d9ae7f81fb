//! Service channel assembly and live reload
//!
//! A [`ServiceChannel`] wires the routing layers for one service:
//!
//! ```text
//! StickyChannels ─▶ QueuedChannel ─▶ NodeSelectionChannel
//!                                          │
//!                                          ▼  (one per host)
//!                  ConcurrencyLimitedChannel ─▶ NeverFailChannel ─▶ transport
//! ```
//!
//! Transports are created per URI by a [`ChannelFactory`]. Reloading the
//! URI list keeps the limiter and scoring state of hosts that stay.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::channel::{
    Channel, HostChannel, HostInfo, LimitedChannel, NeverFailChannel, ResponseFuture,
};
use crate::config::ServiceConfig;
use crate::error::{Result, RoutingError};
use crate::limited::ConcurrencyLimitedChannel;
use crate::queue::QueuedChannel;
use crate::request::{Endpoint, Request};
use crate::selection::{NodeSelectionChannel, NodeSelectionStrategy, SelectionSettings};
use crate::sticky::StickyChannels;
use crate::sync::lock;

pub use crate::context::RoutingContext;

/// Creates the transport channel for one host
pub trait ChannelFactory: Send + Sync {
    fn create(&self, uri: &str) -> Result<Arc<dyn Channel>>;
}

impl<F> ChannelFactory for F
where
    F: Fn(&str) -> Result<Arc<dyn Channel>> + Send + Sync,
{
    fn create(&self, uri: &str) -> Result<Arc<dyn Channel>> {
        self(uri)
    }
}

/// All routing for one logical service
pub struct ServiceChannel {
    name: Arc<str>,
    config: ServiceConfig,
    context: RoutingContext,
    factory: Arc<dyn ChannelFactory>,
    hosts: Mutex<Vec<Arc<ConcurrencyLimitedChannel>>>,
    selection: Arc<NodeSelectionChannel>,
    queued: QueuedChannel,
    sticky: StickyChannels,
}

impl ServiceChannel {
    pub fn new(
        config: ServiceConfig,
        context: RoutingContext,
        factory: impl ChannelFactory + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let name: Arc<str> = Arc::from(config.service_name.as_str());
        let factory: Arc<dyn ChannelFactory> = Arc::new(factory);

        let host_count = config.uris.len();
        let hosts = config
            .uris
            .iter()
            .enumerate()
            .map(|(index, uri)| {
                let transport = factory.create(uri)?;
                limited_host(
                    &name,
                    &config,
                    &context,
                    transport,
                    HostInfo::new(uri.as_str(), index),
                    host_count,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let settings = SelectionSettings {
            failure_half_life: config.failure_half_life(),
            reshuffle_interval: config.reshuffle_interval(),
            reshuffle_jitter: config.reshuffle_jitter(),
        };
        let selection = Arc::new(NodeSelectionChannel::new(
            Arc::clone(&name),
            config.node_selection_strategy,
            host_channels(&hosts),
            settings,
            &context,
        ));
        let queued = QueuedChannel::new(
            Arc::clone(&name),
            Arc::clone(&selection) as Arc<dyn LimitedChannel>,
            config.max_queue_size,
            &context,
        );
        let sticky = StickyChannels::new(
            Arc::new(queued.clone()),
            Arc::clone(&name),
            Arc::clone(context.metrics()),
        );

        info!(
            service = %name,
            hosts = host_count,
            strategy = ?config.node_selection_strategy,
            max_queue_size = config.max_queue_size,
            "Service channel ready"
        );

        Ok(Self {
            name,
            config,
            context,
            factory,
            hosts: Mutex::new(hosts),
            selection,
            queued,
            sticky,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration the channel was built from; `uris` reflects construction
    /// time, see [`ServiceChannel::hosts`] for the live set
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn strategy(&self) -> NodeSelectionStrategy {
        self.selection.strategy()
    }

    /// Hosts currently serving this service
    pub fn hosts(&self) -> Vec<HostInfo> {
        lock(&self.hosts).iter().map(|h| h.host().clone()).collect()
    }

    /// Limited channel for `uri`, if it is part of the service
    pub fn host_channel(&self, uri: &str) -> Option<Arc<ConcurrencyLimitedChannel>> {
        lock(&self.hosts)
            .iter()
            .find(|h| h.host().uri() == uri)
            .cloned()
    }

    /// Requests waiting for capacity
    pub fn queued(&self) -> usize {
        self.queued.queued()
    }

    /// Sticky sessions over this service
    pub fn sticky_channels(&self) -> &StickyChannels {
        &self.sticky
    }

    /// Replace the host set.
    ///
    /// Hosts that stay keep their limiter, score and metric index. New hosts
    /// take the lowest free index. Nothing changes if any new transport
    /// fails to build.
    pub fn reload(&self, uris: Vec<String>) -> Result<()> {
        let mut candidate = self.config.clone();
        candidate.uris = uris;
        candidate.validate()?;
        let uris = candidate.uris;

        let mut hosts = lock(&self.hosts);
        let mut existing: HashMap<&str, &Arc<ConcurrencyLimitedChannel>> =
            hosts.iter().map(|h| (h.host().uri(), h)).collect();

        let mut transports = HashMap::new();
        for uri in &uris {
            if !existing.contains_key(uri.as_str()) {
                transports.insert(uri.as_str(), self.factory.create(uri)?);
            }
        }

        let kept: HashSet<usize> = uris
            .iter()
            .filter_map(|uri| existing.get(uri.as_str()))
            .map(|h| h.host().index())
            .collect();
        let removed: Vec<Arc<ConcurrencyLimitedChannel>> = hosts
            .iter()
            .filter(|h| !kept.contains(&h.host().index()))
            .cloned()
            .collect();
        // Free the indices before new hosts register under them
        for host in &removed {
            host.unregister_metrics();
        }

        let mut free_indices = (0..).filter(|index| !kept.contains(index));
        let mut next = Vec::with_capacity(uris.len());
        for uri in &uris {
            let host = match existing.remove(uri.as_str()) {
                Some(host) => Arc::clone(host),
                None => {
                    let index = free_indices.next().unwrap_or(uris.len());
                    let transport = transports
                        .remove(uri.as_str())
                        .ok_or_else(|| RoutingError::Config(format!("duplicate uri: {}", uri)))?;
                    limited_host(
                        &self.name,
                        &self.config,
                        &self.context,
                        transport,
                        HostInfo::new(uri.as_str(), index),
                        uris.len(),
                    )?
                }
            };
            next.push(host);
        }
        let added = uris.len() - kept.len();

        self.selection.update_hosts(host_channels(&next));
        *hosts = next;
        drop(hosts);

        info!(
            service = %self.name,
            hosts = uris.len(),
            added,
            removed = removed.len(),
            "Reloaded service hosts"
        );

        // New hosts may have capacity for queued requests
        self.queued.schedule();
        Ok(())
    }
}

fn limited_host(
    name: &str,
    config: &ServiceConfig,
    context: &RoutingContext,
    transport: Arc<dyn Channel>,
    host: HostInfo,
    host_count: usize,
) -> Result<Arc<ConcurrencyLimitedChannel>> {
    let never_fail = Arc::new(NeverFailChannel::new(
        transport,
        name,
        Arc::clone(context.metrics()),
    ));
    Ok(Arc::new(ConcurrencyLimitedChannel::new(
        name,
        host,
        host_count,
        never_fail,
        config.limiter.clone(),
        context.clock().clone(),
        context.metrics(),
    )?))
}

fn host_channels(hosts: &[Arc<ConcurrencyLimitedChannel>]) -> Vec<HostChannel> {
    hosts
        .iter()
        .map(|h| HostChannel::new(h.host().clone(), Arc::clone(h) as Arc<dyn LimitedChannel>))
        .collect()
}

impl Channel for ServiceChannel {
    fn execute(&self, endpoint: &Endpoint, request: Request) -> ResponseFuture {
        self.queued.execute(endpoint, request)
    }
}

impl fmt::Debug for ServiceChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceChannel")
            .field("name", &self.name)
            .field("selection", &self.selection)
            .field("queued", &self.queued)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RoutingError;
    use crate::request::Response;
    use futures::future::{self, FutureExt};
    use http::Method;

    struct Ok200;

    impl Channel for Ok200 {
        fn execute(&self, _: &Endpoint, _: Request) -> ResponseFuture {
            future::ready(Ok(Response::ok())).boxed()
        }
    }

    fn factory(_: &str) -> Result<Arc<dyn Channel>> {
        Ok(Arc::new(Ok200))
    }

    fn uris(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| format!("https://{}", n)).collect()
    }

    fn service(hosts: &[&str]) -> ServiceChannel {
        ServiceChannel::new(
            ServiceConfig::new("svc", uris(hosts)),
            RoutingContext::current().unwrap().with_seed(3),
            factory,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_executes_through_all_layers() {
        let service = service(&["a", "b"]);
        let response = service
            .execute(&Endpoint::new("svc", "op", Method::GET), Request::new())
            .await
            .unwrap();
        let target = response.sticky_target().expect("successful responses are stamped");
        assert!(service.hosts().contains(target.host()));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = ServiceConfig::new("svc", uris(&["a"]));
        config.max_queue_size = 0;
        let result = ServiceChannel::new(config, RoutingContext::current().unwrap(), factory);
        assert!(matches!(result, Err(RoutingError::Config(_))));
    }

    #[tokio::test]
    async fn test_factory_errors_propagate() {
        let failing = |uri: &str| -> Result<Arc<dyn Channel>> {
            Err(RoutingError::Transport(format!("cannot reach {}", uri)))
        };
        let result = ServiceChannel::new(
            ServiceConfig::new("svc", uris(&["a"])),
            RoutingContext::current().unwrap(),
            failing,
        );
        assert!(matches!(result, Err(RoutingError::Transport(_))));
    }

    #[tokio::test]
    async fn test_reload_reuses_surviving_hosts() {
        let service = service(&["a", "b", "c"]);
        let b_before = service.host_channel("https://b").unwrap();

        service.reload(uris(&["b", "d"])).unwrap();

        let b_after = service.host_channel("https://b").unwrap();
        assert!(Arc::ptr_eq(&b_before, &b_after));
        assert_eq!(b_after.host().index(), 1);

        // "d" takes the lowest index not held by a surviving host
        let d = service.host_channel("https://d").unwrap();
        assert_eq!(d.host().index(), 0);
        assert!(service.host_channel("https://a").is_none());
        assert_eq!(service.hosts().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_reload_changes_nothing() {
        let service = service(&["a"]);
        assert!(service.reload(uris(&["a", "a"])).is_err());
        assert_eq!(service.hosts().len(), 1);
    }

    #[tokio::test]
    async fn test_reload_to_empty_fails_requests_with_no_hosts() {
        let service = service(&["a"]);
        service.reload(Vec::new()).unwrap();
        let result = service
            .execute(&Endpoint::new("svc", "op", Method::GET), Request::new())
            .await;
        assert!(matches!(result, Err(RoutingError::NoHosts)));
    }
}
