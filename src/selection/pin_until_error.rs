//! Pin-until-error selection
//!
//! All traffic goes to one pinned host. When that host answers with a 5xx
//! (503 included) or fails at the transport, the pin moves to the next host
//! in the shuffled order. 429 responses never move the pin, so transactional
//! affinity survives rate limiting.
//!
//! The move is a compare-and-swap from the pin generation observed when the
//! request was dispatched. A late failure about a host that was already
//! abandoned, by an earlier failure or by a reload that removed it, cannot
//! undo a newer move.

use futures::FutureExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core_resilience::SharedClock;
use switchyard_observability::RoutingMetrics;
use tracing::{debug, info};

use super::node_list::{NodeList, NodeListKind};
use super::NodeSelector;
use crate::channel::{on_completion, Admission, HostChannel, HostInfo, ResponseClass};
use crate::context::SharedRng;
use crate::request::{Endpoint, Request};

pub struct PinUntilErrorSelector {
    channel_name: Arc<str>,
    nodes: Arc<NodeList>,
    metrics: Arc<RoutingMetrics>,
}

impl PinUntilErrorSelector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel_name: impl Into<Arc<str>>,
        kind: NodeListKind,
        hosts: &[HostChannel],
        reshuffle_interval: Duration,
        reshuffle_jitter: Duration,
        clock: SharedClock,
        rng: SharedRng,
        metrics: Arc<RoutingMetrics>,
    ) -> Self {
        Self {
            channel_name: channel_name.into(),
            nodes: Arc::new(NodeList::new(
                kind,
                hosts,
                reshuffle_interval,
                reshuffle_jitter,
                clock,
                rng,
            )),
            metrics,
        }
    }

    /// Host currently receiving traffic
    pub fn pinned_host(&self) -> Option<HostInfo> {
        self.nodes.pinned().map(|(_, host)| host.host().clone())
    }

    /// Current host order
    pub fn host_order(&self) -> Vec<HostInfo> {
        self.nodes
            .snapshot()
            .iter()
            .map(|h| h.host().clone())
            .collect()
    }

    pub fn kind(&self) -> NodeListKind {
        self.nodes.kind()
    }
}

impl NodeSelector for PinUntilErrorSelector {
    fn maybe_execute(&self, endpoint: &Endpoint, request: Request) -> Admission {
        if self.nodes.maybe_reshuffle() {
            info!(
                channel = %self.channel_name,
                pinned = ?self.pinned_host(),
                "Reshuffled pin-until-error host order"
            );
            self.metrics.record_reshuffle(&self.channel_name);
        }

        let Some((observed, pinned)) = self.nodes.pinned() else {
            return Admission::Refused(request);
        };

        let future = match pinned.maybe_execute(endpoint, request) {
            Admission::Admitted(future) => future,
            refused => {
                debug!(host = %pinned.host(), "Pinned host has no capacity");
                return refused;
            }
        };

        let nodes = Arc::clone(&self.nodes);
        let metrics = Arc::clone(&self.metrics);
        let channel_name = Arc::clone(&self.channel_name);
        let host = pinned.host().clone();
        Admission::Admitted(
            on_completion(future, move |result| {
                let Some(result) = result else {
                    return;
                };
                let class = ResponseClass::of(result);
                if !class.is_server_failure() {
                    return;
                }
                if let Some(next) = nodes.advance(observed.generation) {
                    info!(
                        channel = %channel_name,
                        host = %host,
                        outcome = %class,
                        next_index = next.index,
                        "Pinned host failed, moving to next host"
                    );
                    metrics.record_pin_change(&channel_name, class.as_str());
                }
            })
            .boxed(),
        )
    }

    fn update_hosts(&self, hosts: &[HostChannel]) {
        self.nodes.replace(hosts);
    }
}

impl fmt::Debug for PinUntilErrorSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinUntilErrorSelector")
            .field("kind", &self.nodes.kind())
            .field("pinned", &self.pinned_host())
            .finish()
    }
}
