//! Score-based balancing across hosts
//!
//! Every request ranks all hosts by
//!
//! ```text
//! score = inflight + round(decayed failure weight)
//! ```
//!
//! and tries them from lowest to highest score until one admits it. The
//! host list is shuffled before ranking so ties (for example at startup) do
//! not always favour the same host. Scores are integers: a single stale
//! failure decays below 0.5 and stops influencing the ranking entirely.

use futures::FutureExt;
use rand::seq::SliceRandom;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use switchyard_core_resilience::{CoarseExponentialDecay, SharedClock};
use tracing::debug;

use super::NodeSelector;
use crate::channel::{
    on_completion, Admission, HostChannel, HostInfo, ResponseClass, ResponseFuture,
};
use crate::context::SharedRng;
use crate::request::{Endpoint, Request};
use crate::sync::{lock, read, write};

/// Score added for a 5xx, QoS response or transport failure
pub const FAILURE_WEIGHT: f64 = 10.0;

/// Score added for a 4xx response
pub const CLIENT_ERROR_WEIGHT: f64 = 1.0;

struct HostScore {
    inflight: AtomicUsize,
    recent_failures: CoarseExponentialDecay,
}

impl HostScore {
    fn new(clock: SharedClock, half_life: Duration) -> Self {
        Self {
            inflight: AtomicUsize::new(0),
            recent_failures: CoarseExponentialDecay::new(clock, half_life),
        }
    }

    fn score(&self) -> usize {
        let failures = self.recent_failures.get().round().max(0.0) as usize;
        self.inflight.load(Ordering::Acquire).saturating_add(failures)
    }

    fn record(&self, class: ResponseClass) {
        match class {
            ResponseClass::Success => {}
            ResponseClass::ClientError => self.recent_failures.update(CLIENT_ERROR_WEIGHT),
            ResponseClass::TooManyRequests
            | ResponseClass::Unavailable
            | ResponseClass::ServerError
            | ResponseClass::TransportFailure => self.recent_failures.update(FAILURE_WEIGHT),
        }
    }
}

#[derive(Clone)]
struct ScoredHost {
    host: HostChannel,
    score: Arc<HostScore>,
}

/// Routes each request to the least-loaded, least-failing host with capacity
pub struct BalancedSelector {
    clock: SharedClock,
    rng: SharedRng,
    failure_half_life: Duration,
    hosts: RwLock<Arc<Vec<ScoredHost>>>,
}

impl BalancedSelector {
    pub fn new(
        hosts: &[HostChannel],
        clock: SharedClock,
        rng: SharedRng,
        failure_half_life: Duration,
    ) -> Self {
        let selector = Self {
            clock,
            rng,
            failure_half_life,
            hosts: RwLock::new(Arc::new(Vec::new())),
        };
        selector.update_hosts(hosts);
        selector
    }

    /// Current score of every host, in host order
    pub fn scores(&self) -> Vec<(HostInfo, usize)> {
        read(&self.hosts)
            .iter()
            .map(|entry| (entry.host.host().clone(), entry.score.score()))
            .collect()
    }

    fn track(future: ResponseFuture, score: Arc<HostScore>) -> ResponseFuture {
        on_completion(future, move |result| {
            score.inflight.fetch_sub(1, Ordering::AcqRel);
            if let Some(result) = result {
                score.record(ResponseClass::of(result));
            }
        })
        .boxed()
    }
}

impl NodeSelector for BalancedSelector {
    fn maybe_execute(&self, endpoint: &Endpoint, request: Request) -> Admission {
        let hosts = Arc::clone(&read(&self.hosts));

        let mut candidates: Vec<&ScoredHost> = hosts.iter().collect();
        candidates.shuffle(&mut *lock(&self.rng));

        // Snapshot scores once so the sort sees a consistent ranking
        let mut ranked: Vec<(usize, &ScoredHost)> = candidates
            .into_iter()
            .map(|candidate| (candidate.score.score(), candidate))
            .collect();
        ranked.sort_by_key(|(score, _)| *score);

        let mut request = request;
        for (score, candidate) in ranked {
            candidate.score.inflight.fetch_add(1, Ordering::AcqRel);
            match candidate.host.maybe_execute(endpoint, request) {
                Admission::Admitted(future) => {
                    debug!(host = %candidate.host.host(), score, "Balanced selection");
                    return Admission::Admitted(Self::track(future, Arc::clone(&candidate.score)));
                }
                Admission::Refused(returned) => {
                    candidate.score.inflight.fetch_sub(1, Ordering::AcqRel);
                    request = returned;
                }
            }
        }
        Admission::Refused(request)
    }

    fn update_hosts(&self, hosts: &[HostChannel]) {
        let mut current = write(&self.hosts);
        let next: Vec<ScoredHost> = hosts
            .iter()
            .map(|host| {
                let score = current
                    .iter()
                    .find(|existing| existing.host.uri() == host.uri())
                    .map(|existing| Arc::clone(&existing.score))
                    .unwrap_or_else(|| {
                        Arc::new(HostScore::new(self.clock.clone(), self.failure_half_life))
                    });
                ScoredHost {
                    host: host.clone(),
                    score,
                }
            })
            .collect();
        *current = Arc::new(next);
    }
}

impl fmt::Debug for BalancedSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BalancedSelector")
            .field("scores", &self.scores())
            .finish()
    }
}
