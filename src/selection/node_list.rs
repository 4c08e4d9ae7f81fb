//! Host ordering for pin-until-error selection

use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use switchyard_core_resilience::SharedClock;

use crate::channel::HostChannel;
use crate::context::SharedRng;
use crate::sync::{lock, read, write};

/// Whether the host order is periodically reshuffled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeListKind {
    /// Shuffled once, then fixed until the host set changes
    Constant,
    /// Reshuffled every interval (plus jitter)
    Reshuffling,
}

/// Position of the pinned host, tagged with a generation.
///
/// The generation changes whenever a different host becomes pinned: on a
/// failure move, and on a reload that drops the pinned host. Reshuffles and
/// reloads that keep the pinned host may change the index but keep the
/// generation, so failures reported about that host still count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PinWord {
    pub(crate) generation: u32,
    pub(crate) index: usize,
}

impl PinWord {
    fn pack(self) -> u64 {
        (u64::from(self.generation) << 32) | (self.index as u64 & u64::from(u32::MAX))
    }

    fn unpack(word: u64) -> Self {
        Self {
            generation: (word >> 32) as u32,
            index: (word & u64::from(u32::MAX)) as usize,
        }
    }
}

/// Shuffled host order shared by every request of one service.
///
/// Reshuffles are evaluated lazily when the list is read. A reshuffle keeps
/// the currently pinned host at the pinned index so the pin itself does not
/// move. The pin is only written while the host lock is held, so a pin word
/// always refers to the host order it was read with.
pub(crate) struct NodeList {
    kind: NodeListKind,
    hosts: RwLock<Arc<Vec<HostChannel>>>,
    pin: AtomicU64,
    next_reshuffle: AtomicU64,
    interval: Duration,
    jitter: Duration,
    clock: SharedClock,
    rng: SharedRng,
}

impl NodeList {
    pub(crate) fn new(
        kind: NodeListKind,
        hosts: &[HostChannel],
        interval: Duration,
        jitter: Duration,
        clock: SharedClock,
        rng: SharedRng,
    ) -> Self {
        let mut shuffled = hosts.to_vec();
        shuffled.shuffle(&mut *lock(&rng));

        let list = Self {
            kind,
            hosts: RwLock::new(Arc::new(shuffled)),
            pin: AtomicU64::new(0),
            next_reshuffle: AtomicU64::new(0),
            interval,
            jitter,
            clock,
            rng,
        };
        let first = list.clock.nanos().saturating_add(list.next_interval_nanos());
        list.next_reshuffle.store(first, Ordering::Release);
        list
    }

    pub(crate) fn kind(&self) -> NodeListKind {
        self.kind
    }

    pub(crate) fn snapshot(&self) -> Arc<Vec<HostChannel>> {
        Arc::clone(&read(&self.hosts))
    }

    pub(crate) fn pin(&self) -> PinWord {
        PinWord::unpack(self.pin.load(Ordering::Acquire))
    }

    /// Pinned host together with the pin word it was read under
    pub(crate) fn pinned(&self) -> Option<(PinWord, HostChannel)> {
        let hosts = read(&self.hosts);
        if hosts.is_empty() {
            return None;
        }
        let pin = self.pin();
        Some((pin, hosts[pin.index % hosts.len()].clone()))
    }

    /// Move the pin to the next host, unless a different host has been
    /// pinned since `generation` was observed.
    ///
    /// Returns the new pin for the one caller that moved it.
    pub(crate) fn advance(&self, generation: u32) -> Option<PinWord> {
        let hosts = read(&self.hosts);
        if hosts.is_empty() {
            return None;
        }
        let mut current = self.pin.load(Ordering::Acquire);
        loop {
            let pin = PinWord::unpack(current);
            if pin.generation != generation {
                return None;
            }
            let next = PinWord {
                generation: generation.wrapping_add(1),
                index: (pin.index + 1) % hosts.len(),
            };
            match self.pin.compare_exchange(
                current,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(next),
                Err(actual) => current = actual,
            }
        }
    }

    /// Interval until the next reshuffle: `interval` +/- up to `jitter`
    fn next_interval_nanos(&self) -> u64 {
        let interval = self.interval.as_nanos() as i64;
        let jitter = self.jitter.as_nanos() as i64;
        let offset = if jitter > 0 {
            lock(&self.rng).random_range(-jitter..=jitter)
        } else {
            0
        };
        interval.saturating_add(offset).max(1) as u64
    }

    /// Reshuffle if due, keeping the pinned host in place.
    ///
    /// Returns true for the one caller that performed the reshuffle.
    pub(crate) fn maybe_reshuffle(&self) -> bool {
        if self.kind == NodeListKind::Constant {
            return false;
        }

        let now = self.clock.nanos();
        let due = self.next_reshuffle.load(Ordering::Acquire);
        if now < due {
            return false;
        }
        let next = now.saturating_add(self.next_interval_nanos());
        if self
            .next_reshuffle
            .compare_exchange(due, next, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let mut hosts = write(&self.hosts);
        if hosts.len() < 2 {
            return true;
        }
        let pinned_index = self.pin().index % hosts.len();
        let pinned_uri = hosts[pinned_index].host().shared_uri();

        let mut shuffled = hosts.to_vec();
        shuffled.shuffle(&mut *lock(&self.rng));
        if let Some(position) = shuffled.iter().position(|h| h.uri() == &*pinned_uri) {
            shuffled.swap(position, pinned_index);
        }
        *hosts = Arc::new(shuffled);
        true
    }

    /// Install a new host set, keeping the pinned host pinned when it is
    /// still present
    pub(crate) fn replace(&self, new_hosts: &[HostChannel]) {
        let mut hosts = write(&self.hosts);
        let current = self.pin();
        let pinned_uri = if hosts.is_empty() {
            None
        } else {
            Some(hosts[current.index % hosts.len()].host().shared_uri())
        };

        let mut shuffled = new_hosts.to_vec();
        shuffled.shuffle(&mut *lock(&self.rng));

        let kept = pinned_uri.and_then(|uri| shuffled.iter().position(|h| h.uri() == &*uri));
        let next = match kept {
            Some(position) => {
                let index = current.index.min(shuffled.len() - 1);
                shuffled.swap(position, index);
                PinWord {
                    generation: current.generation,
                    index,
                }
            }
            None => PinWord {
                generation: current.generation.wrapping_add(1),
                index: 0,
            },
        };
        self.pin.store(next.pack(), Ordering::Release);
        *hosts = Arc::new(shuffled);
    }
}
