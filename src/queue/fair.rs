//! Bounded round-robin fair queue
//!
//! Entries are grouped by [`QueueKey`]. Each key has a FIFO of entries, and
//! the keys themselves are served from a FIFO of keys. A scheduling round
//! visits every key once, in order, and offers its head entry:
//!
//! - dispatched: the entry is removed and the key moves to the back
//! - refused: the entry stays at the head and the key keeps its turn; it is
//!   not offered again this round
//! - discarded: the entry is dropped (its caller went away) and the next
//!   entry of the same key is offered
//!
//! Rounds repeat until one dispatches nothing or the queue is empty.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::request::{Request, RoutingKey};

/// Fairness partition: routing key plus sticky host
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct QueueKey {
    routing_key: Option<RoutingKey>,
    host: Option<Arc<str>>,
}

impl QueueKey {
    /// Partition for requests carrying neither a routing key nor a sticky host
    pub const UNKEYED: QueueKey = QueueKey {
        routing_key: None,
        host: None,
    };

    pub fn new(routing_key: Option<RoutingKey>, host: Option<Arc<str>>) -> Self {
        Self { routing_key, host }
    }

    /// Partition derived from a request's attachments
    pub fn for_request(request: &Request) -> Self {
        Self {
            routing_key: request.routing_key().cloned(),
            host: request.sticky_target().map(|t| t.host().shared_uri()),
        }
    }

    pub fn routing_key(&self) -> Option<&RoutingKey> {
        self.routing_key.as_ref()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.routing_key, &self.host) {
            (None, None) => f.write_str("unkeyed"),
            (Some(key), None) => write!(f, "{}", key),
            (None, Some(host)) => write!(f, "@{}", host),
            (Some(key), Some(host)) => write!(f, "{}@{}", key, host),
        }
    }
}

/// Result of offering one entry for dispatch
#[derive(Debug)]
pub enum Attempt<T> {
    Dispatched,
    Refused(T),
    Discarded,
}

/// Counts from one [`FairQueue::run_rounds`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub dispatched: usize,
    pub discarded: usize,
    pub rounds: usize,
}

pub struct FairQueue<T> {
    max_size: usize,
    len: usize,
    queues: HashMap<QueueKey, VecDeque<T>>,
    order: VecDeque<QueueKey>,
}

impl<T> FairQueue<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            len: 0,
            queues: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Append `item` under `key`; hands it back when the queue is full
    pub fn push(&mut self, key: QueueKey, item: T) -> Result<(), T> {
        if self.len >= self.max_size {
            return Err(item);
        }
        let queue = self.queues.entry(key.clone()).or_default();
        if queue.is_empty() {
            self.order.push_back(key);
        }
        queue.push_back(item);
        self.len += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of keys with queued entries
    pub fn key_count(&self) -> usize {
        self.order.len()
    }

    /// Run scheduling rounds until quiescent
    pub fn run_rounds<F>(&mut self, mut attempt: F) -> DrainStats
    where
        F: FnMut(T) -> Attempt<T>,
    {
        let mut stats = DrainStats::default();
        while !self.order.is_empty() {
            stats.rounds += 1;
            let dispatched_before = stats.dispatched;
            let mut held = VecDeque::new();
            let mut rotated = VecDeque::new();

            while let Some(key) = self.order.pop_front() {
                let Some(queue) = self.queues.get_mut(&key) else {
                    continue;
                };

                let mut refused = false;
                while let Some(item) = queue.pop_front() {
                    match attempt(item) {
                        Attempt::Dispatched => {
                            self.len -= 1;
                            stats.dispatched += 1;
                            break;
                        }
                        Attempt::Discarded => {
                            self.len -= 1;
                            stats.discarded += 1;
                        }
                        Attempt::Refused(item) => {
                            queue.push_front(item);
                            refused = true;
                            break;
                        }
                    }
                }

                if queue.is_empty() {
                    self.queues.remove(&key);
                } else if refused {
                    held.push_back(key);
                } else {
                    rotated.push_back(key);
                }
            }

            // Refused keys keep their turn; served keys go to the back
            held.append(&mut rotated);
            self.order = held;

            if stats.dispatched == dispatched_before {
                break;
            }
        }
        stats
    }
}

impl<T> fmt::Debug for FairQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FairQueue")
            .field("len", &self.len)
            .field("keys", &self.order.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}
