use std::collections::{BTreeMap, VecDeque};

use crate::bundle::{Bundle, Origin};
use crate::NodeId;

/// The key a bundle is demultiplexed on. Every protocol instance reads from
/// exactly one queue; the recipient is implicit because each node owns its
/// own handler.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct QueueKey {
    pub origin: Origin,
    pub uround: usize,
    pub round: usize,
    pub instance: usize,
}

impl QueueKey {
    /// One reliable-broadcast queue per (uround, sender).
    pub fn rbc(uround: usize, sender: NodeId) -> Self {
        Self {
            origin: Origin::Rbc,
            uround,
            round: 0,
            instance: sender,
        }
    }

    /// One binary-agreement queue per (uround, round, instance).
    pub fn aba(uround: usize, round: usize, instance: usize) -> Self {
        Self {
            origin: Origin::Aba,
            uround,
            round,
            instance,
        }
    }

    /// One block-agreement queue per (uround, round).
    pub fn bla(uround: usize, round: usize) -> Self {
        Self {
            origin: Origin::Bla,
            uround,
            round,
            instance: 0,
        }
    }

    /// Coin answers arrive on a queue per (uround, round, instance).
    pub fn coin(uround: usize, round: usize, instance: usize) -> Self {
        Self {
            origin: Origin::Coin,
            uround,
            round,
            instance,
        }
    }

    fn of(bundle: &Bundle) -> Self {
        match bundle.origin {
            Origin::Rbc => Self::rbc(bundle.uround, bundle.instance),
            Origin::Aba => Self::aba(bundle.uround, bundle.round, bundle.instance),
            Origin::Bla => Self::bla(bundle.uround, bundle.round),
            Origin::Coin => Self::coin(bundle.uround, bundle.round, bundle.instance),
            Origin::Acs | Origin::Abc => Self {
                origin: bundle.origin,
                uround: bundle.uround,
                round: 0,
                instance: 0,
            },
        }
    }
}

/// Handler is the inbound side of a node: the transport hands it every
/// decoded bundle and protocol drivers pop their queues. Queues are created
/// lazily; creation is idempotent because the map has a single owner and an
/// existing entry is never replaced.
pub struct Handler {
    self_id: NodeId,
    queues: BTreeMap<QueueKey, VecDeque<Bundle>>,
}

impl Handler {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            queues: BTreeMap::new(),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Enqueues `bundle` on the queue for its key. Bundles addressed to
    /// another participant are dropped.
    pub fn dispatch(&mut self, bundle: Bundle) {
        if let Some(target) = bundle.target {
            if target != self.self_id {
                log::warn!(
                    "node {} received bundle addressed to {target}, dropping",
                    self.self_id
                );
                return;
            }
        }
        let key = QueueKey::of(&bundle);
        self.queues.entry(key).or_default().push_back(bundle);
    }

    pub fn pop(&mut self, key: QueueKey) -> Option<Bundle> {
        self.queues.get_mut(&key).and_then(|queue| queue.pop_front())
    }

    pub fn len(&self, key: QueueKey) -> usize {
        self.queues.get(&key).map_or(0, |queue| queue.len())
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(|queue| queue.is_empty())
    }

    /// The keys that currently hold at least one bundle.
    pub fn pending_keys(&self) -> Vec<QueueKey> {
        self.queues
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(key, _)| *key)
            .collect()
    }
}
