use crate::bundle::{Bundle, Origin, Outgoing};
use crate::NodeId;

/// Broadcaster is the per-node log of outgoing messages. All protocol
/// instances of one node share it and the transport drains it after every
/// processing step. Sending is fire-and-forget; self-delivery is handled by
/// the instances themselves.
pub struct Broadcaster {
    self_id: NodeId,
    outgoings: Vec<Outgoing>,
}

impl Broadcaster {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            outgoings: Vec::new(),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Queues `payload` for delivery to all participants.
    pub fn broadcast(
        &mut self,
        origin: Origin,
        uround: usize,
        round: usize,
        instance: usize,
        payload: Vec<u8>,
    ) {
        let bundle = Bundle {
            uround,
            round,
            instance,
            origin,
            initiator: self.self_id,
            target: None,
            payload,
        };
        self.outgoings.push(Outgoing::Gossip(bundle));
    }

    /// Queues `payload` for delivery to the single participant `to`.
    pub fn send_to(
        &mut self,
        origin: Origin,
        uround: usize,
        round: usize,
        instance: usize,
        payload: Vec<u8>,
        to: NodeId,
    ) {
        let bundle = Bundle {
            uround,
            round,
            instance,
            origin,
            initiator: self.self_id,
            target: Some(to),
            payload,
        };
        self.outgoings.push(Outgoing::Direct(to, bundle));
    }

    pub fn take_outgoings(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outgoings)
    }

    #[cfg(test)]
    pub fn has_gossip_message(&self, payload: &[u8]) -> bool {
        self.outgoings.iter().any(|out| match out {
            Outgoing::Gossip(bundle) => bundle.payload == payload,
            Outgoing::Direct(..) => false,
        })
    }

    #[cfg(test)]
    pub fn clear(&mut self) {
        self.outgoings.clear();
    }
}
