use serde::{Deserialize, Serialize};

use crate::NodeId;

/// The subprotocol a wire message belongs to. `Acs` and `Abc` name traffic of
/// the outer drivers; this crate only routes them.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Origin {
    Rbc,
    Aba,
    Bla,
    Acs,
    Abc,
    Coin,
}

/// Bundle is the on-wire record moved by the transport. The payload is the
/// bincode-encoded protocol message; routing happens on the remaining fields
/// without decoding it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Bundle {
    pub uround: usize,
    pub round: usize,
    pub instance: usize,
    pub origin: Origin,
    /// The node that produced the message.
    pub initiator: NodeId,
    /// `None` means multicast to all participants.
    pub target: Option<NodeId>,
    pub payload: Vec<u8>,
}

/// Outgoing messages as recorded by the [`Broadcaster`](crate::broadcaster::Broadcaster).
#[derive(Debug, Clone)]
pub enum Outgoing {
    Gossip(Bundle),
    Direct(NodeId, Bundle),
}

impl Outgoing {
    pub fn bundle(&self) -> &Bundle {
        match self {
            Outgoing::Gossip(bundle) => bundle,
            Outgoing::Direct(_, bundle) => bundle,
        }
    }
}
