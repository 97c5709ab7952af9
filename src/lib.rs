//! Byzantine fault tolerant consensus core for asynchronous atomic
//! broadcast: reliable broadcast, binary agreement, graded block agreement
//! and a threshold-signature common coin, composed over a message substrate
//! that multiplexes on (uround, protocol, round, instance, sender).
//!
//! The crate is transport-agnostic. Protocol instances record outgoing
//! traffic in a shared [`broadcaster::Broadcaster`]; inbound bundles are
//! demultiplexed by a per-node [`handler::Handler`] and fed back in by the
//! caller, which also owns the tick clock of the block-agreement layer.

pub mod aba;
pub mod bla;
pub mod block;
pub mod broadcaster;
pub mod bundle;
pub mod coin;
pub mod handler;
pub mod hash;
pub mod rbc;

pub use blsttc::{PublicKeySet, SecretKeyShare, Signature, SignatureShare};

/// A participant's index in [0, n).
pub type NodeId = usize;

/// The well-known pseudo-participant the coin service is addressed as.
pub const COIN_ID: NodeId = NodeId::MAX;

pub mod error;
pub use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;
