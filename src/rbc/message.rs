use blsttc::{Signature, SignatureShare};
use serde::{Deserialize, Serialize};

use crate::hash::Hash32;
use crate::NodeId;

/// Proof, issued by the dealer at key setup, that the holder owns its id.
/// Carried by the initial value message so receivers can authenticate the
/// designated sender.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SenderAuth {
    pub id: NodeId,
    pub sig: Signature,
}

/// The bytes the dealer signs to authenticate node `id`.
pub fn auth_sign_bytes(id: NodeId) -> Result<Vec<u8>, bincode::Error> {
    Ok(Hash32::calculate(&bincode::serialize(&id)?).to_bytes())
}

/// The bytes a committee member signs as a witness of delivering `digest`
/// for (uround, sender).
pub fn deliver_sign_bytes(
    uround: usize,
    sender: NodeId,
    digest: &Hash32,
) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(&(uround, sender, "deliver", digest))
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub enum Message {
    /// The payload, multicast by the designated sender.
    Val(SenderAuth, Vec<u8>),
    /// A vote that the payload with this digest was seen.
    Echo(Hash32),
    /// A vote that delivery of this digest is safe.
    Ready(Hash32),
    /// A committee member's signature share witnessing its delivery.
    Sig(Hash32, SignatureShare),
}

impl Message {
    pub fn action_str(&self) -> &str {
        match self {
            Message::Val(..) => "val",
            Message::Echo(_) => "echo",
            Message::Ready(_) => "ready",
            Message::Sig(..) => "sig",
        }
    }
}
