use std::collections::BTreeMap;

use blsttc::SignatureShare;
use serde::{Deserialize, Serialize};

use crate::block::BlockShare;
use crate::hash::Hash32;
use crate::NodeId;

/// The value a participant carries into a graded-consensus round: the block
/// share it backs and the commit set justifying it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Vote {
    pub round: usize,
    pub block_share: BlockShare,
    pub commits: Vec<CommitMessage>,
}

impl Vote {
    pub fn hash(&self) -> Result<Hash32, bincode::Error> {
        Ok(Hash32::calculate(&bincode::serialize(self)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VoteMessage {
    pub sender: NodeId,
    pub vote: Vote,
    pub sig: SignatureShare,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProposeMessage {
    pub sender: NodeId,
    pub vote: Vote,
    /// The vote messages backing the proposal. A sorted map keeps the
    /// signed encoding deterministic.
    pub vote_map: BTreeMap<NodeId, VoteMessage>,
    pub sig: SignatureShare,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CommitMessage {
    pub sender: NodeId,
    pub round: usize,
    pub block_share: BlockShare,
    pub sig: SignatureShare,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NotifyMessage {
    pub sender: NodeId,
    pub round: usize,
    pub block_share: BlockShare,
    pub commits: Vec<CommitMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub enum Message {
    Vote(VoteMessage),
    Propose(Box<ProposeMessage>),
    Commit(CommitMessage),
    Notify(NotifyMessage),
}

impl Message {
    pub fn action_str(&self) -> &str {
        match self {
            Message::Vote(_) => "vote",
            Message::Propose(_) => "propose",
            Message::Commit(_) => "commit",
            Message::Notify(_) => "notify",
        }
    }
}

pub fn vote_sign_bytes(sender: NodeId, vote: &Vote) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(&(sender, vote))
}

pub fn propose_sign_bytes(
    sender: NodeId,
    vote: &Vote,
    vote_map: &BTreeMap<NodeId, VoteMessage>,
) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(&(sender, vote, vote_map))
}

pub fn commit_sign_bytes(
    sender: NodeId,
    round: usize,
    block_share: &BlockShare,
) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(&(sender, round, block_share))
}
