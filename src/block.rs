use blsttc::Signature;
use serde::{Deserialize, Serialize};

use crate::hash::Hash32;

/// One filled slot of a pre-block: an opaque message together with the
/// certificate vouching for it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PreBlockMessage {
    pub message: Vec<u8>,
    pub sig: Signature,
}

/// An n-slot container of signed messages, one slot per participant.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PreBlock {
    vec: Vec<Option<PreBlockMessage>>,
}

impl PreBlock {
    pub fn new(n: usize) -> Self {
        Self { vec: vec![None; n] }
    }

    pub fn n(&self) -> usize {
        self.vec.len()
    }

    /// Fills slot `i`. Slots are write-once; a second write is ignored.
    pub fn add_message(&mut self, i: usize, msg: PreBlockMessage) {
        if let Some(slot) = self.vec.get_mut(i) {
            if slot.is_none() {
                *slot = Some(msg);
            }
        }
    }

    pub fn get(&self, i: usize) -> Option<&PreBlockMessage> {
        self.vec.get(i).and_then(|slot| slot.as_ref())
    }

    /// The number of filled slots.
    pub fn quality(&self) -> usize {
        self.vec.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn hash(&self) -> Result<Hash32, bincode::Error> {
        Ok(Hash32::calculate(&bincode::serialize(self)?))
    }
}

/// A pointer to a pre-block: its hash plus an auxiliary tag set by the
/// outer protocol.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BlockPointer {
    pub block_hash: Hash32,
    pub sig: Vec<u8>,
}

impl BlockPointer {
    pub fn new(block_hash: Hash32, sig: Vec<u8>) -> Self {
        Self { block_hash, sig }
    }
}

/// The unit of agreement carried through block agreement: a pre-block plus
/// the pointer committing to it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BlockShare {
    pub pre_block: PreBlock,
    pub pointer: BlockPointer,
}

impl BlockShare {
    pub fn new(pre_block: PreBlock, pointer: BlockPointer) -> Self {
        Self {
            pre_block,
            pointer,
        }
    }

    pub fn hash(&self) -> Result<Hash32, bincode::Error> {
        Ok(Hash32::calculate(&bincode::serialize(self)?))
    }
}
