pub mod error;
pub mod gc;
pub mod message;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use blsttc::{PublicKeySet, SecretKeyShare};

use self::error::{Error, Result};
use self::gc::GradedConsensus;
use self::message::{CommitMessage, Message, Vote};
use crate::block::BlockShare;
use crate::broadcaster::Broadcaster;
use crate::NodeId;

/// Picks the round leader. Deterministic and agreed by all participants.
pub type LeaderFn = fn(round: usize, n: usize) -> NodeId;

/// The default rotation.
pub fn round_robin_leader(round: usize, n: usize) -> NodeId {
    round % n
}

// Tick layout of one round: four graded-consensus sending phases plus the
// edge on which the grade is read. The final edge doubles as the alignment
// tick that keeps all nodes' vote ticks on the same global tick index.
const TICKS_PER_ROUND: usize = 5;

/// Block agreement: iterates graded consensus for up to `kappa` rounds,
/// adopting the result on grade 1 and delivering on grade 2. The whole run
/// consumes 5·kappa ticks plus one trailing blank tick; afterwards the
/// instance is inert. Delivery happens at most once; once any honest node
/// delivers, every honest node backs the same block share from the next
/// round on.
pub struct BlockAgreement {
    uround: usize,
    n: usize,
    i: NodeId,
    t: usize,
    kappa: usize,
    round: usize,
    tick: usize,
    block_share: BlockShare,
    commits: Vec<CommitMessage>,
    leader_fn: LeaderFn,
    pub_key_set: PublicKeySet,
    sec_key_share: SecretKeyShare,
    gc: GradedConsensus,
    // Messages for rounds we have not reached yet.
    backlog: BTreeMap<usize, Vec<(NodeId, Message)>>,
    delivered: Option<BlockShare>,
    started: bool,
    terminated: bool,
    broadcaster: Rc<RefCell<Broadcaster>>,
}

impl BlockAgreement {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uround: usize,
        n: usize,
        self_id: NodeId,
        t: usize,
        kappa: usize,
        block_share: BlockShare,
        leader_fn: LeaderFn,
        pub_key_set: PublicKeySet,
        sec_key_share: SecretKeyShare,
        broadcaster: Rc<RefCell<Broadcaster>>,
    ) -> Self {
        debug_assert_eq!(self_id, broadcaster.borrow().self_id());
        debug_assert!(n > 3 * t);
        debug_assert!(kappa > 0);

        let gc = GradedConsensus::new(
            uround,
            n,
            self_id,
            t,
            0,
            Vote {
                round: 0,
                block_share: block_share.clone(),
                commits: vec![],
            },
            leader_fn,
            pub_key_set.clone(),
            sec_key_share.clone(),
            broadcaster.clone(),
        );

        Self {
            uround,
            n,
            i: self_id,
            t,
            kappa,
            round: 0,
            tick: 0,
            block_share,
            commits: vec![],
            leader_fn,
            pub_key_set,
            sec_key_share,
            gc,
            backlog: BTreeMap::new(),
            delivered: None,
            started: false,
            terminated: false,
            broadcaster,
        }
    }

    /// Replaces the input block share. Only valid before the first tick.
    pub fn set_input(&mut self, block_share: BlockShare) -> Result<()> {
        if self.started {
            return Err(Error::InvalidMessage(
                "input cannot change after the first tick".to_string(),
            ));
        }
        self.block_share = block_share;
        self.restart_gc();
        Ok(())
    }

    /// Advances the protocol by one tick edge. Ticks arriving after
    /// termination are ignored.
    pub fn handle_tick(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.started = true;

        self.gc.handle_tick()?;
        self.tick += 1;
        if self.tick < TICKS_PER_ROUND {
            return Ok(());
        }

        // The round's grade is in; fold it in and move to the next round.
        self.harvest()?;
        self.tick = 0;
        self.round += 1;
        if self.round == self.kappa {
            self.terminated = true;
            log::debug!("bla({}): node {} terminating", self.uround, self.i);
            return Ok(());
        }

        self.restart_gc();
        for (initiator, msg) in self.backlog.remove(&self.round).unwrap_or_default() {
            if let Err(err) = self.gc.receive_message(initiator, msg) {
                log::warn!(
                    "bla({}): node {} dropped backlog message from {initiator}: {err}",
                    self.uround,
                    self.i
                );
            }
        }
        Ok(())
    }

    pub fn receive_message(&mut self, initiator: NodeId, msg: Message) -> Result<()> {
        if self.terminated {
            return Ok(());
        }

        let round = message_round(&msg);
        if round < self.round {
            log::debug!(
                "bla({}): node {} ignores stale round {round} message",
                self.uround,
                self.i
            );
            return Ok(());
        }
        if round > self.round {
            if round < self.kappa {
                self.backlog.entry(round).or_default().push((initiator, msg));
            }
            return Ok(());
        }

        self.gc.receive_message(initiator, msg)
    }

    /// The block share delivered with grade 2, if any round produced one.
    /// Stable once set.
    pub fn read_delivered(&self) -> Option<&BlockShare> {
        self.delivered.as_ref()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// The block share this node currently backs.
    pub fn block_share(&self) -> &BlockShare {
        &self.block_share
    }

    // Reads the finished graded-consensus round and folds it into our state.
    fn harvest(&mut self) -> Result<()> {
        let result = match self.gc.result() {
            Some(result) => result.clone(),
            None => {
                return Err(Error::Generic(
                    "graded consensus finished without a result".to_string(),
                ))
            }
        };

        if result.grade >= 1 {
            self.block_share = result.block_share.clone();
            self.commits = result.commits;
        }
        if result.grade == 2 && self.delivered.is_none() {
            log::debug!(
                "bla({}): node {} delivers in round {}",
                self.uround,
                self.i,
                self.round
            );
            self.delivered = Some(result.block_share);
        }
        Ok(())
    }

    fn restart_gc(&mut self) {
        self.gc = GradedConsensus::new(
            self.uround,
            self.n,
            self.i,
            self.t,
            self.round,
            Vote {
                round: self.round,
                block_share: self.block_share.clone(),
                commits: self.commits.clone(),
            },
            self.leader_fn,
            self.pub_key_set.clone(),
            self.sec_key_share.clone(),
            self.broadcaster.clone(),
        );
    }
}

fn message_round(msg: &Message) -> usize {
    match msg {
        Message::Vote(vm) => vm.vote.round,
        Message::Propose(pm) => pm.vote.round,
        Message::Commit(cm) => cm.round,
        Message::Notify(nm) => nm.round,
    }
}
