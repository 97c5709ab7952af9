use std::cell::RefCell;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use blsttc::{PublicKeySet, SecretKeyShare};

use super::error::{Error, Result};
use super::message::{
    commit_sign_bytes, propose_sign_bytes, vote_sign_bytes, CommitMessage, Message, NotifyMessage,
    ProposeMessage, Vote, VoteMessage,
};
use super::LeaderFn;
use crate::block::BlockShare;
use crate::broadcaster::Broadcaster;
use crate::bundle::Origin;
use crate::hash::Hash32;
use crate::NodeId;

/// The outcome of one graded-consensus round.
///
/// Grade 2: this node itself collected a commit quorum on the block share.
/// Grade 1: another node proved a commit quorum via a notify message.
/// Grade 0: no quorum was observed; the block share is the round's input.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GradedConsensusResult {
    pub block_share: BlockShare,
    pub commits: Vec<CommitMessage>,
    pub grade: u8,
}

// The phases map to tick edges: four sending phases, then one edge on
// which the grade is computed from everything that arrived in the meantime.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Phase {
    Vote,
    Propose,
    Commit,
    Notify,
    Finish,
    Done,
}

/// One round of graded consensus: vote, leader proposal, commit, notify.
/// Ticks come from the caller; messages are accumulated in between. On the
/// fifth tick edge the result is fixed with a confidence grade in {0, 1, 2}.
pub struct GradedConsensus {
    uround: usize,
    n: usize,
    i: NodeId,
    t: usize,
    round: usize,
    vote: Vote,
    leader_fn: LeaderFn,
    pub_key_set: PublicKeySet,
    sec_key_share: SecretKeyShare,
    phase: Phase,
    votes: BTreeMap<NodeId, VoteMessage>,
    propose: Option<ProposeMessage>,
    commits: BTreeMap<NodeId, CommitMessage>,
    // The commit quorum this node held when its notify went out.
    commit_quorum: Option<(BlockShare, Vec<CommitMessage>)>,
    notify: Option<NotifyMessage>,
    faulty: BTreeSet<NodeId>,
    result: Option<GradedConsensusResult>,
    broadcaster: Rc<RefCell<Broadcaster>>,
}

impl GradedConsensus {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uround: usize,
        n: usize,
        self_id: NodeId,
        t: usize,
        round: usize,
        vote: Vote,
        leader_fn: LeaderFn,
        pub_key_set: PublicKeySet,
        sec_key_share: SecretKeyShare,
        broadcaster: Rc<RefCell<Broadcaster>>,
    ) -> Self {
        debug_assert_eq!(self_id, broadcaster.borrow().self_id());
        debug_assert_eq!(round, vote.round);

        Self {
            uround,
            n,
            i: self_id,
            t,
            round,
            vote,
            leader_fn,
            pub_key_set,
            sec_key_share,
            phase: Phase::Vote,
            votes: BTreeMap::new(),
            propose: None,
            commits: BTreeMap::new(),
            commit_quorum: None,
            notify: None,
            faulty: BTreeSet::new(),
            result: None,
            broadcaster,
        }
    }

    /// Advances to the next phase. The caller owns the clock; one call per
    /// tick edge.
    pub fn handle_tick(&mut self) -> Result<()> {
        match self.phase {
            Phase::Vote => {
                self.phase = Phase::Propose;
                let sig = self
                    .sec_key_share
                    .sign(vote_sign_bytes(self.i, &self.vote)?);
                let msg = Message::Vote(VoteMessage {
                    sender: self.i,
                    vote: self.vote.clone(),
                    sig,
                });
                self.broadcast_msg(msg)
            }
            Phase::Propose => {
                self.phase = Phase::Commit;
                if (self.leader_fn)(self.round, self.n) == self.i {
                    self.propose_if_quorum()?;
                }
                Ok(())
            }
            Phase::Commit => {
                self.phase = Phase::Notify;
                if let Some(propose) = &self.propose {
                    let block_share = propose.vote.block_share.clone();
                    let sig = self
                        .sec_key_share
                        .sign(commit_sign_bytes(self.i, self.round, &block_share)?);
                    let msg = Message::Commit(CommitMessage {
                        sender: self.i,
                        round: self.round,
                        block_share,
                        sig,
                    });
                    self.broadcast_msg(msg)?;
                }
                Ok(())
            }
            Phase::Notify => {
                self.phase = Phase::Finish;
                self.notify_if_quorum()
            }
            Phase::Finish => {
                self.phase = Phase::Done;
                self.compute_result();
                Ok(())
            }
            Phase::Done => Ok(()),
        }
    }

    pub fn receive_message(&mut self, initiator: NodeId, msg: Message) -> Result<()> {
        log::debug!(
            "gc({}, {}): node {} received {} message from {initiator}",
            self.uround,
            self.round,
            self.i,
            msg.action_str(),
        );

        match msg {
            Message::Vote(vm) => self.on_vote(initiator, vm),
            Message::Propose(pm) => self.on_propose(initiator, *pm),
            Message::Commit(cm) => self.on_commit(initiator, cm),
            Message::Notify(nm) => self.on_notify(initiator, nm),
        }
    }

    /// The round result; `None` until the notify tick fired, stable after.
    pub fn result(&self) -> Option<&GradedConsensusResult> {
        self.result.as_ref()
    }

    pub fn round(&self) -> usize {
        self.round
    }

    /// Senders caught equivocating in this round.
    pub fn faulty_nodes(&self) -> &BTreeSet<NodeId> {
        &self.faulty
    }

    fn on_vote(&mut self, initiator: NodeId, vm: VoteMessage) -> Result<()> {
        if vm.sender != initiator {
            return Err(Error::InvalidMessage(format!(
                "vote message impersonating {}",
                vm.sender
            )));
        }
        if vm.vote.round != self.round {
            return Err(Error::InvalidMessage(format!(
                "vote for round {}, expected {}",
                vm.vote.round, self.round
            )));
        }

        let sign_bytes = vote_sign_bytes(vm.sender, &vm.vote)?;
        if !self
            .pub_key_set
            .public_key_share(vm.sender)
            .verify(&vm.sig, sign_bytes)
        {
            return Err(Error::InvalidMessage(format!(
                "vote message from {initiator} with invalid signature share"
            )));
        }

        match self.votes.entry(initiator) {
            Entry::Vacant(e) => {
                e.insert(vm);
                Ok(())
            }
            Entry::Occupied(e) => {
                if e.get().vote != vm.vote {
                    self.faulty.insert(initiator);
                    return Err(Error::InvalidMessage(format!(
                        "contradictory votes from {initiator}"
                    )));
                }
                Err(Error::DuplicatedMessage(initiator, "vote".to_string()))
            }
        }
    }

    fn on_propose(&mut self, initiator: NodeId, pm: ProposeMessage) -> Result<()> {
        let leader = (self.leader_fn)(self.round, self.n);
        if pm.sender != initiator || initiator != leader {
            return Err(Error::InvalidMessage(format!(
                "propose message from {initiator}, expected leader {leader}"
            )));
        }
        if pm.vote.round != self.round {
            return Err(Error::InvalidMessage(format!(
                "propose for round {}, expected {}",
                pm.vote.round, self.round
            )));
        }

        let sign_bytes = propose_sign_bytes(pm.sender, &pm.vote, &pm.vote_map)?;
        if !self
            .pub_key_set
            .public_key_share(pm.sender)
            .verify(&pm.sig, sign_bytes)
        {
            return Err(Error::InvalidMessage(
                "propose message with invalid signature share".to_string(),
            ));
        }

        if pm.vote_map.len() < self.quorum() {
            return Err(Error::InvalidMessage(format!(
                "propose message with {} votes, need {}",
                pm.vote_map.len(),
                self.quorum()
            )));
        }

        // Every bundled vote must be a valid signature on the proposed vote.
        let proposed_hash = pm.vote.hash()?;
        for (id, vm) in &pm.vote_map {
            if vm.sender != *id || vm.vote.hash()? != proposed_hash {
                return Err(Error::InvalidMessage(format!(
                    "propose message bundles a foreign vote for {id}"
                )));
            }
            let sign_bytes = vote_sign_bytes(vm.sender, &vm.vote)?;
            if !self
                .pub_key_set
                .public_key_share(vm.sender)
                .verify(&vm.sig, sign_bytes)
            {
                return Err(Error::InvalidMessage(format!(
                    "propose message bundles an unsigned vote for {id}"
                )));
            }
        }

        if self.propose.is_some() {
            // The leader already proposed; a second proposal is equivocation.
            self.faulty.insert(initiator);
            return Err(Error::DuplicatedMessage(initiator, "propose".to_string()));
        }
        self.propose = Some(pm);
        Ok(())
    }

    fn on_commit(&mut self, initiator: NodeId, cm: CommitMessage) -> Result<()> {
        if cm.sender != initiator {
            return Err(Error::InvalidMessage(format!(
                "commit message impersonating {}",
                cm.sender
            )));
        }
        if cm.round != self.round {
            return Err(Error::InvalidMessage(format!(
                "commit for round {}, expected {}",
                cm.round, self.round
            )));
        }

        let sign_bytes = commit_sign_bytes(cm.sender, cm.round, &cm.block_share)?;
        if !self
            .pub_key_set
            .public_key_share(cm.sender)
            .verify(&cm.sig, sign_bytes)
        {
            return Err(Error::InvalidMessage(format!(
                "commit message from {initiator} with invalid signature share"
            )));
        }

        match self.commits.entry(initiator) {
            Entry::Vacant(e) => {
                e.insert(cm);
                Ok(())
            }
            Entry::Occupied(_) => Err(Error::DuplicatedMessage(initiator, "commit".to_string())),
        }
    }

    fn on_notify(&mut self, initiator: NodeId, nm: NotifyMessage) -> Result<()> {
        if nm.round != self.round {
            return Err(Error::InvalidMessage(format!(
                "notify for round {}, expected {}",
                nm.round, self.round
            )));
        }
        if self.notify.is_some() {
            // One valid notify is all a round can use.
            return Ok(());
        }

        if nm.commits.len() < self.quorum() {
            return Err(Error::InvalidMessage(format!(
                "notify message with {} commits, need {}",
                nm.commits.len(),
                self.quorum()
            )));
        }

        let share_hash = nm.block_share.hash()?;
        let mut senders = BTreeSet::new();
        for cm in &nm.commits {
            if cm.round != self.round || cm.block_share.hash()? != share_hash {
                return Err(Error::InvalidMessage(
                    "notify message carries a commit for another block share".to_string(),
                ));
            }
            let sign_bytes = commit_sign_bytes(cm.sender, cm.round, &cm.block_share)?;
            if !self
                .pub_key_set
                .public_key_share(cm.sender)
                .verify(&cm.sig, sign_bytes)
            {
                return Err(Error::InvalidMessage(format!(
                    "notify message carries an unsigned commit for {}",
                    cm.sender
                )));
            }
            if !senders.insert(cm.sender) {
                return Err(Error::InvalidMessage(format!(
                    "notify message counts {} twice",
                    cm.sender
                )));
            }
        }

        self.notify = Some(nm);
        Ok(())
    }

    // Leader only: propose the vote that gathered a quorum, if any did.
    fn propose_if_quorum(&mut self) -> Result<()> {
        let mut by_hash: BTreeMap<Hash32, Vec<NodeId>> = BTreeMap::new();
        for (id, vm) in &self.votes {
            by_hash.entry(vm.vote.hash()?).or_default().push(*id);
        }

        let quorum = match by_hash.into_values().find(|ids| ids.len() >= self.quorum()) {
            Some(ids) => ids,
            None => {
                log::debug!(
                    "gc({}, {}): leader {} has no vote quorum",
                    self.uround,
                    self.round,
                    self.i
                );
                return Ok(());
            }
        };

        let vote = self.votes[&quorum[0]].vote.clone();
        let vote_map: BTreeMap<NodeId, VoteMessage> = quorum
            .into_iter()
            .map(|id| (id, self.votes[&id].clone()))
            .collect();
        let sig = self
            .sec_key_share
            .sign(propose_sign_bytes(self.i, &vote, &vote_map)?);

        self.broadcast_msg(Message::Propose(Box::new(ProposeMessage {
            sender: self.i,
            vote,
            vote_map,
            sig,
        })))
    }

    // Multicasts a notify message if this node collected a commit quorum.
    fn notify_if_quorum(&mut self) -> Result<()> {
        let mut by_hash: BTreeMap<Hash32, Vec<CommitMessage>> = BTreeMap::new();
        for cm in self.commits.values() {
            by_hash
                .entry(cm.block_share.hash()?)
                .or_default()
                .push(cm.clone());
        }

        if let Some(commits) = by_hash.into_values().find(|cms| cms.len() >= self.quorum()) {
            let block_share = commits[0].block_share.clone();
            self.commit_quorum = Some((block_share.clone(), commits.clone()));
            self.broadcast_msg(Message::Notify(NotifyMessage {
                sender: self.i,
                round: self.round,
                block_share,
                commits,
            }))?;
        }
        Ok(())
    }

    // Runs one tick after the notify phase, so notify messages from nodes
    // that held a quorum had time to arrive. Grade 2 needs our own quorum
    // (announced via notify), grade 1 somebody else's.
    fn compute_result(&mut self) {
        if let Some((block_share, commits)) = self.commit_quorum.take() {
            self.result = Some(GradedConsensusResult {
                block_share,
                commits,
                grade: 2,
            });
        } else if let Some(nm) = self.notify.take() {
            self.result = Some(GradedConsensusResult {
                block_share: nm.block_share,
                commits: nm.commits,
                grade: 1,
            });
        } else {
            self.result = Some(GradedConsensusResult {
                block_share: self.vote.block_share.clone(),
                commits: self.vote.commits.clone(),
                grade: 0,
            });
        }
    }

    // Multicasts `msg` and processes our own copy inline. Notify messages
    // are not fed back: the round result is already computed from the
    // commits themselves.
    fn broadcast_msg(&mut self, msg: Message) -> Result<()> {
        let data = bincode::serialize(&msg)?;
        self.broadcaster
            .borrow_mut()
            .broadcast(Origin::Bla, self.uround, self.round, 0, data);
        if matches!(msg, Message::Notify(_)) {
            return Ok(());
        }
        self.receive_message(self.i, msg)
    }

    // n - t: enough votes or commits that any two quorums share an honest node.
    fn quorum(&self) -> usize {
        self.n - self.t
    }
}
