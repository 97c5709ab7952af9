pub mod error;
pub mod message;

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use blsttc::SecretKeyShare;

use self::error::{Error, Result};
use self::message::Message;
use crate::broadcaster::Broadcaster;
use crate::bundle::Origin;
use crate::coin::{round_sign_bytes, CoinAnswer, CoinRequest};
use crate::NodeId;

/// Agreement on a single bit, terminating with probability 1. One instance
/// runs per (uround, instance).
///
/// Each round: estimates are exchanged and amplified until a value is
/// backed by 2t+1 senders, the backed values are cross-checked with aux
/// messages from n-t senders, and the common coin breaks the tie. A round
/// decides when the aux values are unanimous and match the coin. The
/// decision is irrevocable; the instance keeps participating for two more
/// rounds so slower nodes can converge, then goes inert.
pub struct BinaryAgreement {
    uround: usize,
    n: usize,
    i: NodeId,
    t: usize,
    instance: usize,
    round: usize,
    est: bool,
    est_recv: BTreeMap<(usize, bool), BTreeSet<NodeId>>,
    aux_recv: BTreeMap<usize, BTreeMap<NodeId, bool>>,
    bin_values: BTreeMap<usize, BTreeSet<bool>>,
    est_sent: BTreeSet<(usize, bool)>,
    aux_sent: BTreeSet<usize>,
    coin_requested: BTreeSet<usize>,
    // The aux value set frozen when the coin for a round was requested.
    pending_vals: BTreeMap<usize, BTreeSet<bool>>,
    decided: Option<bool>,
    decided_round: Option<usize>,
    terminated: bool,
    faulty: BTreeSet<NodeId>,
    sec_key_share: SecretKeyShare,
    broadcaster: Rc<RefCell<Broadcaster>>,
}

impl BinaryAgreement {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uround: usize,
        n: usize,
        self_id: NodeId,
        t: usize,
        instance: usize,
        sec_key_share: SecretKeyShare,
        broadcaster: Rc<RefCell<Broadcaster>>,
    ) -> Self {
        debug_assert_eq!(self_id, broadcaster.borrow().self_id());
        debug_assert!(n > 3 * t);

        Self {
            uround,
            n,
            i: self_id,
            t,
            instance,
            round: 0,
            est: false,
            est_recv: BTreeMap::new(),
            aux_recv: BTreeMap::new(),
            bin_values: BTreeMap::new(),
            est_sent: BTreeSet::new(),
            aux_sent: BTreeSet::new(),
            coin_requested: BTreeSet::new(),
            pending_vals: BTreeMap::new(),
            decided: None,
            decided_round: None,
            terminated: false,
            faulty: BTreeSet::new(),
            sec_key_share,
            broadcaster,
        }
    }

    /// Starts the instance with this node's input bit.
    pub fn propose(&mut self, value: bool) -> Result<()> {
        self.est = value;
        self.send_est(0, value)?;
        self.progress()
    }

    pub fn receive_message(&mut self, initiator: NodeId, msg: Message) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        if initiator >= self.n {
            return Err(Error::InvalidMessage(format!(
                "message from unknown node {initiator}"
            )));
        }

        log::debug!(
            "aba({}, {}): node {} received {} message from {initiator}",
            self.uround,
            self.instance,
            self.i,
            msg.action_str(),
        );

        match msg {
            Message::Est(round, value) => {
                if !self
                    .est_recv
                    .entry((round, value))
                    .or_default()
                    .insert(initiator)
                {
                    return Err(Error::DuplicatedMessage(initiator, "est".to_string()));
                }
            }
            Message::Aux(round, value) => {
                let received = self.aux_recv.entry(round).or_default();
                if let Some(known) = received.get(&initiator) {
                    if *known != value {
                        self.faulty.insert(initiator);
                        return Err(Error::InvalidMessage(format!(
                            "contradictory aux values from {initiator}"
                        )));
                    }
                    return Err(Error::DuplicatedMessage(initiator, "aux".to_string()));
                }
                received.insert(initiator, value);
            }
        }

        self.progress()
    }

    /// Feeds the answer for a previously requested coin. Answers for other
    /// rounds are ignored.
    pub fn receive_coin_answer(&mut self, answer: CoinAnswer) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        if answer.round != self.round || !self.coin_requested.contains(&answer.round) {
            log::debug!(
                "aba({}, {}): node {} ignores coin answer for round {}",
                self.uround,
                self.instance,
                self.i,
                answer.round
            );
            return Ok(());
        }

        let vals = match self.pending_vals.get(&answer.round) {
            Some(vals) => vals.clone(),
            None => {
                return Err(Error::Generic(
                    "coin answered a round with no frozen aux values".to_string(),
                ))
            }
        };

        if vals.len() == 1 {
            let v = *vals.iter().next().ok_or_else(|| {
                Error::Generic("frozen aux value set is empty".to_string())
            })?;
            self.est = v;
            if v == answer.value && self.decided.is_none() {
                self.decided = Some(v);
                self.decided_round = Some(self.round);
                log::debug!(
                    "aba({}, {}): node {} decides {v} in round {}",
                    self.uround,
                    self.instance,
                    self.i,
                    self.round
                );
            }
        } else {
            self.est = answer.value;
        }

        self.round += 1;
        if let Some(decided_round) = self.decided_round {
            // Two helper rounds after the decision are enough for everyone
            // else; after that the instance goes quiet.
            if self.round > decided_round + 2 {
                self.terminated = true;
                log::debug!(
                    "aba({}, {}): node {} terminating",
                    self.uround,
                    self.instance,
                    self.i
                );
                return Ok(());
            }
        }

        let est = self.est;
        let round = self.round;
        self.send_est(round, est)?;
        self.progress()
    }

    /// The decided bit. Stable forever after the first decision.
    pub fn read_decided(&self) -> Option<bool> {
        self.decided
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Senders caught sending contradictory messages in this instance.
    pub fn faulty_nodes(&self) -> &BTreeSet<NodeId> {
        &self.faulty
    }

    // Fires every pending trigger. Amplification and aux broadcasting are
    // message-driven and run for any round; the coin request belongs to the
    // round the instance is currently in.
    fn progress(&mut self) -> Result<()> {
        let rounds: BTreeSet<usize> = self
            .est_recv
            .keys()
            .map(|(round, _)| *round)
            .chain(self.aux_recv.keys().copied())
            .chain([self.round])
            .collect();

        for round in rounds {
            for value in [false, true] {
                let mut count = self
                    .est_recv
                    .get(&(round, value))
                    .map_or(0, |senders| senders.len());

                if count >= self.t + 1 && !self.est_sent.contains(&(round, value)) {
                    // Amplification: enough honest backing to relay.
                    self.send_est(round, value)?;
                    count = self
                        .est_recv
                        .get(&(round, value))
                        .map_or(0, |senders| senders.len());
                }
                if count >= 2 * self.t + 1
                    && self.bin_values.entry(round).or_default().insert(value)
                    && !self.aux_sent.contains(&round)
                {
                    self.aux_sent.insert(round);
                    self.broadcast_msg(Message::Aux(round, value))?;
                }
            }
        }

        self.request_coin_if_ready()
    }

    fn request_coin_if_ready(&mut self) -> Result<()> {
        let round = self.round;
        if self.coin_requested.contains(&round) {
            return Ok(());
        }
        let bin_values = match self.bin_values.get(&round) {
            Some(values) if !values.is_empty() => values,
            _ => return Ok(()),
        };

        let qualified: Vec<bool> = self
            .aux_recv
            .get(&round)
            .map(|received| {
                received
                    .values()
                    .filter(|value| bin_values.contains(value))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        if qualified.len() < self.n - self.t {
            return Ok(());
        }

        let vals: BTreeSet<bool> = qualified.into_iter().collect();
        self.pending_vals.insert(round, vals);
        self.coin_requested.insert(round);

        let request = CoinRequest {
            sender: self.i,
            uround: self.uround,
            round,
            instance: self.instance,
            sig_share: self.sec_key_share.sign(round_sign_bytes(round)?),
        };
        let data = bincode::serialize(&request)?;
        self.broadcaster.borrow_mut().send_to(
            Origin::Coin,
            self.uround,
            round,
            self.instance,
            data,
            crate::COIN_ID,
        );
        Ok(())
    }

    fn send_est(&mut self, round: usize, value: bool) -> Result<()> {
        if !self.est_sent.insert((round, value)) {
            return Ok(());
        }
        self.broadcast_msg(Message::Est(round, value))
    }

    // Multicasts `msg` under the round it belongs to and counts our own
    // copy directly, without running the trigger scan the public receive
    // path does.
    fn broadcast_msg(&mut self, msg: Message) -> Result<()> {
        let data = bincode::serialize(&msg)?;
        let (Message::Est(round, _) | Message::Aux(round, _)) = msg;
        self.broadcaster
            .borrow_mut()
            .broadcast(Origin::Aba, self.uround, round, self.instance, data);
        match msg {
            Message::Est(round, value) => {
                self.est_recv
                    .entry((round, value))
                    .or_default()
                    .insert(self.i);
            }
            Message::Aux(round, value) => {
                self.aux_recv.entry(round).or_default().insert(self.i, value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "./tests.rs"]
mod tests;
