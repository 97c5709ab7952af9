pub mod error;
pub mod message;

use std::cell::RefCell;
use std::collections::btree_map::Entry::Vacant;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use blsttc::{PublicKeySet, SecretKeyShare, Signature, SignatureShare};

use self::error::{Error, Result};
use self::message::{auth_sign_bytes, deliver_sign_bytes, Message, SenderAuth};
use crate::broadcaster::Broadcaster;
use crate::bundle::Origin;
use crate::hash::Hash32;
use crate::NodeId;

/// Reliable broadcast of one sender's value to all participants. One
/// instance runs per (uround, sender); the instance delivers at most once
/// and a Byzantine sender can cause non-delivery but never disagreement.
///
/// Participants echo the value digest, promote echoes to ready votes, and
/// deliver on a 2t+1 ready quorum. Committee members additionally sign the
/// delivered value; t+1 such shares combine into a delivery certificate
/// that both proves delivery to third parties and acts as a second delivery
/// path.
pub struct ReliableBroadcast {
    uround: usize,
    n: usize,
    i: NodeId,
    t: usize,
    sender_id: NodeId,
    committee: BTreeSet<NodeId>,
    pub_key_set: PublicKeySet,
    sec_key_share: SecretKeyShare,
    value: Option<Vec<u8>>,
    digest: Option<Hash32>,
    echos: BTreeMap<NodeId, Hash32>,
    readys: BTreeMap<NodeId, Hash32>,
    sig_shares: BTreeMap<NodeId, (Hash32, SignatureShare)>,
    echo_sent: bool,
    ready_sent: bool,
    sig_sent: bool,
    // Digest that reached the ready quorum before its payload arrived.
    ready_quorum: Option<Hash32>,
    certificate: Option<(Hash32, Signature)>,
    delivered: Option<Vec<u8>>,
    faulty: BTreeSet<NodeId>,
    broadcaster: Rc<RefCell<Broadcaster>>,
}

impl ReliableBroadcast {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uround: usize,
        n: usize,
        self_id: NodeId,
        t: usize,
        sender_id: NodeId,
        committee: BTreeSet<NodeId>,
        pub_key_set: PublicKeySet,
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
            sender_id,
            committee,
            pub_key_set,
            sec_key_share,
            value: None,
            digest: None,
            echos: BTreeMap::new(),
            readys: BTreeMap::new(),
            sig_shares: BTreeMap::new(),
            echo_sent: false,
            ready_sent: false,
            sig_sent: false,
            ready_quorum: None,
            certificate: None,
            delivered: None,
            faulty: BTreeSet::new(),
            broadcaster,
        }
    }

    /// Starts the broadcast. Only the designated sender calls this.
    pub fn broadcast(&mut self, auth: SenderAuth, value: Vec<u8>) -> Result<()> {
        if self.i != self.sender_id {
            return Err(Error::InvalidMessage(format!(
                "node {} is not the designated sender {}",
                self.i, self.sender_id
            )));
        }
        self.broadcast_msg(Message::Val(auth, value))
    }

    pub fn receive_message(&mut self, initiator: NodeId, msg: Message) -> Result<()> {
        log::debug!(
            "rbc({}, {}): node {} received {} message from {initiator}",
            self.uround,
            self.sender_id,
            self.i,
            msg.action_str(),
        );

        match msg {
            Message::Val(auth, value) => self.on_val(initiator, auth, value),
            Message::Echo(digest) => self.on_echo(initiator, digest),
            Message::Ready(digest) => self.on_ready(initiator, digest),
            Message::Sig(digest, sig_share) => self.on_sig(initiator, digest, sig_share),
        }
    }

    /// The delivered value, once the instance terminated. Stable forever
    /// after the first delivery.
    pub fn read_delivered(&self) -> Option<&Vec<u8>> {
        self.delivered.as_ref()
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered.is_some()
    }

    /// The combined committee signature over the delivered value, if t+1
    /// shares arrived. Usable as an out-of-band delivery proof.
    pub fn certificate(&self) -> Option<&Signature> {
        self.certificate.as_ref().map(|(_, sig)| sig)
    }

    /// Senders caught sending contradictory messages in this instance.
    pub fn faulty_nodes(&self) -> &BTreeSet<NodeId> {
        &self.faulty
    }

    fn on_val(&mut self, initiator: NodeId, auth: SenderAuth, value: Vec<u8>) -> Result<()> {
        if initiator != self.sender_id || auth.id != self.sender_id {
            return Err(Error::InvalidMessage(format!(
                "val message impersonating sender {}",
                self.sender_id
            )));
        }

        let sign_bytes = auth_sign_bytes(auth.id)?;
        if !self.pub_key_set.public_key().verify(&auth.sig, sign_bytes) {
            return Err(Error::InvalidMessage(
                "val message with invalid sender authentication".to_string(),
            ));
        }

        let digest = Hash32::calculate(&value);
        if let Some(known) = self.digest {
            if known != digest {
                self.faulty.insert(initiator);
                return Err(Error::InvalidMessage(format!(
                    "sender {initiator} equivocated: expected digest {known}, got {digest}"
                )));
            }
            return Ok(());
        }

        self.value = Some(value);
        self.digest = Some(digest);

        if !self.echo_sent {
            self.echo_sent = true;
            self.broadcast_msg(Message::Echo(digest))?;
        }

        self.try_deliver()
    }

    fn on_echo(&mut self, initiator: NodeId, digest: Hash32) -> Result<()> {
        match self.echos.entry(initiator) {
            Vacant(e) => e.insert(digest),
            _ => {
                return Err(Error::DuplicatedMessage(initiator, "echo".to_string()));
            }
        };

        let count = self.echos.values().filter(|d| **d == digest).count();
        if count >= self.echo_threshold() && !self.ready_sent {
            self.ready_sent = true;
            self.broadcast_msg(Message::Ready(digest))?;
        }
        Ok(())
    }

    fn on_ready(&mut self, initiator: NodeId, digest: Hash32) -> Result<()> {
        match self.readys.entry(initiator) {
            Vacant(e) => e.insert(digest),
            _ => {
                return Err(Error::DuplicatedMessage(initiator, "ready".to_string()));
            }
        };

        let count = self.readys.values().filter(|d| **d == digest).count();
        if count >= self.t + 1 && !self.ready_sent {
            // Amplification: a ready quorum seed is enough to join it.
            self.ready_sent = true;
            self.broadcast_msg(Message::Ready(digest))?;
        }
        if count >= 2 * self.t + 1 && self.ready_quorum.is_none() {
            self.ready_quorum = Some(digest);
        }

        self.try_deliver()
    }

    fn on_sig(&mut self, initiator: NodeId, digest: Hash32, sig_share: SignatureShare) -> Result<()> {
        if !self.committee.contains(&initiator) {
            return Err(Error::InvalidMessage(format!(
                "sig message from non-committee node {initiator}"
            )));
        }

        let sign_bytes = deliver_sign_bytes(self.uround, self.sender_id, &digest)?;
        if !self
            .pub_key_set
            .public_key_share(initiator)
            .verify(&sig_share, sign_bytes)
        {
            return Err(Error::InvalidMessage(format!(
                "sig message from {initiator} with invalid signature share"
            )));
        }

        match self.sig_shares.entry(initiator) {
            Vacant(e) => e.insert((digest, sig_share)),
            _ => {
                return Err(Error::DuplicatedMessage(initiator, "sig".to_string()));
            }
        };

        if self.certificate.is_none() {
            let matching: BTreeMap<NodeId, &SignatureShare> = self
                .sig_shares
                .iter()
                .filter(|(_, (d, _))| *d == digest)
                .map(|(id, (_, share))| (*id, share))
                .collect();

            if matching.len() >= self.pub_key_set.threshold() + 1 {
                let signature = self.pub_key_set.combine_signatures(matching)?;
                self.certificate = Some((digest, signature));
            }
        }

        self.try_deliver()
    }

    // Delivers the stored payload once its digest is backed by a ready
    // quorum or a committee certificate.
    fn try_deliver(&mut self) -> Result<()> {
        if self.delivered.is_some() {
            return Ok(());
        }
        let digest = match self.digest {
            Some(digest) => digest,
            None => return Ok(()),
        };

        let quorum = self.ready_quorum == Some(digest);
        let certified = matches!(&self.certificate, Some((d, _)) if *d == digest);
        if !quorum && !certified {
            return Ok(());
        }

        self.delivered = self.value.clone();
        log::debug!(
            "rbc({}, {}): node {} delivered digest {digest}",
            self.uround,
            self.sender_id,
            self.i
        );

        if self.committee.contains(&self.i) && !self.sig_sent {
            self.sig_sent = true;
            let sign_bytes = deliver_sign_bytes(self.uround, self.sender_id, &digest)?;
            let sig_share = self.sec_key_share.sign(sign_bytes);
            self.broadcast_msg(Message::Sig(digest, sig_share))?;
        }
        Ok(())
    }

    // Multicasts `msg` and processes our own copy inline.
    fn broadcast_msg(&mut self, msg: Message) -> Result<()> {
        let data = bincode::serialize(&msg)?;
        self.broadcaster
            .borrow_mut()
            .broadcast(Origin::Rbc, self.uround, 0, self.sender_id, data);
        self.receive_message(self.i, msg)
    }

    // Echo quorum is ⌈(n+t+1)/2⌉: any two quorums intersect in an honest node.
    fn echo_threshold(&self) -> usize {
        (self.n + self.t + 2) / 2
    }
}

#[cfg(test)]
#[path = "./tests.rs"]
mod tests;
