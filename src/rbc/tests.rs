use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use blsttc::SecretKeySet;

use super::message::{auth_sign_bytes, deliver_sign_bytes, Message, SenderAuth};
use super::ReliableBroadcast;
use crate::broadcaster::Broadcaster;
use crate::bundle::{Bundle, Outgoing};
use crate::hash::Hash32;
use crate::NodeId;

struct NetNode {
    rbcs: BTreeMap<NodeId, ReliableBroadcast>, // per sender
    broadcaster: Rc<RefCell<Broadcaster>>,
}

struct Net {
    sec_key_set: SecretKeySet,
    nodes: BTreeMap<NodeId, NetNode>,
    queue: BTreeMap<NodeId, Vec<Bundle>>,
    dead: BTreeSet<NodeId>,
}

impl Net {
    fn new(n: usize, t: usize, senders: &[NodeId], committee: BTreeSet<NodeId>) -> Self {
        let sec_key_set = SecretKeySet::random(t, &mut rand::thread_rng());
        let pub_key_set = sec_key_set.public_keys();

        let nodes = BTreeMap::from_iter((0..n).map(|node_id| {
            let broadcaster = Rc::new(RefCell::new(Broadcaster::new(node_id)));
            let rbcs = BTreeMap::from_iter(senders.iter().map(|sender_id| {
                let rbc = ReliableBroadcast::new(
                    0,
                    n,
                    node_id,
                    t,
                    *sender_id,
                    committee.clone(),
                    pub_key_set.clone(),
                    sec_key_set.secret_key_share(node_id),
                    broadcaster.clone(),
                );
                (*sender_id, rbc)
            }));
            (node_id, NetNode { rbcs, broadcaster })
        }));

        Net {
            sec_key_set,
            nodes,
            queue: BTreeMap::new(),
            dead: BTreeSet::new(),
        }
    }

    fn auth(&self, id: NodeId) -> SenderAuth {
        let sign_bytes = auth_sign_bytes(id).unwrap();
        SenderAuth {
            id,
            sig: self.sec_key_set.secret_key().sign(sign_bytes),
        }
    }

    fn enqueue_bundles_from(&mut self, id: NodeId) {
        let outgoings = self
            .nodes
            .get_mut(&id)
            .unwrap()
            .broadcaster
            .borrow_mut()
            .take_outgoings();

        for outgoing in outgoings {
            match outgoing {
                Outgoing::Gossip(bundle) => {
                    // Nodes process their own messages inline, so gossip
                    // only travels to the other participants.
                    for recipient in self
                        .nodes
                        .keys()
                        .filter(|r| **r != bundle.initiator && !self.dead.contains(r))
                    {
                        self.queue.entry(*recipient).or_default().push(bundle.clone());
                    }
                }
                Outgoing::Direct(recipient, bundle) => {
                    if !self.dead.contains(&recipient) {
                        self.queue.entry(recipient).or_default().push(bundle);
                    }
                }
            }
        }
    }

    fn drain_queue(&mut self) {
        while !self.queue.is_empty() {
            for (recipient, bundles) in std::mem::take(&mut self.queue) {
                for bundle in bundles {
                    let msg: Message = bincode::deserialize(&bundle.payload)
                        .expect("Failed to deserialize message");
                    let node = self.nodes.get_mut(&recipient).unwrap();
                    node.rbcs
                        .get_mut(&bundle.instance)
                        .unwrap()
                        .receive_message(bundle.initiator, msg)
                        .expect("Failed to receive msg");
                }
                self.enqueue_bundles_from(recipient);
            }
        }
    }
}

#[test]
fn test_rbc_happy_path_with_committee() {
    // One silent (Byzantine) node out of four; committee of two.
    let committee = BTreeSet::from([0, 1]);
    let mut net = Net::new(4, 1, &[0], committee);
    let auth = net.auth(0);

    let sender = net.nodes.get_mut(&0).unwrap();
    sender
        .rbcs
        .get_mut(&0)
        .unwrap()
        .broadcast(auth, b"foo".to_vec())
        .unwrap();
    net.enqueue_bundles_from(0);

    // Node 3 plays dead.
    net.dead.insert(3);
    net.queue.remove(&3);
    net.drain_queue();

    for id in 0..3 {
        let rbc = &net.nodes[&id].rbcs[&0];
        assert_eq!(rbc.read_delivered(), Some(&b"foo".to_vec()), "node {id}");
        // Committee shares were exchanged, so the proof is available.
        assert!(rbc.certificate().is_some(), "node {id}");
    }
}

#[test]
fn test_rbc_parallel_senders() {
    // Three honest nodes, each broadcasting its own value.
    let inputs: [&[u8]; 3] = [b"zero", b"one", b"two"];
    let mut net = Net::new(3, 0, &[0, 1, 2], BTreeSet::from([1]));

    for sender_id in 0..3 {
        let auth = net.auth(sender_id);
        net.nodes
            .get_mut(&sender_id)
            .unwrap()
            .rbcs
            .get_mut(&sender_id)
            .unwrap()
            .broadcast(auth, inputs[sender_id].to_vec())
            .unwrap();
        net.enqueue_bundles_from(sender_id);
    }
    net.drain_queue();

    for (id, node) in &net.nodes {
        for sender_id in 0..3 {
            assert_eq!(
                node.rbcs[&sender_id].read_delivered(),
                Some(&inputs[sender_id].to_vec()),
                "node {id}, sender {sender_id}"
            );
        }
    }
}

#[test]
fn test_rbc_delivers_exactly_once() {
    let mut net = Net::new(4, 1, &[0], BTreeSet::new());
    let auth = net.auth(0);

    net.nodes
        .get_mut(&0)
        .unwrap()
        .rbcs
        .get_mut(&0)
        .unwrap()
        .broadcast(auth, b"once".to_vec())
        .unwrap();
    net.enqueue_bundles_from(0);
    net.drain_queue();

    let node = net.nodes.get_mut(&1).unwrap();
    let rbc = node.rbcs.get_mut(&0).unwrap();
    assert_eq!(rbc.read_delivered(), Some(&b"once".to_vec()));

    // A straggling ready changes nothing.
    let digest = Hash32::calculate(b"once");
    let _ = rbc.receive_message(3, Message::Ready(digest));
    assert_eq!(rbc.read_delivered(), Some(&b"once".to_vec()));
}

#[test]
fn test_rbc_rejects_forged_sender_auth() {
    let net = Net::new(4, 1, &[0], BTreeSet::new());
    let mut receiver = {
        let broadcaster = Rc::new(RefCell::new(Broadcaster::new(1)));
        ReliableBroadcast::new(
            0,
            4,
            1,
            1,
            0,
            BTreeSet::new(),
            net.sec_key_set.public_keys(),
            net.sec_key_set.secret_key_share(1_usize),
            broadcaster,
        )
    };

    // Authentication for the wrong id does not transfer to node 0.
    let forged = SenderAuth {
        id: 0,
        sig: net
            .sec_key_set
            .secret_key()
            .sign(auth_sign_bytes(2).unwrap()),
    };
    assert!(receiver
        .receive_message(0, Message::Val(forged, b"evil".to_vec()))
        .is_err());
    assert!(!receiver.is_delivered());
}

#[test]
fn test_rbc_certificate_path_delivers_without_ready_quorum() {
    let committee = BTreeSet::from([0, 1]);
    let net = Net::new(4, 1, &[0], committee.clone());
    let pub_key_set = net.sec_key_set.public_keys();

    let broadcaster = Rc::new(RefCell::new(Broadcaster::new(2)));
    let mut receiver = ReliableBroadcast::new(
        0,
        4,
        2,
        1,
        0,
        committee,
        pub_key_set,
        net.sec_key_set.secret_key_share(2_usize),
        broadcaster,
    );

    let value = b"certified".to_vec();
    let digest = Hash32::calculate(&value);
    receiver
        .receive_message(0, Message::Val(net.auth(0), value.clone()))
        .unwrap();
    assert!(!receiver.is_delivered());

    // t+1 committee shares stand in for the ready quorum.
    let sign_bytes = deliver_sign_bytes(0, 0, &digest).unwrap();
    for committee_id in [0_usize, 1] {
        let share = net.sec_key_set.secret_key_share(committee_id).sign(&sign_bytes);
        receiver
            .receive_message(committee_id, Message::Sig(digest, share))
            .unwrap();
    }

    assert_eq!(receiver.read_delivered(), Some(&value));
    assert!(receiver.certificate().is_some());
}

#[test]
fn test_rbc_sig_from_non_committee_is_rejected() {
    let committee = BTreeSet::from([0, 1]);
    let net = Net::new(4, 1, &[0], committee.clone());

    let broadcaster = Rc::new(RefCell::new(Broadcaster::new(2)));
    let mut receiver = ReliableBroadcast::new(
        0,
        4,
        2,
        1,
        0,
        committee,
        net.sec_key_set.public_keys(),
        net.sec_key_set.secret_key_share(2_usize),
        broadcaster,
    );

    let digest = Hash32::calculate(b"value");
    let sign_bytes = deliver_sign_bytes(0, 0, &digest).unwrap();
    let share = net.sec_key_set.secret_key_share(3_usize).sign(sign_bytes);
    assert!(receiver.receive_message(3, Message::Sig(digest, share)).is_err());
}
