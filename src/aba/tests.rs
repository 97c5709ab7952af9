use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use blsttc::SecretKeySet;

use super::message::Message;
use super::BinaryAgreement;
use crate::broadcaster::Broadcaster;
use crate::bundle::{Bundle, Origin, Outgoing};
use crate::coin::{CoinAnswer, CoinRequest, CommonCoin};
use crate::{NodeId, COIN_ID};

struct Net {
    nodes: BTreeMap<NodeId, (BinaryAgreement, Rc<RefCell<Broadcaster>>)>,
    coin: CommonCoin,
    queue: BTreeMap<NodeId, Vec<Bundle>>,
    dead: BTreeSet<NodeId>,
}

impl Net {
    fn new(n: usize, t: usize, instance: usize) -> Self {
        let sec_key_set = SecretKeySet::random(t, &mut rand::thread_rng());
        let coin = CommonCoin::new(n, sec_key_set.public_keys());

        let nodes = BTreeMap::from_iter((0..n).map(|node_id| {
            let broadcaster = Rc::new(RefCell::new(Broadcaster::new(node_id)));
            let aba = BinaryAgreement::new(
                0,
                n,
                node_id,
                t,
                instance,
                sec_key_set.secret_key_share(node_id),
                broadcaster.clone(),
            );
            (node_id, (aba, broadcaster))
        }));

        Net {
            nodes,
            coin,
            queue: BTreeMap::new(),
            dead: BTreeSet::new(),
        }
    }

    fn enqueue_bundles_from(&mut self, id: NodeId) {
        let outgoings = self.nodes.get_mut(&id).unwrap().1.borrow_mut().take_outgoings();
        self.route(outgoings);
    }

    fn route(&mut self, outgoings: Vec<Outgoing>) {
        for outgoing in outgoings {
            match outgoing {
                Outgoing::Gossip(bundle) => {
                    for recipient in self
                        .nodes
                        .keys()
                        .filter(|r| **r != bundle.initiator && !self.dead.contains(r))
                    {
                        self.queue.entry(*recipient).or_default().push(bundle.clone());
                    }
                }
                Outgoing::Direct(COIN_ID, bundle) => {
                    let request: CoinRequest =
                        bincode::deserialize(&bundle.payload).expect("Failed to deserialize");
                    let answers = self.coin.handle_request(request);
                    self.route(answers);
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
                    let node = &mut self.nodes.get_mut(&recipient).unwrap().0;
                    match bundle.origin {
                        Origin::Coin => {
                            let answer: CoinAnswer = bincode::deserialize(&bundle.payload)
                                .expect("Failed to deserialize answer");
                            node.receive_coin_answer(answer).expect("Failed to receive answer");
                        }
                        _ => {
                            let msg: Message = bincode::deserialize(&bundle.payload)
                                .expect("Failed to deserialize message");
                            node.receive_message(bundle.initiator, msg)
                                .expect("Failed to receive msg");
                        }
                    }
                }
                self.enqueue_bundles_from(recipient);
            }
        }
    }

    fn propose(&mut self, id: NodeId, value: bool) {
        self.nodes.get_mut(&id).unwrap().0.propose(value).unwrap();
        self.enqueue_bundles_from(id);
    }
}

#[test]
fn test_aba_unanimous_input_decides_that_bit() {
    let mut net = Net::new(2, 0, 0);

    net.propose(0, true);
    net.propose(1, true);
    net.drain_queue();

    for (id, (aba, _)) in &net.nodes {
        assert_eq!(aba.read_decided(), Some(true), "node {id}");
        assert!(aba.is_terminated(), "node {id}");
    }
}

#[test]
fn test_aba_unanimous_zero_decides_zero() {
    let mut net = Net::new(4, 1, 0);

    for id in 0..4 {
        net.propose(id, false);
    }
    net.drain_queue();

    for (id, (aba, _)) in &net.nodes {
        assert_eq!(aba.read_decided(), Some(false), "node {id}");
    }
}

#[test]
fn test_aba_split_inputs_with_silent_node_agree() {
    let mut net = Net::new(4, 1, 0);
    net.dead.insert(3);

    net.propose(0, false);
    net.propose(1, true);
    net.propose(2, false);
    net.drain_queue();

    let decisions: Vec<Option<bool>> = (0..3)
        .map(|id| net.nodes[&id].0.read_decided())
        .collect();
    assert!(decisions[0].is_some());
    assert!(
        decisions.iter().all(|d| *d == decisions[0]),
        "honest nodes disagree: {decisions:?}"
    );
}

#[test]
fn test_aba_decision_is_irrevocable() {
    let mut net = Net::new(2, 0, 0);

    net.propose(0, true);
    net.propose(1, true);
    net.drain_queue();

    let decided = net.nodes[&0].0.read_decided();
    assert!(decided.is_some());

    // Whatever arrives after the decision cannot change it.
    let node = &mut net.nodes.get_mut(&0).unwrap().0;
    let _ = node.receive_message(1, Message::Est(9, false));
    let _ = node.receive_coin_answer(CoinAnswer {
        round: 9,
        value: false,
    });
    assert_eq!(node.read_decided(), decided);
}

#[test]
fn test_aba_contradictory_aux_marks_sender_faulty() {
    let mut net = Net::new(4, 1, 0);

    let node = &mut net.nodes.get_mut(&0).unwrap().0;
    node.receive_message(2, Message::Aux(0, true)).unwrap();
    assert!(node.receive_message(2, Message::Aux(0, false)).is_err());
}

#[test]
fn test_aba_rejects_unknown_sender() {
    let mut net = Net::new(4, 1, 0);
    let node = &mut net.nodes.get_mut(&0).unwrap().0;
    assert!(node.receive_message(17, Message::Est(0, true)).is_err());
}
