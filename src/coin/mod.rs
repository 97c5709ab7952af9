use std::collections::btree_map::Entry::Vacant;
use std::collections::BTreeMap;

use blsttc::{PublicKeySet, SignatureShare};
use serde::{Deserialize, Serialize};

use crate::bundle::{Bundle, Origin, Outgoing};
use crate::hash::Hash32;
use crate::NodeId;

/// A request for the coin value of (uround, round, instance). The signature
/// share is produced on [`round_sign_bytes`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CoinRequest {
    pub sender: NodeId,
    pub uround: usize,
    pub round: usize,
    pub instance: usize,
    pub sig_share: SignatureShare,
}

/// The coin value, sent back to each requester on its coin queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct CoinAnswer {
    pub round: usize,
    pub value: bool,
}

/// The bytes every participant signs for round `round`: the SHA-256 digest
/// of the encoded round number.
pub fn round_sign_bytes(round: usize) -> Result<Vec<u8>, bincode::Error> {
    Ok(Hash32::calculate(&bincode::serialize(&round)?).to_bytes())
}

type CoinKey = (usize, usize, usize); // (uround, round, instance)

/// CommonCoin turns t+1 threshold-signature shares on a round number into a
/// single unpredictable bit. It is a long-lived service: one instance serves
/// every (uround, round, instance) and caches each computed value so late
/// requesters get the same answer.
pub struct CommonCoin {
    n: usize,
    pub_key_set: PublicKeySet,
    received: BTreeMap<CoinKey, BTreeMap<NodeId, SignatureShare>>,
    values: BTreeMap<CoinKey, bool>,
}

impl CommonCoin {
    pub fn new(n: usize, pub_key_set: PublicKeySet) -> Self {
        Self {
            n,
            pub_key_set,
            received: BTreeMap::new(),
            values: BTreeMap::new(),
        }
    }

    /// Processes one request. Invalid shares are dropped without changing
    /// state; share-combine failures drop the triggering request. The
    /// returned outgoings are answer bundles addressed to requesters.
    pub fn handle_request(&mut self, request: CoinRequest) -> Vec<Outgoing> {
        let key = (request.uround, request.round, request.instance);

        let sign_bytes = match round_sign_bytes(request.round) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("coin failed to build sign bytes for round {}: {err}", request.round);
                return vec![];
            }
        };

        if request.sender >= self.n
            || !self
                .pub_key_set
                .public_key_share(request.sender)
                .verify(&request.sig_share, &sign_bytes)
        {
            log::warn!(
                "coin couldn't verify signature share from node {}",
                request.sender
            );
            return vec![];
        }

        if let Some(value) = self.values.get(&key) {
            // The value is known already. Answer only this requester.
            return vec![self.answer(&request, *value)];
        }

        let threshold = self.threshold();
        let shares = self.received.entry(key).or_default();
        if let Vacant(e) = shares.entry(request.sender) {
            e.insert(request.sig_share.clone());
        }

        if shares.len() < threshold {
            return vec![];
        }

        // Enough shares for (uround, round, instance). Combine them into a
        // certificate and take the least significant bit of its hash.
        let signature = match self.pub_key_set.combine_signatures(shares.iter()) {
            Ok(signature) => signature,
            Err(err) => {
                log::warn!("coin failed to combine shares for round {}: {err}", request.round);
                return vec![];
            }
        };

        let cert_hash = Hash32::calculate(&signature.to_bytes());
        let value = cert_hash.as_fixed_bytes()[31] & 1 == 1;
        self.values.insert(key, value);
        log::debug!(
            "coin for uround {} round {} instance {} is {value}",
            request.uround,
            request.round,
            request.instance
        );

        let requesters: Vec<NodeId> = shares.keys().copied().collect();
        requesters
            .into_iter()
            .map(|requester| {
                self.answer(
                    &CoinRequest {
                        sender: requester,
                        ..request.clone()
                    },
                    value,
                )
            })
            .collect()
    }

    fn answer(&self, request: &CoinRequest, value: bool) -> Outgoing {
        let answer = CoinAnswer {
            round: request.round,
            value,
        };
        let bundle = Bundle {
            uround: request.uround,
            round: request.round,
            instance: request.instance,
            origin: Origin::Coin,
            initiator: crate::COIN_ID,
            target: Some(request.sender),
            // CoinAnswer serialization is infallible: two plain fields.
            payload: bincode::serialize(&answer).unwrap_or_default(),
        };
        Outgoing::Direct(request.sender, bundle)
    }

    // The number of shares needed for a certificate.
    fn threshold(&self) -> usize {
        self.pub_key_set.threshold() + 1
    }
}
