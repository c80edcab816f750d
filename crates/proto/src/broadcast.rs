use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};

use crate::proof::StateProof;

/// Message exchanged over the off-chain broadcast channel: a state
/// proof tagged with the reinitialisation it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Arbitrary)]
pub struct BroadcastEnvelope {
    pub reinit: Vec<u8>,
    pub proof: StateProof,
}
