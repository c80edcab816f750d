use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};

use crate::signed::SignedData;

/// One step of a state proof: an optional move made by the player whose
/// turn it was, and the resulting state.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Arbitrary)]
pub struct StateTransition {
    /// The move leading to `new_state`, signed on the `move` topic by
    /// the player whose turn it was.  Absent when the transition is
    /// justified purely by a quorum on the new state.
    pub mv: Option<SignedData>,

    /// The successor state, possibly signed on the `state` topic.
    pub new_state: SignedData,
}

/// A chain of signed transitions proving a later board state from a
/// reinitialisation state.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Arbitrary)]
pub struct StateProof {
    pub initial_state: SignedData,
    pub transitions: Vec<StateTransition>,
}

impl StateProof {
    /// A trivial proof consisting of just an unsigned state.
    pub fn for_state(state: Vec<u8>) -> Self {
        Self {
            initial_state: SignedData::unsigned(state),
            transitions: Vec::new(),
        }
    }

    /// The final state bytes claimed by this proof, without any
    /// signature verification.  Useful for persistence comparisons and
    /// freshness checks on already-validated proofs.
    pub fn end_state(&self) -> &[u8] {
        match self.transitions.last() {
            Some(t) => &t.new_state.data,
            None => &self.initial_state.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_state_without_transitions() {
        let proof = StateProof::for_state(b"base".to_vec());
        assert_eq!(proof.end_state(), b"base");
    }

    #[test]
    fn end_state_follows_last_transition() {
        let mut proof = StateProof::for_state(b"base".to_vec());
        for state in [b"one".as_slice(), b"two".as_slice()] {
            proof.transitions.push(StateTransition {
                mv: None,
                new_state: SignedData::unsigned(state.to_vec()),
            });
        }
        assert_eq!(proof.end_state(), b"two");
    }
}
