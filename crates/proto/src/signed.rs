use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};

/// A payload together with any number of signatures over it.
///
/// The signatures are made on the canonical channel message for the
/// payload (see the channel crate's signature module), not on the raw
/// bytes, so a signature here is scoped to one game, channel, reinit
/// and topic.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Arbitrary)]
pub struct SignedData {
    pub data: Vec<u8>,
    pub signatures: Vec<Vec<u8>>,
}

impl SignedData {
    /// Wraps a payload without any signatures.
    pub fn unsigned(data: Vec<u8>) -> Self {
        Self {
            data,
            signatures: Vec::new(),
        }
    }
}
