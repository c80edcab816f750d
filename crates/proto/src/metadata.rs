use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};

/// One party of a channel: an account name and its signing address.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Arbitrary)]
pub struct ChannelParticipant {
    pub name: String,
    pub address: String,
}

/// On-chain metadata of a channel.
///
/// The metadata is immutable within one reinitialisation; a new
/// reinitialisation (e.g. a second participant joining) replaces it as
/// a whole together with a fresh `reinit` tag.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Arbitrary)]
pub struct ChannelMetadata {
    /// Ordered list of participants.  The position in this list is the
    /// player index used throughout the board rules.
    pub participants: Vec<ChannelParticipant>,

    /// Opaque tag identifying the current reinitialisation.
    pub reinit: Vec<u8>,

    /// Protocol version of the board-state encoding.  States and proofs
    /// from other versions are rejected.
    pub proto_version: u32,
}

impl ChannelMetadata {
    /// Index of the participant with the given name, if any.
    pub fn participant_index(&self, name: &str) -> Option<usize> {
        self.participants.iter().position(|p| p.name == name)
    }
}
