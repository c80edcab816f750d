//! Wire messages exchanged between channel participants and the chain.
//!
//! Everything that ends up inside a signature or an on-chain move is
//! encoded with borsh.  Borsh has a canonical byte representation and
//! strict decoding (no trailing bytes, no unknown content), which is
//! what signed state proofs need: any extension of these messages makes
//! old decoders reject the data instead of silently dropping fields.

mod broadcast;
mod metadata;
mod proof;
mod signed;

pub use broadcast::BroadcastEnvelope;
pub use metadata::{ChannelMetadata, ChannelParticipant};
pub use proof::{StateProof, StateTransition};
pub use signed::SignedData;

use armada_primitives::b64;
use borsh::{BorshDeserialize, BorshSerialize};

/// Serializes a message to its canonical byte form.
pub fn encode_message<T: BorshSerialize>(msg: &T) -> Vec<u8> {
    borsh::to_vec(msg).expect("borsh encoding")
}

/// Decodes a message, rejecting malformed or trailing data.
pub fn decode_message<T: BorshDeserialize>(data: &[u8]) -> Option<T> {
    T::try_from_slice(data).ok()
}

/// Serializes a message and wraps it in base64 for JSON transport.
pub fn message_to_base64<T: BorshSerialize>(msg: &T) -> String {
    b64::encode(&encode_message(msg))
}

/// Decodes a base64-wrapped message from JSON transport.
pub fn message_from_base64<T: BorshDeserialize>(data: &str) -> Option<T> {
    decode_message(&b64::decode(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_proof() -> StateProof {
        StateProof {
            initial_state: SignedData {
                data: b"initial".to_vec(),
                signatures: vec![b"sig0".to_vec(), b"sig1".to_vec()],
            },
            transitions: vec![StateTransition {
                mv: Some(SignedData {
                    data: b"a move".to_vec(),
                    signatures: vec![b"sig".to_vec()],
                }),
                new_state: SignedData {
                    data: b"next".to_vec(),
                    signatures: vec![],
                },
            }],
        }
    }

    #[test]
    fn proof_roundtrip() {
        let proof = sample_proof();
        let bytes = encode_message(&proof);
        assert_eq!(decode_message::<StateProof>(&bytes), Some(proof));
    }

    #[test]
    fn base64_roundtrip() {
        let meta = ChannelMetadata {
            participants: vec![ChannelParticipant {
                name: "alice".to_owned(),
                address: "addr 1".to_owned(),
            }],
            reinit: vec![1, 2, 3],
            proto_version: 1,
        };
        let encoded = message_to_base64(&meta);
        assert_eq!(message_from_base64::<ChannelMetadata>(&encoded), Some(meta));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode_message(&sample_proof());
        bytes.push(0);
        assert_eq!(decode_message::<StateProof>(&bytes), None);
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(decode_message::<StateProof>(b"\xff\xff\xff\xff"), None);
        assert_eq!(message_from_base64::<StateProof>("%%%"), None);
    }
}
