//! Canonical signature messages for channel data.
//!
//! Every signature in a channel covers a deterministic text built from
//! the game id, channel id, reinit tag, a topic string and the payload
//! hash.  The topic separates signature domains (a signed state can
//! never double as a signed move), and including the reinit tag makes
//! signatures worthless across reinitialisations.

use std::collections::BTreeSet;

use armada_crypto::{SignatureSigner, SignatureVerifier};
use armada_primitives::b64;
use armada_primitives::hash::sha256;
use armada_primitives::Id256;
use armada_proto::{ChannelMetadata, SignedData};
use tracing::warn;

/// Topic for signatures over board states.
pub const TOPIC_STATE: &str = "state";

/// Topic for signatures over moves.
pub const TOPIC_MOVE: &str = "move";

fn check_topic(topic: &str) {
    assert!(
        !topic.is_empty() && topic.bytes().all(|b| b.is_ascii_alphanumeric()),
        "invalid signature topic: {topic:?}"
    );
}

/// Builds the canonical message signed for a (topic, payload) pair.
///
/// The topic must be non-empty ASCII alphanumeric; anything else is a
/// programming error and panics.
pub fn channel_signature_message(
    game_id: &str,
    channel_id: &Id256,
    meta: &ChannelMetadata,
    topic: &str,
    data: &[u8],
) -> String {
    check_topic(topic);

    format!(
        "Game-Channel Signature\n\
         Game ID: {}\n\
         Channel: {}\n\
         Reinit: {}\n\
         Topic: {}\n\
         Data Hash: {}",
        game_id,
        channel_id.to_hex(),
        b64::encode(&meta.reinit),
        topic,
        sha256(data).to_hex()
    )
}

/// Returns the indices of all participants that have a valid signature
/// on the given data.  Multiple signatures by the same participant
/// count once.
pub fn verify_participant_signatures(
    verifier: &dyn SignatureVerifier,
    game_id: &str,
    channel_id: &Id256,
    meta: &ChannelMetadata,
    topic: &str,
    data: &SignedData,
) -> BTreeSet<usize> {
    let msg = channel_signature_message(game_id, channel_id, meta, topic, &data.data);

    let addresses: BTreeSet<String> = data
        .signatures
        .iter()
        .map(|sgn| verifier.recover_signer(&msg, sgn))
        .collect();

    meta.participants
        .iter()
        .enumerate()
        .filter(|(_, p)| addresses.contains(&p.address))
        .map(|(i, _)| i)
        .collect()
}

/// Signs the data on behalf of the participant with the given index,
/// appending the signature.  Fails (returning false) when the signer
/// does not hold that participant's address.
pub fn sign_data_for_participant(
    signer: &dyn SignatureSigner,
    game_id: &str,
    channel_id: &Id256,
    meta: &ChannelMetadata,
    topic: &str,
    index: usize,
    data: &mut SignedData,
) -> bool {
    let Some(participant) = meta.participants.get(index) else {
        warn!(index, "no such participant to sign for");
        return false;
    };
    if participant.address != signer.address() {
        warn!(
            wanted = %participant.address,
            have = %signer.address(),
            "signer is for a different address"
        );
        return false;
    }

    let msg = channel_signature_message(game_id, channel_id, meta, topic, &data.data);
    data.signatures.push(signer.sign_message(&msg));
    true
}

#[cfg(test)]
mod tests {
    use armada_test_utils::{fake_metadata, FakeSigner, FakeVerifier};

    use super::*;

    const GAME: &str = "testgame";

    fn channel_id() -> Id256 {
        sha256(b"channel")
    }

    #[test]
    fn topics_change_the_message() {
        let meta = fake_metadata(&[("alice", "addr a"), ("bob", "addr b")], b"reinit");
        let with_topic = |topic| channel_signature_message(GAME, &channel_id(), &meta, topic, b"x");
        assert_ne!(with_topic(TOPIC_STATE), with_topic(TOPIC_MOVE));
    }

    #[test]
    fn reinit_changes_the_message() {
        let meta1 = fake_metadata(&[("alice", "addr a")], b"r1");
        let meta2 = fake_metadata(&[("alice", "addr a")], b"r2");
        let id = channel_id();
        assert_ne!(
            channel_signature_message(GAME, &id, &meta1, TOPIC_STATE, b"x"),
            channel_signature_message(GAME, &id, &meta2, TOPIC_STATE, b"x"),
        );
    }

    #[test]
    #[should_panic(expected = "invalid signature topic")]
    fn non_alphanumeric_topic_panics() {
        let meta = fake_metadata(&[("alice", "addr a")], b"r");
        channel_signature_message(GAME, &channel_id(), &meta, "sta te", b"x");
    }

    #[test]
    fn signatures_recover_participant_indices() {
        let meta = fake_metadata(&[("alice", "addr a"), ("bob", "addr b")], b"reinit");
        let id = channel_id();
        let mut data = SignedData::unsigned(b"payload".to_vec());

        let bob = FakeSigner::new("addr b");
        assert!(sign_data_for_participant(
            &bob, GAME, &id, &meta, TOPIC_STATE, 1, &mut data
        ));
        // Signing twice for the same participant still counts once.
        assert!(sign_data_for_participant(
            &bob, GAME, &id, &meta, TOPIC_STATE, 1, &mut data
        ));

        let signers =
            verify_participant_signatures(&FakeVerifier, GAME, &id, &meta, TOPIC_STATE, &data);
        assert_eq!(signers.into_iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn wrong_address_cannot_sign() {
        let meta = fake_metadata(&[("alice", "addr a")], b"reinit");
        let mut data = SignedData::unsigned(b"payload".to_vec());
        let bob = FakeSigner::new("addr b");
        assert!(!sign_data_for_participant(
            &bob,
            GAME,
            &channel_id(),
            &meta,
            TOPIC_STATE,
            0,
            &mut data
        ));
        assert!(data.signatures.is_empty());
    }

    #[test]
    fn signature_is_bound_to_the_topic() {
        let meta = fake_metadata(&[("alice", "addr a")], b"reinit");
        let id = channel_id();
        let mut data = SignedData::unsigned(b"payload".to_vec());
        let alice = FakeSigner::new("addr a");
        assert!(sign_data_for_participant(
            &alice, GAME, &id, &meta, TOPIC_STATE, 0, &mut data
        ));

        let on_move =
            verify_participant_signatures(&FakeVerifier, GAME, &id, &meta, TOPIC_MOVE, &data);
        assert!(on_move.is_empty());
    }
}
