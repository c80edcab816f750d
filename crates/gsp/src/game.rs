//! Dispute and resolution processing against the channel registry.

use armada_channel::proof::verify_state_proof;
use armada_channel::rules::{BoardRules, ParsedState};
use armada_crypto::SignatureVerifier;
use armada_primitives::hash::Sha256Writer;
use armada_primitives::Id256;
use armada_proto::{ChannelMetadata, StateProof};
use tracing::{debug, warn};

use crate::registry::Channel;

/// A dispute is force-closed once its filed height is this many blocks
/// behind the current height; the player whose turn it is loses.
pub const DISPUTE_BLOCKS: u64 = 10;

/// Channels stuck with a single participant close after this many
/// blocks.
pub const CHANNEL_TIMEOUT_BLOCKS: u64 = 12;

/// Derives the next reinit tag when a transaction (e.g. a join)
/// reinitialises a channel: the hash of the previous tag and the txid.
pub fn update_metadata_reinit(txid: &Id256, meta: &mut ChannelMetadata) {
    let mut hasher = Sha256Writer::new();
    hasher.update(&meta.reinit).update(txid.as_slice());
    meta.reinit = hasher.finalize().as_slice().to_vec();
}

/// Processes a dispute move for a channel.
///
/// The provided proof must be valid and its state must either be
/// strictly fresher than the on-chain state (which it then replaces),
/// or be exactly the already-known on-chain state of a channel that is
/// not yet disputed.  No-turn states cannot be disputed.  Returns
/// whether the dispute was accepted (and the dispute height set).
pub fn process_dispute<R: BoardRules>(
    rules: &R,
    verifier: &dyn SignatureVerifier,
    game_id: &str,
    channel: &mut Channel,
    height: u64,
    proof: &StateProof,
) -> bool {
    if let Some(existing) = channel.dispute_height() {
        // An existing dispute can only have come from an earlier (or
        // in edge cases the same) block.
        debug_assert!(height >= existing);
    }

    let id = *channel.id();
    let meta = channel.metadata().clone();

    let proven_state = match verify_state_proof(
        verifier,
        rules,
        game_id,
        &id,
        &meta,
        channel.reinit_state(),
        proof,
    ) {
        Ok(state) => state,
        Err(err) => {
            warn!(%err, "dispute has an invalid state proof");
            return false;
        }
    };

    let Some(on_chain) = rules.parse_state(&id, &meta, channel.latest_state()) else {
        warn!(channel = %id, "invalid on-chain state for channel");
        return false;
    };
    let Some(proven) = rules.parse_state(&id, &meta, &proven_state) else {
        warn!("proven dispute state does not parse");
        return false;
    };

    if proven.whose_turn().is_none() {
        warn!("cannot file a dispute for a no-turn state");
        return false;
    }

    let on_chain_count = on_chain.turn_count();
    let proven_count = proven.turn_count();

    if proven_count > on_chain_count {
        debug!(
            on_chain_count,
            proven_count, "disputing with a fresher state"
        );
        channel.set_state_proof(proof.clone());
        channel.set_dispute_height(height);
        return true;
    }

    if proven_count < on_chain_count {
        warn!(
            on_chain_count,
            proven_count, "dispute is staler than the on-chain state"
        );
        return false;
    }

    if channel.dispute_height().is_some() {
        warn!(proven_count, "state is already disputed at this turn count");
        return false;
    }

    if !proven.equals(channel.latest_state()) {
        warn!(
            proven_count,
            "dispute has the on-chain turn count but a differing state"
        );
        return false;
    }

    debug!(proven_count, "disputing the existing on-chain state");
    channel.set_dispute_height(height);
    true
}

/// Processes a resolution move for a channel.
///
/// The proof must be valid and strictly fresher than the on-chain
/// state.  On success the state is replaced and any dispute cleared.
pub fn process_resolution<R: BoardRules>(
    rules: &R,
    verifier: &dyn SignatureVerifier,
    game_id: &str,
    channel: &mut Channel,
    proof: &StateProof,
) -> bool {
    let id = *channel.id();
    let meta = channel.metadata().clone();

    let proven_state = match verify_state_proof(
        verifier,
        rules,
        game_id,
        &id,
        &meta,
        channel.reinit_state(),
        proof,
    ) {
        Ok(state) => state,
        Err(err) => {
            warn!(%err, "resolution has an invalid state proof");
            return false;
        }
    };

    let Some(on_chain) = rules.parse_state(&id, &meta, channel.latest_state()) else {
        warn!(channel = %id, "invalid on-chain state for channel");
        return false;
    };
    let Some(proven) = rules.parse_state(&id, &meta, &proven_state) else {
        warn!("proven resolution state does not parse");
        return false;
    };

    let on_chain_count = on_chain.turn_count();
    let proven_count = proven.turn_count();
    if proven_count <= on_chain_count {
        warn!(
            on_chain_count,
            proven_count, "resolution is not fresher than the on-chain state"
        );
        return false;
    }

    debug!(proven_count, "resolution is valid, updating state");
    channel.set_state_proof(proof.clone());
    channel.clear_dispute();
    true
}

#[cfg(test)]
mod tests {
    use armada_primitives::hash::sha256;
    use armada_test_utils::{
        count_state, extend_counting_proof, fake_metadata, CountingRules, FakeVerifier,
    };

    use super::*;
    use crate::registry::ChannelRegistry;

    const GAME: &str = "testgame";

    fn setup(registry: &mut ChannelRegistry) -> &mut Channel {
        registry.create(
            sha256(b"gsp game tests"),
            fake_metadata(&[("alice", "addr a"), ("bob", "addr b")], b"r1"),
            count_state(0),
        )
    }

    fn proof_to(channel: &Channel, moves: &[u32]) -> StateProof {
        extend_counting_proof(
            GAME,
            channel.id(),
            channel.metadata(),
            StateProof::for_state(channel.reinit_state().to_vec()),
            moves,
        )
    }

    #[test]
    fn reinit_update_is_deterministic_and_changes_the_tag() {
        let txid = sha256(b"join tx");
        let mut meta1 = fake_metadata(&[("alice", "addr a")], b"r1");
        let mut meta2 = meta1.clone();

        update_metadata_reinit(&txid, &mut meta1);
        update_metadata_reinit(&txid, &mut meta2);
        assert_eq!(meta1.reinit, meta2.reinit);
        assert_ne!(meta1.reinit, b"r1");
        assert_eq!(meta1.reinit.len(), 32);
    }

    #[test]
    fn fresher_dispute_updates_state_and_height() {
        let mut registry = ChannelRegistry::new();
        let channel = setup(&mut registry);
        let proof = proof_to(channel, &[1, 2]);

        assert!(process_dispute(
            &CountingRules,
            &FakeVerifier,
            GAME,
            channel,
            100,
            &proof
        ));
        assert_eq!(channel.dispute_height(), Some(100));
        assert_eq!(channel.latest_state(), count_state(2));
    }

    #[test]
    fn stale_dispute_is_rejected() {
        let mut registry = ChannelRegistry::new();
        let channel = setup(&mut registry);
        let newer = proof_to(channel, &[1, 2]);
        channel.set_state_proof(newer);

        let stale = proof_to(channel, &[1]);
        assert!(!process_dispute(
            &CountingRules,
            &FakeVerifier,
            GAME,
            channel,
            100,
            &stale
        ));
        assert_eq!(channel.dispute_height(), None);
    }

    #[test]
    fn equal_count_dispute_works_once_on_the_same_state() {
        let mut registry = ChannelRegistry::new();
        let channel = setup(&mut registry);

        // Disputing the reinit state itself.
        let same = StateProof::for_state(channel.reinit_state().to_vec());
        assert!(process_dispute(
            &CountingRules,
            &FakeVerifier,
            GAME,
            channel,
            100,
            &same
        ));
        assert_eq!(channel.dispute_height(), Some(100));

        // A second dispute at the same count is refused.
        assert!(!process_dispute(
            &CountingRules,
            &FakeVerifier,
            GAME,
            channel,
            101,
            &same
        ));
        assert_eq!(channel.dispute_height(), Some(100));
    }

    #[test]
    fn invalid_proof_cannot_dispute() {
        let mut registry = ChannelRegistry::new();
        let channel = setup(&mut registry);

        // A claimed state without any signatures.
        let bogus = StateProof::for_state(count_state(5));
        assert!(!process_dispute(
            &CountingRules,
            &FakeVerifier,
            GAME,
            channel,
            100,
            &bogus
        ));
    }

    #[test]
    fn resolution_replaces_state_and_clears_dispute() {
        let mut registry = ChannelRegistry::new();
        let channel = setup(&mut registry);

        let disputed = proof_to(channel, &[1]);
        assert!(process_dispute(
            &CountingRules,
            &FakeVerifier,
            GAME,
            channel,
            100,
            &disputed
        ));

        let newer = proof_to(channel, &[1, 2, 3]);
        assert!(process_resolution(
            &CountingRules,
            &FakeVerifier,
            GAME,
            channel,
            &newer
        ));
        assert_eq!(channel.dispute_height(), None);
        assert_eq!(channel.latest_state(), count_state(3));

        // A resolution that is not fresher is refused.
        let not_fresher = proof_to(channel, &[1, 2, 3]);
        assert!(!process_resolution(
            &CountingRules,
            &FakeVerifier,
            GAME,
            channel,
            &not_fresher
        ));
    }
}
