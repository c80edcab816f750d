//! State proof validation and extension.

use std::sync::Arc;

use armada_crypto::{SignatureSigner, SignatureVerifier};
use armada_primitives::Id256;
use armada_proto::{ChannelMetadata, SignedData, StateProof, StateTransition};
use tracing::warn;

use crate::errors::ProofError;
use crate::rules::{BoardRules, BoardState, ParsedState};
use crate::sig::{sign_data_for_participant, verify_participant_signatures, TOPIC_MOVE, TOPIC_STATE};

fn has_quorum(
    verifier: &dyn SignatureVerifier,
    game_id: &str,
    channel_id: &Id256,
    meta: &ChannelMetadata,
    data: &SignedData,
) -> bool {
    let signed =
        verify_participant_signatures(verifier, game_id, channel_id, meta, TOPIC_STATE, data);
    signed.len() == meta.participants.len()
}

/// Validates a state proof against a reinitialisation state.
///
/// The initial state is accepted when it matches the reinit state or
/// carries signatures of all participants.  Every transition must then
/// be justified either by the acting player's signature on the move
/// (with the board rules reproducing the claimed successor) or by a
/// full participant quorum on the new state.  Returns the proven end
/// state.
pub fn verify_state_proof<R: BoardRules>(
    verifier: &dyn SignatureVerifier,
    rules: &R,
    game_id: &str,
    channel_id: &Id256,
    meta: &Arc<ChannelMetadata>,
    reinit_state: &[u8],
    proof: &StateProof,
) -> Result<BoardState, ProofError> {
    let mut parsed = rules
        .parse_state(channel_id, meta, &proof.initial_state.data)
        .ok_or(ProofError::UnparsableInitialState)?;

    if !parsed.equals(reinit_state)
        && !has_quorum(verifier, game_id, channel_id, meta, &proof.initial_state)
    {
        return Err(ProofError::MissingInitialQuorum);
    }

    let mut end_state = proof.initial_state.data.clone();

    for (i, t) in proof.transitions.iter().enumerate() {
        let new_parsed = rules
            .parse_state(channel_id, meta, &t.new_state.data)
            .ok_or(ProofError::UnparsableNewState(i))?;

        let turn = parsed
            .whose_turn()
            .ok_or(ProofError::TransitionFromNoTurn(i))?;

        let justified_by_move = t.mv.as_ref().is_some_and(|mv| {
            let signers =
                verify_participant_signatures(verifier, game_id, channel_id, meta, TOPIC_MOVE, mv);
            signers.contains(&(turn as usize))
                && parsed
                    .apply_move(&mv.data)
                    .is_some_and(|next| new_parsed.equals(&next))
        });

        if !justified_by_move && !has_quorum(verifier, game_id, channel_id, meta, &t.new_state) {
            return Err(ProofError::UnjustifiedTransition(i));
        }

        parsed = new_parsed;
        end_state = t.new_state.data.clone();
    }

    Ok(end_state)
}

/// Extends a proof with a locally made move.
///
/// Applies the move to the proof's end state, signs the move on the
/// `move` topic and the resulting state on the `state` topic with the
/// given signer (which must hold the acting participant's address) and
/// appends the transition.
pub fn extend_state_proof<R: BoardRules>(
    signer: &dyn SignatureSigner,
    rules: &R,
    game_id: &str,
    channel_id: &Id256,
    meta: &Arc<ChannelMetadata>,
    proof: &StateProof,
    mv: &[u8],
) -> Result<StateProof, ProofError> {
    let parsed = rules
        .parse_state(channel_id, meta, proof.end_state())
        .ok_or(ProofError::UnparsableEndState)?;

    let turn = parsed.whose_turn().ok_or(ProofError::EndStateNoTurn)?;

    let new_state = parsed.apply_move(mv).ok_or(ProofError::InvalidMove)?;

    let mut signed_move = SignedData::unsigned(mv.to_vec());
    if !sign_data_for_participant(
        signer,
        game_id,
        channel_id,
        meta,
        TOPIC_MOVE,
        turn as usize,
        &mut signed_move,
    ) {
        return Err(ProofError::WrongSigner);
    }

    let mut signed_state = SignedData::unsigned(new_state);
    if !sign_data_for_participant(
        signer,
        game_id,
        channel_id,
        meta,
        TOPIC_STATE,
        turn as usize,
        &mut signed_state,
    ) {
        warn!("state signature failed after move signature succeeded");
        return Err(ProofError::WrongSigner);
    }

    let mut extended = proof.clone();
    extended.transitions.push(StateTransition {
        mv: Some(signed_move),
        new_state: signed_state,
    });
    Ok(extended)
}
