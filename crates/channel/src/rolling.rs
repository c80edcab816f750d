//! Latest-state tracking across reinitialisations.

use std::collections::HashMap;
use std::sync::Arc;

use armada_crypto::SignatureVerifier;
use armada_primitives::b64;
use armada_primitives::Id256;
use armada_proto::{ChannelMetadata, StateProof};
use tracing::{debug, error, info, warn};

use crate::proof::verify_state_proof;
use crate::rules::{BoardRules, BoardState, ParsedState};

/// Everything known about one reinitialisation of the channel.
struct ReinitData<R: BoardRules> {
    /// Metadata of this reinitialisation.  Shared with the parsed
    /// state, which resolves player indices through it.
    meta: Arc<ChannelMetadata>,

    /// The state at which play (re-)started.
    reinit_state: BoardState,

    /// The best state proof known for this reinitialisation.
    proof: StateProof,

    /// Parsed form of the proof's end state.
    latest: R::State,

    /// The largest turn count seen through an on-chain update.
    on_chain_turn: u32,
}

/// Per-channel container of all known reinitialisations and the best
/// known state for each.
///
/// Old reinitialisations are retained: a blockchain rollback can bring
/// a previous one back, and the off-chain progress accumulated for it
/// should not be lost when that happens.
pub struct RollingState<R: BoardRules> {
    rules: Arc<R>,
    verifier: Arc<dyn SignatureVerifier>,
    game_id: String,
    channel_id: Id256,

    reinits: HashMap<Vec<u8>, ReinitData<R>>,
    current: Option<Vec<u8>>,
}

impl<R: BoardRules> RollingState<R> {
    pub fn new(
        rules: Arc<R>,
        verifier: Arc<dyn SignatureVerifier>,
        game_id: String,
        channel_id: Id256,
    ) -> Self {
        Self {
            rules,
            verifier,
            game_id,
            channel_id,
            reinits: HashMap::new(),
            current: None,
        }
    }

    /// Whether any update has been processed yet.
    pub fn is_initialised(&self) -> bool {
        self.current.is_some()
    }

    fn current_entry(&self) -> &ReinitData<R> {
        let id = self
            .current
            .as_ref()
            .expect("rolling state has not been initialised yet");
        &self.reinits[id]
    }

    /// The parsed latest state of the current reinitialisation.
    pub fn latest_state(&self) -> &R::State {
        &self.current_entry().latest
    }

    /// The best state proof of the current reinitialisation.
    pub fn state_proof(&self) -> &StateProof {
        &self.current_entry().proof
    }

    /// The largest on-chain turn count of the current reinitialisation.
    pub fn on_chain_turn_count(&self) -> u32 {
        self.current_entry().on_chain_turn
    }

    /// The current reinitialisation tag.
    pub fn reinit_id(&self) -> &[u8] {
        self.current
            .as_deref()
            .expect("rolling state has not been initialised yet")
    }

    /// The metadata of the current reinitialisation.
    pub fn metadata(&self) -> &Arc<ChannelMetadata> {
        &self.current_entry().meta
    }

    /// Processes an on-chain update for the channel.  This switches the
    /// current reinitialisation to the one in the metadata, installing
    /// a new entry or refreshing the existing one when the provided
    /// proof is fresher than what is already known.  Returns whether
    /// the observable (current) state changed.
    pub fn update_on_chain(
        &mut self,
        meta: Arc<ChannelMetadata>,
        reinit_state: BoardState,
        proof: StateProof,
    ) -> bool {
        // On-chain data has been filtered by the GSP and should always
        // verify; a failure here means the GSP and we disagree about
        // the rules, so the update is dropped loudly.
        let proven_state = match verify_state_proof(
            self.verifier.as_ref(),
            self.rules.as_ref(),
            &self.game_id,
            &self.channel_id,
            &meta,
            &reinit_state,
            &proof,
        ) {
            Ok(state) => state,
            Err(err) => {
                error!(%err, "state proof provided on-chain is not valid");
                return false;
            }
        };

        let reinit_change = self.current.as_deref() != Some(&meta.reinit[..]);
        self.current = Some(meta.reinit.clone());
        info!(
            channel = %self.channel_id,
            reinit = %b64::encode(&meta.reinit),
            "performing on-chain update"
        );

        let Some(parsed) = self
            .rules
            .parse_state(&self.channel_id, &meta, &proven_state)
        else {
            error!("proven on-chain state does not parse");
            return false;
        };
        let parsed_count = parsed.turn_count();

        if !self.reinits.contains_key(&meta.reinit) {
            info!(turn_count = parsed_count, "adding previously unknown reinitialisation");
            let entry = ReinitData {
                on_chain_turn: parsed_count,
                reinit_state,
                proof,
                latest: parsed,
                meta: meta.clone(),
            };
            self.reinits.insert(meta.reinit.clone(), entry);
            return true;
        }
        let entry = self
            .reinits
            .get_mut(&meta.reinit)
            .expect("entry just checked");

        debug_assert_eq!(*entry.meta, *meta);
        debug_assert_eq!(entry.reinit_state, reinit_state);

        if parsed_count > entry.on_chain_turn {
            debug!(turn_count = parsed_count, "updating on-chain turn count");
            entry.on_chain_turn = parsed_count;
        }

        let current_count = entry.latest.turn_count();
        if current_count >= parsed_count {
            debug!(
                current_count,
                parsed_count, "on-chain state is not fresher than the known one"
            );
            return reinit_change;
        }

        debug!(parsed_count, "on-chain state is fresher, updating");
        entry.proof = proof;
        entry.latest = parsed;
        true
    }

    /// Processes a state proof received off-chain (or built locally)
    /// for the given reinitialisation.  The reinitialisation must
    /// already be known; the proof is fully verified and applied only
    /// when strictly fresher.  Returns whether the observable state of
    /// the *current* reinitialisation changed.
    pub fn update_with_move(&mut self, reinit: &[u8], proof: StateProof) -> bool {
        // The update is applied even to a non-current reinitialisation,
        // so progress is not lost if a rollback later restores it.
        let Some(entry) = self.reinits.get_mut(reinit) else {
            warn!(
                channel = %self.channel_id,
                reinit = %b64::encode(reinit),
                "off-chain update for unknown reinitialisation"
            );
            return false;
        };

        let proven_state = match verify_state_proof(
            self.verifier.as_ref(),
            self.rules.as_ref(),
            &self.game_id,
            &self.channel_id,
            &entry.meta,
            &entry.reinit_state,
            &proof,
        ) {
            Ok(state) => state,
            Err(err) => {
                warn!(channel = %self.channel_id, %err, "off-chain update has an invalid state proof");
                return false;
            }
        };

        let Some(parsed) = self
            .rules
            .parse_state(&self.channel_id, &entry.meta, &proven_state)
        else {
            warn!("proven off-chain state does not parse");
            return false;
        };

        let parsed_count = parsed.turn_count();
        let current_count = entry.latest.turn_count();
        if current_count >= parsed_count {
            debug!(
                current_count,
                parsed_count, "off-chain state is not fresher than the known one"
            );
            return false;
        }

        debug!(parsed_count, "off-chain state is fresher, updating");
        entry.proof = proof;
        entry.latest = parsed;

        // Changes to a non-current reinitialisation are not signalled;
        // switching back to it (via an on-chain update) will be.
        self.current.as_deref() == Some(reinit)
    }
}
