//! On-chain game logic: channel registration, disputes and stats.
//!
//! This is the part of the game a global state processor runs.  It
//! consumes the per-block moves of the game's namespace and maintains
//! the channel registry plus the win/loss statistics.  Everything else
//! (the actual play) happens off-chain.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use armada_channel::rules::{BoardRules, ParsedState};
use armada_crypto::SignatureVerifier;
use armada_gsp::{
    process_dispute, process_resolution, update_metadata_reinit, ChannelRegistry,
    CHANNEL_TIMEOUT_BLOCKS, DISPUTE_BLOCKS,
};
use armada_primitives::{b64, Id256};
use armada_proto::{message_from_base64, ChannelMetadata, ChannelParticipant, StateProof};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::board::{initial_board_state, waiting_board_state, SalvoRules, PROTO_VERSION};

/// One move of the game's namespace in a block.
#[derive(Clone, Debug)]
pub struct OnChainMove {
    /// Name that sent the move.
    pub name: String,

    /// Id of the enclosing transaction.
    pub txid: Id256,

    /// The move data (the value under the game id in the envelope).
    pub data: Value,
}

/// Win/loss record of one name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlayerStats {
    pub won: u64,
    pub lost: u64,
}

/// The on-chain game state.
pub struct SalvoGame {
    verifier: Arc<dyn SignatureVerifier>,
    game_id: String,

    registry: ChannelRegistry,

    /// Creation height of channels, for the single-participant
    /// timeout.
    created: HashMap<Id256, u64>,

    stats: BTreeMap<String, PlayerStats>,
}

impl SalvoGame {
    pub fn new(verifier: Arc<dyn SignatureVerifier>, game_id: String) -> Self {
        Self {
            verifier,
            game_id,
            registry: ChannelRegistry::new(),
            created: HashMap::new(),
            stats: BTreeMap::new(),
        }
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn stats(&self, name: &str) -> PlayerStats {
        self.stats.get(name).copied().unwrap_or_default()
    }

    /// Processes all moves of one block, then expired disputes and
    /// channel timeouts at the block's height.
    pub fn process_block(&mut self, height: u64, moves: &[OnChainMove]) {
        for mv in moves {
            let Some(data) = mv.data.as_object() else {
                warn!(name = %mv.name, "move is not an object");
                continue;
            };
            // Combining several actions in one move would create
            // ordering subtleties for no benefit; exactly one action
            // per move is allowed.
            if data.len() > 1 {
                warn!(name = %mv.name, "move has more than one action");
                continue;
            }

            if let Some(v) = data.get("c") {
                self.handle_create(v, height, &mv.name, &mv.txid);
            }
            if let Some(v) = data.get("j") {
                self.handle_join(v, &mv.name, &mv.txid);
            }
            if let Some(v) = data.get("a") {
                self.handle_abort(v, &mv.name);
            }
            if let Some(v) = data.get("l") {
                self.handle_declare_loss(v, &mv.name);
            }
            if let Some(v) = data.get("d") {
                self.handle_dispute_resolution(v, height, true);
            }
            if let Some(v) = data.get("r") {
                self.handle_dispute_resolution(v, height, false);
            }
        }

        self.process_expired_disputes(height);
        self.time_out_channels(height);
    }

    /// Full game state as JSON.
    pub fn state_json(&self) -> Value {
        let channels: serde_json::Map<String, Value> = self
            .registry
            .iter()
            .map(|(id, ch)| (id.to_hex(), ch.to_gsp_json()))
            .collect();
        let stats: serde_json::Map<String, Value> = self
            .stats
            .iter()
            .map(|(name, s)| (name.clone(), json!({"won": s.won, "lost": s.lost})))
            .collect();
        json!({
            "channels": channels,
            "gamestats": stats,
        })
    }

    fn update_stats(&mut self, winner: &str, loser: &str) {
        self.stats.entry(winner.to_owned()).or_default().won += 1;
        self.stats.entry(loser.to_owned()).or_default().lost += 1;
    }

    fn remove_channel(&mut self, id: &Id256) {
        self.registry.remove(id);
        self.created.remove(id);
    }

    /// Extracts and looks up the channel id of a move object.
    fn channel_id_of(&self, obj: &Value) -> Option<Id256> {
        let Some(id_str) = obj["id"].as_str() else {
            warn!("no channel id given in move");
            return None;
        };
        let Ok(id) = Id256::from_hex(id_str) else {
            warn!(id_str, "invalid channel id in move");
            return None;
        };
        if self.registry.get(&id).is_none() {
            warn!(%id, "action for non-existent channel");
            return None;
        }
        Some(id)
    }

    fn handle_create(&mut self, data: &Value, height: u64, name: &str, txid: &Id256) {
        let Some(obj) = data.as_object() else { return };
        let (Some(addr), 1) = (obj.get("addr").and_then(Value::as_str), obj.len()) else {
            warn!(name, "invalid create channel move");
            return;
        };

        if self.registry.get(txid).is_some() {
            // Txids do not collide, so this cannot happen for real
            // transactions.
            warn!(%txid, "channel already exists");
            return;
        }

        info!(channel = %txid, name, addr, "creating channel");
        let meta = ChannelMetadata {
            participants: vec![ChannelParticipant {
                name: name.to_owned(),
                address: addr.to_owned(),
            }],
            reinit: Vec::new(),
            proto_version: PROTO_VERSION,
        };
        self.registry.create(*txid, meta, waiting_board_state());
        self.created.insert(*txid, height);
    }

    fn handle_join(&mut self, data: &Value, name: &str, txid: &Id256) {
        let Some(obj) = data.as_object() else { return };
        let (Some(addr), 2) = (obj.get("addr").and_then(Value::as_str), obj.len()) else {
            warn!(name, "invalid join channel move");
            return;
        };
        let Some(id) = self.channel_id_of(data) else {
            return;
        };
        let addr = addr.to_owned();

        let channel = self.registry.get_mut(&id).expect("channel just looked up");
        let meta = channel.metadata();
        if meta.participants.len() != 1 {
            warn!(%id, participants = meta.participants.len(), "cannot join channel");
            return;
        }
        if meta.participants[0].name == name {
            warn!(%id, name, "cannot join own channel a second time");
            return;
        }

        info!(%id, name, %addr, "joining channel");
        let mut new_meta = (**meta).clone();
        update_metadata_reinit(txid, &mut new_meta);
        new_meta.participants.push(ChannelParticipant {
            name: name.to_owned(),
            address: addr,
        });
        channel.reinitialise(new_meta, initial_board_state());
    }

    fn handle_abort(&mut self, data: &Value, name: &str) {
        let Some(obj) = data.as_object() else { return };
        if obj.len() != 1 {
            warn!(name, "invalid abort channel move");
            return;
        }
        let Some(id) = self.channel_id_of(data) else {
            return;
        };

        let channel = self.registry.get(&id).expect("channel just looked up");
        let meta = channel.metadata();
        if meta.participants.len() != 1 {
            warn!(%id, "cannot abort channel with more than one participant");
            return;
        }
        if meta.participants[0].name != name {
            warn!(%id, name, "only the creator can abort a channel");
            return;
        }

        info!(%id, "aborting channel");
        self.remove_channel(&id);
    }

    fn handle_declare_loss(&mut self, data: &Value, name: &str) {
        let Some(obj) = data.as_object() else { return };
        if obj.len() != 2 {
            warn!(name, "invalid declare loss move");
            return;
        }
        let Some(id) = self.channel_id_of(data) else {
            return;
        };

        let channel = self.registry.get(&id).expect("channel just looked up");
        let meta = channel.metadata().clone();
        if meta.participants.len() != 2 {
            warn!(%id, "cannot declare loss in a waiting channel");
            return;
        }

        let Some(reinit) = obj.get("r").and_then(Value::as_str).and_then(b64::decode) else {
            warn!("invalid reinit value on declare loss");
            return;
        };
        if reinit != meta.reinit {
            warn!(%id, "loss declaration is for a different reinitialisation");
            return;
        }

        let Some(loser) = meta.participant_index(name) else {
            warn!(%id, name, "non-participant cannot declare loss");
            return;
        };
        let winner = 1 - loser;

        info!(
            %id,
            loser = %meta.participants[loser].name,
            winner = %meta.participants[winner].name,
            "loss declared, closing channel"
        );
        let winner_name = meta.participants[winner].name.clone();
        let loser_name = meta.participants[loser].name.clone();
        self.update_stats(&winner_name, &loser_name);
        self.remove_channel(&id);
    }

    fn handle_dispute_resolution(&mut self, data: &Value, height: u64, is_dispute: bool) {
        let Some(obj) = data.as_object() else { return };
        if obj.len() != 2 {
            warn!("invalid dispute/resolution move");
            return;
        }
        let Some(proof) = obj
            .get("state")
            .and_then(Value::as_str)
            .and_then(message_from_base64::<StateProof>)
        else {
            warn!("could not decode state proof from move");
            return;
        };
        let Some(id) = self.channel_id_of(data) else {
            return;
        };

        let channel = self.registry.get_mut(&id).expect("channel just looked up");
        if channel.metadata().participants.len() != 2 {
            warn!(%id, "cannot dispute/resolve a waiting channel");
            return;
        }

        info!(%id, height, is_dispute, "processing dispute/resolution");
        let ok = if is_dispute {
            process_dispute(
                &SalvoRules,
                self.verifier.as_ref(),
                &self.game_id,
                channel,
                height,
                &proof,
            )
        } else {
            process_resolution(
                &SalvoRules,
                self.verifier.as_ref(),
                &self.game_id,
                channel,
                &proof,
            )
        };
        if !ok {
            warn!(%id, "dispute/resolution is invalid");
            return;
        }

        // A determined winner in the on-chain state closes the channel
        // right away; the winner can force the close through a
        // resolution even if the loser never declares.
        let meta = channel.metadata().clone();
        let Some(state) = SalvoRules.parse_state(&id, &meta, channel.latest_state()) else {
            warn!(%id, "on-chain state does not parse after dispute/resolution");
            return;
        };
        if let Some(winner) = state.data().winner {
            let winner = winner as usize;
            let winner_name = meta.participants[winner].name.clone();
            let loser_name = meta.participants[1 - winner].name.clone();
            info!(%id, winner = %winner_name, "on-chain state has a winner, closing");
            self.update_stats(&winner_name, &loser_name);
            self.remove_channel(&id);
        }
    }

    fn process_expired_disputes(&mut self, height: u64) {
        if height < DISPUTE_BLOCKS {
            return;
        }

        for id in self.registry.disputes_filed_up_to(height - DISPUTE_BLOCKS) {
            let Some(channel) = self.registry.get(&id) else {
                continue;
            };
            let meta = channel.metadata().clone();

            let Some(state) = SalvoRules.parse_state(&id, &meta, channel.latest_state()) else {
                warn!(%id, "invalid on-chain state for disputed channel");
                continue;
            };
            // A dispute implies two participants and a state with a
            // turn.
            let Some(loser) = state.whose_turn() else {
                warn!(%id, "disputed channel is in a no-turn state");
                continue;
            };
            let loser = loser as usize;
            let winner = 1 - loser;

            info!(
                %id,
                winner = %meta.participants[winner].name,
                loser = %meta.participants[loser].name,
                "dispute expired, force-closing channel"
            );
            let winner_name = meta.participants[winner].name.clone();
            let loser_name = meta.participants[loser].name.clone();
            self.update_stats(&winner_name, &loser_name);
            self.remove_channel(&id);
        }
    }

    fn time_out_channels(&mut self, height: u64) {
        if height < CHANNEL_TIMEOUT_BLOCKS {
            return;
        }
        let cutoff = height - CHANNEL_TIMEOUT_BLOCKS;

        let expired: Vec<Id256> = self
            .created
            .iter()
            .filter(|&(id, created)| {
                *created <= cutoff
                    && self
                        .registry
                        .get(id)
                        .is_some_and(|ch| ch.metadata().participants.len() < 2)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            info!(%id, "timing out single-participant channel");
            self.remove_channel(&id);
        }
    }
}
