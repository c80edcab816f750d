//! Per-channel daemon logic of the game: automoves, secrets and the
//! on-chain loss declaration.

use armada_channel::rules::{BoardMove, OpenChannel, ParsedState};
use armada_channel::sender::MoveSender;
use armada_primitives::hash::{sha256, Sha256Writer};
use armada_primitives::{b64, Id256};
use armada_proto::{encode_message, message_to_base64, StateProof};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::board::{Phase, SalvoMove, SalvoRules, SalvoState};
use crate::coord::{Coord, CELLS};
use crate::grid::{verify_position_of_ships, Grid};

fn random_secret() -> Vec<u8> {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes.to_vec()
}

/// State the player's daemon keeps about one open channel: the secret
/// position with its commitment salt, and the first player's random
/// seed.
pub struct SalvoChannel {
    player_name: String,

    position: Option<Grid>,
    position_salt: Vec<u8>,

    /// Seed committed in our first-commitment move; needed to reveal
    /// later.
    seed0: Option<Vec<u8>>,

    /// Pending loss-declaration txid, if any.
    txid_close: Option<Id256>,
}

impl SalvoChannel {
    pub fn new(player_name: String) -> Self {
        Self {
            player_name,
            position: None,
            position_salt: Vec::new(),
            seed0: None,
            txid_close: None,
        }
    }

    pub fn is_position_set(&self) -> bool {
        self.position.is_some()
    }

    pub fn position(&self) -> Option<&Grid> {
        self.position.as_ref()
    }

    /// Stores the player's fleet placement and generates the
    /// commitment salt.  Rejects invalid fleets; the position can only
    /// be set once.
    pub fn set_position(&mut self, grid: Grid) -> bool {
        if self.is_position_set() {
            warn!("position is already set");
            return false;
        }
        if !verify_position_of_ships(grid) {
            warn!(bits = grid.bits(), "cannot set an invalid ships position");
            return false;
        }

        self.position_salt = random_secret();
        info!(bits = grid.bits(), "stored player position");
        self.position = Some(grid);
        true
    }

    /// The encoded shot move for a target cell.
    pub fn shot_move(target: Coord) -> BoardMove {
        encode_message(&SalvoMove::Shot {
            location: target.index(),
        })
    }

    /// The encoded position-reveal move for our stored position.
    pub fn position_reveal_move(&self) -> Option<BoardMove> {
        let position = self.position.as_ref()?;
        Some(encode_message(&SalvoMove::RevealPosition {
            position: position.bits(),
            salt: self.position_salt.clone(),
        }))
    }

    fn position_commitment_hash(&self) -> Option<Vec<u8>> {
        let position = self.position.as_ref()?;
        let mut hasher = Sha256Writer::new();
        hasher.update(&position.blob()).update(&self.position_salt);
        Some(hasher.finalize().as_slice().to_vec())
    }

    /// This player's index in the channel.
    fn player_index(&self, state: &SalvoState) -> Option<usize> {
        state.metadata().participant_index(&self.player_name)
    }

    fn internal_auto_move(&mut self, state: &SalvoState) -> Option<SalvoMove> {
        let index = self.player_index(state)?;
        debug_assert_eq!(Some(index as u8), state.whose_turn());
        let data = state.data();

        match state.phase() {
            Phase::FirstCommitment => {
                let position_hash = self.position_commitment_hash()?;

                let seed = random_secret();
                let seed_hash = sha256(&seed).as_slice().to_vec();
                self.seed0 = Some(seed);

                Some(SalvoMove::Commit {
                    position_hash,
                    seed_hash: Some(seed_hash),
                    seed: None,
                })
            }

            Phase::SecondCommitment => {
                let position_hash = self.position_commitment_hash()?;
                Some(SalvoMove::Commit {
                    position_hash,
                    seed_hash: None,
                    seed: Some(random_secret()),
                })
            }

            Phase::FirstRevealSeed => {
                let Some(seed) = self.seed0.clone() else {
                    // Can happen after a daemon restart; the reveal
                    // then needs the stored seed, which is gone.
                    warn!("no stored seed to reveal");
                    return None;
                };
                Some(SalvoMove::RevealSeed { seed })
            }

            Phase::Shoot => {
                // Once every opponent ship is hit, reveal to claim the
                // win; otherwise shots are up to the player.
                let other = 1 - index;
                let hits = Grid::new(data.known_ships[other].hits);
                if hits.count_ones() >= Grid::TOTAL_SHIP_CELLS {
                    info!("all opponent ships are hit, revealing");
                    let position = self.position.as_ref()?;
                    return Some(SalvoMove::RevealPosition {
                        position: position.bits(),
                        salt: self.position_salt.clone(),
                    });
                }
                None
            }

            Phase::Answer => {
                let position = self.position.as_ref()?;
                let shot = data.current_shot?;
                if shot >= CELLS {
                    warn!(shot, "state has an invalid current shot");
                    return None;
                }
                Some(SalvoMove::Reply {
                    hit: position.get(Coord::from_index(shot)),
                })
            }

            Phase::SecondRevealPosition => {
                let position = self.position.as_ref()?;
                Some(SalvoMove::RevealPosition {
                    position: position.bits(),
                    salt: self.position_salt.clone(),
                })
            }

            // Neither phase has a turn, so automoves are never
            // requested for them.
            Phase::Waiting | Phase::Finished => None,
        }
    }
}

fn dispute_resolution_move(kind: &str, channel_id: &Id256, proof: &StateProof) -> Value {
    let data = json!({
        "id": channel_id.to_hex(),
        "state": message_to_base64(proof),
    });
    let mut res = serde_json::Map::new();
    res.insert(kind.to_owned(), data);
    Value::Object(res)
}

impl OpenChannel<SalvoRules> for SalvoChannel {
    fn resolution_move(&self, channel_id: &Id256, proof: &StateProof) -> Value {
        dispute_resolution_move("r", channel_id, proof)
    }

    fn dispute_move(&self, channel_id: &Id256, proof: &StateProof) -> Value {
        dispute_resolution_move("d", channel_id, proof)
    }

    fn maybe_auto_move(&mut self, state: &SalvoState) -> Option<BoardMove> {
        self.internal_auto_move(state).map(|mv| encode_message(&mv))
    }

    fn maybe_on_chain_move(&mut self, state: &SalvoState, sender: &MoveSender) {
        if state.phase() != Phase::Finished {
            return;
        }
        let meta = state.metadata();
        let Some(winner) = state.data().winner else {
            return;
        };

        let loser = 1 - winner as usize;
        if meta
            .participants
            .get(loser)
            .map(|p| p.name.as_str())
            != Some(self.player_name.as_str())
        {
            return;
        }

        if let Some(txid) = self.txid_close.as_ref() {
            if sender.is_pending(txid) {
                // A pending close can in rare reorg cases become
                // invalid; the worst outcome is waiting for it to
                // confirm and then sending a fresh one.
                info!(%txid, "already have a pending channel close");
                return;
            }
        }

        let mv = json!({
            "l": {
                "id": state.channel_id().to_hex(),
                "r": b64::encode(&meta.reinit),
            }
        });
        self.txid_close = sender.send_move(mv);
        if let Some(txid) = self.txid_close.as_ref() {
            info!(%txid, "we lost, closing the channel on-chain");
        }
    }
}
