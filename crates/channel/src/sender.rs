//! Submitting channel moves to the chain.

use std::sync::Arc;

use armada_primitives::Id256;
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use crate::errors::SendError;

/// Raw transaction submission, implemented over the chain daemon's
/// wallet.  The implementation owns any keys involved; this crate only
/// ever sees resulting transaction ids.
pub trait TransactionSender: Send + Sync {
    /// Submits a raw move for the given name, returning the
    /// transaction id.
    fn send_raw_move(&self, name: &str, value: &str) -> Result<Id256, SendError>;

    /// Whether the given transaction is still pending (not yet mined).
    fn is_pending(&self, txid: &Id256) -> bool;
}

/// Composes and submits on-chain moves for one game.
///
/// Wraps the raw sender with the game-id envelope: a move `m` for game
/// `g` is submitted as `{"g": {"<game id>": m}}`.
pub struct MoveSender {
    sender: Arc<dyn TransactionSender>,
    game_id: String,
    player_name: String,
}

impl MoveSender {
    pub fn new(sender: Arc<dyn TransactionSender>, game_id: String, player_name: String) -> Self {
        Self {
            sender,
            game_id,
            player_name,
        }
    }

    /// Sends a move, returning its transaction id or `None` when the
    /// submission failed.
    pub fn send_move(&self, mv: Value) -> Option<Id256> {
        let mut games = Map::new();
        games.insert(self.game_id.clone(), mv);
        let mut full = Map::new();
        full.insert("g".to_owned(), Value::Object(games));
        let encoded = Value::Object(full).to_string();

        info!(player = %self.player_name, "sending move");
        debug!(%encoded, "move data");

        match self.sender.send_raw_move(&self.player_name, &encoded) {
            Ok(txid) => Some(txid),
            Err(err) => {
                error!(%err, "sending move to the chain failed");
                None
            }
        }
    }

    /// Whether a previously sent transaction is still pending.
    pub fn is_pending(&self, txid: &Id256) -> bool {
        self.sender.is_pending(txid)
    }
}
