//! Capabilities a concrete game plugs into the engine.

use std::sync::Arc;

use armada_primitives::Id256;
use armada_proto::{ChannelMetadata, StateProof};

use crate::sender::MoveSender;

/// Encoded board state, opaque to the engine.
pub type BoardState = Vec<u8>;

/// Encoded board move, opaque to the engine.
pub type BoardMove = Vec<u8>;

/// A successfully parsed and validated board state.
///
/// Parsed states keep an `Arc` of the channel metadata they were parsed
/// under, so player indices stay resolvable for as long as the state is
/// held, independently of the reinit map they came from.
pub trait ParsedState: Send + 'static {
    /// The player index whose turn it is, or `None` when it is no
    /// player's turn (waiting channel or finished game).
    fn whose_turn(&self) -> Option<u8>;

    /// Monotone counter advanced by every legal transition.
    fn turn_count(&self) -> u32;

    /// Applies a move, returning the encoded successor state.  Returns
    /// `None` for invalid moves; the current state is never modified.
    fn apply_move(&self, mv: &[u8]) -> Option<BoardState>;

    /// Structural equality against another encoded state.  Malformed
    /// `other` bytes simply compare unequal.
    fn equals(&self, other: &[u8]) -> bool;

    /// JSON rendering for frontends.
    fn to_json(&self) -> serde_json::Value;
}

/// The rules of a game: how to turn encoded bytes into parsed states.
pub trait BoardRules: Send + Sync + 'static {
    type State: ParsedState;

    /// Parses and validates an encoded state under the given metadata.
    /// Returns `None` for malformed bytes, states that violate the
    /// rules, or states of a protocol version the rules do not
    /// implement.
    fn parse_state(
        &self,
        channel_id: &Id256,
        meta: &Arc<ChannelMetadata>,
        data: &[u8],
    ) -> Option<Self::State>;
}

/// Game-specific behavior of one open channel inside the daemon.
///
/// This is where a game keeps per-channel secrets (hash preimages,
/// salts) and decides on automatic moves.  Composition of dispute and
/// resolution moves lives here too, since their JSON shape belongs to
/// the game's on-chain protocol.
pub trait OpenChannel<R: BoardRules>: Send {
    /// Builds the resolution move data (without the game-id envelope).
    fn resolution_move(&self, channel_id: &Id256, proof: &StateProof) -> serde_json::Value;

    /// Builds the dispute move data (without the game-id envelope).
    fn dispute_move(&self, channel_id: &Id256, proof: &StateProof) -> serde_json::Value;

    /// Returns a move the game wants to make automatically in the given
    /// state, if any.  Only called when it is this player's turn.  May
    /// mutate internal game data (e.g. generate and store a salt).
    fn maybe_auto_move(&mut self, state: &R::State) -> Option<BoardMove>;

    /// Gives the game a chance to send an out-of-band on-chain move for
    /// the current state (e.g. declaring a loss to close the channel).
    /// Called independently of whose turn it is.
    fn maybe_on_chain_move(&mut self, state: &R::State, sender: &MoveSender);
}
