//! "Salvo", the hidden-fleet example game on top of the channel engine.
//!
//! Two players commit to secret fleet placements on an 8x8 board, then
//! alternate shots and answers entirely off-chain.  The commit-reveal
//! protocol keeps both honest: positions are bound by hash commitments
//! and must be revealed (and checked against all past answers) before a
//! winner can be determined.  The on-chain game logic only registers
//! channels, validates disputes and records wins and losses.

pub mod board;
pub mod channel;
pub mod coord;
pub mod grid;
pub mod logic;

pub use board::{
    initial_board_state, waiting_board_state, BoardData, KnownShips, Phase, SalvoMove, SalvoRules,
    SalvoState,
};
pub use channel::SalvoChannel;
pub use coord::Coord;
pub use grid::Grid;
pub use logic::{OnChainMove, SalvoGame};
