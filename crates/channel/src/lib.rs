//! The channel coordination engine.
//!
//! This crate maintains a player's view of one game channel: the known
//! board states per reinitialisation together with their state proofs
//! (`rolling`), validation and extension of those proofs (`proof`), the
//! concurrent controller reconciling on-chain, off-chain and local
//! updates (`manager`), and the plumbing that feeds it: the GSP
//! long-poll feeder (`feeder`), the off-chain broadcast shim
//! (`broadcast`) and the on-chain move sender (`sender`).
//!
//! Game-specific behavior enters through two capabilities: [`rules::BoardRules`]
//! for parsing and advancing board states, and [`rules::OpenChannel`] for
//! automoves and move composition.

pub mod broadcast;
pub mod daemon;
pub mod errors;
pub mod feeder;
pub mod manager;
pub mod proof;
pub mod rolling;
pub mod rules;
pub mod sender;
pub mod sig;

pub use errors::{ProofError, SendError};
pub use manager::{ChannelManager, SyncChannelManager, WAITFORCHANGE_ALWAYS_BLOCK};
pub use rules::{BoardMove, BoardRules, BoardState, OpenChannel, ParsedState};
