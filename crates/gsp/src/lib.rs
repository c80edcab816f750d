//! On-chain side of the channel protocol.
//!
//! This crate holds the channel registry a global state processor
//! maintains from on-chain moves, and the validation of disputes and
//! resolutions against it.  Persistence of the registry is up to the
//! embedding GSP; the registry here is the in-memory working set that
//! the channel lifecycle itself requires.

pub mod game;
pub mod registry;

pub use game::{
    process_dispute, process_resolution, update_metadata_reinit, CHANNEL_TIMEOUT_BLOCKS,
    DISPUTE_BLOCKS,
};
pub use registry::{Channel, ChannelRegistry};
