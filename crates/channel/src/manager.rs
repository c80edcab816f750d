//! The channel manager: the single controller of one channel's state.
//!
//! All updates, whether on-chain (from the feeder), off-chain (from
//! the broadcast) or local moves, run through [`ChannelManager`].  The
//! manager consults the rolling state to accept or reject them, drives
//! automoves, requests dispute resolutions, and versions every
//! observable change so that frontends can long-poll with
//! [`SyncChannelManager::wait_for_change`].
//!
//! [`ChannelManager`] itself does no locking; [`SyncChannelManager`]
//! wraps it in a mutex/condvar monitor and is what the rest of the
//! system holds.  Note that on-chain sends (dispute, resolution, loss
//! declarations) happen while the instance lock is held; transaction
//! senders should be quick or queue internally.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use std::sync::Arc;

use armada_crypto::{SignatureSigner, SignatureVerifier};
use armada_primitives::{b64, Id256};
use armada_proto::{message_to_base64, ChannelMetadata, StateProof};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::broadcast::OffChainBroadcast;
use crate::proof::extend_state_proof;
use crate::rolling::RollingState;
use crate::rules::{BoardMove, BoardRules, BoardState, OpenChannel, ParsedState};
use crate::sender::MoveSender;

/// Sentinel version for `wait_for_change` that never short-circuits.
pub const WAITFORCHANGE_ALWAYS_BLOCK: u64 = 0;

/// Upper bound on how long one `wait_for_change` call blocks.  Bounding
/// the wait keeps abandoned RPC threads from piling up forever.
const WAITFORCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Data about an open on-chain dispute of the managed channel.
#[derive(Clone, Debug)]
struct DisputeData {
    /// Block height at which the dispute was filed.
    height: u64,

    /// The player whose turn it is in the disputed state.
    turn: Option<u8>,

    /// Turn count of the disputed state.
    count: u32,

    /// Txid of a resolution we sent for this dispute, while pending.
    pending_resolution: Option<Id256>,
}

/// The main logic of a channel daemon for one channel.
pub struct ChannelManager<R: BoardRules, C: OpenChannel<R>> {
    rules: Arc<R>,
    game: C,
    signer: Box<dyn SignatureSigner>,

    game_id: String,
    channel_id: Id256,
    /// The name of the player running this daemon.
    player_name: String,

    board_states: RollingState<R>,

    off_chain: Option<OffChainBroadcast>,
    on_chain: Option<MoveSender>,

    /// Bumped on every observable change; starts at 1.
    state_version: u64,

    /// Whether the last on-chain update saw the channel present.
    exists: bool,
    block_hash: Option<Id256>,
    on_chain_height: u64,

    dispute: Option<DisputeData>,

    /// Latest pending put-state-on-chain resolution txid, if any.
    pending_put_state_on_chain: Option<Id256>,
    /// Pending dispute txid, if any.
    pending_dispute: Option<Id256>,

    /// One-way flag; no updates are accepted once set.
    stopped: bool,
}

impl<R: BoardRules, C: OpenChannel<R>> ChannelManager<R, C> {
    pub fn new(
        rules: Arc<R>,
        game: C,
        verifier: Arc<dyn SignatureVerifier>,
        signer: Box<dyn SignatureSigner>,
        game_id: String,
        channel_id: Id256,
        player_name: String,
    ) -> Self {
        let board_states = RollingState::new(rules.clone(), verifier, game_id.clone(), channel_id);
        Self {
            rules,
            game,
            signer,
            game_id,
            channel_id,
            player_name,
            board_states,
            off_chain: None,
            on_chain: None,
            state_version: 1,
            exists: false,
            block_hash: None,
            on_chain_height: 0,
            dispute: None,
            pending_put_state_on_chain: None,
            pending_dispute: None,
            stopped: false,
        }
    }

    /// Sets the off-chain broadcast.  Must be called before anything
    /// triggers a broadcast.
    pub fn set_off_chain_broadcast(&mut self, broadcast: OffChainBroadcast) {
        debug_assert!(self.off_chain.is_none());
        self.off_chain = Some(broadcast);
    }

    /// Sets the on-chain move sender.  Must be called before anything
    /// triggers an on-chain move.
    pub fn set_move_sender(&mut self, sender: MoveSender) {
        debug_assert!(self.on_chain.is_none());
        self.on_chain = Some(sender);
    }

    pub fn channel_id(&self) -> &Id256 {
        &self.channel_id
    }

    pub fn player_name(&self) -> &str {
        &self.player_name
    }

    pub fn state_version(&self) -> u64 {
        self.state_version
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// The game-specific open-channel data.
    pub fn game(&self) -> &C {
        &self.game
    }

    /// Mutable access to the game data (e.g. to set a position).  The
    /// caller should trigger automoves afterwards if the change could
    /// unblock any.
    pub fn game_mut(&mut self) -> &mut C {
        &mut self.game
    }

    /// The parsed latest state, if one is known.
    pub fn board_state(&self) -> Option<&R::State> {
        self.board_states
            .is_initialised()
            .then(|| self.board_states.latest_state())
    }

    fn notify_state_change(&mut self) {
        self.state_version += 1;
        debug!(version = self.state_version, "channel state changed");
    }

    /// Clears a tracked txid once the chain no longer reports it as
    /// pending.  Shared logic for disputes and resolutions on each new
    /// block.
    fn reset_mined_txid(sender: &Option<MoveSender>, txid: &mut Option<Id256>) {
        let Some(id) = txid.as_ref() else { return };
        let Some(sender) = sender.as_ref() else {
            return;
        };
        if sender.is_pending(id) {
            debug!(%id, "transaction is still pending");
        } else {
            info!(%id, "transaction is no longer pending");
            *txid = None;
        }
    }

    /// Applies a local move to the current state by extending the state
    /// proof with our signature.  Returns whether a change was made.
    fn apply_local_move(&mut self, mv: &[u8]) -> bool {
        debug_assert!(!self.stopped && self.exists);

        let new_proof = match extend_state_proof(
            self.signer.as_ref(),
            self.rules.as_ref(),
            &self.game_id,
            &self.channel_id,
            self.board_states.metadata(),
            self.board_states.state_proof(),
            mv,
        ) {
            Ok(proof) => proof,
            Err(err) => {
                error!(%err, "failed to extend state with local move");
                return false;
            }
        };

        let reinit = self.board_states.reinit_id().to_vec();
        if !self.board_states.update_with_move(&reinit, new_proof) {
            // The extension was strictly fresher, so this cannot
            // happen unless the rules are inconsistent.
            error!("extended state proof did not update the rolling state");
            return false;
        }
        true
    }

    /// Drives automoves as long as it is our turn and the game keeps
    /// producing them.  Returns whether at least one move was applied.
    fn process_auto_moves(&mut self) -> bool {
        let mut found = false;
        loop {
            let mv = {
                let state = self.board_states.latest_state();
                let meta = self.board_states.metadata();
                let Some(turn) = state.whose_turn() else {
                    debug!("no-turn state, no automoves");
                    break;
                };
                let our_turn = meta
                    .participants
                    .get(turn as usize)
                    .is_some_and(|p| p.name == self.player_name);
                if !our_turn {
                    debug!("not our turn, no automoves");
                    break;
                }
                match self.game.maybe_auto_move(state) {
                    Some(mv) => mv,
                    None => break,
                }
            };

            info!("found automove");
            if !self.apply_local_move(&mv) {
                warn!("automove could not be applied");
                break;
            }
            found = true;
        }
        found
    }

    /// Sends a resolution if there is a dispute against us and we know
    /// a strictly better state.
    fn try_resolve_dispute(&mut self) {
        if !self.exists {
            return;
        }
        let Some(dispute) = self.dispute.as_ref() else {
            return;
        };
        if dispute.pending_resolution.is_some() {
            debug!("there may be a pending resolution already");
            return;
        }

        let meta = self.board_states.metadata();
        let disputed_is_us = dispute
            .turn
            .and_then(|t| meta.participants.get(t as usize))
            .is_some_and(|p| p.name == self.player_name);
        if !disputed_is_us {
            debug!("dispute is not against us");
            return;
        }

        let latest_count = self.board_states.latest_state().turn_count();
        if latest_count <= dispute.count {
            debug!(
                latest_count,
                disputed = dispute.count,
                "no better state than the disputed one"
            );
            return;
        }

        info!(
            channel = %self.channel_id,
            latest_count,
            disputed = dispute.count,
            "dispute for our turn, resolving with a better state"
        );
        let Some(sender) = self.on_chain.as_ref() else {
            error!("no move sender configured, cannot resolve dispute");
            return;
        };
        let mv = self
            .game
            .resolution_move(&self.channel_id, self.board_states.state_proof());
        let txid = sender.send_move(mv);
        if let Some(dispute) = self.dispute.as_mut() {
            dispute.pending_resolution = txid;
        }
    }

    /// Runs the shared update pipeline after a state change: automoves,
    /// broadcasting, dispute resolution, the game's on-chain move hook
    /// and waiter notification.
    ///
    /// Automoves always force a broadcast: they extend the proof with
    /// our signatures, which no peer can reproduce locally.
    fn process_state_update(&mut self, broadcast: bool) {
        let automoved = self.process_auto_moves();

        if broadcast || automoved {
            if let Some(off_chain) = self.off_chain.as_ref() {
                off_chain.send_new_state(
                    self.board_states.reinit_id(),
                    self.board_states.state_proof(),
                );
            } else {
                warn!("no off-chain broadcast configured, not sending state");
            }
        }

        self.try_resolve_dispute();

        if let Some(sender) = self.on_chain.as_ref() {
            self.game
                .maybe_on_chain_move(self.board_states.latest_state(), sender);
        }

        self.notify_state_change();
    }

    /// Processes an on-chain update that has no data for our channel.
    pub fn process_on_chain_non_existent(&mut self, block: Id256, height: u64) {
        if self.stopped {
            info!("manager is stopped, ignoring update");
            return;
        }
        if self.exists {
            info!(channel = %self.channel_id, "channel no longer exists on-chain");
        }

        self.block_hash = Some(block);
        self.on_chain_height = height;
        self.exists = false;
        self.dispute = None;

        if let Some(off_chain) = self.off_chain.as_mut() {
            off_chain.set_participants(None);
        }

        self.notify_state_change();
    }

    /// Processes a new on-chain state of the channel.
    pub fn process_on_chain(
        &mut self,
        block: Id256,
        height: u64,
        meta: ChannelMetadata,
        reinit_state: BoardState,
        proof: StateProof,
        dispute_height: u64,
    ) {
        if self.stopped {
            info!("manager is stopped, ignoring update");
            return;
        }
        if !self.exists {
            info!(channel = %self.channel_id, "channel is now found on-chain");
        }

        self.block_hash = Some(block);
        self.on_chain_height = height;

        Self::reset_mined_txid(&self.on_chain, &mut self.pending_put_state_on_chain);
        Self::reset_mined_txid(&self.on_chain, &mut self.pending_dispute);
        self.exists = true;

        let meta = Arc::new(meta);

        if dispute_height == 0 {
            if self.dispute.is_some() {
                info!(channel = %self.channel_id, "dispute is resolved");
            }
            self.dispute = None;
        } else {
            match self.rules.parse_state(&self.channel_id, &meta, proof.end_state()) {
                Some(disputed) => {
                    let pending_resolution = match self.dispute.as_mut() {
                        Some(dispute) => {
                            Self::reset_mined_txid(&self.on_chain, &mut dispute.pending_resolution);
                            dispute.pending_resolution
                        }
                        None => {
                            info!(
                                channel = %self.channel_id,
                                dispute_height, "channel now has a dispute"
                            );
                            None
                        }
                    };
                    self.dispute = Some(DisputeData {
                        height: dispute_height,
                        turn: disputed.whose_turn(),
                        count: disputed.turn_count(),
                        pending_resolution,
                    });
                }
                None => warn!("disputed on-chain state does not parse, keeping old dispute data"),
            }
        }

        self.board_states
            .update_on_chain(meta.clone(), reinit_state, proof);

        if let Some(off_chain) = self.off_chain.as_mut() {
            off_chain.set_participants(Some(&meta));
        }

        if !self.board_states.is_initialised() {
            // The proof was rejected before any state was known; there
            // is nothing to run the pipeline on.
            self.notify_state_change();
            return;
        }

        self.process_state_update(false);
    }

    /// Processes a state proof received through the off-chain
    /// broadcast.
    pub fn process_off_chain(&mut self, reinit: &[u8], proof: StateProof) {
        if self.stopped {
            info!("manager is stopped, ignoring update");
            return;
        }
        if !self.board_states.update_with_move(reinit, proof) {
            return;
        }
        // No re-broadcast: the peer that sent this already did.
        self.process_state_update(false);
    }

    /// Processes a move made by the local player.
    pub fn process_local_move(&mut self, mv: BoardMove) {
        if self.stopped {
            info!("manager is stopped, ignoring local move");
            return;
        }
        if !self.exists || !self.board_states.is_initialised() {
            error!("channel does not exist on-chain, ignoring local move");
            return;
        }
        if !self.apply_local_move(&mv) {
            return;
        }
        self.process_state_update(true);
    }

    /// Runs automoves triggered by some non-move input (e.g. the
    /// position being set).
    pub fn trigger_auto_moves(&mut self) {
        if self.stopped {
            info!("manager is stopped, not triggering automoves");
            return;
        }
        if !self.exists || !self.board_states.is_initialised() {
            info!("channel does not exist on-chain, not triggering automoves");
            return;
        }
        if !self.process_auto_moves() {
            debug!("automoves triggered explicitly, but none found");
            return;
        }
        self.process_state_update(true);
    }

    /// Sends a resolution carrying the current state proof, tracking
    /// and returning its txid.  Returns `None` when no state is known
    /// or sending fails.
    pub fn put_state_on_chain(&mut self) -> Option<Id256> {
        info!(channel = %self.channel_id, "trying to put the latest state on chain");

        if !self.exists || !self.board_states.is_initialised() {
            warn!("no known state to put on chain");
            return None;
        }
        let Some(sender) = self.on_chain.as_ref() else {
            error!("no move sender configured");
            return None;
        };

        let mv = self
            .game
            .resolution_move(&self.channel_id, self.board_states.state_proof());
        let txid = sender.send_move(mv);
        self.pending_put_state_on_chain = txid;
        txid
    }

    /// Files a dispute with the current state proof, tracking and
    /// returning its txid.  Returns `None` when the channel does not
    /// exist, a dispute is already open or pending, or sending fails.
    pub fn file_dispute(&mut self) -> Option<Id256> {
        info!(channel = %self.channel_id, "trying to file a dispute");

        if !self.exists || !self.board_states.is_initialised() {
            warn!("the channel does not exist on chain");
            return None;
        }
        if self.dispute.is_some() {
            warn!("there is already a dispute for the channel");
            return None;
        }
        if self.pending_dispute.is_some() {
            warn!("there may already be a pending dispute");
            return None;
        }
        let Some(sender) = self.on_chain.as_ref() else {
            error!("no move sender configured");
            return None;
        };

        let mv = self
            .game
            .dispute_move(&self.channel_id, self.board_states.state_proof());
        let txid = sender.send_move(mv);
        self.pending_dispute = txid;
        txid
    }

    /// Stops all further updates.  One-way.
    pub fn stop_updates(&mut self) {
        self.stopped = true;
        self.notify_state_change();
    }

    /// JSON snapshot of the channel state for frontends.
    pub fn to_json(&self) -> Value {
        let mut res = json!({
            "id": self.channel_id.to_hex(),
            "playername": self.player_name,
            "existsonchain": self.exists,
            "version": self.state_version,
        });

        if let Some(block) = self.block_hash.as_ref() {
            res["blockhash"] = json!(block.to_hex());
            res["height"] = json!(self.on_chain_height);
        }

        if !self.exists || !self.board_states.is_initialised() {
            return res;
        }

        let meta = self.board_states.metadata();
        let proof = self.board_states.state_proof();
        let latest = self.board_states.latest_state();
        res["current"] = json!({
            "meta": {
                "participants": meta
                    .participants
                    .iter()
                    .map(|p| json!({"name": p.name, "address": p.address}))
                    .collect::<Vec<_>>(),
                "reinit": b64::encode(&meta.reinit),
                "proto": message_to_base64(meta.as_ref()),
            },
            "state": {
                "base64": b64::encode(proof.end_state()),
                "parsed": latest.to_json(),
                "whoseturn": latest.whose_turn(),
                "turncount": latest.turn_count(),
            },
        });

        if let Some(dispute) = self.dispute.as_ref() {
            res["dispute"] = json!({
                "height": dispute.height,
                "whoseturn": dispute.turn,
                "canresolve": latest.turn_count() > dispute.count,
            });
        }

        let mut pending = json!({});
        if let Some(txid) = self.pending_put_state_on_chain.as_ref() {
            pending["putstateonchain"] = json!(txid.to_hex());
        }
        if let Some(txid) = self.pending_dispute.as_ref() {
            pending["dispute"] = json!(txid.to_hex());
        }
        if let Some(txid) = self.dispute.as_ref().and_then(|d| d.pending_resolution) {
            pending["resolution"] = json!(txid.to_hex());
        }
        res["pending"] = pending;

        res
    }
}

/// Thread-safe monitor around a [`ChannelManager`].
///
/// Every public operation takes the single instance lock; waiters on
/// [`SyncChannelManager::wait_for_change`] are woken after each
/// operation and re-check the state version.
pub struct SyncChannelManager<R: BoardRules, C: OpenChannel<R>> {
    inner: Mutex<ChannelManager<R, C>>,
    changed: Condvar,
}

impl<R: BoardRules, C: OpenChannel<R>> SyncChannelManager<R, C> {
    pub fn new(manager: ChannelManager<R, C>) -> Self {
        Self {
            inner: Mutex::new(manager),
            changed: Condvar::new(),
        }
    }

    /// Runs a closure with the manager locked, waking waiters
    /// afterwards.
    pub fn access<T>(&self, f: impl FnOnce(&mut ChannelManager<R, C>) -> T) -> T {
        let mut guard = self.inner.lock().expect("channel manager lock poisoned");
        let out = f(&mut guard);
        drop(guard);
        self.changed.notify_all();
        out
    }

    /// Runs a closure with read-only access; does not wake waiters.
    pub fn read<T>(&self, f: impl FnOnce(&ChannelManager<R, C>) -> T) -> T {
        let guard = self.inner.lock().expect("channel manager lock poisoned");
        f(&guard)
    }

    pub fn process_on_chain(
        &self,
        block: Id256,
        height: u64,
        meta: ChannelMetadata,
        reinit_state: BoardState,
        proof: StateProof,
        dispute_height: u64,
    ) {
        self.access(|m| m.process_on_chain(block, height, meta, reinit_state, proof, dispute_height))
    }

    pub fn process_on_chain_non_existent(&self, block: Id256, height: u64) {
        self.access(|m| m.process_on_chain_non_existent(block, height))
    }

    pub fn process_off_chain(&self, reinit: &[u8], proof: StateProof) {
        self.access(|m| m.process_off_chain(reinit, proof))
    }

    pub fn process_local_move(&self, mv: BoardMove) {
        self.access(|m| m.process_local_move(mv))
    }

    pub fn trigger_auto_moves(&self) {
        self.access(|m| m.trigger_auto_moves())
    }

    pub fn put_state_on_chain(&self) -> Option<Id256> {
        self.access(|m| m.put_state_on_chain())
    }

    pub fn file_dispute(&self) -> Option<Id256> {
        self.access(|m| m.file_dispute())
    }

    pub fn stop_updates(&self) {
        self.access(|m| m.stop_updates())
    }

    pub fn to_json(&self) -> Value {
        self.read(|m| m.to_json())
    }

    pub fn state_version(&self) -> u64 {
        self.read(|m| m.state_version())
    }

    /// Blocks until the state version differs from `known_version`, the
    /// manager is stopped, or the timeout elapses; returns the current
    /// JSON snapshot.  Passing [`WAITFORCHANGE_ALWAYS_BLOCK`] waits for
    /// the next change regardless of the current version.
    pub fn wait_for_change(&self, known_version: u64) -> Value {
        let guard = self.inner.lock().expect("channel manager lock poisoned");

        if known_version != WAITFORCHANGE_ALWAYS_BLOCK && known_version != guard.state_version() {
            debug!(
                known_version,
                current = guard.state_version(),
                "returning immediately from wait_for_change"
            );
            return guard.to_json();
        }
        if guard.is_stopped() {
            debug!("manager is stopped, not waiting for changes");
            return guard.to_json();
        }

        let start_version = guard.state_version();
        let (guard, _timeout) = self
            .changed
            .wait_timeout_while(guard, WAITFORCHANGE_TIMEOUT, |m| {
                !m.is_stopped() && m.state_version() == start_version
            })
            .expect("channel manager lock poisoned");
        guard.to_json()
    }
}
