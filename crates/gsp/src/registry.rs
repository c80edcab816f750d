//! The per-channel records a GSP keeps.

use std::collections::BTreeMap;
use std::sync::Arc;

use armada_primitives::{b64, Id256};
use armada_proto::{message_to_base64, ChannelMetadata, StateProof};
use serde_json::{json, Value};

/// On-chain record of one channel.
pub struct Channel {
    id: Id256,
    meta: Arc<ChannelMetadata>,
    reinit_state: Vec<u8>,

    /// Latest state proof.  `None` when the latest state equals the
    /// reinit state byte-for-byte (the common case right after a
    /// reinitialisation).
    proof: Option<StateProof>,

    /// Height at which an open dispute was filed, if any.
    dispute_height: Option<u64>,
}

impl Channel {
    fn new(id: Id256, meta: ChannelMetadata, reinit_state: Vec<u8>) -> Self {
        Self {
            id,
            meta: Arc::new(meta),
            reinit_state,
            proof: None,
            dispute_height: None,
        }
    }

    pub fn id(&self) -> &Id256 {
        &self.id
    }

    pub fn metadata(&self) -> &Arc<ChannelMetadata> {
        &self.meta
    }

    pub fn reinit_state(&self) -> &[u8] {
        &self.reinit_state
    }

    /// Replaces metadata and state for a new reinitialisation.  Clears
    /// the stored proof and any dispute.
    pub fn reinitialise(&mut self, meta: ChannelMetadata, reinit_state: Vec<u8>) {
        self.meta = Arc::new(meta);
        self.reinit_state = reinit_state;
        self.proof = None;
        self.dispute_height = None;
    }

    /// The latest known state bytes.
    pub fn latest_state(&self) -> &[u8] {
        match self.proof.as_ref() {
            Some(proof) => proof.end_state(),
            None => &self.reinit_state,
        }
    }

    /// Stores a new state proof.  A proof ending in the reinit state is
    /// normalised away.
    pub fn set_state_proof(&mut self, proof: StateProof) {
        if proof.end_state() == self.reinit_state {
            self.proof = None;
        } else {
            self.proof = Some(proof);
        }
    }

    /// The state proof justifying the latest state.  Channels sitting
    /// at their reinit state yield a trivial proof.
    pub fn state_proof(&self) -> StateProof {
        match self.proof.as_ref() {
            Some(proof) => proof.clone(),
            None => StateProof::for_state(self.reinit_state.clone()),
        }
    }

    pub fn dispute_height(&self) -> Option<u64> {
        self.dispute_height
    }

    pub fn set_dispute_height(&mut self, height: u64) {
        self.dispute_height = Some(height);
    }

    pub fn clear_dispute(&mut self) {
        self.dispute_height = None;
    }

    /// The JSON form served to channel daemons via `getchannel`.
    pub fn to_gsp_json(&self) -> Value {
        let mut res = json!({
            "id": self.id.to_hex(),
            "meta": {"proto": message_to_base64(self.meta.as_ref())},
            "state": {"proof": message_to_base64(&self.state_proof())},
            "reinit": {"base64": b64::encode(&self.reinit_state)},
        });
        if let Some(height) = self.dispute_height {
            res["disputeheight"] = json!(height);
        }
        res
    }
}

/// In-memory registry of all open channels, keyed by channel id.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<Id256, Channel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a channel.  The id must be fresh; ids come from
    /// transaction ids, which do not collide.
    pub fn create(&mut self, id: Id256, meta: ChannelMetadata, reinit_state: Vec<u8>) -> &mut Channel {
        assert!(
            !self.channels.contains_key(&id),
            "channel {id} already exists"
        );
        self.channels
            .entry(id)
            .or_insert_with(|| Channel::new(id, meta, reinit_state))
    }

    pub fn get(&self, id: &Id256) -> Option<&Channel> {
        self.channels.get(id)
    }

    pub fn get_mut(&mut self, id: &Id256) -> Option<&mut Channel> {
        self.channels.get_mut(id)
    }

    pub fn remove(&mut self, id: &Id256) -> Option<Channel> {
        self.channels.remove(id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Id256, &Channel)> {
        self.channels.iter()
    }

    /// Ids of all channels whose dispute was filed at or below the
    /// given height.  Used by the expiry scan at new-block time.
    pub fn disputes_filed_up_to(&self, height: u64) -> Vec<Id256> {
        self.channels
            .iter()
            .filter(|(_, ch)| ch.dispute_height().is_some_and(|h| h <= height))
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use armada_primitives::hash::sha256;
    use armada_test_utils::fake_metadata;

    use super::*;

    fn id(n: u8) -> Id256 {
        sha256(&[n])
    }

    #[test]
    fn proof_at_reinit_state_is_normalised_away() {
        let mut registry = ChannelRegistry::new();
        let ch = registry.create(id(1), fake_metadata(&[("a", "x")], b"r"), b"base".to_vec());

        ch.set_state_proof(StateProof::for_state(b"base".to_vec()));
        assert_eq!(ch.latest_state(), b"base");
        // Even so, a usable trivial proof is served.
        assert_eq!(ch.state_proof().end_state(), b"base");

        ch.set_state_proof(StateProof::for_state(b"newer".to_vec()));
        assert_eq!(ch.latest_state(), b"newer");
    }

    #[test]
    fn reinitialise_resets_proof_and_dispute() {
        let mut registry = ChannelRegistry::new();
        let ch = registry.create(id(1), fake_metadata(&[("a", "x")], b"r1"), b"one".to_vec());
        ch.set_state_proof(StateProof::for_state(b"later".to_vec()));
        ch.set_dispute_height(10);

        ch.reinitialise(fake_metadata(&[("a", "x"), ("b", "y")], b"r2"), b"two".to_vec());
        assert_eq!(ch.latest_state(), b"two");
        assert_eq!(ch.dispute_height(), None);
        assert_eq!(ch.metadata().reinit, b"r2");
    }

    #[test]
    fn dispute_scan_finds_expired_heights() {
        let mut registry = ChannelRegistry::new();
        registry
            .create(id(1), fake_metadata(&[("a", "x")], b"r"), vec![])
            .set_dispute_height(90);
        registry
            .create(id(2), fake_metadata(&[("a", "x")], b"r"), vec![])
            .set_dispute_height(100);
        registry.create(id(3), fake_metadata(&[("a", "x")], b"r"), vec![]);

        let expired = registry.disputes_filed_up_to(95);
        assert_eq!(expired, vec![id(1)]);
    }

    #[test]
    fn gsp_json_has_the_wire_fields() {
        let mut registry = ChannelRegistry::new();
        let ch = registry.create(id(1), fake_metadata(&[("a", "x")], b"r"), b"base".to_vec());
        ch.set_dispute_height(12);

        let json = ch.to_gsp_json();
        assert_eq!(json["id"], id(1).to_hex());
        assert!(json["meta"]["proto"].is_string());
        assert!(json["state"]["proof"].is_string());
        assert!(json["reinit"]["base64"].is_string());
        assert_eq!(json["disputeheight"], 12);
    }
}
