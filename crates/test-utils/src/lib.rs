//! Shared fakes and helpers for tests across the armada crates.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use arbitrary::{Arbitrary, Unstructured};
use rand::{rngs::ThreadRng, thread_rng, RngCore};
use serde_json::{json, Value};

use armada_channel::broadcast::BroadcastTransport;
use armada_channel::proof::extend_state_proof;
use armada_channel::rules::{BoardMove, BoardRules, BoardState, OpenChannel, ParsedState};
use armada_channel::sender::{MoveSender, TransactionSender};
use armada_channel::sig::{sign_data_for_participant, TOPIC_STATE};
use armada_channel::SendError;
use armada_crypto::{SignatureSigner, SignatureVerifier, INVALID_ADDRESS};
use armada_primitives::hash::sha256;
use armada_primitives::Id256;
use armada_proto::{
    message_to_base64, ChannelMetadata, ChannelParticipant, SignedData, StateProof,
};

/// Buffer-backed generator of `Arbitrary` values.
pub struct ArbitraryGenerator {
    rng: ThreadRng,
    buf: Vec<u8>,
}

impl Default for ArbitraryGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ArbitraryGenerator {
    pub fn new() -> Self {
        Self {
            rng: thread_rng(),
            buf: vec![0u8; 256],
        }
    }

    pub fn generate<'a, T: Arbitrary<'a>>(&'a mut self) -> T {
        self.rng.fill_bytes(&mut self.buf);
        let mut u = Unstructured::new(&self.buf);
        T::arbitrary(&mut u).expect("arbitrary generation")
    }
}

// -------------------------------------------------------------------
// Fake signature scheme.

/// Deterministic fake signer: the "signature" embeds the address and a
/// digest fragment of the message, so the fake verifier can recover the
/// address while still binding signatures to their message.
pub struct FakeSigner {
    address: String,
}

impl FakeSigner {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_owned(),
        }
    }
}

fn message_tag(message: &str) -> String {
    sha256(message.as_bytes()).to_hex()[..16].to_owned()
}

impl SignatureSigner for FakeSigner {
    fn address(&self) -> &str {
        &self.address
    }

    fn sign_message(&self, message: &str) -> Vec<u8> {
        format!("sgn:{}:{}", self.address, message_tag(message)).into_bytes()
    }
}

/// Verifier for [`FakeSigner`] signatures.
pub struct FakeVerifier;

impl SignatureVerifier for FakeVerifier {
    fn recover_signer(&self, message: &str, signature: &[u8]) -> String {
        let Ok(text) = std::str::from_utf8(signature) else {
            return INVALID_ADDRESS.to_owned();
        };
        let Some(rest) = text.strip_prefix("sgn:") else {
            return INVALID_ADDRESS.to_owned();
        };
        let Some((address, tag)) = rest.rsplit_once(':') else {
            return INVALID_ADDRESS.to_owned();
        };
        if tag != message_tag(message) {
            return INVALID_ADDRESS.to_owned();
        }
        address.to_owned()
    }
}

/// Metadata with the given (name, address) participants, protocol
/// version 1.
pub fn fake_metadata(participants: &[(&str, &str)], reinit: &[u8]) -> ChannelMetadata {
    ChannelMetadata {
        participants: participants
            .iter()
            .map(|(name, address)| ChannelParticipant {
                name: (*name).to_owned(),
                address: (*address).to_owned(),
            })
            .collect(),
        reinit: reinit.to_vec(),
        proto_version: 1,
    }
}

/// Signs a payload for every given signer (each must match some
/// participant address in the metadata).
pub fn signed_by(
    data: &[u8],
    signers: &[&FakeSigner],
    game_id: &str,
    channel_id: &Id256,
    meta: &ChannelMetadata,
    topic: &str,
) -> SignedData {
    let mut signed = SignedData::unsigned(data.to_vec());
    for signer in signers {
        let index = meta
            .participants
            .iter()
            .position(|p| p.address == signer.address())
            .expect("signer address not in metadata");
        assert!(sign_data_for_participant(
            *signer, game_id, channel_id, meta, topic, index, &mut signed
        ));
    }
    signed
}

// -------------------------------------------------------------------
// Counting game: the minimal board rules for framework tests.
//
// The state is a single number; any move to a strictly larger number is
// legal, the turn alternates with parity, and the game is over at 100.

const COUNTING_FINISHED_AT: u32 = 100;

/// Encodes a counting-game state.
pub fn count_state(count: u32) -> BoardState {
    borsh::to_vec(&count).expect("borsh encoding")
}

/// Encodes a counting-game move.
pub fn count_move(target: u32) -> BoardMove {
    borsh::to_vec(&target).expect("borsh encoding")
}

pub struct CountState {
    meta: Arc<ChannelMetadata>,
    count: u32,
}

impl CountState {
    pub fn count(&self) -> u32 {
        self.count
    }
}

impl ParsedState for CountState {
    fn whose_turn(&self) -> Option<u8> {
        if self.count >= COUNTING_FINISHED_AT || self.meta.participants.is_empty() {
            return None;
        }
        Some((self.count as usize % self.meta.participants.len()) as u8)
    }

    fn turn_count(&self) -> u32 {
        self.count
    }

    fn apply_move(&self, mv: &[u8]) -> Option<BoardState> {
        let target: u32 = borsh::from_slice(mv).ok()?;
        self.whose_turn()?;
        (target > self.count).then(|| count_state(target))
    }

    fn equals(&self, other: &[u8]) -> bool {
        borsh::from_slice::<u32>(other).is_ok_and(|c| c == self.count)
    }

    fn to_json(&self) -> Value {
        json!({ "count": self.count })
    }
}

pub struct CountingRules;

impl BoardRules for CountingRules {
    type State = CountState;

    fn parse_state(
        &self,
        _channel_id: &Id256,
        meta: &Arc<ChannelMetadata>,
        data: &[u8],
    ) -> Option<Self::State> {
        if meta.proto_version != 1 {
            return None;
        }
        let count: u32 = borsh::from_slice(data).ok()?;
        Some(CountState {
            meta: meta.clone(),
            count,
        })
    }
}

/// Open-channel fake for the counting game: automoves come from a
/// scripted queue, and on-chain move hook invocations are counted.
#[derive(Default)]
pub struct CountingChannel {
    pub auto_moves: VecDeque<u32>,
    pub on_chain_calls: u32,
}

impl CountingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auto_moves(moves: &[u32]) -> Self {
        Self {
            auto_moves: moves.iter().copied().collect(),
            on_chain_calls: 0,
        }
    }
}

impl OpenChannel<CountingRules> for CountingChannel {
    fn resolution_move(&self, channel_id: &Id256, proof: &StateProof) -> Value {
        json!({"r": {"id": channel_id.to_hex(), "state": message_to_base64(proof)}})
    }

    fn dispute_move(&self, channel_id: &Id256, proof: &StateProof) -> Value {
        json!({"d": {"id": channel_id.to_hex(), "state": message_to_base64(proof)}})
    }

    fn maybe_auto_move(&mut self, state: &CountState) -> Option<BoardMove> {
        while let Some(next) = self.auto_moves.pop_front() {
            if next > state.count() {
                return Some(count_move(next));
            }
        }
        None
    }

    fn maybe_on_chain_move(&mut self, _state: &CountState, _sender: &MoveSender) {
        self.on_chain_calls += 1;
    }
}

/// Builds a proof whose initial state is `count_state(count)` signed by
/// all participants (addresses must match `FakeSigner`s).
pub fn quorum_proof(
    game_id: &str,
    channel_id: &Id256,
    meta: &ChannelMetadata,
    count: u32,
) -> StateProof {
    let signers: Vec<FakeSigner> = meta
        .participants
        .iter()
        .map(|p| FakeSigner::new(&p.address))
        .collect();
    let refs: Vec<&FakeSigner> = signers.iter().collect();
    StateProof {
        initial_state: signed_by(
            &count_state(count),
            &refs,
            game_id,
            channel_id,
            meta,
            TOPIC_STATE,
        ),
        transitions: Vec::new(),
    }
}

/// Extends a counting-game proof with the given sequence of moves, each
/// signed by the participant whose turn it is.
pub fn extend_counting_proof(
    game_id: &str,
    channel_id: &Id256,
    meta: &Arc<ChannelMetadata>,
    base: StateProof,
    moves: &[u32],
) -> StateProof {
    let mut proof = base;
    for target in moves {
        let current: u32 = borsh::from_slice(proof.end_state()).expect("counting state");
        let turn = current as usize % meta.participants.len();
        let signer = FakeSigner::new(&meta.participants[turn].address);
        proof = extend_state_proof(
            &signer,
            &CountingRules,
            game_id,
            channel_id,
            meta,
            &proof,
            &count_move(*target),
        )
        .expect("extending counting proof");
    }
    proof
}

// -------------------------------------------------------------------
// Recording transaction sender.

#[derive(Default)]
struct RecordingInner {
    sent: Vec<(String, String)>,
    pending: BTreeSet<Id256>,
    fail: bool,
    counter: u64,
}

/// Transaction sender that records submitted moves and tracks a
/// controllable pending set.
#[derive(Default)]
pub struct RecordingSender {
    inner: Mutex<RecordingInner>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// All (name, value) moves sent so far.
    pub fn sent_moves(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Parsed JSON payloads of all sent moves.
    pub fn sent_json(&self) -> Vec<Value> {
        self.sent_moves()
            .iter()
            .map(|(_, v)| serde_json::from_str(v).unwrap())
            .collect()
    }

    /// Makes future sends fail.
    pub fn set_fail(&self, fail: bool) {
        self.inner.lock().unwrap().fail = fail;
    }

    /// Marks a transaction as mined (no longer pending).
    pub fn confirm(&self, txid: &Id256) {
        self.inner.lock().unwrap().pending.remove(txid);
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }
}

impl TransactionSender for RecordingSender {
    fn send_raw_move(&self, name: &str, value: &str) -> Result<Id256, SendError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail {
            return Err(SendError("simulated send failure".to_owned()));
        }
        inner.counter += 1;
        let txid = sha256(format!("fake tx {}", inner.counter).as_bytes());
        inner.sent.push((name.to_owned(), value.to_owned()));
        inner.pending.insert(txid);
        Ok(txid)
    }

    fn is_pending(&self, txid: &Id256) -> bool {
        self.inner.lock().unwrap().pending.contains(txid)
    }
}

// -------------------------------------------------------------------
// In-process broadcast hub.

#[derive(Default)]
struct Endpoint {
    queue: Mutex<VecDeque<Vec<u8>>>,
    available: Condvar,
}

impl Endpoint {
    fn push(&self, msg: Vec<u8>) {
        self.queue.lock().unwrap().push_back(msg);
        self.available.notify_one();
    }

    fn pop(&self, timeout: Duration) -> Option<Vec<u8>> {
        let guard = self.queue.lock().unwrap();
        let (mut guard, _) = self
            .available
            .wait_timeout_while(guard, timeout, |q| q.is_empty())
            .unwrap();
        guard.pop_front()
    }
}

#[derive(Default)]
struct HubInner {
    endpoints: Mutex<Vec<Arc<Endpoint>>>,
}

/// In-process pub/sub carrier connecting any number of transports;
/// every message is delivered to all other endpoints.
#[derive(Default)]
pub struct LocalBroadcastHub {
    inner: Arc<HubInner>,
}

impl LocalBroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> Arc<HubTransport> {
        let endpoint = Arc::new(Endpoint::default());
        self.inner.endpoints.lock().unwrap().push(endpoint.clone());
        Arc::new(HubTransport {
            hub: self.inner.clone(),
            endpoint,
        })
    }
}

pub struct HubTransport {
    hub: Arc<HubInner>,
    endpoint: Arc<Endpoint>,
}

impl BroadcastTransport for HubTransport {
    fn send(&self, msg: Vec<u8>) {
        for other in self.hub.endpoints.lock().unwrap().iter() {
            if !Arc::ptr_eq(other, &self.endpoint) {
                other.push(msg.clone());
            }
        }
    }

    fn try_receive(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.endpoint.pop(timeout)
    }
}
