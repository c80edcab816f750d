//! End-to-end tests of the channel manager against the counting game.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use armada_channel::broadcast::{decode_incoming, BroadcastTransport, OffChainBroadcast};
use armada_channel::manager::{ChannelManager, SyncChannelManager, WAITFORCHANGE_ALWAYS_BLOCK};
use armada_channel::sender::MoveSender;
use armada_primitives::hash::sha256;
use armada_primitives::Id256;
use armada_proto::{ChannelMetadata, StateProof};
use armada_test_utils::{
    count_move, count_state, extend_counting_proof, fake_metadata, CountingChannel, CountingRules,
    FakeSigner, FakeVerifier, HubTransport, LocalBroadcastHub, RecordingSender,
};
use serde_json::json;

const GAME: &str = "testgame";
const PLAYER: &str = "alice";

fn channel_id() -> Id256 {
    sha256(b"manager tests")
}

fn block(n: u64) -> Id256 {
    sha256(format!("block {n}").as_bytes())
}

fn meta() -> ChannelMetadata {
    fake_metadata(&[("alice", "addr a"), ("bob", "addr b")], b"r1")
}

type TestManager = SyncChannelManager<CountingRules, CountingChannel>;

struct Harness {
    manager: Arc<TestManager>,
    sender: Arc<RecordingSender>,
    peer: Arc<HubTransport>,
}

fn harness(game: CountingChannel) -> Harness {
    let sender = Arc::new(RecordingSender::new());
    let hub = LocalBroadcastHub::new();
    let peer = hub.connect();

    let mut cm = ChannelManager::new(
        Arc::new(CountingRules),
        game,
        Arc::new(FakeVerifier),
        Box::new(FakeSigner::new("addr a")),
        GAME.to_owned(),
        channel_id(),
        PLAYER.to_owned(),
    );
    cm.set_move_sender(MoveSender::new(
        sender.clone(),
        GAME.to_owned(),
        PLAYER.to_owned(),
    ));
    cm.set_off_chain_broadcast(OffChainBroadcast::new(hub.connect()));

    Harness {
        manager: Arc::new(SyncChannelManager::new(cm)),
        sender,
        peer,
    }
}

/// Installs an on-chain state at the given count with no dispute.
fn install(h: &Harness, count: u32) {
    h.manager.process_on_chain(
        block(1),
        1,
        meta(),
        count_state(count),
        StateProof::for_state(count_state(count)),
        0,
    );
}

fn turn_count(h: &Harness) -> u64 {
    h.manager.to_json()["current"]["state"]["turncount"]
        .as_u64()
        .expect("state in json")
}

#[test]
fn version_starts_at_one_and_increases() {
    let h = harness(CountingChannel::new());
    assert_eq!(h.manager.state_version(), 1);

    h.manager.process_on_chain_non_existent(block(1), 1);
    assert_eq!(h.manager.state_version(), 2);

    let snapshot = h.manager.to_json();
    assert_eq!(snapshot["existsonchain"], json!(false));
    assert_eq!(snapshot["blockhash"], json!(block(1).to_hex()));
    assert_eq!(snapshot["height"], json!(1));
}

#[test]
fn snapshots_are_stable_without_updates() {
    let h = harness(CountingChannel::new());
    install(&h, 2);
    assert_eq!(h.manager.to_json(), h.manager.to_json());
}

#[test]
fn on_chain_update_installs_the_state() {
    let h = harness(CountingChannel::new());
    let before = h.manager.state_version();
    install(&h, 2);

    assert!(h.manager.state_version() > before);
    let snapshot = h.manager.to_json();
    assert_eq!(snapshot["existsonchain"], json!(true));
    assert_eq!(snapshot["current"]["state"]["turncount"], json!(2));
    assert_eq!(snapshot["current"]["state"]["whoseturn"], json!(0));
}

#[test]
fn local_move_extends_and_broadcasts() {
    let h = harness(CountingChannel::new());
    install(&h, 0);

    h.manager.process_local_move(count_move(1));
    assert_eq!(turn_count(&h), 1);

    // The new proof went out over the broadcast.
    let msg = h
        .peer
        .try_receive(Duration::from_millis(500))
        .expect("broadcast message");
    let envelope = decode_incoming(&msg).unwrap();
    assert_eq!(envelope.reinit, b"r1");
    assert_eq!(envelope.proof.transitions.len(), 1);
}

#[test]
fn local_move_out_of_turn_is_rejected() {
    let h = harness(CountingChannel::new());
    install(&h, 1); // count 1: bob's turn

    let before = h.manager.state_version();
    h.manager.process_local_move(count_move(2));
    assert_eq!(h.manager.state_version(), before);
    assert_eq!(turn_count(&h), 1);
}

#[test]
fn local_move_without_channel_is_ignored() {
    let h = harness(CountingChannel::new());
    let before = h.manager.state_version();
    h.manager.process_local_move(count_move(1));
    assert_eq!(h.manager.state_version(), before);
}

#[test]
fn off_chain_updates_apply_when_fresher() {
    let h = harness(CountingChannel::new());
    install(&h, 0);

    let m = Arc::new(meta());
    let newer = extend_counting_proof(
        GAME,
        &channel_id(),
        &m,
        StateProof::for_state(count_state(0)),
        &[1, 2],
    );
    h.manager.process_off_chain(b"r1", newer);
    assert_eq!(turn_count(&h), 2);

    // Stale proof afterwards changes nothing.
    let before = h.manager.state_version();
    let stale = extend_counting_proof(
        GAME,
        &channel_id(),
        &m,
        StateProof::for_state(count_state(0)),
        &[1],
    );
    h.manager.process_off_chain(b"r1", stale);
    assert_eq!(h.manager.state_version(), before);
    assert_eq!(turn_count(&h), 2);
}

#[test]
fn automoves_run_while_it_is_our_turn() {
    let h = harness(CountingChannel::with_auto_moves(&[1, 3]));
    // Installing runs the pipeline: alice automoves 0 -> 1, then it is
    // bob's turn.
    install(&h, 0);
    assert_eq!(turn_count(&h), 1);

    // Automoves force a broadcast even on an on-chain trigger.
    let msg = h
        .peer
        .try_receive(Duration::from_millis(500))
        .expect("automove broadcast");
    assert!(decode_incoming(&msg).is_some());

    // Bob moves 1 -> 2 off-chain; alice's next automove takes it to 3.
    let m = Arc::new(meta());
    let proof = extend_counting_proof(
        GAME,
        &channel_id(),
        &m,
        StateProof::for_state(count_state(0)),
        &[1, 2],
    );
    h.manager.process_off_chain(b"r1", proof);
    assert_eq!(turn_count(&h), 3);
}

#[test]
fn trigger_auto_moves_applies_pending_moves() {
    let h = harness(CountingChannel::new());
    install(&h, 0);
    assert_eq!(turn_count(&h), 0);

    h.manager.access(|m| {
        m.game_mut().auto_moves.push_back(1);
    });
    h.manager.trigger_auto_moves();
    assert_eq!(turn_count(&h), 1);
}

#[test]
fn on_chain_move_hook_runs_in_the_pipeline() {
    let h = harness(CountingChannel::new());
    install(&h, 0);
    let calls = h.manager.read(|m| m.game().on_chain_calls);
    assert!(calls > 0);
}

#[test]
fn dispute_against_us_is_resolved_once_we_know_better() {
    let h = harness(CountingChannel::new());
    // Disputed state at count 2 (alice's turn).
    h.manager.process_on_chain(
        block(1),
        1,
        meta(),
        count_state(2),
        StateProof::for_state(count_state(2)),
        100,
    );

    // No better state yet, so no resolution.
    assert!(h.sender.sent_moves().is_empty());
    let snapshot = h.manager.to_json();
    assert_eq!(snapshot["dispute"]["height"], json!(100));
    assert_eq!(snapshot["dispute"]["whoseturn"], json!(0));
    assert_eq!(snapshot["dispute"]["canresolve"], json!(false));

    // Alice makes a move; the dispute is now resolvable and a
    // resolution goes out automatically.
    h.manager.process_local_move(count_move(3));
    let sent = h.sender.sent_json();
    assert_eq!(sent.len(), 1);
    assert!(sent[0]["g"][GAME]["r"].is_object());
    assert!(h.manager.to_json()["pending"]["resolution"].is_string());

    // Only one resolution is sent while it is pending.
    h.manager.trigger_auto_moves();
    assert_eq!(h.sender.sent_moves().len(), 1);

    // The dispute clearing on-chain drops the dispute data.
    h.manager.process_on_chain(
        block(2),
        2,
        meta(),
        count_state(2),
        StateProof::for_state(count_state(2)),
        0,
    );
    assert!(h.manager.to_json()["dispute"].is_null());
}

#[test]
fn dispute_against_the_opponent_is_left_alone() {
    let h = harness(CountingChannel::new());
    // Count 3: bob's turn is disputed.
    h.manager.process_on_chain(
        block(1),
        1,
        meta(),
        count_state(3),
        StateProof::for_state(count_state(3)),
        100,
    );

    let m = Arc::new(meta());
    let proof = extend_counting_proof(
        GAME,
        &channel_id(),
        &m,
        StateProof::for_state(count_state(3)),
        &[4],
    );
    h.manager.process_off_chain(b"r1", proof);

    assert_eq!(turn_count(&h), 4);
    assert!(h.sender.sent_moves().is_empty());
}

#[test]
fn file_dispute_tracks_the_pending_txid() {
    let h = harness(CountingChannel::new());
    install(&h, 2);

    let txid = h.manager.file_dispute().expect("dispute txid");
    assert_eq!(
        h.manager.to_json()["pending"]["dispute"],
        json!(txid.to_hex())
    );

    // A second dispute is refused while one is pending.
    assert_eq!(h.manager.file_dispute(), None);

    // Once mined and seen in a block, the pending marker clears.
    h.sender.confirm(&txid);
    h.manager.process_on_chain(
        block(2),
        2,
        meta(),
        count_state(2),
        StateProof::for_state(count_state(2)),
        0,
    );
    assert!(h.manager.to_json()["pending"]["dispute"].is_null());
}

#[test]
fn put_state_on_chain_is_idempotent() {
    let h = harness(CountingChannel::new());
    install(&h, 0);

    let m = Arc::new(meta());
    let proof = extend_counting_proof(
        GAME,
        &channel_id(),
        &m,
        StateProof::for_state(count_state(0)),
        &[1, 2],
    );
    h.manager.process_off_chain(b"r1", proof);

    let version = h.manager.state_version();
    let tx1 = h.manager.put_state_on_chain().expect("first txid");
    let tx2 = h.manager.put_state_on_chain().expect("second txid");
    assert_ne!(tx1, tx2);

    // Both moves carry a byte-equal resolution payload, and the state
    // version did not move.
    let sent = h.sender.sent_moves();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].1, sent[1].1);
    assert_eq!(h.manager.state_version(), version);
}

#[test]
fn put_state_on_chain_without_state_fails() {
    let h = harness(CountingChannel::new());
    assert_eq!(h.manager.put_state_on_chain(), None);

    h.sender.set_fail(true);
    install(&h, 0);
    assert_eq!(h.manager.put_state_on_chain(), None);
}

#[test]
fn wait_for_change_returns_immediately_on_version_mismatch() {
    let h = harness(CountingChannel::new());
    let snapshot = h.manager.wait_for_change(999);
    assert_eq!(snapshot["version"], json!(h.manager.state_version()));
}

#[test]
fn wait_for_change_wakes_on_updates() {
    let h = harness(CountingChannel::new());
    let version = h.manager.state_version();

    let manager = h.manager.clone();
    let updater = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        manager.process_on_chain_non_existent(block(1), 1);
    });

    let snapshot = h.manager.wait_for_change(version);
    updater.join().unwrap();
    assert!(snapshot["version"].as_u64().unwrap() > version);
}

#[test]
fn wait_for_change_always_block_waits_for_the_next_change() {
    let h = harness(CountingChannel::new());

    let manager = h.manager.clone();
    let updater = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        manager.process_on_chain_non_existent(block(1), 1);
    });

    let before = h.manager.state_version();
    let snapshot = h.manager.wait_for_change(WAITFORCHANGE_ALWAYS_BLOCK);
    updater.join().unwrap();
    assert!(snapshot["version"].as_u64().unwrap() > before);
}

#[test]
fn stop_updates_is_absorbing() {
    let h = harness(CountingChannel::new());
    install(&h, 0);
    h.manager.stop_updates();

    let version = h.manager.state_version();
    install(&h, 5);
    h.manager.process_local_move(count_move(1));
    h.manager.process_on_chain_non_existent(block(9), 9);
    assert_eq!(h.manager.state_version(), version);

    // Waiters return promptly when stopped.
    let snapshot = h.manager.wait_for_change(version);
    assert_eq!(snapshot["version"], json!(version));
}

#[test]
fn nonexistent_channel_clears_dispute() {
    let h = harness(CountingChannel::new());
    h.manager.process_on_chain(
        block(1),
        1,
        meta(),
        count_state(2),
        StateProof::for_state(count_state(2)),
        100,
    );
    assert!(h.manager.to_json()["dispute"].is_object());

    h.manager.process_on_chain_non_existent(block(2), 2);
    let snapshot = h.manager.to_json();
    assert_eq!(snapshot["existsonchain"], json!(false));
    assert!(snapshot["dispute"].is_null());
}
