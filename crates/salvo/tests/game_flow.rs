//! Full games driven end-to-end through the per-channel game logic.

use std::sync::Arc;

use armada_channel::rules::{BoardRules, OpenChannel, ParsedState};
use armada_channel::sender::MoveSender;
use armada_primitives::hash::sha256;
use armada_primitives::Id256;
use armada_salvo::{initial_board_state, Coord, Grid, Phase, SalvoChannel, SalvoRules, SalvoState};
use armada_test_utils::{fake_metadata, RecordingSender};

const GAME: &str = "xs";

const FLEET_A: &str = "\
    xx..xx..\n\
    ........\n\
    xx..xxx.\n\
    ........\n\
    xx..xxx.\n\
    ........\n\
    xxxx....\n\
    ........\n";

const FLEET_B: &str = "\
    x.x.x.x.\n\
    x.x.x.x.\n\
    ......x.\n\
    ......x.\n\
    x.x.x...\n\
    x.x.x...\n\
    ..x.x...\n\
    ........\n";

fn channel_id() -> Id256 {
    sha256(b"game flow tests")
}

/// Plays a full game between two honest daemons.  Automoves cover
/// everything except picking shot targets, which the driver does by
/// scanning the board in order.
fn play_duel() -> (SalvoState, [SalvoChannel; 2]) {
    let meta = Arc::new(fake_metadata(
        &[("alice", "addr a"), ("bob", "addr b")],
        b"r1",
    ));

    let mut players = [
        SalvoChannel::new("alice".to_owned()),
        SalvoChannel::new("bob".to_owned()),
    ];
    assert!(players[0].set_position(Grid::from_text(FLEET_A).unwrap()));
    assert!(players[1].set_position(Grid::from_text(FLEET_B).unwrap()));

    let mut state = SalvoRules
        .parse_state(&channel_id(), &meta, &initial_board_state())
        .expect("initial state");

    let mut steps = 0;
    while let Some(turn) = state.whose_turn() {
        steps += 1;
        assert!(steps < 1000, "game does not terminate");

        let turn = turn as usize;
        let mv = players[turn].maybe_auto_move(&state).unwrap_or_else(|| {
            // No automove means the shoot phase: target the first cell
            // not yet guessed on the opponent's board.
            assert_eq!(state.phase(), Phase::Shoot);
            let other = 1 - turn;
            let guessed = Grid::new(state.data().known_ships[other].guessed);
            let target = (0u8..64)
                .map(Coord::from_index)
                .find(|c| !guessed.get(*c))
                .expect("some cell left to shoot");
            SalvoChannel::shot_move(target)
        });

        let before = state.turn_count();
        let bytes = state.apply_move(&mv).expect("move applies");
        state = SalvoRules
            .parse_state(&channel_id(), &meta, &bytes)
            .expect("successor state parses");
        assert!(state.turn_count() > before, "turn count must advance");
    }

    (state, players)
}

#[test]
fn honest_duel_produces_a_winner() {
    let (state, _) = play_duel();

    assert_eq!(state.phase(), Phase::Finished);
    let winner = state.data().winner.expect("winner is set");
    assert!(winner <= 1);

    // The winner revealed an all-hit opponent board.
    let loser = 1 - winner as usize;
    let hits = Grid::new(state.data().known_ships[loser].hits);
    assert_eq!(hits.count_ones(), Grid::TOTAL_SHIP_CELLS);

    let json = state.to_json();
    assert_eq!(json["phase"], "finished");
    assert_eq!(json["winner"], winner);
}

#[test]
fn the_loser_declares_the_loss_on_chain() {
    let (state, mut players) = play_duel();
    let winner = state.data().winner.unwrap() as usize;
    let loser = 1 - winner;

    let recording = Arc::new(RecordingSender::new());
    let sender = MoveSender::new(recording.clone(), GAME.to_owned(), "irrelevant".to_owned());

    // The winner has nothing to declare.
    players[winner].maybe_on_chain_move(&state, &sender);
    assert!(recording.sent_moves().is_empty());

    // The loser sends the loss declaration.
    players[loser].maybe_on_chain_move(&state, &sender);
    let sent = recording.sent_json();
    assert_eq!(sent.len(), 1);
    let data = &sent[0]["g"][GAME]["l"];
    assert_eq!(data["id"], channel_id().to_hex());
    assert!(data["r"].is_string());

    // While the declaration is pending, no second one goes out.
    players[loser].maybe_on_chain_move(&state, &sender);
    assert_eq!(recording.sent_moves().len(), 1);
}

#[test]
fn positions_can_only_be_set_once_and_must_be_valid() {
    let mut channel = SalvoChannel::new("alice".to_owned());
    assert!(!channel.set_position(Grid::new(0xff)));
    assert!(!channel.is_position_set());

    assert!(channel.set_position(Grid::from_text(FLEET_A).unwrap()));
    assert!(!channel.set_position(Grid::from_text(FLEET_B).unwrap()));
    assert_eq!(
        channel.position().map(|g| g.bits()),
        Some(Grid::from_text(FLEET_A).unwrap().bits())
    );
}
