//! Board state and move rules of the game.
//!
//! The game phase is implicit in which fields of the state are
//! populated; [`BoardData`] is the encoded form, [`SalvoState`] a
//! parsed and validated state tied to its channel metadata.

use std::sync::Arc;

use armada_channel::rules::{BoardRules, BoardState, ParsedState};
use armada_primitives::hash::{sha256, Sha256Writer};
use armada_primitives::rng::SeededRng;
use armada_primitives::Id256;
use armada_proto::{decode_message, encode_message, ChannelMetadata};
use borsh::{BorshDeserialize, BorshSerialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::coord::{Coord, CELLS, SIDE};
use crate::grid::{verify_position_for_answers, verify_position_of_ships, Grid};

/// Protocol version of the board encoding implemented by these rules.
pub const PROTO_VERSION: u32 = 1;

/// Size in bytes of hash commitments (and the maximum seed/salt size).
const COMMITMENT_BYTES: usize = 32;

/// What each player knows about one player's board: the cells that
/// have been shot at, and which of those were answered as hits.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct KnownShips {
    pub guessed: u64,
    pub hits: u64,
}

/// Encoded board state.
///
/// Which fields are populated determines the phase; see
/// [`Phase`].  States with field combinations matching no phase are
/// invalid.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BoardData {
    /// Player to move; absent exactly when the game is finished.
    pub turn: Option<u8>,

    /// Position hash commitments, in commitment order.  Entries are
    /// blanked once the position is revealed.
    pub position_hashes: Vec<Vec<u8>>,

    /// Per-player known-ships bitmaps (index = player whose board).
    pub known_ships: Vec<KnownShips>,

    /// First player's seed commitment, until the seed is revealed.
    pub seed_hash_0: Option<Vec<u8>>,

    /// Second player's seed preimage, until the first seed is revealed.
    pub seed_1: Option<Vec<u8>>,

    /// Cell of a shot awaiting its answer.
    pub current_shot: Option<u8>,

    /// Revealed positions (0 = not yet revealed); empty until the
    /// first reveal.
    pub positions: Vec<u64>,

    /// The winning player once determined.
    pub winner: Option<u8>,
}

/// A move in the game.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum SalvoMove {
    /// Position commitment of either player; the first player also
    /// commits to a random seed, the second reveals theirs directly.
    Commit {
        position_hash: Vec<u8>,
        seed_hash: Option<Vec<u8>>,
        seed: Option<Vec<u8>>,
    },

    /// First player's seed preimage, deciding the starting player.
    RevealSeed { seed: Vec<u8> },

    /// A shot at a cell.
    Shot { location: u8 },

    /// Answer to the pending shot.
    Reply { hit: bool },

    /// Reveal of the full position, with the commitment salt.
    RevealPosition { position: u64, salt: Vec<u8> },
}

/// Game phase, derived from the populated state fields.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// The channel is still waiting for a second participant.
    Waiting,
    FirstCommitment,
    SecondCommitment,
    FirstRevealSeed,
    Shoot,
    Answer,
    SecondRevealPosition,
    Finished,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Waiting => "single participant",
            Phase::FirstCommitment => "first commitment",
            Phase::SecondCommitment => "second commitment",
            Phase::FirstRevealSeed => "first reveal seed",
            Phase::Shoot => "shoot",
            Phase::Answer => "answer",
            Phase::SecondRevealPosition => "second reveal position",
            Phase::Finished => "finished",
        }
    }
}

fn derive_phase(data: &BoardData) -> Option<Phase> {
    if data.winner.is_some() {
        return Some(Phase::Finished);
    }

    match data.position_hashes.len() {
        0 => return Some(Phase::FirstCommitment),
        1 => return Some(Phase::SecondCommitment),
        2 => (),
        _ => return None,
    }

    match data.known_ships.len() {
        0 => return Some(Phase::FirstRevealSeed),
        2 => (),
        _ => return None,
    }

    match data.positions.len() {
        0 => (),
        2 => return Some(Phase::SecondRevealPosition),
        _ => return None,
    }

    if data.current_shot.is_some() {
        Some(Phase::Answer)
    } else {
        Some(Phase::Shoot)
    }
}

/// Checks phase-dependent consistency of the state, in particular the
/// turn field.  Returns the phase of a valid state.
fn validate(meta: &ChannelMetadata, data: &BoardData) -> Option<Phase> {
    // Single-participant states exist only while the channel waits for
    // a second player; nothing ever moves in them, so any decodable
    // state is fine.
    if meta.participants.len() == 1 {
        return Some(Phase::Waiting);
    }
    if meta.participants.len() != 2 {
        return None;
    }

    let phase = derive_phase(data)?;

    let turn = match (data.turn, phase) {
        (None, Phase::Finished) => {
            return match data.winner {
                Some(winner) if winner <= 1 => Some(phase),
                _ => None,
            };
        }
        (None, _) | (Some(_), Phase::Finished) => return None,
        (Some(turn), _) => turn,
    };
    if turn > 1 {
        return None;
    }

    match phase {
        Phase::FirstCommitment | Phase::FirstRevealSeed => {
            if turn != 0 {
                return None;
            }
        }
        Phase::SecondCommitment => {
            if turn != 1 {
                return None;
            }
        }
        Phase::Shoot | Phase::Answer => (),
        Phase::SecondRevealPosition => {
            // The player still to reveal is to move.
            let other = 1 - turn as usize;
            if data.positions[turn as usize] != 0 || data.positions[other] == 0 {
                return None;
            }
        }
        Phase::Waiting | Phase::Finished => unreachable!("handled above"),
    }

    Some(phase)
}

/// A parsed and validated board state.
pub struct SalvoState {
    channel_id: Id256,
    meta: Arc<ChannelMetadata>,
    data: BoardData,
    phase: Phase,
}

impl SalvoState {
    pub fn channel_id(&self) -> &Id256 {
        &self.channel_id
    }

    pub fn metadata(&self) -> &Arc<ChannelMetadata> {
        &self.meta
    }

    pub fn data(&self) -> &BoardData {
        &self.data
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn shots_answered(&self) -> u32 {
        self.data
            .known_ships
            .iter()
            .map(|k| Grid::new(k.guessed).count_ones())
            .sum()
    }
}

fn check_committed_hash(actual: &Id256, committed: &[u8]) -> bool {
    if committed.len() != COMMITMENT_BYTES {
        warn!(size = committed.len(), "committed hash has wrong size");
        return false;
    }
    actual.as_slice() == committed
}

fn apply_commit(
    position_hash: &[u8],
    seed_hash: Option<&Vec<u8>>,
    seed: Option<&Vec<u8>>,
    phase: Phase,
    new: &mut BoardData,
) -> bool {
    if position_hash.len() != COMMITMENT_BYTES {
        warn!("position hash has wrong size");
        return false;
    }

    match phase {
        Phase::FirstCommitment => {
            let Some(seed_hash) = seed_hash else {
                warn!("first commitment lacks a seed hash");
                return false;
            };
            if seed_hash.len() != COMMITMENT_BYTES {
                warn!("seed hash has wrong size");
                return false;
            }
            if seed.is_some() {
                warn!("first commitment has a preimage seed");
                return false;
            }

            new.turn = Some(1);
            new.position_hashes.push(position_hash.to_vec());
            new.seed_hash_0 = Some(seed_hash.clone());
            true
        }

        Phase::SecondCommitment => {
            if seed_hash.is_some() {
                warn!("second commitment has a seed hash");
                return false;
            }
            let seed = seed.cloned().unwrap_or_default();
            if seed.len() > COMMITMENT_BYTES {
                warn!(size = seed.len(), "seed is too large");
                return false;
            }

            new.turn = Some(0);
            new.position_hashes.push(position_hash.to_vec());
            new.seed_1 = Some(seed);
            true
        }

        _ => {
            warn!(?phase, "invalid phase for a position commitment");
            false
        }
    }
}

fn apply_seed_reveal(seed: &[u8], phase: Phase, new: &mut BoardData) -> bool {
    if phase != Phase::FirstRevealSeed {
        warn!(?phase, "invalid phase for a seed reveal");
        return false;
    }
    if seed.len() > COMMITMENT_BYTES {
        warn!(size = seed.len(), "seed is too large");
        return false;
    }
    let committed = new.seed_hash_0.clone().unwrap_or_default();
    if !check_committed_hash(&sha256(seed), &committed) {
        warn!("seed does not match the committed hash");
        return false;
    }

    // The starting player is a single random bit drawn from a stream
    // seeded with both seeds together.
    let mut digest = Sha256Writer::new();
    digest
        .update(seed)
        .update(new.seed_1.as_deref().unwrap_or_default());
    let mut rng = SeededRng::new(digest.finalize());
    new.turn = Some(rng.next_bool() as u8);

    new.seed_hash_0 = None;
    new.seed_1 = None;
    new.known_ships = vec![KnownShips::default(), KnownShips::default()];
    true
}

fn apply_shot(location: u8, phase: Phase, turn: usize, new: &mut BoardData) -> bool {
    if phase != Phase::Shoot {
        warn!(?phase, "invalid phase for a shot");
        return false;
    }
    if location >= CELLS {
        warn!(location, "shot target is not on the board");
        return false;
    }
    let target = Coord::from_index(location);

    let other = 1 - turn;
    let mut guessed = Grid::new(new.known_ships[other].guessed);
    if guessed.get(target) {
        warn!("shot target has already been guessed");
        return false;
    }
    guessed.set(target);

    new.turn = Some(other as u8);
    new.current_shot = Some(location);
    new.known_ships[other].guessed = guessed.bits();
    true
}

fn apply_reply(hit: bool, phase: Phase, turn: usize, new: &mut BoardData) -> bool {
    if phase != Phase::Answer {
        warn!(?phase, "invalid phase for a reply");
        return false;
    }
    let Some(shot) = new.current_shot else {
        warn!("answer phase without a current shot");
        return false;
    };
    // Not covered by state validation; a state with a bad shot could
    // have been quorum-signed, so fail the move instead of panicking.
    if shot >= CELLS {
        warn!(shot, "invalid current shot target");
        return false;
    }
    let target = Coord::from_index(shot);
    new.current_shot = None;

    if !hit {
        // A miss keeps the turn with the answering player.
        return true;
    }

    let mut hits = Grid::new(new.known_ships[turn].hits);
    if hits.get(target) {
        warn!("previous shot targeted an already known position");
        return false;
    }
    hits.set(target);

    new.known_ships[turn].hits = hits.bits();
    new.turn = Some(1 - turn as u8);
    true
}

fn apply_position_reveal(
    position: u64,
    salt: &[u8],
    phase: Phase,
    turn: usize,
    new: &mut BoardData,
) -> bool {
    match phase {
        // In the shooting phases a player may reveal instead of
        // shooting or answering; in the second-reveal phase it is the
        // only legal move.
        Phase::Shoot | Phase::Answer | Phase::SecondRevealPosition => (),
        _ => {
            warn!(?phase, "invalid phase for a position reveal");
            return false;
        }
    }
    if salt.len() > COMMITMENT_BYTES {
        warn!(size = salt.len(), "position reveal salt is too large");
        return false;
    }

    let grid = Grid::new(position);
    let mut hasher = Sha256Writer::new();
    hasher.update(&grid.blob()).update(salt);
    if !check_committed_hash(&hasher.finalize(), &new.position_hashes[turn]) {
        warn!("revealed position does not match the committed hash");
        return false;
    }

    if new.positions.is_empty() {
        new.positions = vec![0, 0];
    }
    if new.positions[turn] != 0 {
        warn!("player has already revealed a position");
        return false;
    }
    new.positions[turn] = position;
    new.position_hashes[turn] = Vec::new();

    let other = 1 - turn;
    if !verify_position_of_ships(grid) {
        debug!("player revealed an invalid position of ships");
        new.winner = Some(other as u8);
    } else {
        let known = &new.known_ships[turn];
        // Hits not being a subset of the guesses can only come from a
        // deliberately quorum-signed state; reject the move rather
        // than feed it to the answer check.
        if known.hits & !known.guessed != 0 {
            warn!("hits are not a subset of the guessed positions");
            return false;
        }
        if !verify_position_for_answers(grid, Grid::new(known.guessed), Grid::new(known.hits)) {
            debug!("revealed position does not match the given answers");
            new.winner = Some(other as u8);
        }
    }

    // An honest first revealer wins if they have already hit every
    // opponent ship cell.
    if new.winner.is_none() && phase != Phase::SecondRevealPosition {
        let hits = Grid::new(new.known_ships[other].hits);
        if hits.count_ones() >= Grid::TOTAL_SHIP_CELLS {
            new.winner = Some(turn as u8);
        }
    }

    // An honest second revealer wins: the first revealer had not sunk
    // every ship, or the game would have ended above.
    if new.winner.is_none() && phase == Phase::SecondRevealPosition {
        new.winner = Some(turn as u8);
    }

    match new.winner {
        Some(_) => {
            new.turn = None;
            for hash in new.position_hashes.iter_mut() {
                hash.clear();
            }
        }
        None => {
            new.turn = Some(other as u8);
        }
    }
    true
}

impl ParsedState for SalvoState {
    fn whose_turn(&self) -> Option<u8> {
        if self.meta.participants.len() == 1 {
            return None;
        }
        self.data.turn
    }

    fn turn_count(&self) -> u32 {
        let shots = self.shots_answered();
        match self.phase {
            Phase::Waiting => 0,
            Phase::FirstCommitment => 1,
            Phase::SecondCommitment => 2,
            Phase::FirstRevealSeed => 3,
            Phase::Shoot => 4 + 2 * shots,
            // The shot has been made but not yet answered.
            Phase::Answer => 4 + 2 * shots - 1,
            // The reveal phases are counted together, since the first
            // reveal can end the game directly or not.
            Phase::SecondRevealPosition | Phase::Finished => {
                let mut count = 4 + 2 * shots;
                if self.data.current_shot.is_some() {
                    count -= 1;
                }
                count += self.data.positions.iter().filter(|p| **p != 0).count() as u32;
                count
            }
        }
    }

    fn apply_move(&self, mv: &[u8]) -> Option<BoardState> {
        let Some(mv) = decode_message::<SalvoMove>(mv) else {
            warn!("undecodable move");
            return None;
        };
        let turn = self.whose_turn()? as usize;

        let mut new = self.data.clone();
        let ok = match &mv {
            SalvoMove::Commit {
                position_hash,
                seed_hash,
                seed,
            } => apply_commit(
                position_hash,
                seed_hash.as_ref(),
                seed.as_ref(),
                self.phase,
                &mut new,
            ),
            SalvoMove::RevealSeed { seed } => apply_seed_reveal(seed, self.phase, &mut new),
            SalvoMove::Shot { location } => apply_shot(*location, self.phase, turn, &mut new),
            SalvoMove::Reply { hit } => apply_reply(*hit, self.phase, turn, &mut new),
            SalvoMove::RevealPosition { position, salt } => {
                apply_position_reveal(*position, salt, self.phase, turn, &mut new)
            }
        };

        ok.then(|| encode_message(&new))
    }

    fn equals(&self, other: &[u8]) -> bool {
        decode_message::<BoardData>(other).is_some_and(|data| data == self.data)
    }

    fn to_json(&self) -> Value {
        let mut res = json!({ "phase": self.phase.name() });

        if let Some(winner) = self.data.winner {
            res["winner"] = json!(winner);
        }

        if !self.data.positions.is_empty() {
            let ships: Vec<Value> = self
                .data
                .positions
                .iter()
                .map(|p| {
                    if *p == 0 {
                        Value::Null
                    } else {
                        json!(Grid::new(*p).to_text())
                    }
                })
                .collect();
            res["ships"] = json!(ships);
        }

        if !self.data.known_ships.is_empty() {
            let boards: Vec<String> = self
                .data
                .known_ships
                .iter()
                .map(|known| {
                    let guessed = Grid::new(known.guessed);
                    let hits = Grid::new(known.hits);
                    let mut out = String::new();
                    for row in 0..SIDE {
                        for col in 0..SIDE {
                            let c = Coord::new(row, col);
                            out.push(if hits.get(c) {
                                'x'
                            } else if guessed.get(c) {
                                'm'
                            } else {
                                '.'
                            });
                        }
                        out.push('\n');
                    }
                    out
                })
                .collect();
            res["guesses"] = json!(boards);
        }

        res
    }
}

/// Board rules of the game.
pub struct SalvoRules;

impl BoardRules for SalvoRules {
    type State = SalvoState;

    fn parse_state(
        &self,
        channel_id: &Id256,
        meta: &Arc<ChannelMetadata>,
        data: &[u8],
    ) -> Option<SalvoState> {
        if meta.proto_version != PROTO_VERSION {
            warn!(version = meta.proto_version, "unsupported protocol version");
            return None;
        }
        let board = decode_message::<BoardData>(data)?;
        let phase = validate(meta, &board)?;
        Some(SalvoState {
            channel_id: *channel_id,
            meta: meta.clone(),
            data: board,
            phase,
        })
    }
}

/// The board state right after the second participant joined.
pub fn initial_board_state() -> Vec<u8> {
    encode_message(&BoardData {
        turn: Some(0),
        ..BoardData::default()
    })
}

/// The state stored for a channel still waiting for its second
/// participant.
pub fn waiting_board_state() -> Vec<u8> {
    encode_message(&BoardData::default())
}
