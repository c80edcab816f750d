//! Bit grids over the board and fleet placement rules.

use std::collections::BTreeMap;

use tracing::debug;

use crate::coord::{Coord, Direction, CELLS, SIDE};

/// The fleet both players must place: (ship size, how many).
const FLEET: [(u32, u32); 3] = [(2, 4), (3, 2), (4, 1)];

/// A bit vector with one entry per board cell.  Used for ship
/// positions, guessed cells and hits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Grid(u64);

impl Grid {
    /// Number of cells covered by ships in a valid placement.
    pub const TOTAL_SHIP_CELLS: u32 = 18;

    pub fn new(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn get(&self, c: Coord) -> bool {
        debug_assert!(c.is_on_board());
        (self.0 >> c.index()) & 1 != 0
    }

    /// Sets the bit for a cell.  The bit must not be set yet.
    pub fn set(&mut self, c: Coord) {
        debug_assert!(!self.get(c));
        self.0 |= 1u64 << c.index();
    }

    pub fn count_ones(&self) -> u32 {
        self.0.count_ones()
    }

    /// Little-endian byte encoding, used inside hash commitments.
    pub fn blob(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Renders the grid row by row, `x` for ones and `.` for zeros,
    /// each row ending in a newline.
    pub fn to_text(&self) -> String {
        let mut out = String::with_capacity((SIDE as usize + 1) * SIDE as usize);
        for row in 0..SIDE {
            for col in 0..SIDE {
                out.push(if self.get(Coord::new(row, col)) { 'x' } else { '.' });
            }
            out.push('\n');
        }
        out
    }

    /// Parses the text form produced by [`Grid::to_text`].  Whitespace
    /// is ignored; exactly one character per cell is required.
    pub fn from_text(text: &str) -> Option<Self> {
        let mut grid = Grid::default();
        let mut next = 0u8;
        for ch in text.chars() {
            match ch {
                ' ' | '\n' | '\r' | '\t' => continue,
                '.' | 'x' => {
                    if next >= CELLS {
                        return None;
                    }
                    if ch == 'x' {
                        grid.set(Coord::from_index(next));
                    }
                    next += 1;
                }
                _ => return None,
            }
        }
        (next == CELLS).then_some(grid)
    }
}

fn has_ship(g: Grid, c: Coord) -> bool {
    c.is_on_board() && g.get(c)
}

/// Walks a ship from its top-/left-most cell along `dir` and checks
/// that no other ship touches it, including diagonally.  Returns the
/// ship's size, or `None` for an invalid placement.
fn check_ship(g: Grid, start: Coord, dir: Direction, across: Direction) -> Option<u32> {
    debug_assert!(has_ship(g, start));

    let behind = start.step(dir.opposite());
    if has_ship(g, behind)
        || has_ship(g, behind.step(across))
        || has_ship(g, behind.step(across.opposite()))
    {
        debug!("another ship touches the head side");
        return None;
    }

    let mut size = 0;
    let mut c = start;
    while has_ship(g, c) {
        size += 1;
        if has_ship(g, c.step(across)) || has_ship(g, c.step(across.opposite())) {
            debug!("another ship alongside");
            return None;
        }
        c = c.step(dir);
    }

    // `c` is now one past the tail; the straight continuation is free
    // by the loop condition, so only the tail diagonals remain.
    if has_ship(g, c.step(across)) || has_ship(g, c.step(across.opposite())) {
        debug!("another ship touches the tail side");
        return None;
    }

    Some(size)
}

/// Verifies that a grid is a legal fleet placement: exactly the ships
/// of [`FLEET`], straight, fully on the board and not touching each
/// other (diagonals included).
pub fn verify_position_of_ships(position: Grid) -> bool {
    let mut found: BTreeMap<u32, u32> = BTreeMap::new();

    for index in 0..CELLS {
        let c = Coord::from_index(index);
        if !position.get(c) {
            continue;
        }
        // Cells with a ship above or to the left are covered when the
        // walk starts from the ship's first cell.
        if has_ship(position, c.step(Direction::Up)) || has_ship(position, c.step(Direction::Left))
        {
            continue;
        }

        // A cell below makes the ship vertical; otherwise treat it as
        // horizontal (a single cell counts as a size-one ship, which
        // the fleet check rejects).
        let (dir, across) = if has_ship(position, c.step(Direction::Down)) {
            (Direction::Down, Direction::Right)
        } else {
            (Direction::Right, Direction::Down)
        };

        let Some(size) = check_ship(position, c, dir, across) else {
            return false;
        };
        *found.entry(size).or_default() += 1;
    }

    let expected: BTreeMap<u32, u32> = FLEET.iter().copied().collect();
    found == expected
}

/// Verifies that a revealed position matches the player's past answers:
/// among all targeted cells, exactly those answered as hits carry a
/// ship.  `hits` must be a subset of `targeted`.
pub fn verify_position_for_answers(position: Grid, targeted: Grid, hits: Grid) -> bool {
    debug_assert_eq!(hits.bits() & targeted.bits(), hits.bits());
    position.bits() & targeted.bits() == hits.bits()
}

/// A legal reference fleet used throughout the game tests.
#[cfg(test)]
pub(crate) const VALID_FLEET: &str = "\
    xx..xx..\n\
    ........\n\
    xx..xxx.\n\
    ........\n\
    xx..xxx.\n\
    ........\n\
    xxxx....\n\
    ........\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_roundtrip() {
        let grid = Grid::from_text(VALID_FLEET).unwrap();
        assert_eq!(grid.to_text(), VALID_FLEET);
        assert_eq!(grid.count_ones(), Grid::TOTAL_SHIP_CELLS);
    }

    #[test]
    fn from_text_rejects_bad_input() {
        assert!(Grid::from_text("").is_none());
        assert!(Grid::from_text(&"x".repeat(63)).is_none());
        assert!(Grid::from_text(&"x".repeat(65)).is_none());
        assert!(Grid::from_text(&"y".repeat(64)).is_none());
    }

    #[test]
    fn blob_is_little_endian() {
        let mut grid = Grid::default();
        grid.set(Coord::from_index(0));
        grid.set(Coord::from_index(9));
        assert_eq!(grid.blob(), [0x01, 0x02, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn reference_fleet_is_valid() {
        let grid = Grid::from_text(VALID_FLEET).unwrap();
        assert!(verify_position_of_ships(grid));
    }

    #[test]
    fn wrong_ship_counts_are_rejected() {
        // A single row of 18 cells is one huge ship.
        let grid = Grid::new((1u64 << 18) - 1);
        assert!(!verify_position_of_ships(grid));

        // An empty board has no ships at all.
        assert!(!verify_position_of_ships(Grid::default()));

        // The reference fleet with one ship removed.
        let missing = "\
            xx..xx..\n\
            ........\n\
            xx..xxx.\n\
            ........\n\
            xx..xxx.\n\
            ........\n\
            ........\n\
            ........\n";
        assert!(!verify_position_of_ships(Grid::from_text(missing).unwrap()));
    }

    #[test]
    fn touching_ships_are_rejected() {
        // The reference fleet with one size-2 ship moved to touch
        // another orthogonally.
        let touching = "\
            xx..xx..\n\
            xx......\n\
            ....xxx.\n\
            ........\n\
            xx..xxx.\n\
            ........\n\
            xxxx....\n\
            ........\n";
        let grid = Grid::from_text(touching).unwrap();
        assert!(!verify_position_of_ships(grid));

        // The same ship moved to touch only diagonally.
        let diagonal = "\
            xx..xx..\n\
            ..xx....\n\
            ....xxx.\n\
            ........\n\
            xx..xxx.\n\
            ........\n\
            xxxx....\n\
            ........\n";
        let grid = Grid::from_text(diagonal).unwrap();
        assert!(!verify_position_of_ships(grid));
    }

    #[test]
    fn answers_must_match_the_position() {
        let position = Grid::from_text(VALID_FLEET).unwrap();

        // Target the first two cells: both are ships.
        let targeted = Grid::new(0b11);
        assert!(verify_position_for_answers(position, targeted, Grid::new(0b11)));
        // Claiming a miss on a ship cell does not match.
        assert!(!verify_position_for_answers(position, targeted, Grid::new(0b01)));

        // Target a water cell (index 2) and claim a hit on it.
        let targeted = Grid::new(0b100);
        assert!(!verify_position_for_answers(position, targeted, Grid::new(0b100)));
        assert!(verify_position_for_answers(position, targeted, Grid::default()));
    }
}
