//! Tetromino shapes and the piece bag.

use glam::{IVec2, Vec4};

/// The seven tetrominoes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tetromino {
    I,
    O,
    T,
    S,
    Z,
    J,
    L,
}

impl Tetromino {
    pub const ALL: [Self; 7] = [Self::I, Self::O, Self::T, Self::S, Self::Z, Self::J, Self::L];

    /// Cells of the spawn orientation, inside a 4x4 box with y pointing down.
    fn spawn_cells(self) -> [IVec2; 4] {
        let cells = match self {
            Self::I => [(0, 1), (1, 1), (2, 1), (3, 1)],
            Self::O => [(1, 0), (2, 0), (1, 1), (2, 1)],
            Self::T => [(1, 0), (0, 1), (1, 1), (2, 1)],
            Self::S => [(1, 0), (2, 0), (0, 1), (1, 1)],
            Self::Z => [(0, 0), (1, 0), (1, 1), (2, 1)],
            Self::J => [(0, 0), (0, 1), (1, 1), (2, 1)],
            Self::L => [(2, 0), (0, 1), (1, 1), (2, 1)],
        };
        cells.map(|(x, y)| IVec2::new(x, y))
    }

    /// Size of the box the piece rotates in.
    fn box_size(self) -> i32 {
        match self {
            Self::I => 4,
            Self::O => 2,
            _ => 3,
        }
    }

    /// Cells for `rotation` quarter turns clockwise.
    pub fn cells(self, rotation: u8) -> [IVec2; 4] {
        let mut cells = self.spawn_cells();
        if self == Self::O {
            // Shifted into its 2x2 box.
            return cells.map(|c| c - IVec2::X);
        }
        let n = self.box_size() - 1;
        for _ in 0..rotation % 4 {
            cells = cells.map(|c| IVec2::new(n - c.y, c.x));
        }
        cells
    }

    pub fn color(self) -> Vec4 {
        match self {
            Self::I => Vec4::new(0.0, 0.85, 0.9, 1.0),
            Self::O => Vec4::new(0.95, 0.85, 0.1, 1.0),
            Self::T => Vec4::new(0.65, 0.2, 0.85, 1.0),
            Self::S => Vec4::new(0.2, 0.85, 0.3, 1.0),
            Self::Z => Vec4::new(0.9, 0.2, 0.2, 1.0),
            Self::J => Vec4::new(0.2, 0.35, 0.95, 1.0),
            Self::L => Vec4::new(0.95, 0.55, 0.1, 1.0),
        }
    }
}

/// Deals every tetromino once per round in shuffled order.
#[derive(Debug, Clone)]
pub struct PieceBag {
    state: u64,
    pending: Vec<Tetromino>,
}

impl PieceBag {
    pub fn new(seed: u64) -> Self {
        Self {
            // xorshift gets stuck at zero.
            state: seed | 1,
            pending: Vec::with_capacity(Tetromino::ALL.len()),
        }
    }

    fn next_random(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn refill(&mut self) {
        self.pending.extend_from_slice(&Tetromino::ALL);
        for i in (1..self.pending.len()).rev() {
            #[allow(clippy::cast_possible_truncation)]
            let j = (self.next_random() % (i as u64 + 1)) as usize;
            self.pending.swap(i, j);
        }
    }

    /// Next piece to spawn.
    pub fn draw(&mut self) -> Tetromino {
        if self.pending.is_empty() {
            self.refill();
        }
        self.pending.pop().unwrap_or(Tetromino::T)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn four_rotations_return_to_spawn() {
        for kind in Tetromino::ALL {
            assert_eq!(kind.cells(4), kind.cells(0), "{kind:?}");
        }
    }

    #[test]
    fn rotated_cells_stay_in_the_box() {
        for kind in Tetromino::ALL {
            for rotation in 0..4 {
                for cell in kind.cells(rotation) {
                    assert!((0..4).contains(&cell.x) && (0..4).contains(&cell.y));
                }
            }
        }
    }

    #[test]
    fn t_piece_rotates_clockwise() {
        let cells: HashSet<_> = Tetromino::T.cells(1).into_iter().collect();
        let expected: HashSet<_> = [(1, 0), (1, 1), (2, 1), (1, 2)]
            .into_iter()
            .map(|(x, y)| IVec2::new(x, y))
            .collect();
        assert_eq!(cells, expected);
    }

    #[test]
    fn bag_deals_each_piece_once_per_round() {
        let mut bag = PieceBag::new(42);
        for _ in 0..3 {
            let round: HashSet<_> = (0..7).map(|_| bag.draw()).collect();
            assert_eq!(round.len(), 7);
        }
    }
}
