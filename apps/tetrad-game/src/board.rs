//! Board rules: gravity, locking and line clears.

use glam::IVec2;

use crate::piece::{PieceBag, Tetromino};

pub const BOARD_WIDTH: usize = 10;
pub const BOARD_HEIGHT: usize = 20;

/// Points for clearing 1..=4 lines at once.
const LINE_SCORES: [u32; 5] = [0, 100, 300, 500, 800];

/// The falling piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivePiece {
    pub kind: Tetromino,
    pub rotation: u8,
    /// Top-left corner of the rotation box.
    pub origin: IVec2,
}

impl ActivePiece {
    fn spawn(kind: Tetromino) -> Self {
        Self {
            kind,
            rotation: 0,
            origin: IVec2::new(3, 0),
        }
    }

    /// Board coordinates of the four cells.
    pub fn cells(&self) -> [IVec2; 4] {
        self.kind.cells(self.rotation).map(|c| c + self.origin)
    }
}

/// What a gravity tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Fell,
    /// The piece locked, clearing this many lines.
    Locked { lines: usize },
    GameOver,
}

/// A 10x20 falling-block board, row 0 at the top.
#[derive(Debug, Clone)]
pub struct Board {
    cells: [[Option<Tetromino>; BOARD_WIDTH]; BOARD_HEIGHT],
    active: Option<ActivePiece>,
    bag: PieceBag,
    score: u32,
    lines: u32,
    game_over: bool,
}

impl Board {
    pub fn new(seed: u64) -> Self {
        let mut board = Self {
            cells: [[None; BOARD_WIDTH]; BOARD_HEIGHT],
            active: None,
            bag: PieceBag::new(seed),
            score: 0,
            lines: 0,
            game_over: false,
        };
        board.spawn_next();
        board
    }

    pub fn active(&self) -> Option<&ActivePiece> {
        self.active.as_ref()
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    pub fn lines(&self) -> u32 {
        self.lines
    }

    pub fn is_game_over(&self) -> bool {
        self.game_over
    }

    /// Locked cell at `(x, y)`.
    pub fn cell(&self, x: usize, y: usize) -> Option<Tetromino> {
        self.cells.get(y).and_then(|row| row.get(x)).copied().flatten()
    }

    /// Locked cells with their coordinates.
    pub fn locked_cells(&self) -> impl Iterator<Item = (usize, usize, Tetromino)> + '_ {
        self.cells.iter().enumerate().flat_map(|(y, row)| {
            row.iter()
                .enumerate()
                .filter_map(move |(x, cell)| cell.map(|kind| (x, y, kind)))
        })
    }

    fn is_free(&self, cell: IVec2) -> bool {
        let (Ok(x), Ok(y)) = (usize::try_from(cell.x), usize::try_from(cell.y)) else {
            return false;
        };
        x < BOARD_WIDTH && y < BOARD_HEIGHT && self.cells[y][x].is_none()
    }

    fn fits(&self, piece: &ActivePiece) -> bool {
        piece.cells().into_iter().all(|c| self.is_free(c))
    }

    fn spawn_next(&mut self) {
        let piece = ActivePiece::spawn(self.bag.draw());
        if self.fits(&piece) {
            self.active = Some(piece);
        } else {
            self.active = None;
            self.game_over = true;
        }
    }

    /// Place `kind` as the falling piece, replacing the current one.
    pub fn set_active(&mut self, kind: Tetromino) -> bool {
        let piece = ActivePiece::spawn(kind);
        let fits = self.fits(&piece);
        if fits {
            self.active = Some(piece);
        }
        fits
    }

    /// Move the piece if the target position is free.
    pub fn try_shift(&mut self, dx: i32, dy: i32) -> bool {
        let Some(mut piece) = self.active else {
            return false;
        };
        piece.origin += IVec2::new(dx, dy);
        self.try_place(piece)
    }

    /// Rotate clockwise, nudging one cell sideways when the wall is in the way.
    pub fn try_rotate(&mut self) -> bool {
        let Some(mut piece) = self.active else {
            return false;
        };
        piece.rotation = (piece.rotation + 1) % 4;
        [0, -1, 1].into_iter().any(|kick| {
            let mut kicked = piece;
            kicked.origin.x += kick;
            self.try_place(kicked)
        })
    }

    fn try_place(&mut self, piece: ActivePiece) -> bool {
        let fits = self.fits(&piece);
        if fits {
            self.active = Some(piece);
        }
        fits
    }

    /// Advance gravity by one row.
    pub fn tick(&mut self) -> TickOutcome {
        if self.game_over {
            return TickOutcome::GameOver;
        }
        if self.try_shift(0, 1) {
            return TickOutcome::Fell;
        }
        let lines = self.lock();
        if self.game_over {
            TickOutcome::GameOver
        } else {
            TickOutcome::Locked { lines }
        }
    }

    /// Drop the piece to the floor and lock it.
    pub fn hard_drop(&mut self) -> TickOutcome {
        while self.try_shift(0, 1) {}
        self.tick()
    }

    /// Write the falling piece into the board, clear lines, spawn the next.
    fn lock(&mut self) -> usize {
        let Some(piece) = self.active.take() else {
            return 0;
        };
        for cell in piece.cells() {
            if let (Ok(x), Ok(y)) = (usize::try_from(cell.x), usize::try_from(cell.y)) {
                if x < BOARD_WIDTH && y < BOARD_HEIGHT {
                    self.cells[y][x] = Some(piece.kind);
                }
            }
        }

        let cleared = self.clear_lines();
        self.lines += cleared as u32;
        self.score += LINE_SCORES[cleared.min(4)];
        self.spawn_next();
        cleared
    }

    /// Remove full rows, shifting everything above down.
    fn clear_lines(&mut self) -> usize {
        let kept: Vec<_> = self
            .cells
            .iter()
            .filter(|row| row.iter().any(Option::is_none))
            .copied()
            .collect();
        let cleared = BOARD_HEIGHT - kept.len();
        if cleared > 0 {
            let mut cells = [[None; BOARD_WIDTH]; BOARD_HEIGHT];
            cells[cleared..].copy_from_slice(&kept);
            self.cells = cells;
        }
        cleared
    }

    /// Start over with an empty board.
    pub fn reset(&mut self) {
        self.cells = [[None; BOARD_WIDTH]; BOARD_HEIGHT];
        self.score = 0;
        self.lines = 0;
        self.game_over = false;
        self.spawn_next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill_row(board: &mut Board, y: usize, except: Option<usize>) {
        for x in 0..BOARD_WIDTH {
            if Some(x) != except {
                board.cells[y][x] = Some(Tetromino::O);
            }
        }
    }

    #[test]
    fn new_board_has_a_piece_at_the_top() {
        let board = Board::new(1);
        let piece = board.active().unwrap();
        assert!(piece.cells().iter().all(|c| c.y < 2));
        assert_eq!(board.locked_cells().count(), 0);
    }

    #[test]
    fn gravity_moves_piece_down() {
        let mut board = Board::new(1);
        board.set_active(Tetromino::T);
        assert_eq!(board.tick(), TickOutcome::Fell);
        assert_eq!(board.active().unwrap().origin, IVec2::new(3, 1));
    }

    #[test]
    fn piece_locks_on_the_floor() {
        let mut board = Board::new(1);
        board.set_active(Tetromino::O);
        assert_eq!(board.hard_drop(), TickOutcome::Locked { lines: 0 });
        assert_eq!(board.cell(3, BOARD_HEIGHT - 1), Some(Tetromino::O));
        assert_eq!(board.cell(4, BOARD_HEIGHT - 2), Some(Tetromino::O));
        assert_eq!(board.locked_cells().count(), 4);
        assert!(board.active().is_some());
    }

    #[test]
    fn walls_block_movement() {
        let mut board = Board::new(1);
        board.set_active(Tetromino::O);
        let mut moves = 0;
        while board.try_shift(-1, 0) {
            moves += 1;
        }
        assert_eq!(moves, 3);
        assert!(board.active().unwrap().cells().iter().any(|c| c.x == 0));
    }

    #[test]
    fn full_rows_are_cleared_and_rows_above_fall() {
        let mut board = Board::new(1);
        fill_row(&mut board, BOARD_HEIGHT - 1, Some(0));
        fill_row(&mut board, BOARD_HEIGHT - 2, Some(0));
        board.cells[BOARD_HEIGHT - 3][5] = Some(Tetromino::S);

        // A vertical I fills the gap in both rows.
        board.set_active(Tetromino::I);
        assert!(board.try_rotate());
        while board.try_shift(-1, 0) {}
        assert_eq!(board.hard_drop(), TickOutcome::Locked { lines: 2 });

        assert_eq!(board.lines(), 2);
        assert_eq!(board.score(), 300);
        assert_eq!(board.cell(5, BOARD_HEIGHT - 1), Some(Tetromino::S));
        assert_eq!(board.cell(0, BOARD_HEIGHT - 1), Some(Tetromino::I));
        assert_eq!(board.cell(0, BOARD_HEIGHT - 2), Some(Tetromino::I));
        assert_eq!(board.locked_cells().count(), 3);
    }

    #[test]
    fn blocked_spawn_ends_the_game() {
        let mut board = Board::new(1);
        for y in 0..2 {
            fill_row(&mut board, y, Some(9));
        }
        board.active = None;
        board.spawn_next();
        assert!(board.is_game_over());
        assert_eq!(board.tick(), TickOutcome::GameOver);

        board.reset();
        assert!(!board.is_game_over());
        assert_eq!(board.locked_cells().count(), 0);
    }
}
