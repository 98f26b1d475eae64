//! Game application: input, gravity timing and drawing.

use glam::{IVec2, UVec2, Vec4};
use tetrad_app::{
    FrameContext, GraphicsCore, KeyCode, PhysicalKey, TetradApp, WindowConfig, WindowEvent,
};
use tracing::info;
use winit::event::ElementState;

use crate::board::{Board, TickOutcome, BOARD_HEIGHT, BOARD_WIDTH};

/// Seconds between gravity steps at level 0.
const BASE_GRAVITY: f32 = 0.6;
/// Fastest gravity step.
const MIN_GRAVITY: f32 = 0.08;
/// Lines per level.
const LINES_PER_LEVEL: u32 = 10;

const BACKGROUND: [f32; 4] = [0.03, 0.03, 0.05, 1.0];
const WELL_COLOR: Vec4 = Vec4::new(0.1, 0.1, 0.14, 1.0);
const FRAME_COLOR: Vec4 = Vec4::new(0.35, 0.35, 0.4, 1.0);

/// Pixel placement of the board inside the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardLayout {
    /// Top-left corner of cell (0, 0).
    pub origin: IVec2,
    /// Edge length of one cell.
    pub cell: u32,
}

impl BoardLayout {
    /// Largest square cells that fit the board, with a one-cell margin.
    pub fn fit(extent: UVec2) -> Self {
        let cell = (extent.x / (BOARD_WIDTH as u32 + 2))
            .min(extent.y / (BOARD_HEIGHT as u32 + 2))
            .max(1);
        let size = UVec2::new(cell * BOARD_WIDTH as u32, cell * BOARD_HEIGHT as u32);
        let origin = (extent.as_ivec2() - size.as_ivec2()) / 2;
        Self { origin, cell }
    }

    /// Top-left pixel of the board cell.
    pub fn cell_origin(&self, x: i32, y: i32) -> IVec2 {
        self.origin + IVec2::new(x, y) * self.cell as i32
    }

    pub fn size(&self) -> UVec2 {
        UVec2::new(
            self.cell * BOARD_WIDTH as u32,
            self.cell * BOARD_HEIGHT as u32,
        )
    }
}

/// Seconds between gravity steps after `lines` cleared lines.
pub fn gravity_interval(lines: u32) -> f32 {
    let level = lines / LINES_PER_LEVEL;
    #[allow(clippy::cast_precision_loss)]
    let interval = BASE_GRAVITY * 0.85_f32.powi(level as i32);
    interval.max(MIN_GRAVITY)
}

pub struct Game {
    board: Board,
    gravity_timer: f32,
    windows_opened: u32,
    window_request: Option<WindowConfig>,
    exit_requested: bool,
}

impl Game {
    fn handle_key(&mut self, key: KeyCode) -> bool {
        match key {
            KeyCode::ArrowLeft => {
                self.board.try_shift(-1, 0);
            }
            KeyCode::ArrowRight => {
                self.board.try_shift(1, 0);
            }
            KeyCode::ArrowDown => {
                if self.board.try_shift(0, 1) {
                    self.gravity_timer = 0.0;
                }
            }
            KeyCode::ArrowUp => {
                self.board.try_rotate();
            }
            KeyCode::Space => {
                let outcome = self.board.hard_drop();
                self.report(outcome);
                self.gravity_timer = 0.0;
            }
            KeyCode::KeyR => {
                info!("Restarting");
                self.board.reset();
            }
            KeyCode::KeyN => {
                self.windows_opened += 1;
                self.window_request = Some(
                    WindowConfig::new(format!("Tetrad ({})", self.windows_opened + 1))
                        .with_size(480, 800),
                );
            }
            KeyCode::Escape => self.exit_requested = true,
            _ => return false,
        }
        true
    }

    fn report(&self, outcome: TickOutcome) {
        match outcome {
            TickOutcome::Locked { lines } if lines > 0 => {
                info!(
                    lines,
                    total = self.board.lines(),
                    score = self.board.score(),
                    "Cleared lines"
                );
            }
            TickOutcome::GameOver => {
                info!(score = self.board.score(), "Game over, press R to restart");
            }
            _ => {}
        }
    }

    fn draw_cell(frame: &FrameContext<'_>, layout: &BoardLayout, x: i32, y: i32, color: Vec4) {
        let corner = layout.cell_origin(x, y);
        // One pixel gap between cells.
        let edge = layout.cell.saturating_sub(1).max(1);
        frame.fill_rect(corner.x, corner.y, edge, edge, color);
    }
}

impl TetradApp for Game {
    fn init(core: &mut GraphicsCore) -> anyhow::Result<Self> {
        core.set_clear_color(BACKGROUND);

        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0x9e37_79b9, |d| d.as_nanos() as u64);

        info!("Arrows move and rotate, Space drops, R restarts, N opens a new window");
        Ok(Self {
            board: Board::new(seed),
            gravity_timer: 0.0,
            windows_opened: 0,
            window_request: None,
            exit_requested: false,
        })
    }

    fn update(&mut self, _core: &GraphicsCore, dt: f32) {
        if self.board.is_game_over() {
            return;
        }
        self.gravity_timer += dt;
        let interval = gravity_interval(self.board.lines());
        while self.gravity_timer >= interval {
            self.gravity_timer -= interval;
            let outcome = self.board.tick();
            self.report(outcome);
            if outcome == TickOutcome::GameOver {
                break;
            }
        }
    }

    fn render(&mut self, _core: &GraphicsCore, frame: &mut FrameContext<'_>) -> anyhow::Result<()> {
        let layout = BoardLayout::fit(UVec2::new(frame.extent.width, frame.extent.height));
        let size = layout.size();
        let border = (layout.cell / 4).max(1);

        frame.fill_rect(
            layout.origin.x - border as i32,
            layout.origin.y - border as i32,
            size.x + 2 * border,
            size.y + 2 * border,
            FRAME_COLOR,
        );
        frame.fill_rect(layout.origin.x, layout.origin.y, size.x, size.y, WELL_COLOR);

        for (x, y, kind) in self.board.locked_cells() {
            Self::draw_cell(frame, &layout, x as i32, y as i32, kind.color());
        }

        if let Some(piece) = self.board.active() {
            let color = if self.board.is_game_over() {
                piece.kind.color() * 0.4
            } else {
                piece.kind.color()
            };
            for cell in piece.cells() {
                Self::draw_cell(frame, &layout, cell.x, cell.y, color);
            }
        }

        Ok(())
    }

    fn on_event(&mut self, event: &WindowEvent) -> bool {
        match event {
            WindowEvent::KeyboardInput { event, .. }
                if event.state == ElementState::Pressed =>
            {
                match event.physical_key {
                    PhysicalKey::Code(key) => self.handle_key(key),
                    PhysicalKey::Unidentified(_) => false,
                }
            }
            _ => false,
        }
    }

    fn take_window_request(&mut self) -> Option<WindowConfig> {
        self.window_request.take()
    }

    fn should_exit(&self) -> bool {
        self.exit_requested
    }

    fn cleanup(&mut self, _core: &mut GraphicsCore) {
        info!(
            score = self.board.score(),
            lines = self.board.lines(),
            "Final result"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_centers_board() {
        let layout = BoardLayout::fit(UVec2::new(800, 600));
        // 600 / 22 = 27 px cells.
        assert_eq!(layout.cell, 27);
        assert_eq!(layout.size(), UVec2::new(270, 540));
        assert_eq!(layout.origin, IVec2::new(265, 30));
        assert_eq!(layout.cell_origin(1, 2), IVec2::new(292, 84));
    }

    #[test]
    fn layout_survives_tiny_windows() {
        let layout = BoardLayout::fit(UVec2::new(5, 5));
        assert_eq!(layout.cell, 1);
    }

    #[test]
    fn gravity_speeds_up_per_level() {
        assert!((gravity_interval(0) - BASE_GRAVITY).abs() < f32::EPSILON);
        assert!(gravity_interval(10) < gravity_interval(9));
        assert!((gravity_interval(10_000) - MIN_GRAVITY).abs() < f32::EPSILON);
    }
}
