//! Tetrad falling-block prototype.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p tetrad-game -- [--vsync] [--validation]
//! ```
//!
//! ## Controls
//!
//! - Left/Right: move, Up: rotate, Down: soft drop, Space: hard drop
//! - R: restart
//! - N: continue in a new window
//! - Escape: quit
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod board;
mod game;
mod piece;

use tetrad_app::{run_app, AppConfig};

use crate::game::Game;

const WIDTH: u32 = 480;
const HEIGHT: u32 = 800;
const TARGET_FPS: u32 = 120;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let has_flag = |flag: &str| args.iter().any(|arg| arg == flag);

    let mut config = AppConfig::new("Tetrad")
        .with_size(WIDTH, HEIGHT)
        .with_target_fps(TARGET_FPS)
        .with_vsync(has_flag("--vsync"));
    if has_flag("--validation") {
        config = config.with_validation(true);
    }

    run_app::<Game>(config)
}
