//! Application framework for the Tetrad engine.
//!
//! This crate provides a trait-based application framework that handles
//! common boilerplate like:
//! - Window creation and management
//! - GPU context initialization
//! - Swapchain creation and recreation
//! - Frame synchronization and deferred destruction
//! - Event loop handling
//!
//! # Example
//!
//! ```no_run
//! use tetrad_app::{run_app, AppConfig, FrameContext, GraphicsCore, TetradApp};
//!
//! struct MyApp;
//!
//! impl TetradApp for MyApp {
//!     fn init(_core: &mut GraphicsCore) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, _core: &GraphicsCore, _dt: f32) {}
//!
//!     fn render(
//!         &mut self,
//!         _core: &GraphicsCore,
//!         frame: &mut FrameContext<'_>,
//!     ) -> anyhow::Result<()> {
//!         frame.fill_rect(10, 10, 100, 100, glam::Vec4::new(1.0, 0.0, 0.0, 1.0));
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod frame;
mod graphics;
mod runner;

pub use app::TetradApp;
pub use frame::{clip_rect, FrameContext};
pub use graphics::{CoreConfig, GraphicsCore};
pub use runner::{init_logging, run_app, AppConfig};

// Re-export commonly used types for convenience
pub use tetrad_gpu::{GpuContext, PresentStatus};
pub use tetrad_platform::{OsWindow, WindowConfig};
pub use winit::event::WindowEvent;
pub use winit::keyboard::{KeyCode, PhysicalKey};
