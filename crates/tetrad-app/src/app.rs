//! `TetradApp` trait definition.

use tetrad_platform::WindowConfig;
use winit::event::WindowEvent;

use crate::frame::FrameContext;
use crate::graphics::GraphicsCore;

/// Trait for Tetrad applications.
///
/// The framework handles window creation, GPU initialization, swapchain
/// management and the event loop.
pub trait TetradApp: Sized {
    /// Initialize the application.
    ///
    /// Called once after the window and GPU context have been created.
    fn init(core: &mut GraphicsCore) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every frame before rendering, also while minimized.
    ///
    /// # Arguments
    /// * `core` - Graphics core with GPU and window access
    /// * `dt` - Delta time in seconds since last frame
    fn update(&mut self, core: &GraphicsCore, dt: f32);

    /// Render a frame.
    ///
    /// The forward render pass is active; record draws into `frame`. The
    /// framework acquires, submits and presents.
    fn render(&mut self, core: &GraphicsCore, frame: &mut FrameContext<'_>) -> anyhow::Result<()>;

    /// Handle window resize, after the swapchain was rebuilt.
    #[allow(unused_variables)]
    fn on_resize(&mut self, core: &mut GraphicsCore, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events.
    ///
    /// Return `true` if the event was handled and should not be processed
    /// further.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Whether the app wants to continue in a new window.
    ///
    /// Polled once per frame; the default never asks.
    fn take_window_request(&mut self) -> Option<WindowConfig> {
        None
    }

    /// Whether the app wants to quit.
    fn should_exit(&self) -> bool {
        false
    }

    /// Cleanup before shutdown.
    ///
    /// Called with the GPU idle.
    #[allow(unused_variables)]
    fn cleanup(&mut self, core: &mut GraphicsCore) {}
}
