//! Platform abstraction for the Tetrad engine.
//!
//! Provides window creation via winit.

use std::sync::Arc;

use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, RawDisplayHandle, WindowHandle,
};
use thiserror::Error;
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window, WindowId};

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Window creation failed: {0}")]
    WindowCreation(String),
    #[error("Event loop error: {0}")]
    EventLoop(String),
    #[error("Window handle unavailable: {0}")]
    Handle(#[from] HandleError),
}

pub type Result<T> = std::result::Result<T, PlatformError>;

/// Window configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Tetrad".to_string(),
            width: 800,
            height: 600,
            resizable: true,
        }
    }
}

impl WindowConfig {
    /// Create a config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the inner size in physical pixels.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Allow or forbid user resizing.
    pub fn with_resizable(mut self, resizable: bool) -> Self {
        self.resizable = resizable;
        self
    }
}

/// An OS window shared between the event loop and the renderer.
#[derive(Debug, Clone)]
pub struct OsWindow {
    window: Arc<Window>,
}

impl OsWindow {
    /// Open a window on the running event loop.
    pub fn create(event_loop: &ActiveEventLoop, config: &WindowConfig) -> Result<Self> {
        let attributes = Window::default_attributes()
            .with_title(&config.title)
            .with_inner_size(PhysicalSize::new(config.width, config.height))
            .with_resizable(config.resizable);

        let window = event_loop
            .create_window(attributes)
            .map_err(|e| PlatformError::WindowCreation(e.to_string()))?;

        tracing::debug!(
            title = %config.title,
            width = config.width,
            height = config.height,
            "Window created"
        );
        Ok(Self {
            window: Arc::new(window),
        })
    }

    pub fn id(&self) -> WindowId {
        self.window.id()
    }

    /// Current inner size in physical pixels.
    pub fn size(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }

    /// Whether the window has no drawable area.
    pub fn is_minimized(&self) -> bool {
        let (width, height) = self.size();
        is_zero_area(width, height) || self.window.is_minimized().unwrap_or(false)
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }

    /// Raw display handle, for picking instance extensions.
    pub fn raw_display_handle(&self) -> Result<RawDisplayHandle> {
        Ok(self.window.display_handle()?.as_raw())
    }

    /// Shared handle to the winit window.
    pub fn shared(&self) -> Arc<Window> {
        Arc::clone(&self.window)
    }
}

impl HasDisplayHandle for OsWindow {
    fn display_handle(&self) -> std::result::Result<DisplayHandle<'_>, HandleError> {
        self.window.display_handle()
    }
}

impl HasWindowHandle for OsWindow {
    fn window_handle(&self) -> std::result::Result<WindowHandle<'_>, HandleError> {
        self.window.window_handle()
    }
}

/// Whether a surface of this size can be rendered to.
pub fn is_zero_area(width: u32, height: u32) -> bool {
    width == 0 || height == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder_overrides_defaults() {
        let config = WindowConfig::new("Blocks")
            .with_size(400, 300)
            .with_resizable(false);
        assert_eq!(config.title, "Blocks");
        assert_eq!((config.width, config.height), (400, 300));
        assert!(!config.resizable);

        let default = WindowConfig::default();
        assert_eq!((default.width, default.height), (800, 600));
        assert!(default.resizable);
    }

    #[test]
    fn zero_area_detection() {
        assert!(is_zero_area(0, 600));
        assert!(is_zero_area(800, 0));
        assert!(!is_zero_area(1, 1));
    }
}
