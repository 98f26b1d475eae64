//! Application runner and event loop.

use std::thread;
use std::time::{Duration, Instant};

use tetrad_platform::WindowConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use crate::app::TetradApp;
use crate::frame::FrameContext;
use crate::graphics::{CoreConfig, GraphicsCore};

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Force FIFO presentation.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Tetrad".to_string(),
            width: 800,
            height: 600,
            target_fps: None,
            vsync: false,
            validation: cfg!(debug_assertions),
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the target FPS.
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Window settings derived from this config.
    pub fn window_config(&self) -> WindowConfig {
        WindowConfig::new(self.title.clone()).with_size(self.width, self.height)
    }

    /// Frame budget for the target FPS.
    pub fn target_frame_time(&self) -> Option<Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }

    fn core_config(&self) -> CoreConfig {
        CoreConfig {
            app_name: self.title.clone(),
            window: self.window_config(),
            vsync: self.vsync,
            validation: self.validation,
        }
    }
}

/// Install the fmt subscriber, honoring `RUST_LOG` (default `info`).
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

/// Run a `TetradApp` with the given configuration.
///
/// Initializes logging, creates the window and GPU context, and runs the
/// event loop until the application exits.
pub fn run_app<A: TetradApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    init_logging();
    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        failure: None,
    };

    event_loop.run_app(&mut runner)?;

    match runner.failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Internal application runner that implements winit's `ApplicationHandler`.
struct AppRunner<A: TetradApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    failure: Option<anyhow::Error>,
}

/// Internal application state.
struct AppState<A: TetradApp> {
    core: GraphicsCore,
    app: A,
    target_frame_time: Option<Duration>,
    last_frame_time: Instant,
    frame_count: u64,
    fps_sum: f64,
}

impl<A: TetradApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.failure = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, id: WindowId, event: WindowEvent) {
        let Some(state) = &mut self.state else {
            return;
        };
        // Events of a retired window may still trickle in.
        if id != state.core.window().id() {
            return;
        }
        if state.app.on_event(&event) {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.shutdown(event_loop);
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = state.frame(event_loop) {
                    error!("Render error: {e:#}");
                    self.failure = Some(e);
                    self.shutdown(event_loop);
                }
            }
            WindowEvent::Resized(size) => {
                if let Err(e) = state.handle_resize(size.width, size.height) {
                    error!("Resize error: {e:#}");
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let Some(state) = &self.state else {
            return;
        };
        if state.app.should_exit() {
            self.shutdown(event_loop);
            return;
        }

        // Block on the event queue while there is nothing to draw.
        if state.core.is_minimized() {
            event_loop.set_control_flow(ControlFlow::Wait);
        } else {
            event_loop.set_control_flow(ControlFlow::Poll);
            state.core.window().request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = self.state.take() {
            state.cleanup();
        }
    }
}

impl<A: TetradApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let mut core = GraphicsCore::new(event_loop, &self.config.core_config())?;
        info!("GPU: {}", core.gpu().capabilities().summary());

        let app = A::init(&mut core)?;

        Ok(AppState {
            core,
            app,
            target_frame_time: self.config.target_frame_time(),
            last_frame_time: Instant::now(),
            frame_count: 0,
            fps_sum: 0.0,
        })
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(state) = self.state.take() {
            state.cleanup();
        }
        event_loop.exit();
    }
}

impl<A: TetradApp> AppState<A> {
    fn frame(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<()> {
        let frame_start = Instant::now();
        let dt = frame_start
            .duration_since(self.last_frame_time)
            .as_secs_f32();
        self.last_frame_time = frame_start;

        self.app.update(&self.core, dt);

        if let Some(window) = self.app.take_window_request() {
            self.core.replace_window(event_loop, &window)?;
            let (width, height) = self.core.window().size();
            self.app.on_resize(&mut self.core, width, height)?;
        }

        let Some(target) = self.core.begin_frame()? else {
            return Ok(());
        };

        let rendered = {
            let mut frame = FrameContext::new(
                self.core.gpu().device(),
                self.core.command_buffer(&target),
                target.image_index,
                target.slot,
                target.extent,
                dt,
                self.frame_count,
            );
            self.app.render(&self.core, &mut frame)
        };
        // Always close the frame so the swapchain is ready for the next one.
        self.core.end_frame(&target)?;
        rendered?;

        self.frame_count += 1;
        if dt > 0.0 {
            self.fps_sum += 1.0 / f64::from(dt);
        }

        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }

        Ok(())
    }

    fn handle_resize(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        if self.core.handle_resize(width, height)? {
            self.app.on_resize(&mut self.core, width, height)?;
            info!("Resized to {}x{}", width, height);
        }
        Ok(())
    }

    fn cleanup(mut self) {
        if self.frame_count > 0 {
            #[allow(clippy::cast_precision_loss)]
            let avg_fps = self.fps_sum / self.frame_count as f64;
            info!(
                frames = self.frame_count,
                avg_fps = format_args!("{avg_fps:.1}"),
                "Frame statistics"
            );
        }

        info!("Starting cleanup...");
        if let Err(e) = self.core.wait_for_frames() {
            error!("Failed to wait for submitted frames: {e:#}");
        }
        match self.core.completed_frames() {
            Ok(completed) => info!(completed, "GPU frames completed"),
            Err(e) => error!("Failed to read frame timeline: {e}"),
        }

        self.app.cleanup(&mut self.core);

        match self.core.destroy() {
            Ok(()) => info!("Cleanup complete"),
            Err(e) => error!("Cleanup failed: {e:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let config = AppConfig::new("Blocks")
            .with_size(400, 300)
            .with_target_fps(60)
            .with_vsync(true)
            .with_validation(false);

        assert_eq!(config.title, "Blocks");
        assert_eq!((config.width, config.height), (400, 300));
        assert!(config.vsync);
        assert!(!config.validation);
        assert_eq!(
            config.target_frame_time(),
            Some(Duration::from_nanos(16_666_666))
        );
    }

    #[test]
    fn validation_follows_build_profile() {
        assert_eq!(AppConfig::default().validation, cfg!(debug_assertions));
        assert_eq!(AppConfig::default().target_frame_time(), None);
        assert_eq!(AppConfig::new("x").with_target_fps(0).target_frame_time(), None);
    }

    #[test]
    fn window_config_mirrors_app_config() {
        let window = AppConfig::new("Blocks").with_size(640, 480).window_config();
        assert_eq!(window.title, "Blocks");
        assert_eq!((window.width, window.height), (640, 480));
    }
}
