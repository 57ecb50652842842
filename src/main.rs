// =============================================================================
// VR360 PLAYER - desktop host for the VR render device
// =============================================================================
//
// Owns the window and the event loop, feeds keys to the device and drives
// one frame per redraw. Decoding is out of scope here: a generated
// equirectangular test pattern stands in for the decoder's output.
//
// FRAME FLOW:
// 1. winit asks for a redraw
// 2. The demo allocator hands out the test pattern texture
// 3. VrDevice renders both eyes, submits to the HMD, presents the mirror
//
// The HMD is the simulator unless config.toml says `runtime = "openxr"`
// and the binary was built with the `openxr` feature.
//
// =============================================================================

use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use raw_window_handle::HasWindowHandle;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowAttributes},
};

use vr360_render::backend::vulkan::VulkanGraphics;
use vr360_render::config::{Config, RuntimeKind};
use vr360_render::device::FrameTexture;
use vr360_render::error::AllocatorError;
#[cfg(feature = "openxr")]
use vr360_render::hmd::OpenXrRuntime;
use vr360_render::hmd::{HmdRuntime, SimulatedHmd};
use vr360_render::input::winit_key;
use vr360_render::{
    ExternalTexture, FrameAllocator, FrameSurface, KeyMessage, MemId, PlaybackSignals, VrDevice,
};

const PATTERN_WIDTH: u32 = 2048;
const PATTERN_HEIGHT: u32 = 1024;
const PATTERN_SURFACE: MemId = MemId(0);

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config)?;
    log::info!("Starting VR360 player");

    let event_loop = EventLoop::new()?;
    match config.hmd.runtime {
        RuntimeKind::Simulated => {
            let mut app = App::new(config, |c: &Config| Ok(SimulatedHmd::new(c.simulated_hmd()?)));
            event_loop.run_app(&mut app)?;
        }
        #[cfg(feature = "openxr")]
        RuntimeKind::OpenXr => {
            let mut app = App::new(config, |c: &Config| Ok(OpenXrRuntime::new(c.openxr()?)));
            event_loop.run_app(&mut app)?;
        }
        #[cfg(not(feature = "openxr"))]
        RuntimeKind::OpenXr => {
            anyhow::bail!("runtime = \"openxr\" needs a build with --features openxr")
        }
    }
    Ok(())
}

fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();
    // Frame phase spans arrive through tracing's `log` feature, e.g.
    // RUST_LOG=tracing::span=trace

    if config.debug.log_to_file {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
            .with_context(|| format!("Failed to open log file {}", config.debug.log_file))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

/// Equirectangular grid: 30 degree lines, hue by longitude, darker toward
/// the poles. Easy to judge orientation and seam continuity by eye.
fn test_pattern(width: u32, height: u32) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
    for y in 0..height {
        let v = y as f32 / height as f32;
        let shade = 1.0 - (v - 0.5).abs();
        for x in 0..width {
            let u = x as f32 / width as f32;
            let on_grid = (u * 12.0).fract() < 0.004 * 12.0 || (v * 6.0).fract() < 0.006 * 6.0;
            let [r, g, b] = if on_grid {
                [255, 255, 255]
            } else {
                let phase = u * std::f32::consts::TAU;
                [
                    (127.5 * (1.0 + phase.cos()) * shade) as u8,
                    (127.5 * (1.0 + (phase + 2.094).cos()) * shade) as u8,
                    (127.5 * (1.0 + (phase + 4.189).cos()) * shade) as u8,
                ]
            };
            pixels.extend_from_slice(&[r, g, b, 255]);
        }
    }
    pixels
}

/// Always resolves the one surface it owns to the test pattern.
struct PatternFrames {
    frame: FrameTexture,
}

impl FrameAllocator for PatternFrames {
    fn get_hdl(&mut self, mem_id: MemId) -> Result<ExternalTexture, AllocatorError> {
        if mem_id == PATTERN_SURFACE {
            Ok(self.frame.texture)
        } else {
            Err(AllocatorError::UnknownSurface(mem_id))
        }
    }
}

type RuntimeFactory<R> = fn(&Config) -> Result<R>;

struct App<R: HmdRuntime> {
    config: Config,
    runtime: RuntimeFactory<R>,
    window: Option<Arc<Window>>,
    device: Option<VrDevice<VulkanGraphics, R>>,
    frames: Option<PatternFrames>,
    signals: Arc<PlaybackSignals>,

    is_minimized: bool,
    needs_resize: bool,

    last_frame_time: Instant,
    last_fps_update: Instant,
    frame_count: u32,
}

impl<R: HmdRuntime> App<R> {
    fn new(config: Config, runtime: RuntimeFactory<R>) -> Self {
        Self {
            config,
            runtime,
            window: None,
            device: None,
            frames: None,
            signals: PlaybackSignals::new(),
            is_minimized: false,
            needs_resize: false,
            last_frame_time: Instant::now(),
            last_fps_update: Instant::now(),
            frame_count: 0,
        }
    }

    fn init_device(&mut self, window: &Window) -> Result<()> {
        let settings = self.config.device_settings()?;
        let hmd = (self.runtime)(&self.config)?;
        let api = VulkanGraphics::new(
            &self.config.window.title,
            self.config.graphics.validation_layers,
        );

        let mut device = VrDevice::new(api, hmd, settings, self.signals.clone());
        let handle = window.window_handle()?.as_raw();
        if let Err(e) = device.init(handle) {
            device.close();
            return Err(e.into());
        }

        // The mirror starts at half the panel size; match the window to it.
        // The swapchain is built on the first redraw from the actual size.
        let (width, height) = device.window_size();
        let _ = window.request_inner_size(PhysicalSize::new(width, height));
        self.needs_resize = true;

        let pattern = test_pattern(PATTERN_WIDTH, PATTERN_HEIGHT);
        let frame = match device.create_frame_texture(PATTERN_WIDTH, PATTERN_HEIGHT, &pattern) {
            Ok(frame) => frame,
            Err(e) => {
                device.close();
                return Err(e.into());
            }
        };

        self.frames = Some(PatternFrames { frame });
        self.device = Some(device);
        Ok(())
    }

    fn render_frame(&mut self) -> Result<bool> {
        if self.is_minimized {
            return Ok(false);
        }
        let (Some(device), Some(frames), Some(window)) =
            (self.device.as_mut(), self.frames.as_mut(), self.window.as_ref())
        else {
            return Ok(false);
        };

        if self.needs_resize {
            let size = window.inner_size();
            device.set_window_size(size.width, size.height);
            device.reset()?;
            self.needs_resize = false;
        }

        let surface = FrameSurface {
            mem_id: PATTERN_SURFACE,
        };
        device.render_frame(&surface, frames)?;
        Ok(true)
    }

    fn poll_signals(&self) {
        if self.signals.take_fast_forward() {
            log::info!("Fast forward requested");
        }
        if self.signals.take_cancel_fast_forward() {
            log::info!("Fast forward cancelled");
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let paused = if self.signals.is_paused() { " [paused]" } else { "" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms){}",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    paused
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut device) = self.device.take() {
            if let Some(frames) = self.frames.take() {
                device.release_frame_texture(frames.frame);
            }
            device.close();
        }
    }
}

impl<R: HmdRuntime> ApplicationHandler for App<R> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default().with_title(&self.config.window.title);

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_device(&window) {
            log::error!("Failed to initialize VR device: {:#}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    self.needs_resize = true;
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => log::error!("Render error: {:#}", e),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                let PhysicalKey::Code(code) = event.physical_key else {
                    return;
                };
                if code == KeyCode::Escape && event.state.is_pressed() {
                    log::info!("ESC pressed, exiting...");
                    self.shutdown();
                    event_loop.exit();
                    return;
                }

                let Some(key) = winit_key(code) else {
                    return;
                };
                let message = if event.state.is_pressed() {
                    KeyMessage::KeyDown
                } else {
                    KeyMessage::KeyUp
                };
                if let Some(device) = self.device.as_mut() {
                    device.on_key(message, key.code() as u32);
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        self.poll_signals();
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl<R: HmdRuntime> Drop for App<R> {
    fn drop(&mut self) {
        self.shutdown();
        log::info!("Cleanup complete");
    }
}
