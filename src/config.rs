// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section is optional; missing keys fall back to the defaults below.
// Key names and the simulated HMD description are validated when converted
// into runtime settings, not while parsing.

use anyhow::{Context, Result};
use glam::{Quat, Vec3};
use serde::Deserialize;
use std::path::Path;

use crate::backend::{AdapterLuid, GraphicsRequirements};
use crate::camera::{DEFAULT_MOVE_STEP, DEFAULT_TURN_STEP};
use crate::device::DeviceSettings;
use crate::error::ConfigError;
#[cfg(feature = "openxr")]
use crate::hmd::OpenXrConfig;
use crate::hmd::{Extent, FovPort, SimulatedHmdConfig};
use crate::input::{Action, KeyBindings};
use crate::pose::Pose;
use crate::scene::{DEFAULT_RADIUS, DEFAULT_TESSELLATION, MAX_TESSELLATION};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub scene: SceneConfig,
    pub controls: ControlsConfig,
    pub hmd: HmdConfig,
    pub debug: DebugConfig,
}

/// Desktop mirror window
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "VR360 Player".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Eye target clear color, transparent black by default
    pub clear_color: [f32; 4],
    pub validation_layers: bool,
    pub pixel_density: f32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 0.0],
            validation_layers: cfg!(debug_assertions),
            pixel_density: 1.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub sphere_radius: f32,
    pub tessellation: u32,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            sphere_radius: DEFAULT_RADIUS,
            tessellation: DEFAULT_TESSELLATION,
        }
    }
}

/// Camera speeds and key bindings, one list of key names per action
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub move_step: f32,
    pub turn_step: f32,
    pub move_forward: Vec<String>,
    pub move_backward: Vec<String>,
    pub strafe_left: Vec<String>,
    pub strafe_right: Vec<String>,
    pub move_up: Vec<String>,
    pub move_down: Vec<String>,
    pub turn_left: Vec<String>,
    pub turn_right: Vec<String>,
    pub pitch_up: Vec<String>,
    pub pitch_down: Vec<String>,
    pub toggle_pause: Vec<String>,
    pub fast_forward: Vec<String>,
    pub cancel_fast_forward: Vec<String>,
}

fn keys(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            move_step: DEFAULT_MOVE_STEP,
            turn_step: DEFAULT_TURN_STEP,
            move_forward: keys(&["W", "Up"]),
            move_backward: keys(&["S", "Down"]),
            strafe_left: keys(&["A"]),
            strafe_right: keys(&["D"]),
            move_up: keys(&["E"]),
            move_down: keys(&["C"]),
            turn_left: keys(&["Left"]),
            turn_right: keys(&["Right"]),
            pitch_up: keys(&["Q"]),
            pitch_down: keys(&["Z"]),
            toggle_pause: keys(&["Space"]),
            fast_forward: keys(&["F"]),
            cancel_fast_forward: keys(&["N"]),
        }
    }
}

/// Which HMD runtime the player opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Simulated,
    /// Needs the `openxr` feature
    OpenXr,
}

/// Headset runtime; everything but `runtime` describes the simulated HMD,
/// and OpenXR reuses `eye_fov`, `ipd` and `refresh_rate` as its defaults
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HmdConfig {
    pub runtime: RuntimeKind,
    pub product_name: String,
    pub present: bool,
    pub resolution: [u32; 2],
    pub refresh_rate: f32,
    /// Left eye tangents: up, down, left, right
    pub eye_fov: [f32; 4],
    pub ipd: f32,
    pub adapter_luid: u64,
    pub head_height: f32,
    /// Radians per second, 0 keeps the head still
    pub yaw_rate: f32,
    pub ring_size: usize,
}

impl Default for HmdConfig {
    fn default() -> Self {
        let sim = SimulatedHmdConfig::default();
        let fov = sim.eye_fov;
        Self {
            runtime: RuntimeKind::default(),
            product_name: sim.product_name,
            present: sim.hmd_present,
            resolution: [sim.resolution.width, sim.resolution.height],
            refresh_rate: sim.refresh_rate,
            eye_fov: [fov.up_tan, fov.down_tan, fov.left_tan, fov.right_tan],
            ipd: sim.ipd,
            adapter_luid: u64::from_le_bytes(sim.adapter_luid.0),
            head_height: sim.head_pose.position.y,
            yaw_rate: sim.yaw_rate,
            ring_size: sim.ring_size,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_to_file: false,
            log_file: "vr360_debug.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn key_bindings(&self) -> Result<KeyBindings, ConfigError> {
        let c = &self.controls;
        KeyBindings::from_names([
            (Action::MoveForward, &c.move_forward),
            (Action::MoveBackward, &c.move_backward),
            (Action::StrafeLeft, &c.strafe_left),
            (Action::StrafeRight, &c.strafe_right),
            (Action::MoveUp, &c.move_up),
            (Action::MoveDown, &c.move_down),
            (Action::TurnLeft, &c.turn_left),
            (Action::TurnRight, &c.turn_right),
            (Action::PitchUp, &c.pitch_up),
            (Action::PitchDown, &c.pitch_down),
            (Action::TogglePause, &c.toggle_pause),
            (Action::FastForward, &c.fast_forward),
            (Action::CancelFastForward, &c.cancel_fast_forward),
        ])
    }

    pub fn device_settings(&self) -> Result<DeviceSettings, ConfigError> {
        let tessellation = self.scene.tessellation;
        if tessellation > MAX_TESSELLATION {
            return Err(ConfigError::Tessellation {
                value: tessellation,
                max: MAX_TESSELLATION,
            });
        }
        let density = self.graphics.pixel_density;
        if !density.is_finite() || density <= 0.0 {
            return Err(ConfigError::PixelDensity(density));
        }

        Ok(DeviceSettings {
            clear_color: self.graphics.clear_color,
            move_step: self.controls.move_step,
            turn_step: self.controls.turn_step,
            sphere_radius: self.scene.sphere_radius,
            sphere_tessellation: self.scene.tessellation,
            pixel_density: self.graphics.pixel_density,
            key_bindings: self.key_bindings()?,
        })
    }

    fn eye_fov(&self) -> Result<FovPort, ConfigError> {
        let fov = self.hmd.eye_fov;
        if fov.iter().any(|t| !t.is_finite() || *t <= 0.0) {
            return Err(ConfigError::InvalidFov(fov));
        }
        let [up_tan, down_tan, left_tan, right_tan] = fov;
        Ok(FovPort {
            up_tan,
            down_tan,
            left_tan,
            right_tan,
        })
    }

    pub fn simulated_hmd(&self) -> Result<SimulatedHmdConfig, ConfigError> {
        let hmd = &self.hmd;
        let eye_fov = self.eye_fov()?;

        Ok(SimulatedHmdConfig {
            product_name: hmd.product_name.clone(),
            hmd_present: hmd.present,
            resolution: Extent {
                width: hmd.resolution[0],
                height: hmd.resolution[1],
            },
            refresh_rate: hmd.refresh_rate,
            eye_fov,
            ipd: hmd.ipd,
            adapter_luid: AdapterLuid::from_u64(hmd.adapter_luid),
            head_pose: Pose::new(Quat::IDENTITY, Vec3::new(0.0, hmd.head_height, 0.0)),
            yaw_rate: hmd.yaw_rate,
            ring_size: hmd.ring_size,
            graphics_requirements: GraphicsRequirements::default(),
        })
    }

    #[cfg(feature = "openxr")]
    pub fn openxr(&self) -> Result<OpenXrConfig, ConfigError> {
        Ok(OpenXrConfig {
            application_name: self.window.title.clone(),
            eye_fov: self.eye_fov()?,
            ipd: self.hmd.ipd,
            refresh_rate: self.hmd.refresh_rate,
        })
    }
}
