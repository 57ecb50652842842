// Simulated HMD - a debug headset with a real compositor protocol
//
// No hardware: the "display" is the mirror texture. Eye rings are ordinary
// device textures, submitted layers are blitted side by side into the mirror.
// Everything the session sees is kept in a shared log so a host or a test can
// inspect what the device did.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use glam::{Quat, Vec3};
use parking_lot::{Mutex, MutexGuard};

use super::{
    mirror_half, Eye, EyeRenderDesc, Extent, FovPort, HmdDesc, HmdRuntime, HmdSession,
    LayerEyeFov, MirrorTexture, SwapTextureSet, SwapTextureSetId, TrackingState,
};
use crate::backend::{
    AdapterLuid, GraphicsDevice, GraphicsRequirements, Rect, TextureDesc, TextureId,
};
use crate::error::HmdError;
use crate::pose::Pose;

/// Knobs of the simulated headset.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedHmdConfig {
    pub product_name: String,
    /// Whether a headset is "plugged in". Without one, session creation fails.
    pub hmd_present: bool,
    pub resolution: Extent,
    pub refresh_rate: f32,
    /// Left eye; the right eye uses the mirrored frustum.
    pub eye_fov: FovPort,
    pub ipd: f32,
    pub adapter_luid: AdapterLuid,
    /// Head pose at time zero.
    pub head_pose: Pose,
    /// Head yaw speed in radians per second. Zero keeps the pose static.
    pub yaw_rate: f32,
    /// Textures per eye ring.
    pub ring_size: usize,
    /// Extensions the session asks the GPU device to enable.
    pub graphics_requirements: GraphicsRequirements,
}

impl Default for SimulatedHmdConfig {
    fn default() -> Self {
        Self {
            product_name: "Simulated HMD".to_string(),
            hmd_present: true,
            resolution: Extent {
                width: 2160,
                height: 1200,
            },
            refresh_rate: 90.0,
            eye_fov: FovPort {
                up_tan: 1.33,
                down_tan: 1.33,
                left_tan: 1.06,
                right_tan: 1.06,
            },
            ipd: 0.064,
            adapter_luid: AdapterLuid::from_u64(1),
            head_pose: Pose::new(Quat::IDENTITY, Vec3::ZERO),
            yaw_rate: 0.0,
            ring_size: 2,
            graphics_requirements: GraphicsRequirements::default(),
        }
    }
}

impl SimulatedHmdConfig {
    fn eye_fov(&self, eye: Eye) -> FovPort {
        match eye {
            Eye::Left => self.eye_fov,
            Eye::Right => self.eye_fov.mirrored(),
        }
    }

    /// Panel pixels per unit of tangent, per eye half of the panel.
    fn pixels_per_tan(&self) -> (f32, f32) {
        let fov = &self.eye_fov;
        (
            (self.resolution.width / 2) as f32 / (fov.left_tan + fov.right_tan),
            self.resolution.height as f32 / (fov.up_tan + fov.down_tan),
        )
    }
}

/// Session calls that depend on time, in the order they were made.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimingCall {
    PredictedDisplayTime(u64),
    TimeInSeconds,
    TrackingState { latency_marker: bool },
    SubmitFrame(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedFrame {
    pub frame_index: u64,
    pub layers: Vec<LayerEyeFov>,
    /// Mirror size the eyes were composited into, if a mirror existed.
    pub mirror_size: Option<(u32, u32)>,
}

/// What the simulated runtime observed.
#[derive(Debug, Default)]
pub struct SimulatorLog {
    pub initialized: bool,
    pub shutdowns: u32,
    pub sessions_created: u32,
    pub sessions_destroyed: u32,
    pub swap_texture_sets: HashMap<SwapTextureSetId, Vec<TextureId>>,
    pub swap_texture_sets_created: u32,
    pub mirrors: HashMap<u32, (u32, u32)>,
    pub mirrors_created: Vec<(u32, u32)>,
    pub timing: Vec<TimingCall>,
    pub submissions: Vec<SubmittedFrame>,
    /// Swap texture sets and mirrors still open each time the device detached.
    pub detached_with_open: Vec<usize>,
    next_id: u32,
}

impl SimulatorLog {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// No swap texture set, mirror or session is left open.
    pub fn is_clean(&self) -> bool {
        self.swap_texture_sets.is_empty()
            && self.mirrors.is_empty()
            && self.sessions_created == self.sessions_destroyed
    }
}

pub struct SimulatedHmd {
    config: SimulatedHmdConfig,
    log: Arc<Mutex<SimulatorLog>>,
    epoch: Instant,
}

impl Default for SimulatedHmd {
    fn default() -> Self {
        Self::new(SimulatedHmdConfig::default())
    }
}

impl SimulatedHmd {
    pub fn new(config: SimulatedHmdConfig) -> Self {
        Self {
            config,
            log: Arc::new(Mutex::new(SimulatorLog::default())),
            epoch: Instant::now(),
        }
    }

    pub fn config(&self) -> &SimulatedHmdConfig {
        &self.config
    }

    pub fn log(&self) -> MutexGuard<'_, SimulatorLog> {
        self.log.lock()
    }
}

impl HmdRuntime for SimulatedHmd {
    type Session = SimulatedSession;

    fn initialize(&mut self) -> Result<(), HmdError> {
        self.log.lock().initialized = true;
        log::info!("Simulated HMD runtime started");
        Ok(())
    }

    fn create_session(&mut self) -> Result<(SimulatedSession, AdapterLuid), HmdError> {
        let mut log = self.log.lock();
        if !log.initialized {
            return Err(HmdError::NotInitialized);
        }
        if !self.config.hmd_present {
            return Err(HmdError::NoHmd);
        }
        log.sessions_created += 1;

        let session = SimulatedSession {
            config: self.config.clone(),
            log: self.log.clone(),
            epoch: self.epoch,
            mirror: None,
        };
        Ok((session, self.config.adapter_luid))
    }

    fn shutdown(&mut self) {
        let mut log = self.log.lock();
        log.initialized = false;
        log.shutdowns += 1;
        log::info!("Simulated HMD runtime shut down");
    }
}

#[derive(Debug, Clone, Copy)]
struct MirrorTarget {
    id: u32,
    texture: TextureId,
    width: u32,
    height: u32,
}

pub struct SimulatedSession {
    config: SimulatedHmdConfig,
    log: Arc<Mutex<SimulatorLog>>,
    epoch: Instant,
    mirror: Option<MirrorTarget>,
}

impl SimulatedSession {
    fn head_pose_at(&self, time: f64) -> Pose {
        let base = self.config.head_pose;
        if self.config.yaw_rate == 0.0 {
            return base;
        }
        let yaw = Quat::from_rotation_y((self.config.yaw_rate as f64 * time) as f32);
        Pose::new((yaw * base.orientation).normalize(), base.position)
    }

    fn composite_eye<D: GraphicsDevice>(
        &self,
        device: &mut D,
        eye: Eye,
        source: TextureId,
        viewport: Rect,
    ) -> Result<(), HmdError> {
        let Some(mirror) = self.mirror else {
            return Ok(());
        };
        let dst = mirror_half(eye, mirror.width, mirror.height);
        device
            .blit_texture(source, viewport, mirror.texture, dst)
            .map_err(HmdError::Texture)
    }
}

impl HmdSession for SimulatedSession {
    fn hmd_desc(&self) -> HmdDesc {
        HmdDesc {
            product_name: self.config.product_name.clone(),
            resolution: self.config.resolution,
            default_eye_fov: [self.config.eye_fov(Eye::Left), self.config.eye_fov(Eye::Right)],
            display_refresh_rate: self.config.refresh_rate,
        }
    }

    fn graphics_requirements(&self) -> GraphicsRequirements {
        self.config.graphics_requirements.clone()
    }

    fn fov_texture_size(&self, _eye: Eye, fov: &FovPort, pixels_per_display_pixel: f32) -> Extent {
        let (ppt_x, ppt_y) = self.config.pixels_per_tan();
        let width = ((fov.left_tan + fov.right_tan) * ppt_x * pixels_per_display_pixel).round();
        let height = ((fov.up_tan + fov.down_tan) * ppt_y * pixels_per_display_pixel).round();
        Extent {
            width: (width as u32).max(1),
            height: (height as u32).max(1),
        }
    }

    fn render_desc(&self, eye: Eye, fov: &FovPort) -> EyeRenderDesc {
        let half_ipd = self.config.ipd * 0.5;
        let x = match eye {
            Eye::Left => -half_ipd,
            Eye::Right => half_ipd,
        };
        EyeRenderDesc {
            eye,
            fov: *fov,
            hmd_to_eye_offset: Vec3::new(x, 0.0, 0.0),
        }
    }

    fn create_swap_texture_set<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
        desc: &TextureDesc,
    ) -> Result<SwapTextureSet, HmdError> {
        let mut textures = Vec::with_capacity(self.config.ring_size);
        for _ in 0..self.config.ring_size {
            match device.create_texture(desc, None) {
                Ok(texture) => textures.push(texture),
                Err(e) => {
                    for texture in textures {
                        device.release_texture(texture);
                    }
                    return Err(HmdError::Texture(e));
                }
            }
        }

        let mut log = self.log.lock();
        let id = SwapTextureSetId(log.next_id());
        log.swap_texture_sets.insert(id, textures.clone());
        log.swap_texture_sets_created += 1;
        Ok(SwapTextureSet { id, textures })
    }

    fn destroy_swap_texture_set<D: GraphicsDevice>(&mut self, device: &mut D, set: SwapTextureSet) {
        if self.log.lock().swap_texture_sets.remove(&set.id).is_none() {
            log::warn!("Destroying unknown swap texture set {:?}", set.id);
            return;
        }
        for texture in set.textures {
            device.release_texture(texture);
        }
    }

    fn create_mirror_texture<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
        desc: &TextureDesc,
    ) -> Result<MirrorTexture, HmdError> {
        let texture = device.create_texture(desc, None).map_err(HmdError::Texture)?;

        let mut log = self.log.lock();
        let id = log.next_id();
        log.mirrors.insert(id, (desc.width, desc.height));
        log.mirrors_created.push((desc.width, desc.height));
        self.mirror = Some(MirrorTarget {
            id,
            texture,
            width: desc.width,
            height: desc.height,
        });

        Ok(MirrorTexture {
            id,
            texture,
            width: desc.width,
            height: desc.height,
        })
    }

    fn destroy_mirror_texture<D: GraphicsDevice>(&mut self, device: &mut D, mirror: MirrorTexture) {
        if self.log.lock().mirrors.remove(&mirror.id).is_none() {
            log::warn!("Destroying unknown mirror texture {}", mirror.id);
            return;
        }
        if self.mirror.is_some_and(|m| m.id == mirror.id) {
            self.mirror = None;
        }
        device.release_texture(mirror.texture);
    }

    fn predicted_display_time(&mut self, frame_index: u64) -> Result<f64, HmdError> {
        self.log.lock().timing.push(TimingCall::PredictedDisplayTime(frame_index));
        let period = 1.0 / self.config.refresh_rate.max(1.0) as f64;
        let now = self.epoch.elapsed().as_secs_f64();
        Ok(((now / period).floor() + 1.0) * period)
    }

    fn time_in_seconds(&self) -> f64 {
        self.log.lock().timing.push(TimingCall::TimeInSeconds);
        self.epoch.elapsed().as_secs_f64()
    }

    fn tracking_state(&self, abs_time: f64, latency_marker: bool) -> TrackingState {
        self.log
            .lock()
            .timing
            .push(TimingCall::TrackingState { latency_marker });
        TrackingState {
            head_pose: self.head_pose_at(abs_time),
            sample_time: abs_time,
            orientation_tracked: true,
            position_tracked: true,
        }
    }

    fn submit_frame<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
        frame_index: u64,
        layers: &[LayerEyeFov],
    ) -> Result<(), HmdError> {
        for layer in layers {
            for (eye, texture_ref) in Eye::ALL.into_iter().zip(&layer.color_texture) {
                let texture = {
                    let log = self.log.lock();
                    let ring = log
                        .swap_texture_sets
                        .get(&texture_ref.set)
                        .ok_or(HmdError::UnknownTextureSet(texture_ref.set.0))?;
                    *ring.get(texture_ref.index).ok_or(HmdError::InvalidLayer {
                        index: texture_ref.index,
                        len: ring.len(),
                    })?
                };
                self.composite_eye(device, eye, texture, layer.viewport[eye.index()])?;
            }
        }

        let mut log = self.log.lock();
        log.timing.push(TimingCall::SubmitFrame(frame_index));
        log.submissions.push(SubmittedFrame {
            frame_index,
            layers: layers.to_vec(),
            mirror_size: self.mirror.map(|m| (m.width, m.height)),
        });
        Ok(())
    }

    fn detach_device(&mut self) {
        let mut log = self.log.lock();
        let open = log.swap_texture_sets.len() + log.mirrors.len();
        log.detached_with_open.push(open);
        self.mirror = None;
    }

    fn destroy(self) {
        self.log.lock().sessions_destroyed += 1;
        log::info!("Simulated HMD session destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{GraphicsApi, NullGraphics, TextureFormat, TextureUsage};
    use crate::hmd::SwapTextureRef;

    fn eye_desc(width: u32, height: u32) -> TextureDesc {
        TextureDesc {
            width,
            height,
            format: TextureFormat::Rgba8UnormSrgb,
            usage: TextureUsage::RENDER_TARGET,
        }
    }

    fn open(config: SimulatedHmdConfig) -> (SimulatedHmd, SimulatedSession) {
        let mut hmd = SimulatedHmd::new(config);
        hmd.initialize().unwrap();
        let (session, _) = hmd.create_session().unwrap();
        (hmd, session)
    }

    #[test]
    fn test_ideal_size_matches_panel_half() {
        let (_hmd, session) = open(SimulatedHmdConfig::default());
        let desc = session.hmd_desc();
        for eye in Eye::ALL {
            let size = session.fov_texture_size(eye, &desc.default_eye_fov[eye.index()], 1.0);
            assert_eq!(size, Extent { width: 1080, height: 1200 });
        }
        let dense = session.fov_texture_size(Eye::Left, &desc.default_eye_fov[0], 1.5);
        assert_eq!(dense, Extent { width: 1620, height: 1800 });
    }

    #[test]
    fn test_session_requires_hmd() {
        let mut hmd = SimulatedHmd::new(SimulatedHmdConfig {
            hmd_present: false,
            ..Default::default()
        });
        assert!(matches!(hmd.create_session(), Err(HmdError::NotInitialized)));
        hmd.initialize().unwrap();
        assert!(matches!(hmd.create_session(), Err(HmdError::NoHmd)));
    }

    #[test]
    fn test_eye_offsets_are_half_ipd() {
        let (_hmd, session) = open(SimulatedHmdConfig::default());
        let fov = session.hmd_desc().default_eye_fov;
        let left = session.render_desc(Eye::Left, &fov[0]);
        let right = session.render_desc(Eye::Right, &fov[1]);
        assert_eq!(left.hmd_to_eye_offset, Vec3::new(-0.032, 0.0, 0.0));
        assert_eq!(right.hmd_to_eye_offset, Vec3::new(0.032, 0.0, 0.0));
    }

    #[test]
    fn test_static_pose_is_deterministic() {
        let head = Pose::new(Quat::from_rotation_x(0.1), Vec3::new(0.0, 1.6, 0.0));
        let (_hmd, session) = open(SimulatedHmdConfig {
            head_pose: head,
            ..Default::default()
        });
        assert_eq!(session.tracking_state(1.0, true).head_pose, head);
        assert_eq!(session.tracking_state(42.0, false).head_pose, head);
    }

    #[test]
    fn test_submit_composites_mirror_and_validates_slots() {
        let mut api = NullGraphics::new();
        let mut device = api.create_device(None).unwrap();
        let (hmd, mut session) = open(SimulatedHmdConfig::default());

        let sets = [
            session.create_swap_texture_set(&mut device, &eye_desc(8, 8)).unwrap(),
            session.create_swap_texture_set(&mut device, &eye_desc(8, 8)).unwrap(),
        ];
        let mirror = session.create_mirror_texture(&mut device, &eye_desc(16, 4)).unwrap();

        let mut layer = LayerEyeFov {
            color_texture: [
                SwapTextureRef { set: sets[0].id, index: 1 },
                SwapTextureRef { set: sets[1].id, index: 1 },
            ],
            viewport: [Rect::from_size(8, 8); 2],
            fov: session.hmd_desc().default_eye_fov,
            render_pose: [Pose::IDENTITY; 2],
            sensor_sample_time: 0.5,
        };
        session.submit_frame(&mut device, 0, &[layer]).unwrap();
        assert_eq!(api.stats().commands.len(), 2);
        assert_eq!(hmd.log().submissions[0].mirror_size, Some((16, 4)));

        layer.color_texture[1].index = 2;
        let err = session.submit_frame(&mut device, 1, &[layer]).unwrap_err();
        assert!(matches!(err, HmdError::InvalidLayer { index: 2, len: 2 }));

        session.destroy_mirror_texture(&mut device, mirror);
        for set in sets {
            session.destroy_swap_texture_set(&mut device, set);
        }
        session.destroy();
        assert!(hmd.log().is_clean());
        assert!(api.stats().is_empty());
    }
}
