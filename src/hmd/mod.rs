// HMD runtime protocol
//
// The compositor is an external service. This module names the calls the
// device makes into it (session, eye rings, mirror, timing, tracking, layer
// submission) plus the pure helpers every runtime ships alongside its API:
// eye pose calculation and the projection matrix in runtime layout.

#[cfg(feature = "openxr")]
pub mod openxr;
pub mod sim;

use glam::Vec3;

use crate::backend::{
    AdapterLuid, GraphicsDevice, GraphicsRequirements, Rect, TextureDesc, TextureId,
};
use crate::error::HmdError;
use crate::pose::Pose;

#[cfg(feature = "openxr")]
pub use self::openxr::{OpenXrConfig, OpenXrRuntime, OpenXrSession};
pub use sim::{SimulatedHmd, SimulatedHmdConfig, SimulatedSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Eye {
    Left = 0,
    Right = 1,
}

impl Eye {
    /// Render order: left first.
    pub const ALL: [Eye; 2] = [Eye::Left, Eye::Right];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Field of view as tangents of the four half angles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FovPort {
    pub up_tan: f32,
    pub down_tan: f32,
    pub left_tan: f32,
    pub right_tan: f32,
}

impl FovPort {
    /// Same frustum seen by the other eye (left and right swapped).
    pub fn mirrored(&self) -> Self {
        Self {
            left_tan: self.right_tan,
            right_tan: self.left_tan,
            ..*self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HmdDesc {
    pub product_name: String,
    /// Full panel resolution, both eyes side by side.
    pub resolution: Extent,
    pub default_eye_fov: [FovPort; 2],
    pub display_refresh_rate: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeRenderDesc {
    pub eye: Eye,
    pub fov: FovPort,
    /// Translation from the head center to this eye, in head space.
    pub hmd_to_eye_offset: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingState {
    pub head_pose: Pose,
    /// Time the pose was predicted for, in runtime seconds.
    pub sample_time: f64,
    pub orientation_tracked: bool,
    pub position_tracked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwapTextureSetId(pub u32);

/// Compositor-owned ring of render targets for one eye.
///
/// Not `Clone`: the value is handed back to the session exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct SwapTextureSet {
    pub id: SwapTextureSetId,
    pub textures: Vec<TextureId>,
}

/// Compositor-maintained copy of the final HMD image.
#[derive(Debug, PartialEq, Eq)]
pub struct MirrorTexture {
    pub id: u32,
    pub texture: TextureId,
    pub width: u32,
    pub height: u32,
}

/// Which slot of which ring holds an eye's image for this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapTextureRef {
    pub set: SwapTextureSetId,
    pub index: usize,
}

/// One full-FOV stereo layer, both eyes sampled at the same sensor time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerEyeFov {
    pub color_texture: [SwapTextureRef; 2],
    pub viewport: [Rect; 2],
    pub fov: [FovPort; 2],
    pub render_pose: [Pose; 2],
    pub sensor_sample_time: f64,
}

pub trait HmdRuntime {
    type Session: HmdSession;

    fn initialize(&mut self) -> Result<(), HmdError>;
    /// Open the HMD; also reports the adapter the HMD is attached to.
    fn create_session(&mut self) -> Result<(Self::Session, AdapterLuid), HmdError>;
    fn shutdown(&mut self);
}

pub trait HmdSession {
    fn hmd_desc(&self) -> HmdDesc;
    /// Extensions the GPU device must be created with to share images with
    /// the compositor.
    fn graphics_requirements(&self) -> GraphicsRequirements {
        GraphicsRequirements::default()
    }
    /// Render target size that gives `pixels_per_display_pixel` at the center.
    fn fov_texture_size(&self, eye: Eye, fov: &FovPort, pixels_per_display_pixel: f32) -> Extent;
    fn render_desc(&self, eye: Eye, fov: &FovPort) -> EyeRenderDesc;

    fn create_swap_texture_set<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
        desc: &TextureDesc,
    ) -> Result<SwapTextureSet, HmdError>;
    fn destroy_swap_texture_set<D: GraphicsDevice>(&mut self, device: &mut D, set: SwapTextureSet);

    fn create_mirror_texture<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
        desc: &TextureDesc,
    ) -> Result<MirrorTexture, HmdError>;
    fn destroy_mirror_texture<D: GraphicsDevice>(&mut self, device: &mut D, mirror: MirrorTexture);

    /// Absolute time the frame `frame_index` is expected to reach the display.
    /// Runtimes that pace the application block here until the frame may start.
    fn predicted_display_time(&mut self, frame_index: u64) -> Result<f64, HmdError>;
    fn time_in_seconds(&self) -> f64;
    fn tracking_state(&self, abs_time: f64, latency_marker: bool) -> TrackingState;

    /// Hand the layers to the compositor. Rings are read at the indices the
    /// layers name, so the caller must not write those slots until they advance.
    fn submit_frame<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
        frame_index: u64,
        layers: &[LayerEyeFov],
    ) -> Result<(), HmdError>;

    /// The GPU device is about to be dropped. Runtimes holding native
    /// handles of it must let go here; every texture has been returned already.
    fn detach_device(&mut self) {}

    fn destroy(self)
    where
        Self: Sized;
}

/// Per-eye poses from one head pose: each eye keeps the head orientation and
/// sits at its head-space offset.
pub fn calc_eye_poses(head: &Pose, hmd_to_eye_offset: &[Vec3; 2]) -> [Pose; 2] {
    [0, 1].map(|eye| Pose {
        orientation: head.orientation,
        position: head.transform_point(hmd_to_eye_offset[eye]),
    })
}

/// Half of the mirror an eye is composited into: left eye on the left.
pub fn mirror_half(eye: Eye, width: u32, height: u32) -> Rect {
    let half = width / 2;
    match eye {
        Eye::Left => Rect::new(0, 0, half, height),
        Eye::Right => Rect::new(half as i32, 0, width - half, height),
    }
}

/// Asymmetric-frustum projection in runtime layout: `m[row][col]`, applied to
/// column vectors, depth mapped to [0, 1].
pub fn projection(fov: &FovPort, z_near: f32, z_far: f32, right_handed: bool) -> [[f32; 4]; 4] {
    let x_scale = 2.0 / (fov.left_tan + fov.right_tan);
    let x_offset = (fov.left_tan - fov.right_tan) * x_scale * 0.5;
    let y_scale = 2.0 / (fov.up_tan + fov.down_tan);
    let y_offset = (fov.up_tan - fov.down_tan) * y_scale * 0.5;
    let handedness = if right_handed { -1.0 } else { 1.0 };

    [
        [x_scale, 0.0, handedness * x_offset, 0.0],
        [0.0, y_scale, handedness * -y_offset, 0.0],
        [
            0.0,
            0.0,
            -handedness * z_far / (z_near - z_far),
            (z_far * z_near) / (z_near - z_far),
        ],
        [0.0, 0.0, handedness, 0.0],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    const EPSILON: f32 = 1e-5;

    #[test]
    fn test_eye_poses_share_head_orientation() {
        let head = Pose::new(Quat::from_rotation_y(0.5), Vec3::new(0.0, 1.7, 0.0));
        let offsets = [Vec3::new(-0.032, 0.0, 0.0), Vec3::new(0.032, 0.0, 0.0)];
        let [left, right] = calc_eye_poses(&head, &offsets);

        assert_eq!(left.orientation, head.orientation);
        assert_eq!(right.orientation, head.orientation);
        let ipd = left.position.distance(right.position);
        assert!((ipd - 0.064).abs() < EPSILON);
        let center = (left.position + right.position) * 0.5;
        assert!(center.abs_diff_eq(head.position, EPSILON));
    }

    #[test]
    fn test_projection_offsets_asymmetric_fov() {
        let fov = FovPort {
            up_tan: 1.0,
            down_tan: 1.0,
            left_tan: 1.2,
            right_tan: 0.8,
        };
        let m = projection(&fov, 0.2, 1000.0, true);
        assert!((m[0][0] - 1.0).abs() < EPSILON);
        // Wider left side shifts the center of projection
        assert!((m[0][2] + 0.2).abs() < EPSILON);
        assert_eq!(m[3][2], -1.0);
    }

    #[test]
    fn test_mirror_halves_cover_odd_widths() {
        let left = mirror_half(Eye::Left, 1281, 720);
        let right = mirror_half(Eye::Right, 1281, 720);
        assert_eq!(left, Rect::new(0, 0, 640, 720));
        assert_eq!(right, Rect::new(640, 0, 641, 720));
    }

    #[test]
    fn test_fov_mirrored() {
        let fov = FovPort {
            up_tan: 1.3,
            down_tan: 1.2,
            left_tan: 1.1,
            right_tan: 0.9,
        };
        let other = fov.mirrored();
        assert_eq!(other.left_tan, 0.9);
        assert_eq!(other.right_tan, 1.1);
        assert_eq!(other.up_tan, 1.3);
    }
}
