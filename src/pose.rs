// Pose composition - head tracking + camera -> per-eye matrices
//
// Poses stay as (position, quaternion) through every composition step and are
// only turned into matrices right before they are handed to the GPU.

use glam::{Mat4, Quat, Vec3, Vec4};

use crate::hmd::{self, FovPort};

/// Near clip plane, in world units.
pub const NEAR_PLANE: f32 = 0.2;
/// Far clip plane, in world units.
pub const FAR_PLANE: f32 = 1000.0;

/// Rigid transform: rotate by `orientation`, then translate by `position`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub orientation: Quat,
    pub position: Vec3,
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Pose {
    pub const IDENTITY: Self = Self {
        orientation: Quat::IDENTITY,
        position: Vec3::ZERO,
    };

    pub fn new(orientation: Quat, position: Vec3) -> Self {
        Self { orientation, position }
    }

    /// Map a point from this pose's local space into the parent space.
    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.position + self.orientation * point
    }

    /// `self` applied after `local`: the result places `local` inside `self`.
    pub fn compose(&self, local: &Pose) -> Pose {
        Pose {
            orientation: (self.orientation * local.orientation).normalize(),
            position: self.transform_point(local.position),
        }
    }

    pub fn forward(&self) -> Vec3 {
        self.orientation * Vec3::NEG_Z
    }

    pub fn up(&self) -> Vec3 {
        self.orientation * Vec3::Y
    }

    pub fn right(&self) -> Vec3 {
        self.orientation * Vec3::X
    }
}

/// World-space eye pose: the tracked eye pose expressed inside the camera.
pub fn compose_eye_pose(camera: &Pose, eye: &Pose) -> Pose {
    camera.compose(eye)
}

/// Right-handed look-at view matrix for a pose looking down its local -Z.
pub fn view_matrix(pose: &Pose) -> Mat4 {
    Mat4::look_at_rh(pose.position, pose.position + pose.forward(), pose.up())
}

/// Projection matrix for `fov` using the fixed clip planes.
pub fn projection_matrix(fov: &FovPort) -> Mat4 {
    let runtime = hmd::projection(fov, NEAR_PLANE, FAR_PLANE, true);
    from_runtime_layout(&runtime)
}

/// Rebuild a runtime matrix (row-major, column vectors, `m[row][col]`) as a
/// glam matrix (column-major storage). Each glam column is one runtime column
/// gathered across the four rows.
pub fn from_runtime_layout(m: &[[f32; 4]; 4]) -> Mat4 {
    Mat4::from_cols(
        Vec4::new(m[0][0], m[1][0], m[2][0], m[3][0]),
        Vec4::new(m[0][1], m[1][1], m[2][1], m[3][1]),
        Vec4::new(m[0][2], m[1][2], m[2][2], m[3][2]),
        Vec4::new(m[0][3], m[1][3], m[2][3], m[3][3]),
    )
}

/// View and projection for one eye in one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeMatrices {
    pub pose: Pose,
    pub view: Mat4,
    pub projection: Mat4,
}

/// Everything needed to draw one eye, from camera + tracked eye + FOV.
pub fn eye_matrices(camera: &Pose, eye: &Pose, fov: &FovPort) -> EyeMatrices {
    let pose = compose_eye_pose(camera, eye);
    EyeMatrices {
        pose,
        view: view_matrix(&pose),
        projection: projection_matrix(fov),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    const EPSILON: f32 = 1e-4;

    fn symmetric_fov() -> FovPort {
        FovPort {
            up_tan: 1.0,
            down_tan: 1.0,
            left_tan: 1.0,
            right_tan: 1.0,
        }
    }

    #[test]
    fn test_compose_identity_camera() {
        let eye = Pose::new(Quat::from_rotation_y(0.3), Vec3::new(-0.032, 0.0, 0.0));
        let world = compose_eye_pose(&Pose::IDENTITY, &eye);
        assert!(world.position.abs_diff_eq(eye.position, EPSILON));
        assert!(world.orientation.abs_diff_eq(eye.orientation, EPSILON));
    }

    #[test]
    fn test_compose_rotates_eye_offset_by_camera() {
        // Camera turned 90 degrees left: local +X (right eye) points to world -Z
        let camera = Pose::new(Quat::from_rotation_y(FRAC_PI_2), Vec3::new(1.0, 2.0, 3.0));
        let eye = Pose::new(Quat::IDENTITY, Vec3::new(0.032, 0.0, 0.0));
        let world = compose_eye_pose(&camera, &eye);
        assert!(world.position.abs_diff_eq(Vec3::new(1.0, 2.0, 3.0 - 0.032), EPSILON));
        assert!(world.orientation.abs_diff_eq(camera.orientation, EPSILON));
    }

    #[test]
    fn test_compose_applies_eye_rotation_inside_camera() {
        let camera = Pose::new(Quat::from_rotation_y(0.9), Vec3::ZERO);
        let eye = Pose::new(Quat::from_rotation_x(0.4), Vec3::ZERO);
        let world = compose_eye_pose(&camera, &eye);

        let expected = Quat::from_rotation_y(0.9) * Quat::from_rotation_x(0.4);
        assert!(world.orientation.abs_diff_eq(expected, EPSILON));
        // The rotations do not commute, so the reverse order is a different pose
        let reversed = Quat::from_rotation_x(0.4) * Quat::from_rotation_y(0.9);
        assert!(!world.orientation.abs_diff_eq(reversed, 1e-2));

        // Looking up inside a body turned left: forward leans toward -X and +Y
        let forward = world.forward();
        assert!(forward.x < 0.0 && forward.y > 0.0, "{forward:?}");
        let (yaw, pitch) = (0.9f32, 0.4f32);
        let expected_forward = Vec3::new(
            -yaw.sin() * pitch.cos(),
            pitch.sin(),
            -yaw.cos() * pitch.cos(),
        );
        assert!(forward.abs_diff_eq(expected_forward, EPSILON), "{forward:?}");
    }

    #[test]
    fn test_view_matrix_maps_eye_to_origin() {
        let camera = Pose::new(Quat::from_rotation_x(0.4), Vec3::new(0.5, -1.0, 2.0));
        let eye = Pose::new(Quat::from_rotation_y(-0.2), Vec3::new(0.032, 0.1, 0.0));
        let world = compose_eye_pose(&camera, &eye);
        let view = view_matrix(&world);

        let origin = view.transform_point3(world.position);
        assert!(origin.abs_diff_eq(Vec3::ZERO, EPSILON), "{origin:?}");

        let back = view.inverse().transform_point3(Vec3::ZERO);
        assert!(back.abs_diff_eq(world.position, EPSILON), "{back:?}");
        assert!(view.determinant().abs() > EPSILON);
    }

    #[test]
    fn test_view_matrix_forward_is_negative_z() {
        let pose = Pose::new(Quat::from_rotation_y(0.7), Vec3::new(3.0, 0.0, -1.0));
        let view = view_matrix(&pose);
        let ahead = view.transform_point3(pose.position + pose.forward() * 5.0);
        assert!(ahead.abs_diff_eq(Vec3::new(0.0, 0.0, -5.0), EPSILON), "{ahead:?}");
    }

    #[test]
    fn test_matrices_are_deterministic() {
        let camera = Pose::new(Quat::from_rotation_y(1.1), Vec3::new(0.1, 0.2, 0.3));
        let eye = Pose::new(Quat::from_rotation_z(0.05), Vec3::new(-0.032, 0.0, 0.01));
        let fov = symmetric_fov();
        let a = eye_matrices(&camera, &eye, &fov);
        let b = eye_matrices(&camera, &eye, &fov);
        assert_eq!(a.view.to_cols_array(), b.view.to_cols_array());
        assert_eq!(a.projection.to_cols_array(), b.projection.to_cols_array());
    }

    #[test]
    fn test_projection_depth_range() {
        let proj = projection_matrix(&symmetric_fov());

        let near = proj * Vec4::new(0.0, 0.0, -NEAR_PLANE, 1.0);
        assert!((near.z / near.w).abs() < EPSILON);

        let far = proj * Vec4::new(0.0, 0.0, -FAR_PLANE, 1.0);
        assert!((far.z / far.w - 1.0).abs() < EPSILON);

        // 45 degree edge of a tan=1 frustum lands on the NDC edge
        let edge = proj * Vec4::new(1.0, 1.0, -1.0, 1.0);
        assert!((edge.x / edge.w - 1.0).abs() < EPSILON);
        assert!((edge.y / edge.w - 1.0).abs() < EPSILON);
    }

    #[test]
    fn test_runtime_layout_conversion() {
        let mut m = [[0.0f32; 4]; 4];
        for (row, values) in m.iter_mut().enumerate() {
            for (col, value) in values.iter_mut().enumerate() {
                *value = (row * 4 + col) as f32;
            }
        }
        let converted = from_runtime_layout(&m);
        for row in 0..4 {
            for col in 0..4 {
                assert_eq!(converted.row(row)[col], m[row][col]);
            }
        }
    }
}
