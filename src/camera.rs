// Free-fly camera driven by held keys
//
// The tracked head moves inside this camera, so yaw and pitch here only turn
// the viewer's body. Roll stays zero.

use glam::{EulerRot, Quat, Vec3};

use crate::input::{Action, InputState};
use crate::pose::Pose;

/// Translation per frame, in world units.
pub const DEFAULT_MOVE_STEP: f32 = 0.05;
/// Rotation per frame, in radians.
pub const DEFAULT_TURN_STEP: f32 = 0.02;

/// Orientation is always rebuilt from yaw and pitch, so the two cannot drift apart.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraModel {
    pub position: Vec3,
    yaw: f32,
    pitch: f32,
}

impl Default for CameraModel {
    fn default() -> Self {
        Self::new(Vec3::ZERO)
    }
}

impl CameraModel {
    pub fn new(position: Vec3) -> Self {
        Self {
            position,
            yaw: 0.0,
            pitch: 0.0,
        }
    }

    /// Radians around +Y, positive turns left.
    pub fn yaw(&self) -> f32 {
        self.yaw
    }

    /// Radians around +X, positive looks up.
    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    pub fn orientation(&self) -> Quat {
        Quat::from_euler(EulerRot::YXZ, self.yaw, self.pitch, 0.0)
    }

    pub fn pose(&self) -> Pose {
        Pose::new(self.orientation(), self.position)
    }

    /// Apply one frame of held input.
    pub fn update(&mut self, input: &InputState, step: f32, turn: f32) {
        let pose = self.pose();
        let (forward, right, up) = (pose.forward(), pose.right(), pose.up());

        let axis = |positive: Action, negative: Action| {
            input.is_active(positive) as i32 as f32 - input.is_active(negative) as i32 as f32
        };

        self.position += forward * step * axis(Action::MoveForward, Action::MoveBackward);
        self.position += right * step * axis(Action::StrafeRight, Action::StrafeLeft);
        self.position += up * step * axis(Action::MoveUp, Action::MoveDown);

        self.yaw += turn * axis(Action::TurnLeft, Action::TurnRight);
        self.pitch += turn * axis(Action::PitchUp, Action::PitchDown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{KeyBindings, KeyMessage, PlaybackSignals, VirtualKey};

    const EPSILON: f32 = 1e-5;

    fn input_with(keys: &[VirtualKey]) -> InputState {
        let mut input = InputState::new(KeyBindings::default(), PlaybackSignals::new());
        for key in keys {
            input.on_key(KeyMessage::KeyDown, key.code() as u32);
        }
        input
    }

    fn letter(c: char) -> VirtualKey {
        VirtualKey::from_char(c).unwrap()
    }

    #[test]
    fn test_idle_camera_stays_put() {
        let mut camera = CameraModel::default();
        camera.update(&input_with(&[]), DEFAULT_MOVE_STEP, DEFAULT_TURN_STEP);
        assert_eq!(camera, CameraModel::default());
    }

    #[test]
    fn test_forward_moves_along_negative_z() {
        let mut camera = CameraModel::default();
        let input = input_with(&[letter('W')]);
        camera.update(&input, DEFAULT_MOVE_STEP, DEFAULT_TURN_STEP);
        camera.update(&input, DEFAULT_MOVE_STEP, DEFAULT_TURN_STEP);
        assert!(camera.position.abs_diff_eq(Vec3::new(0.0, 0.0, -0.1), EPSILON));
    }

    #[test]
    fn test_opposite_keys_cancel() {
        let mut camera = CameraModel::default();
        let input = input_with(&[letter('A'), letter('D'), letter('E')]);
        camera.update(&input, 1.0, DEFAULT_TURN_STEP);
        assert!(camera.position.abs_diff_eq(Vec3::Y, EPSILON));
    }

    #[test]
    fn test_turn_left_accumulates_yaw() {
        let mut camera = CameraModel::default();
        let input = input_with(&[VirtualKey::LEFT]);
        for _ in 0..10 {
            camera.update(&input, DEFAULT_MOVE_STEP, DEFAULT_TURN_STEP);
        }
        assert!((camera.yaw() - 0.2).abs() < EPSILON);
        assert_eq!(camera.pitch(), 0.0);

        // Positive yaw turns the view toward -X
        let forward = camera.pose().forward();
        assert!(forward.x < 0.0);
        assert!(forward.y.abs() < EPSILON);
    }

    #[test]
    fn test_orientation_has_no_roll() {
        let mut camera = CameraModel::default();
        let input = input_with(&[VirtualKey::RIGHT, letter('Q')]);
        for _ in 0..25 {
            camera.update(&input, DEFAULT_MOVE_STEP, DEFAULT_TURN_STEP);
        }
        // Right vector stays horizontal
        assert!(camera.pose().right().y.abs() < EPSILON);
        assert!(camera.pose().up().y > 0.0);
    }

    #[test]
    fn test_orientation_follows_yaw_and_pitch() {
        let mut camera = CameraModel::default();
        assert_eq!(camera.orientation(), Quat::IDENTITY);

        camera.update(&input_with(&[VirtualKey::LEFT]), 0.0, 0.3);
        camera.update(&input_with(&[letter('Q')]), 0.0, 0.2);
        let expected = Quat::from_rotation_y(0.3) * Quat::from_rotation_x(0.2);
        assert!(camera.orientation().abs_diff_eq(expected, EPSILON));
        assert_eq!(camera.pose().orientation, camera.orientation());

        // Opposite turns return to the starting orientation
        camera.update(&input_with(&[VirtualKey::RIGHT]), 0.0, 0.3);
        camera.update(&input_with(&[letter('Z')]), 0.0, 0.2);
        assert!(camera.orientation().abs_diff_eq(Quat::IDENTITY, EPSILON));
    }
}
