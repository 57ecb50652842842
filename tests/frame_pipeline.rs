// Per-frame behaviour: ring rotation, command order, timing, matrices, input

mod common;

use common::{device_with, ready_device, surface, window, TestFrames, EPSILON};
use glam::{Mat4, Quat, Vec3};
use vr360_render::backend::null::{Command, ViewKind};
use vr360_render::backend::NullGraphics;
use vr360_render::hmd::sim::TimingCall;
use vr360_render::hmd::{Eye, SimulatedHmdConfig};
use vr360_render::input::VirtualKey;
use vr360_render::pose::{self, Pose};
use vr360_render::{DeviceError, DeviceState, KeyMessage, MemId, Status};

fn draw_views(commands: &[Command]) -> Vec<Mat4> {
    commands
        .iter()
        .filter_map(|c| match c {
            Command::Draw { view, .. } => Some(*view),
            _ => None,
        })
        .collect()
}

fn key(c: char) -> u32 {
    VirtualKey::from_char(c).unwrap().code() as u32
}

#[test]
fn test_rings_alternate_every_frame() {
    let mut vr = ready_device();
    let mut frames = TestFrames::new(1);

    for k in 0..5usize {
        vr.render_frame(&surface(0), &mut frames).unwrap();
        for eye in Eye::ALL {
            assert_eq!(vr.eye_ring_index(eye), Some(k % 2), "frame {k} {eye:?}");
        }
        let log = vr.runtime().log();
        let layer = &log.submissions[k].layers[0];
        assert_eq!(layer.color_texture[0].index, k % 2);
        assert_eq!(layer.color_texture[1].index, k % 2);
    }
    assert_eq!(vr.frame_index(), 5);
    assert_eq!(frames.lookups, 5);
}

#[test]
fn test_single_frame_submits_once_and_presents_immediately() {
    let mut vr = ready_device();
    let mut frames = TestFrames::new(1);
    vr.render_frame(&surface(0), &mut frames).unwrap();
    assert_eq!(vr.state(), DeviceState::Rendering);

    let log = vr.runtime().log();
    assert_eq!(log.submissions.len(), 1);
    let submission = &log.submissions[0];
    assert_eq!(submission.frame_index, 0);
    assert_eq!(submission.layers.len(), 1);
    let layer = &submission.layers[0];
    assert_ne!(layer.color_texture[0].set, layer.color_texture[1].set);
    for eye in Eye::ALL {
        assert_eq!(layer.viewport[eye.index()], vr.eye_viewport(eye));
    }
    drop(log);

    let stats = vr.api().stats();
    assert_eq!(stats.draw_count(), 2);
    assert_eq!(stats.presents, 1);
    assert_eq!(stats.commands.last(), Some(&Command::Present { sync_interval: 0 }));
}

#[test]
fn test_command_order_per_frame() {
    let mut vr = ready_device();
    let mut frames = TestFrames::new(1);
    vr.render_frame(&surface(0), &mut frames).unwrap();

    let stats = vr.api().stats();
    let commands = &stats.commands;
    assert_eq!(commands.len(), 14);

    let mut targets = Vec::new();
    for eye in 0..2 {
        let block = &commands[eye * 5..eye * 5 + 5];
        let Command::SetRenderTarget { rtv, dsv: Some(dsv) } = block[0] else {
            panic!("eye {eye} starts with {:?}", block[0]);
        };
        assert!(matches!(stats.views[&rtv], ViewKind::RenderTarget(_)));
        assert!(matches!(stats.views[&dsv], ViewKind::DepthStencil(_)));
        assert_eq!(block[1], Command::ClearRenderTarget { rtv, color: [0.0; 4] });
        assert_eq!(block[2], Command::ClearDepthStencil { dsv, depth: 1.0, stencil: 0 });
        let Command::SetViewport(viewport) = block[3] else {
            panic!("expected viewport, got {:?}", block[3]);
        };
        assert_eq!((viewport.width, viewport.height), (1080.0, 1200.0));
        assert!(matches!(block[4], Command::Draw { .. }));
        targets.push((rtv, dsv));
    }
    assert_ne!(targets[0].0, targets[1].0);
    assert_ne!(targets[0].1, targets[1].1);

    // Compositor blits both eyes into the mirror, then the mirror is shown
    assert!(matches!(commands[10], Command::Blit { .. }));
    assert!(matches!(commands[11], Command::Blit { .. }));
    let backbuffer = stats.swapchain.unwrap().backbuffer;
    let Command::Copy { dst, src } = commands[12] else {
        panic!("expected mirror copy, got {:?}", commands[12]);
    };
    assert_eq!(dst, backbuffer);
    let Command::Blit { dst: mirror, .. } = commands[10] else {
        unreachable!()
    };
    assert_eq!(src, mirror);
    assert_eq!(commands[13], Command::Present { sync_interval: 0 });
}

#[test]
fn test_timing_sampled_in_order() {
    let mut vr = ready_device();
    let mut frames = TestFrames::new(1);
    vr.render_frame(&surface(0), &mut frames).unwrap();
    vr.render_frame(&surface(0), &mut frames).unwrap();

    let log = vr.runtime().log();
    let expected = [0, 1].iter().flat_map(|&frame| {
        [
            TimingCall::PredictedDisplayTime(frame),
            TimingCall::TimeInSeconds,
            TimingCall::TrackingState { latency_marker: true },
            TimingCall::SubmitFrame(frame),
        ]
    });
    assert_eq!(log.timing, expected.collect::<Vec<_>>());
}

#[test]
fn test_view_matrix_centers_the_render_pose() {
    let mut vr = ready_device();
    let mut frames = TestFrames::new(1);
    vr.render_frame(&surface(0), &mut frames).unwrap();

    let layer = vr.runtime().log().submissions[0].layers[0];
    let views = draw_views(&vr.api().stats().commands);
    assert_eq!(views.len(), 2);

    for eye in 0..2 {
        let eye_position = layer.render_pose[eye].position;
        let origin = views[eye].transform_point3(eye_position);
        assert!(origin.abs_diff_eq(Vec3::ZERO, EPSILON), "eye {eye}: {origin}");
        let back = views[eye].inverse().transform_point3(Vec3::ZERO);
        assert!(back.abs_diff_eq(eye_position, EPSILON));
    }
    // The eyes sit an IPD apart
    let ipd = layer.render_pose[0].position.distance(layer.render_pose[1].position);
    assert!((ipd - 0.064).abs() < EPSILON);
}

#[test]
fn test_rotated_camera_and_head_compose_in_view() {
    let head = Pose::new(Quat::from_rotation_x(0.3), Vec3::new(0.0, 1.6, 0.0));
    let hmd = SimulatedHmdConfig {
        head_pose: head,
        ..SimulatedHmdConfig::default()
    };
    let mut vr = device_with(NullGraphics::new(), hmd);
    vr.init(window()).unwrap();
    vr.reset().unwrap();
    let mut frames = TestFrames::new(1);

    vr.on_key(KeyMessage::KeyDown, VirtualKey::LEFT.code() as u32);
    for _ in 0..10 {
        vr.render_frame(&surface(0), &mut frames).unwrap();
    }
    let camera = vr.camera().pose();
    assert!((vr.camera().yaw() - 0.2).abs() < EPSILON);

    let layer = vr.runtime().log().submissions[9].layers[0];
    let views = draw_views(&vr.api().stats().commands);
    assert_eq!(views.len(), 20);

    for eye in 0..2 {
        let render_pose = layer.render_pose[eye];
        assert_eq!(render_pose.orientation, head.orientation);

        // Body turn first, then the tracked head inside it
        let orientation = Quat::from_rotation_y(0.2) * Quat::from_rotation_x(0.3);
        let position = camera.transform_point(render_pose.position);
        let view = views[18 + eye];

        assert!(view.transform_point3(position).abs_diff_eq(Vec3::ZERO, EPSILON));
        let ahead = view.transform_point3(position + orientation * Vec3::NEG_Z);
        assert!(ahead.abs_diff_eq(Vec3::NEG_Z, EPSILON), "eye {eye}: {ahead}");
        let up = view.transform_point3(position + orientation * Vec3::Y);
        assert!(up.abs_diff_eq(Vec3::Y, EPSILON), "eye {eye}: {up}");

        let expected = pose::view_matrix(&pose::compose_eye_pose(&camera, &render_pose));
        assert!(view.abs_diff_eq(expected, EPSILON));
    }
}

#[test]
fn test_matrices_are_deterministic() {
    let draws = || {
        let mut vr = ready_device();
        let mut frames = TestFrames::new(1);
        vr.render_frame(&surface(0), &mut frames).unwrap();
        let stats = vr.api().stats();
        let matrices: Vec<_> = stats
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::Draw { view, projection, .. } => Some((*view, *projection)),
                _ => None,
            })
            .collect();
        matrices
    };
    let first = draws();
    let second = draws();
    assert_eq!(first.len(), 2);
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.0.to_cols_array(), b.0.to_cols_array());
        assert_eq!(a.1.to_cols_array(), b.1.to_cols_array());
    }
}

#[test]
fn test_allocator_failure_touches_nothing() {
    let mut vr = ready_device();
    let mut frames = TestFrames::new(1);
    let err = vr.render_frame(&surface(9), &mut frames).unwrap_err();
    assert!(matches!(err, DeviceError::Allocator { mem_id: MemId(9), .. }));
    assert_eq!(err.status(), Status::AllocatorFailed);

    assert!(vr.api().stats().commands.is_empty());
    assert!(vr.runtime().log().timing.is_empty());
    assert_eq!(vr.frame_index(), 0);
    assert_eq!(vr.state(), DeviceState::Initialized);

    // The device is still usable afterwards
    vr.render_frame(&surface(0), &mut frames).unwrap();
    assert_eq!(vr.frame_index(), 1);
}

#[test]
fn test_unready_device_never_asks_the_allocator() {
    let mut frames = TestFrames::new(1);

    let mut vr = device_with(NullGraphics::new(), SimulatedHmdConfig::default());
    assert!(vr.render_frame(&surface(0), &mut frames).is_err());
    assert_eq!(frames.lookups, 0);

    let mut vr = ready_device();
    vr.close();
    let err = vr.render_frame(&surface(0), &mut frames).unwrap_err();
    assert!(matches!(
        err,
        DeviceError::InvalidState {
            operation: "render_frame",
            state: DeviceState::Closed
        }
    ));
    assert_eq!(frames.lookups, 0);
}

#[test]
fn test_only_latest_video_view_stays_alive() {
    let mut vr = ready_device();
    let mut frames = TestFrames::new(3);
    for i in 0..3 {
        vr.render_frame(&surface(i), &mut frames).unwrap();
    }
    let stats = vr.api().stats();
    let video_views: Vec<_> = stats
        .views
        .values()
        .filter_map(|kind| match kind {
            ViewKind::ShaderResource(handle) => Some(*handle),
            _ => None,
        })
        .collect();
    assert_eq!(video_views, vec![0xF002]);
    assert_eq!(stats.bad_releases, 0);
}

#[test]
fn test_fast_forward_is_latched() {
    let mut vr = ready_device();
    let signals = vr.signals().clone();

    vr.on_key(KeyMessage::KeyDown, key('F'));
    assert!(signals.fast_forward_requested());
    vr.on_key(KeyMessage::KeyUp, key('F'));
    assert!(signals.fast_forward_requested());

    assert!(signals.take_fast_forward());
    assert!(!signals.fast_forward_requested());

    vr.on_key(KeyMessage::KeyDown, key('N'));
    assert!(signals.take_cancel_fast_forward());
}

#[test]
fn test_press_and_release_toggles_pause_once() {
    let mut vr = ready_device();
    let space = VirtualKey::SPACE.code() as u32;

    vr.on_key(KeyMessage::KeyDown, space);
    assert!(vr.signals().is_paused());
    vr.on_key(KeyMessage::KeyUp, space);
    assert!(vr.signals().is_paused());

    vr.on_key(KeyMessage::KeyDown, space);
    vr.on_key(KeyMessage::KeyUp, space);
    assert!(!vr.signals().is_paused());
}

#[test]
fn test_held_pause_key_toggles_on_every_message() {
    let mut vr = ready_device();
    let space = VirtualKey::SPACE.code() as u32;

    vr.on_key(KeyMessage::KeyDown, space);
    assert!(vr.signals().is_paused());
    // Auto-repeat and unrelated messages arrive while the key is still down
    vr.on_key(KeyMessage::KeyDown, space);
    assert!(!vr.signals().is_paused());
    vr.on_key(KeyMessage::Other, key('X'));
    assert!(vr.signals().is_paused());
    vr.on_key(KeyMessage::KeyUp, space);
    assert!(vr.signals().is_paused());
}

#[test]
fn test_held_key_moves_camera_each_frame() {
    let mut vr = ready_device();
    let mut frames = TestFrames::new(1);

    vr.on_key(KeyMessage::KeyDown, key('W'));
    vr.render_frame(&surface(0), &mut frames).unwrap();
    let z1 = vr.camera().position.z;
    assert!(z1 < 0.0);
    vr.render_frame(&surface(0), &mut frames).unwrap();
    let z2 = vr.camera().position.z;
    assert!((z2 - 2.0 * z1).abs() < EPSILON);

    vr.on_key(KeyMessage::KeyUp, key('W'));
    vr.render_frame(&surface(0), &mut frames).unwrap();
    assert_eq!(vr.camera().position.z, z2);
}

#[test]
fn test_turning_updates_orientation() {
    let mut vr = ready_device();
    let mut frames = TestFrames::new(1);
    let left = VirtualKey::LEFT.code() as u32;

    vr.on_key(KeyMessage::KeyDown, left);
    vr.render_frame(&surface(0), &mut frames).unwrap();
    let camera = *vr.camera();
    assert!(camera.yaw() > 0.0);
    assert_eq!(camera.pitch(), 0.0);
    // Turning left swings the forward vector toward -X
    let forward = camera.orientation() * Vec3::NEG_Z;
    assert!(forward.x < 0.0);
}
