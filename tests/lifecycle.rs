// Device lifecycle: init sizing, reset, resize, and teardown after failures

mod common;

use common::{device_with, ready_device, surface, window, TestDevice, TestFrames};
use vr360_render::backend::null::Command;
use vr360_render::backend::{AdapterLuid, GraphicsRequirements, NullGraphics, Rect};
use vr360_render::error::{GpuError, HmdError, InitStage, SurfaceError};
use vr360_render::hmd::{Eye, Extent, SimulatedHmdConfig};
use vr360_render::{DeviceError, DeviceState, Status};

fn init_stage(result: Result<(), DeviceError>) -> (InitStage, DeviceError) {
    match result {
        Err(DeviceError::Init { stage, source }) => (stage, *source),
        other => panic!("expected an init failure, got {other:?}"),
    }
}

/// Close and check every handle the failed init created was released once.
fn assert_closes_clean(mut vr: TestDevice) {
    vr.close();
    assert_eq!(vr.state(), DeviceState::Closed);

    let stats = vr.api().stats();
    assert!(stats.is_empty(), "leaked: {stats:?}");
    assert_eq!(stats.bad_releases, 0);
    assert_eq!(stats.devices_dropped, stats.devices_created);

    let log = vr.runtime().log();
    assert!(log.is_clean());
    assert_eq!(log.shutdowns, 1);
}

#[test]
fn test_init_sizes_everything_from_the_hmd() {
    let mut vr = device_with(NullGraphics::new(), SimulatedHmdConfig::default());
    vr.init(window()).unwrap();

    assert_eq!(vr.state(), DeviceState::Initialized);
    assert_eq!(vr.window_size(), (1080, 600));
    let desc = vr.hmd_desc().unwrap();
    assert_eq!(desc.resolution, Extent { width: 2160, height: 1200 });
    for eye in Eye::ALL {
        assert_eq!(vr.eye_viewport(eye), Rect::from_size(1080, 1200));
        assert_eq!(vr.eye_ring_index(eye), Some(1));
    }

    let log = vr.runtime().log();
    assert_eq!(log.swap_texture_sets.len(), 2);
    assert_eq!(log.mirrors_created, vec![(1080, 600)]);
    drop(log);

    let stats = vr.api().stats();
    assert!(stats.multithread_protected);
    assert_eq!(stats.meshes.len(), 1);
    // Two rings of two, two depth buffers, one mirror
    assert_eq!(stats.textures.len(), 7);
    assert!(stats.swapchain.is_none());
}

#[test]
fn test_adapter_is_matched_by_luid() {
    let mut vr = device_with(NullGraphics::new(), SimulatedHmdConfig::default());
    vr.init(window()).unwrap();
    let adapter = vr.api().stats().device_adapter.clone();
    assert_eq!(adapter.map(|a| a.luid), Some(AdapterLuid::from_u64(1)));

    let hmd = SimulatedHmdConfig {
        adapter_luid: AdapterLuid::from_u64(0xBEEF),
        ..SimulatedHmdConfig::default()
    };
    let mut vr = device_with(NullGraphics::new(), hmd);
    vr.init(window()).unwrap();
    let stats = vr.api().stats();
    assert_eq!(stats.devices_created, 1);
    assert!(stats.device_adapter.is_none());
}

#[test]
fn test_session_extensions_reach_the_device() {
    let requirements = GraphicsRequirements {
        instance_extensions: vec!["VK_KHR_external_memory_capabilities".into()],
        device_extensions: vec![
            "VK_KHR_external_memory".into(),
            "VK_KHR_dedicated_allocation".into(),
        ],
    };
    let hmd = SimulatedHmdConfig {
        graphics_requirements: requirements.clone(),
        ..SimulatedHmdConfig::default()
    };
    let mut vr = device_with(NullGraphics::new(), hmd);
    vr.init(window()).unwrap();
    let stats = vr.api().stats();
    assert_eq!(stats.devices_created, 1);
    assert_eq!(stats.device_requirements, requirements);
}

#[test]
fn test_device_detaches_after_every_texture_is_returned() {
    let mut vr = ready_device();
    let mut frames = TestFrames::new(1);
    vr.render_frame(&surface(0), &mut frames).unwrap();
    vr.close();

    let log = vr.runtime().log();
    assert_eq!(log.detached_with_open, vec![0]);
    assert_eq!(log.sessions_destroyed, 1);
}

#[test]
fn test_reset_builds_swapchain_at_window_size() {
    let vr = ready_device();
    let stats = vr.api().stats();
    let swapchain = stats.swapchain.unwrap();
    assert_eq!((swapchain.width, swapchain.height), (1080, 600));
    assert_eq!(stats.max_frame_latency, Some(1));
    assert_eq!(stats.swapchains_created, 1);
}

#[test]
fn test_resize_rebuilds_swapchain_and_mirror() {
    let mut vr = ready_device();
    let mut frames = TestFrames::new(1);
    vr.render_frame(&surface(0), &mut frames).unwrap();

    vr.set_window_size(1280, 720);
    assert_eq!(vr.window_size(), (1280, 720));
    vr.reset().unwrap();

    {
        let stats = vr.api().stats();
        let swapchain = stats.swapchain.unwrap();
        assert_eq!((swapchain.width, swapchain.height), (1280, 720));
        assert_eq!(stats.swapchains_created, 2);

        let log = vr.runtime().log();
        assert_eq!(log.mirrors.len(), 1);
        assert_eq!(log.mirrors.values().next(), Some(&(1280, 720)));
        assert_eq!(log.mirrors_created, vec![(1080, 600), (1280, 720)]);
    }

    let mark = vr.api().stats().commands.len();
    vr.render_frame(&surface(0), &mut frames).unwrap();

    let stats = vr.api().stats();
    let backbuffer = stats.swapchain.unwrap().backbuffer;
    let copy = stats.commands[mark..]
        .iter()
        .find_map(|c| match c {
            Command::Copy { dst, src } => Some((*dst, *src)),
            _ => None,
        })
        .unwrap();
    assert_eq!(copy.0, backbuffer);
    let mirror = stats.textures[&copy.1];
    assert_eq!((mirror.width, mirror.height), (1280, 720));

    let log = vr.runtime().log();
    assert_eq!(log.submissions.last().unwrap().mirror_size, Some((1280, 720)));
}

#[test]
fn test_reset_at_same_size_keeps_mirror() {
    let mut vr = ready_device();
    vr.reset().unwrap();
    assert_eq!(vr.runtime().log().mirrors_created.len(), 1);
    assert_eq!(vr.api().stats().swapchains_created, 2);
    assert_eq!(vr.api().stats().bad_releases, 0);
}

#[test]
fn test_render_needs_init_and_swapchain() {
    let mut frames = TestFrames::new(1);

    let mut vr = device_with(NullGraphics::new(), SimulatedHmdConfig::default());
    let err = vr.render_frame(&surface(0), &mut frames).unwrap_err();
    assert!(matches!(err, DeviceError::InvalidState { operation: "render_frame", .. }));

    vr.init(window()).unwrap();
    let err = vr.render_frame(&surface(0), &mut frames).unwrap_err();
    assert!(matches!(err, DeviceError::Gpu(GpuError::NoSwapchain)));
    assert_eq!(err.status(), Status::DeviceFailed);
    assert_eq!(vr.frame_index(), 0);
}

#[test]
fn test_missing_hmd_fails_session_stage() {
    let hmd = SimulatedHmdConfig {
        hmd_present: false,
        ..SimulatedHmdConfig::default()
    };
    let mut vr = device_with(NullGraphics::new(), hmd);
    let result = vr.init(window());
    assert_eq!(Status::of(&result), Status::DeviceFailed);

    let (stage, source) = init_stage(result);
    assert_eq!(stage, InitStage::SessionCreate);
    assert!(matches!(source, DeviceError::Hmd(HmdError::NoHmd)));
    assert_eq!(vr.api().stats().devices_created, 0);
    assert_closes_clean(vr);
}

#[test]
fn test_device_creation_failure_closes_clean() {
    let mut vr = device_with(
        NullGraphics::new().failing_device_creation(),
        SimulatedHmdConfig::default(),
    );
    let (stage, _) = init_stage(vr.init(window()));
    assert_eq!(stage, InitStage::DeviceCreate);
    assert_eq!(vr.runtime().log().sessions_created, 1);
    assert_closes_clean(vr);
}

#[test]
fn test_partial_eye_ring_closes_clean() {
    // Left ring and depth succeed, the right ring fails on its second slot
    let mut vr = device_with(
        NullGraphics::new().failing_textures_after(4),
        SimulatedHmdConfig::default(),
    );
    let (stage, source) = init_stage(vr.init(window()));
    assert_eq!(stage, InitStage::EyeSurfaces);
    assert!(matches!(source, DeviceError::Surface(SurfaceError::Hmd(HmdError::Texture(_)))));
    assert_eq!(vr.runtime().log().swap_texture_sets.len(), 1);
    assert_closes_clean(vr);
}

#[test]
fn test_depth_failure_closes_clean() {
    let mut vr = device_with(
        NullGraphics::new().failing_textures_after(2),
        SimulatedHmdConfig::default(),
    );
    let (stage, _) = init_stage(vr.init(window()));
    assert_eq!(stage, InitStage::EyeSurfaces);
    assert_closes_clean(vr);
}

#[test]
fn test_mirror_failure_closes_clean() {
    let mut vr = device_with(
        NullGraphics::new().failing_textures_after(6),
        SimulatedHmdConfig::default(),
    );
    let (stage, _) = init_stage(vr.init(window()));
    assert_eq!(stage, InitStage::MirrorTexture);
    assert_eq!(vr.api().stats().textures.len(), 6);
    assert_closes_clean(vr);
}

#[test]
fn test_wrong_ring_size_closes_clean() {
    let hmd = SimulatedHmdConfig {
        ring_size: 3,
        ..SimulatedHmdConfig::default()
    };
    let mut vr = device_with(NullGraphics::new(), hmd);
    let (stage, source) = init_stage(vr.init(window()));
    assert_eq!(stage, InitStage::EyeSurfaces);
    assert!(matches!(
        source,
        DeviceError::Surface(SurfaceError::RingSize { expected: 2, actual: 3 })
    ));
    // The three textures of the rejected ring were handed back
    assert!(vr.api().stats().textures.is_empty());
    assert_closes_clean(vr);
}

#[test]
fn test_multithread_refusal_closes_clean() {
    let mut vr = device_with(
        NullGraphics::new().without_multithread_protection(),
        SimulatedHmdConfig::default(),
    );
    let (stage, source) = init_stage(vr.init(window()));
    assert_eq!(stage, InitStage::Multithread);
    assert!(matches!(source, DeviceError::Gpu(_)));
    assert_closes_clean(vr);
}

#[test]
fn test_close_after_rendering_releases_everything() {
    let mut vr = ready_device();
    let mut frames = TestFrames::new(2);
    for i in 0..4 {
        vr.render_frame(&surface(i % 2), &mut frames).unwrap();
    }
    assert_eq!(vr.state(), DeviceState::Rendering);

    assert_closes_clean(vr);
}

#[test]
fn test_closed_device_rejects_work() {
    let mut vr = ready_device();
    vr.close();
    vr.close();
    assert!(matches!(vr.reset(), Err(DeviceError::InvalidState { .. })));
    assert!(matches!(vr.init(window()), Err(DeviceError::InvalidState { .. })));

    let mut frames = TestFrames::new(1);
    assert!(vr.render_frame(&surface(0), &mut frames).is_err());
    assert_eq!(vr.runtime().log().shutdowns, 1);
}
