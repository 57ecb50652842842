// Shared fixtures: a VR device on the null backend and the simulated HMD
#![allow(dead_code)]

use std::collections::HashMap;
use std::num::NonZeroIsize;

use raw_window_handle::{RawWindowHandle, Win32WindowHandle};
use vr360_render::backend::{NullGraphics, TextureFormat};
use vr360_render::error::AllocatorError;
use vr360_render::hmd::{SimulatedHmd, SimulatedHmdConfig};
use vr360_render::{
    DeviceSettings, ExternalTexture, FrameAllocator, FrameSurface, MemId, PlaybackSignals,
    VrDevice,
};

pub const EPSILON: f32 = 1e-4;

pub type TestDevice = VrDevice<NullGraphics, SimulatedHmd>;

pub fn window() -> RawWindowHandle {
    let hwnd = NonZeroIsize::new(0x1234).unwrap();
    RawWindowHandle::Win32(Win32WindowHandle::new(hwnd))
}

pub fn device_with(api: NullGraphics, hmd: SimulatedHmdConfig) -> TestDevice {
    VrDevice::new(
        api,
        SimulatedHmd::new(hmd),
        DeviceSettings::default(),
        PlaybackSignals::new(),
    )
}

/// Initialized and reset, ready to render.
pub fn ready_device() -> TestDevice {
    let mut vr = device_with(NullGraphics::new(), SimulatedHmdConfig::default());
    vr.init(window()).unwrap();
    vr.reset().unwrap();
    vr
}

/// Decoder stand-in: a fixed set of surfaces, each a 4K equirect frame.
pub struct TestFrames {
    surfaces: HashMap<MemId, ExternalTexture>,
    pub lookups: usize,
}

impl TestFrames {
    pub fn new(count: u64) -> Self {
        let surfaces = (0..count)
            .map(|i| {
                let texture = ExternalTexture {
                    handle: 0xF000 + i,
                    width: 3840,
                    height: 1920,
                    format: TextureFormat::Rgba8Unorm,
                };
                (MemId(i), texture)
            })
            .collect();
        Self {
            surfaces,
            lookups: 0,
        }
    }
}

impl FrameAllocator for TestFrames {
    fn get_hdl(&mut self, mem_id: MemId) -> Result<ExternalTexture, AllocatorError> {
        self.lookups += 1;
        self.surfaces
            .get(&mem_id)
            .copied()
            .ok_or(AllocatorError::UnknownSurface(mem_id))
    }
}

pub fn surface(id: u64) -> FrameSurface {
    FrameSurface { mem_id: MemId(id) }
}
