// =============================================================================
// VR360 RENDER DEVICE - Stereo HMD rendering of decoded video frames
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Host (window loop, decoder, frame allocator)                   │
// │    └── VrDevice (lifecycle + frame pipeline)                    │
// │          ├── HMD session (simulated, or OpenXR on a headset)    │
// │          ├── GPU context (device, swapchain, backbuffer)        │
// │          ├── Eye surfaces (2 ring-buffered targets + depth)     │
// │          ├── Camera + input (keyboard driven fly camera)        │
// │          └── Sphere scene (decoded frame mapped inside a sphere)│
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Check device state, resolve decoded surface -> native texture
// 2. Update camera from held keys
// 3. Sample predicted display time, sensor time, tracking state
// 4. Per eye: advance ring, clear, viewport, view/proj, draw
// 5. Submit one stereo layer to the compositor
// 6. Copy mirror into the backbuffer and present
//
// =============================================================================

pub mod backend;
pub mod camera;
pub mod config;
pub mod device;
pub mod error;
pub mod frame;
pub mod hmd;
pub mod input;
pub mod pose;
pub mod scene;
pub mod surface;

pub use device::{DeviceSettings, DeviceState, HandleType, NativeHandle, VrDevice};
pub use error::{DeviceError, Status};
pub use frame::{ExternalTexture, FrameAllocator, FrameSurface, MemId};
pub use input::{KeyMessage, PlaybackSignals};
