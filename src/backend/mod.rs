// Backend module - GPU abstraction layer
//
// Design: an immediate-context style device (create resources, issue commands
// in order, present) so the frame pipeline reads the same on every backend.
// Resources are addressed by small copyable ids owned by the backend.

pub mod null;
#[cfg(feature = "vulkan")]
pub mod vulkan;

use glam::Mat4;
use raw_window_handle::RawWindowHandle;

use crate::error::GpuError;

pub use null::{NullDevice, NullGraphics};

macro_rules! resource_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            pub fn raw(self) -> u32 {
                self.0
            }
        }
    };
}

resource_id!(
    /// A 2D texture owned by the device (render target, depth, mirror...)
    TextureId
);
resource_id!(
    /// Render-target, depth-stencil or shader-resource view
    ViewId
);
resource_id!(
    /// Uploaded vertex + index buffers
    MeshId
);

/// Locally unique adapter identifier, as reported by the OS and the HMD runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AdapterLuid(pub [u8; 8]);

impl AdapterLuid {
    pub fn from_u64(value: u64) -> Self {
        Self(value.to_le_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub index: u32,
    pub name: String,
    pub luid: AdapterLuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8UnormSrgb,
    D32Float,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> usize {
        4
    }
}

/// How a texture will be bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureUsage {
    pub render_target: bool,
    pub shader_resource: bool,
    pub depth_stencil: bool,
}

impl TextureUsage {
    pub const RENDER_TARGET: Self = Self {
        render_target: true,
        shader_resource: true,
        depth_stencil: false,
    };
    pub const DEPTH_STENCIL: Self = Self {
        render_target: false,
        shader_resource: false,
        depth_stencil: true,
    };
    pub const SHADER_RESOURCE: Self = Self {
        render_target: false,
        shader_resource: true,
        depth_stencil: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl TextureDesc {
    pub fn byte_size(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// Integer rectangle in texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }
}

/// Rasterizer viewport. `y` grows downward, depth range defaults to [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl From<Rect> for Viewport {
    fn from(rect: Rect) -> Self {
        Self {
            x: rect.x as f32,
            y: rect.y as f32,
            width: rect.width as f32,
            height: rect.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// A texture living outside the device's bookkeeping (decoder output).
///
/// `handle` is the backend's native object (a `VkImage` for Vulkan). It stays
/// valid until the allocator is asked for the same surface again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalTexture {
    pub handle: u64,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

/// Extensions a runtime needs enabled on the instance and device it will
/// share with us. Names are the backend's own extension strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphicsRequirements {
    pub instance_extensions: Vec<String>,
    pub device_extensions: Vec<String>,
}

impl GraphicsRequirements {
    pub fn is_empty(&self) -> bool {
        self.instance_extensions.is_empty() && self.device_extensions.is_empty()
    }
}

/// Raw objects a runtime needs to submit work on the same device.
///
/// Values are the backend's native handles (`VkInstance`, `VkPhysicalDevice`,
/// `VkDevice` for Vulkan) widened to integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeDevice {
    pub instance: u64,
    pub physical_device: u64,
    pub device: u64,
    pub queue_family_index: u32,
    pub queue_index: u32,
}

/// Interleaved vertex layout shared by every mesh: position, normal, uv.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

#[derive(Debug, Clone, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

/// Entry point of a graphics API: adapter discovery and device creation.
pub trait GraphicsApi {
    type Device: GraphicsDevice;

    /// Extensions to enable on every instance and device created from now on.
    fn require(&mut self, requirements: &GraphicsRequirements);

    fn enumerate_adapters(&mut self) -> Result<Vec<AdapterInfo>, GpuError>;

    /// Create a device on `adapter`, or on the default hardware adapter.
    fn create_device(&mut self, adapter: Option<&AdapterInfo>) -> Result<Self::Device, GpuError>;
}

/// A device plus its immediate context and (optionally) a window swapchain.
pub trait GraphicsDevice {
    /// Raw device pointer handed to external allocators.
    fn native_handle(&self) -> usize;

    /// Handles for a runtime sharing this device, if the backend has any.
    fn native_device(&self) -> Option<NativeDevice> {
        None
    }

    /// (Re)create the window swapchain. Any previous swapchain is released
    /// first, invalidating its backbuffer id.
    fn create_swapchain(
        &mut self,
        window: RawWindowHandle,
        width: u32,
        height: u32,
    ) -> Result<(), GpuError>;
    fn release_swapchain(&mut self);
    fn backbuffer(&self) -> Option<TextureId>;

    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        initial_data: Option<&[u8]>,
    ) -> Result<TextureId, GpuError>;
    /// Describe a device texture the way an external allocator would hand it out.
    fn export_texture(&self, texture: TextureId) -> Result<ExternalTexture, GpuError>;
    fn release_texture(&mut self, texture: TextureId);

    /// Track an image someone else owns, e.g. a runtime swapchain image.
    /// Releasing the id forgets the image without destroying it.
    fn import_texture(&mut self, handle: u64, desc: &TextureDesc) -> Result<TextureId, GpuError>;
    /// Execute every recorded write to `texture` and wait for it, leaving the
    /// image as its owner expects it back.
    fn flush_texture(&mut self, texture: TextureId) -> Result<(), GpuError>;

    fn create_render_target_view(&mut self, texture: TextureId) -> Result<ViewId, GpuError>;
    fn create_depth_stencil_view(&mut self, texture: TextureId) -> Result<ViewId, GpuError>;
    fn create_shader_resource_view(&mut self, texture: &ExternalTexture)
        -> Result<ViewId, GpuError>;
    fn release_view(&mut self, view: ViewId);

    fn create_mesh(&mut self, mesh: &MeshData) -> Result<MeshId, GpuError>;
    fn release_mesh(&mut self, mesh: MeshId);

    fn set_render_target(&mut self, rtv: ViewId, dsv: Option<ViewId>) -> Result<(), GpuError>;
    fn clear_render_target(&mut self, rtv: ViewId, color: [f32; 4]) -> Result<(), GpuError>;
    fn clear_depth_stencil(&mut self, dsv: ViewId, depth: f32, stencil: u8)
        -> Result<(), GpuError>;
    fn set_viewport(&mut self, viewport: Viewport) -> Result<(), GpuError>;
    /// Draw `mesh` into the bound target with `texture` sampled.
    fn draw_mesh(
        &mut self,
        mesh: MeshId,
        texture: ViewId,
        view: Mat4,
        projection: Mat4,
    ) -> Result<(), GpuError>;
    /// Whole-resource copy; sizes are expected to match.
    fn copy_texture(&mut self, dst: TextureId, src: TextureId) -> Result<(), GpuError>;
    /// Scaled region copy, used by compositors to assemble the mirror.
    fn blit_texture(
        &mut self,
        src: TextureId,
        src_rect: Rect,
        dst: TextureId,
        dst_rect: Rect,
    ) -> Result<(), GpuError>;
    fn present(&mut self, sync_interval: u32) -> Result<(), GpuError>;

    /// Allow resource creation from other threads while this one records.
    fn set_multithread_protected(&mut self, enabled: bool) -> Result<(), GpuError>;
    fn set_maximum_frame_latency(&mut self, frames: u32) -> Result<(), GpuError>;
}
