// Null backend - no GPU, full bookkeeping
//
// Tracks every live resource and records every command so callers can check
// ordering, sizes and release discipline without a graphics driver. Stats are
// shared between the api object and the devices it creates.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use glam::Mat4;
use parking_lot::{Mutex, MutexGuard};
use raw_window_handle::RawWindowHandle;

use super::{
    AdapterInfo, AdapterLuid, ExternalTexture, GraphicsApi, GraphicsDevice, GraphicsRequirements,
    MeshData, MeshId, Rect, TextureDesc, TextureFormat, TextureId, TextureUsage, ViewId, Viewport,
};
use crate::error::GpuError;

/// One recorded context command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetRenderTarget { rtv: ViewId, dsv: Option<ViewId> },
    ClearRenderTarget { rtv: ViewId, color: [f32; 4] },
    ClearDepthStencil { dsv: ViewId, depth: f32, stencil: u8 },
    SetViewport(Viewport),
    Draw { mesh: MeshId, texture: ViewId, view: Mat4, projection: Mat4 },
    Copy { dst: TextureId, src: TextureId },
    Blit { src: TextureId, src_rect: Rect, dst: TextureId, dst_rect: Rect },
    Flush(TextureId),
    Present { sync_interval: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    RenderTarget(TextureId),
    DepthStencil(TextureId),
    ShaderResource(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainInfo {
    pub width: u32,
    pub height: u32,
    pub backbuffer: TextureId,
}

/// Everything the null backend observed.
#[derive(Debug, Default)]
pub struct NullStats {
    pub devices_created: u32,
    pub devices_dropped: u32,
    pub device_adapter: Option<AdapterInfo>,
    /// Requirements in force when the last device was created
    pub device_requirements: GraphicsRequirements,
    pub textures: HashMap<TextureId, TextureDesc>,
    /// Imported textures and the foreign handle behind each
    pub imported: HashMap<TextureId, u64>,
    pub views: HashMap<ViewId, ViewKind>,
    pub meshes: HashMap<MeshId, usize>,
    pub swapchain: Option<SwapchainInfo>,
    pub swapchains_created: u32,
    pub commands: Vec<Command>,
    pub presents: u32,
    /// Releases of ids that were not live (double release or garbage)
    pub bad_releases: u32,
    pub multithread_protected: bool,
    pub max_frame_latency: Option<u32>,
    textures_created: usize,
    next_id: u32,
}

impl NullStats {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// Nothing created by the device is still alive.
    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
            && self.views.is_empty()
            && self.meshes.is_empty()
            && self.swapchain.is_none()
    }

    pub fn draw_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::Draw { .. }))
            .count()
    }
}

/// Failure injection knobs.
#[derive(Debug, Clone, Default)]
struct Faults {
    device_creation: bool,
    textures_after: Option<usize>,
    no_multithread: bool,
}

pub struct NullGraphics {
    adapters: Vec<AdapterInfo>,
    requirements: GraphicsRequirements,
    stats: Arc<Mutex<NullStats>>,
    faults: Faults,
}

impl Default for NullGraphics {
    fn default() -> Self {
        Self::new()
    }
}

impl NullGraphics {
    /// A single default adapter.
    pub fn new() -> Self {
        Self::with_adapters(vec![AdapterInfo {
            index: 0,
            name: "Null Adapter".to_string(),
            luid: AdapterLuid::from_u64(1),
        }])
    }

    pub fn with_adapters(adapters: Vec<AdapterInfo>) -> Self {
        Self {
            adapters,
            requirements: GraphicsRequirements::default(),
            stats: Arc::new(Mutex::new(NullStats::default())),
            faults: Faults::default(),
        }
    }

    pub fn failing_device_creation(mut self) -> Self {
        self.faults.device_creation = true;
        self
    }

    /// Let `count` textures succeed, then fail every later one.
    pub fn failing_textures_after(mut self, count: usize) -> Self {
        self.faults.textures_after = Some(count);
        self
    }

    pub fn without_multithread_protection(mut self) -> Self {
        self.faults.no_multithread = true;
        self
    }

    pub fn stats(&self) -> MutexGuard<'_, NullStats> {
        self.stats.lock()
    }
}

impl GraphicsApi for NullGraphics {
    type Device = NullDevice;

    fn require(&mut self, requirements: &GraphicsRequirements) {
        for name in &requirements.instance_extensions {
            if !self.requirements.instance_extensions.contains(name) {
                self.requirements.instance_extensions.push(name.clone());
            }
        }
        for name in &requirements.device_extensions {
            if !self.requirements.device_extensions.contains(name) {
                self.requirements.device_extensions.push(name.clone());
            }
        }
    }

    fn enumerate_adapters(&mut self) -> Result<Vec<AdapterInfo>, GpuError> {
        Ok(self.adapters.clone())
    }

    fn create_device(&mut self, adapter: Option<&AdapterInfo>) -> Result<NullDevice, GpuError> {
        if self.faults.device_creation {
            return Err(anyhow!("null device creation disabled").into());
        }

        let mut stats = self.stats.lock();
        stats.devices_created += 1;
        stats.device_adapter = adapter.cloned();
        stats.device_requirements = self.requirements.clone();
        log::info!(
            "Created null device on {}",
            adapter.map(|a| a.name.as_str()).unwrap_or("default adapter")
        );

        Ok(NullDevice {
            handle: 0x0D3D_0000 + stats.devices_created as usize,
            stats: self.stats.clone(),
            faults: self.faults.clone(),
        })
    }
}

pub struct NullDevice {
    handle: usize,
    stats: Arc<Mutex<NullStats>>,
    faults: Faults,
}

impl NullDevice {
    fn record(&self, command: Command) {
        self.stats.lock().commands.push(command);
    }

    fn check_view(&self, view: ViewId) -> Result<ViewKind, GpuError> {
        self.stats
            .lock()
            .views
            .get(&view)
            .copied()
            .ok_or(GpuError::UnknownHandle { kind: "view", id: view.0 })
    }

    fn texture_desc(&self, texture: TextureId) -> Result<TextureDesc, GpuError> {
        self.stats
            .lock()
            .textures
            .get(&texture)
            .copied()
            .ok_or(GpuError::UnknownHandle { kind: "texture", id: texture.0 })
    }

    fn create_view(&mut self, texture: TextureId, kind: ViewKind) -> Result<ViewId, GpuError> {
        self.texture_desc(texture)?;
        let mut stats = self.stats.lock();
        let id = ViewId(stats.next_id());
        stats.views.insert(id, kind);
        Ok(id)
    }
}

impl GraphicsDevice for NullDevice {
    fn native_handle(&self) -> usize {
        self.handle
    }

    fn create_swapchain(
        &mut self,
        _window: RawWindowHandle,
        width: u32,
        height: u32,
    ) -> Result<(), GpuError> {
        self.release_swapchain();

        let mut stats = self.stats.lock();
        let backbuffer = TextureId(stats.next_id());
        stats.textures.insert(
            backbuffer,
            TextureDesc {
                width,
                height,
                format: TextureFormat::Bgra8UnormSrgb,
                usage: TextureUsage::RENDER_TARGET,
            },
        );
        stats.swapchain = Some(SwapchainInfo { width, height, backbuffer });
        stats.swapchains_created += 1;
        Ok(())
    }

    fn release_swapchain(&mut self) {
        let mut stats = self.stats.lock();
        if let Some(swapchain) = stats.swapchain.take() {
            stats.textures.remove(&swapchain.backbuffer);
        }
    }

    fn backbuffer(&self) -> Option<TextureId> {
        self.stats.lock().swapchain.map(|s| s.backbuffer)
    }

    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        initial_data: Option<&[u8]>,
    ) -> Result<TextureId, GpuError> {
        if let Some(data) = initial_data {
            if data.len() != desc.byte_size() {
                return Err(GpuError::InitialDataSize {
                    expected: desc.byte_size(),
                    actual: data.len(),
                });
            }
        }

        let mut stats = self.stats.lock();
        if let Some(limit) = self.faults.textures_after {
            if stats.textures_created >= limit {
                return Err(anyhow!("null texture budget of {} exhausted", limit).into());
            }
        }
        stats.textures_created += 1;
        let id = TextureId(stats.next_id());
        stats.textures.insert(id, *desc);
        Ok(id)
    }

    fn export_texture(&self, texture: TextureId) -> Result<ExternalTexture, GpuError> {
        let desc = self.texture_desc(texture)?;
        Ok(ExternalTexture {
            handle: texture.0 as u64,
            width: desc.width,
            height: desc.height,
            format: desc.format,
        })
    }

    fn release_texture(&mut self, texture: TextureId) {
        let mut stats = self.stats.lock();
        if stats.textures.remove(&texture).is_none() {
            log::warn!("Released unknown texture {:?}", texture);
            stats.bad_releases += 1;
        }
        stats.imported.remove(&texture);
    }

    fn import_texture(&mut self, handle: u64, desc: &TextureDesc) -> Result<TextureId, GpuError> {
        let mut stats = self.stats.lock();
        let id = TextureId(stats.next_id());
        stats.textures.insert(id, *desc);
        stats.imported.insert(id, handle);
        Ok(id)
    }

    fn flush_texture(&mut self, texture: TextureId) -> Result<(), GpuError> {
        self.texture_desc(texture)?;
        self.record(Command::Flush(texture));
        Ok(())
    }

    fn create_render_target_view(&mut self, texture: TextureId) -> Result<ViewId, GpuError> {
        self.create_view(texture, ViewKind::RenderTarget(texture))
    }

    fn create_depth_stencil_view(&mut self, texture: TextureId) -> Result<ViewId, GpuError> {
        self.create_view(texture, ViewKind::DepthStencil(texture))
    }

    fn create_shader_resource_view(
        &mut self,
        texture: &ExternalTexture,
    ) -> Result<ViewId, GpuError> {
        let mut stats = self.stats.lock();
        let id = ViewId(stats.next_id());
        stats.views.insert(id, ViewKind::ShaderResource(texture.handle));
        Ok(id)
    }

    fn release_view(&mut self, view: ViewId) {
        let mut stats = self.stats.lock();
        if stats.views.remove(&view).is_none() {
            log::warn!("Released unknown view {:?}", view);
            stats.bad_releases += 1;
        }
    }

    fn create_mesh(&mut self, mesh: &MeshData) -> Result<MeshId, GpuError> {
        let mut stats = self.stats.lock();
        let id = MeshId(stats.next_id());
        stats.meshes.insert(id, mesh.indices.len());
        Ok(id)
    }

    fn release_mesh(&mut self, mesh: MeshId) {
        let mut stats = self.stats.lock();
        if stats.meshes.remove(&mesh).is_none() {
            log::warn!("Released unknown mesh {:?}", mesh);
            stats.bad_releases += 1;
        }
    }

    fn set_render_target(&mut self, rtv: ViewId, dsv: Option<ViewId>) -> Result<(), GpuError> {
        self.check_view(rtv)?;
        if let Some(dsv) = dsv {
            self.check_view(dsv)?;
        }
        self.record(Command::SetRenderTarget { rtv, dsv });
        Ok(())
    }

    fn clear_render_target(&mut self, rtv: ViewId, color: [f32; 4]) -> Result<(), GpuError> {
        self.check_view(rtv)?;
        self.record(Command::ClearRenderTarget { rtv, color });
        Ok(())
    }

    fn clear_depth_stencil(
        &mut self,
        dsv: ViewId,
        depth: f32,
        stencil: u8,
    ) -> Result<(), GpuError> {
        self.check_view(dsv)?;
        self.record(Command::ClearDepthStencil { dsv, depth, stencil });
        Ok(())
    }

    fn set_viewport(&mut self, viewport: Viewport) -> Result<(), GpuError> {
        self.record(Command::SetViewport(viewport));
        Ok(())
    }

    fn draw_mesh(
        &mut self,
        mesh: MeshId,
        texture: ViewId,
        view: Mat4,
        projection: Mat4,
    ) -> Result<(), GpuError> {
        if !self.stats.lock().meshes.contains_key(&mesh) {
            return Err(GpuError::UnknownHandle { kind: "mesh", id: mesh.0 });
        }
        self.check_view(texture)?;
        self.record(Command::Draw { mesh, texture, view, projection });
        Ok(())
    }

    fn copy_texture(&mut self, dst: TextureId, src: TextureId) -> Result<(), GpuError> {
        let dst_desc = self.texture_desc(dst)?;
        let src_desc = self.texture_desc(src)?;
        if (dst_desc.width, dst_desc.height) != (src_desc.width, src_desc.height) {
            return Err(anyhow!(
                "copy size mismatch: {}x{} -> {}x{}",
                src_desc.width,
                src_desc.height,
                dst_desc.width,
                dst_desc.height
            )
            .into());
        }
        self.record(Command::Copy { dst, src });
        Ok(())
    }

    fn blit_texture(
        &mut self,
        src: TextureId,
        src_rect: Rect,
        dst: TextureId,
        dst_rect: Rect,
    ) -> Result<(), GpuError> {
        self.texture_desc(src)?;
        self.texture_desc(dst)?;
        self.record(Command::Blit { src, src_rect, dst, dst_rect });
        Ok(())
    }

    fn present(&mut self, sync_interval: u32) -> Result<(), GpuError> {
        if self.stats.lock().swapchain.is_none() {
            return Err(GpuError::NoSwapchain);
        }
        self.record(Command::Present { sync_interval });
        self.stats.lock().presents += 1;
        Ok(())
    }

    fn set_multithread_protected(&mut self, enabled: bool) -> Result<(), GpuError> {
        if self.faults.no_multithread {
            return Err(GpuError::Unsupported("multithread protection"));
        }
        self.stats.lock().multithread_protected = enabled;
        Ok(())
    }

    fn set_maximum_frame_latency(&mut self, frames: u32) -> Result<(), GpuError> {
        self.stats.lock().max_frame_latency = Some(frames);
        Ok(())
    }
}

impl Drop for NullDevice {
    fn drop(&mut self) {
        let mut stats = self.stats.lock();
        if let Some(swapchain) = stats.swapchain.take() {
            stats.textures.remove(&swapchain.backbuffer);
        }
        stats.devices_dropped += 1;
    }
}
