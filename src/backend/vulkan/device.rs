// Vulkan implementation of the immediate-context device
//
// Commands are recorded into one command buffer as they arrive. Recording
// begins lazily on the first command after the previous submission retired,
// and ends at present. Image layouts are tracked per texture and fixed up
// with a barrier whenever a command needs a different one.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use ash::vk;
use ash::vk::Handle;
use glam::Mat4;
use raw_window_handle::RawWindowHandle;

use super::context::{DeviceContext, Instance};
use super::memory::{self, aspect, subresource_layers, subresource_range};
use super::pipeline::{self, Matrices, SpherePipeline};
use super::swapchain::Swapchain;
use super::sync::FrameSync;
use crate::backend::{
    AdapterInfo, ExternalTexture, GraphicsApi, GraphicsDevice, GraphicsRequirements, MeshData,
    MeshId, NativeDevice, Rect, TextureDesc, TextureFormat, TextureId, TextureUsage, ViewId,
    Viewport,
};
use crate::error::GpuError;

/// Vulkan entry point. The instance is created on first use and shared by
/// every device.
pub struct VulkanGraphics {
    app_name: String,
    enable_validation: bool,
    requirements: GraphicsRequirements,
    instance: Option<Arc<Instance>>,
}

impl VulkanGraphics {
    pub fn new(app_name: &str, enable_validation: bool) -> Self {
        Self {
            app_name: app_name.to_string(),
            enable_validation,
            requirements: GraphicsRequirements::default(),
            instance: None,
        }
    }

    fn instance(&mut self) -> anyhow::Result<Arc<Instance>> {
        if let Some(instance) = &self.instance {
            return Ok(instance.clone());
        }
        let instance = Instance::new(
            &self.app_name,
            self.enable_validation,
            &self.requirements.instance_extensions,
        )?;
        self.instance = Some(instance.clone());
        Ok(instance)
    }
}

impl GraphicsApi for VulkanGraphics {
    type Device = VulkanDevice;

    fn require(&mut self, requirements: &GraphicsRequirements) {
        if self.instance.is_some() && !requirements.instance_extensions.is_empty() {
            log::warn!("Instance already created, instance extensions only apply to a new one");
        }
        let merge = |have: &mut Vec<String>, want: &[String]| {
            for name in want {
                if !have.contains(name) {
                    log::debug!("Enabling Vulkan extension {}", name);
                    have.push(name.clone());
                }
            }
        };
        merge(
            &mut self.requirements.instance_extensions,
            &requirements.instance_extensions,
        );
        merge(
            &mut self.requirements.device_extensions,
            &requirements.device_extensions,
        );
    }

    fn enumerate_adapters(&mut self) -> Result<Vec<AdapterInfo>, GpuError> {
        let adapters = self.instance()?.adapters()?;
        for (_, info) in &adapters {
            log::debug!("Adapter {}: {} {:?}", info.index, info.name, info.luid);
        }
        Ok(adapters.into_iter().map(|(_, info)| info).collect())
    }

    fn create_device(&mut self, adapter: Option<&AdapterInfo>) -> Result<VulkanDevice, GpuError> {
        let instance = self.instance()?;
        let physical_device = match adapter {
            Some(info) => Some(
                instance
                    .adapters()?
                    .into_iter()
                    .find(|(_, a)| a.index == info.index)
                    .map(|(device, _)| device)
                    .ok_or_else(|| anyhow!("Adapter {} ({}) not found", info.index, info.name))?,
            ),
            None => None,
        };

        let ctx = DeviceContext::new(
            instance,
            physical_device,
            &self.requirements.device_extensions,
        )?;
        Ok(VulkanDevice::new(ctx)?)
    }
}

/// Layout a runtime hands its swapchain images over in, and expects back.
const IMPORTED_LAYOUT: vk::ImageLayout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;

struct Texture {
    image: vk::Image,
    /// `None` for imported images, which are never destroyed here
    memory: Option<vk::DeviceMemory>,
    desc: TextureDesc,
    layout: vk::ImageLayout,
}

enum View {
    /// `view` is `None` for the backbuffer, which is only ever cleared or copied to
    RenderTarget {
        texture: TextureId,
        view: Option<vk::ImageView>,
    },
    DepthStencil {
        texture: TextureId,
        view: vk::ImageView,
    },
    ShaderResource {
        view: vk::ImageView,
        set: vk::DescriptorSet,
    },
}

struct Mesh {
    vertex_buffer: vk::Buffer,
    vertex_memory: vk::DeviceMemory,
    index_buffer: vk::Buffer,
    index_memory: vk::DeviceMemory,
    index_count: u32,
}

struct Backbuffer {
    id: TextureId,
    swapchain: Swapchain,
    /// Acquired image index and its current layout
    acquired: Option<(u32, vk::ImageLayout)>,
}

pub struct VulkanDevice {
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    sync: FrameSync,
    render_pass: vk::RenderPass,
    pipeline: SpherePipeline,
    backbuffer: Option<Backbuffer>,
    textures: HashMap<TextureId, Texture>,
    views: HashMap<ViewId, View>,
    meshes: HashMap<MeshId, Mesh>,
    framebuffers: HashMap<(ViewId, ViewId), vk::Framebuffer>,
    target: Option<(ViewId, Option<ViewId>)>,
    viewport: Option<Viewport>,
    pass_extent: Option<vk::Extent2D>,
    recording: bool,
    next_id: u32,
    multithread_protected: bool,
    max_frame_latency: u32,
    ctx: DeviceContext,
}

impl VulkanDevice {
    pub fn new(ctx: DeviceContext) -> anyhow::Result<Self> {
        let device = &ctx.device;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(ctx.graphics_queue_family);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let created = (|| -> anyhow::Result<_> {
            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let command_buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
                .context("Failed to allocate command buffer")?[0];

            let sync = FrameSync::new(device)?;
            let render_pass = match pipeline::create_render_pass(device) {
                Ok(render_pass) => render_pass,
                Err(e) => {
                    sync.destroy(device);
                    return Err(e);
                }
            };
            match SpherePipeline::new(device, render_pass) {
                Ok(pipeline) => Ok((command_buffer, sync, render_pass, pipeline)),
                Err(e) => {
                    unsafe { device.destroy_render_pass(render_pass, None) };
                    sync.destroy(device);
                    Err(e)
                }
            }
        })();

        let (command_buffer, sync, render_pass, pipeline) = match created {
            Ok(objects) => objects,
            Err(e) => {
                unsafe { device.destroy_command_pool(command_pool, None) };
                return Err(e);
            }
        };

        Ok(Self {
            command_pool,
            command_buffer,
            sync,
            render_pass,
            pipeline,
            backbuffer: None,
            textures: HashMap::new(),
            views: HashMap::new(),
            meshes: HashMap::new(),
            framebuffers: HashMap::new(),
            target: None,
            viewport: None,
            pass_extent: None,
            recording: false,
            next_id: 0,
            multithread_protected: false,
            max_frame_latency: 1,
            ctx,
        })
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn begin_recording(&mut self) -> Result<(), GpuError> {
        if self.recording {
            return Ok(());
        }
        let device = &self.ctx.device;
        self.sync.wait(device)?;
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;
            device
                .begin_command_buffer(self.command_buffer, &begin_info)
                .context("Failed to begin command buffer")?;
        }
        self.recording = true;
        Ok(())
    }

    fn end_pass(&mut self) {
        if self.pass_extent.take().is_some() {
            unsafe { self.ctx.device.cmd_end_render_pass(self.command_buffer) };
        }
    }

    fn is_backbuffer(&self, texture: TextureId) -> bool {
        self.backbuffer.as_ref().is_some_and(|b| b.id == texture)
    }

    fn acquire(&mut self) -> Result<u32, GpuError> {
        self.begin_recording()?;
        let image_available = self.sync.image_available;
        let backbuffer = self.backbuffer.as_mut().ok_or(GpuError::NoSwapchain)?;
        if let Some((index, _)) = backbuffer.acquired {
            return Ok(index);
        }
        let (index, _) = backbuffer.swapchain.acquire_next_image(image_available)?;
        // Contents are overwritten every frame, nothing to preserve
        backbuffer.acquired = Some((index, vk::ImageLayout::UNDEFINED));
        Ok(index)
    }

    fn image_state(
        &mut self,
        texture: TextureId,
    ) -> Result<(vk::Image, TextureDesc, &mut vk::ImageLayout), GpuError> {
        if let Some(backbuffer) = self.backbuffer.as_mut().filter(|b| b.id == texture) {
            let extent = backbuffer.swapchain.extent;
            let images = &backbuffer.swapchain.images;
            let (index, layout) = backbuffer
                .acquired
                .as_mut()
                .ok_or_else(|| anyhow!("Backbuffer used before acquire"))?;
            let desc = TextureDesc {
                width: extent.width,
                height: extent.height,
                format: TextureFormat::Bgra8UnormSrgb,
                usage: TextureUsage::RENDER_TARGET,
            };
            return Ok((images[*index as usize], desc, layout));
        }

        let tex = self.textures.get_mut(&texture).ok_or(GpuError::UnknownHandle {
            kind: "texture",
            id: texture.0,
        })?;
        Ok((tex.image, tex.desc, &mut tex.layout))
    }

    /// Resolve `texture` to its image, moving it into `new_layout`.
    fn prepare(
        &mut self,
        texture: TextureId,
        new_layout: vk::ImageLayout,
    ) -> Result<(vk::Image, TextureDesc), GpuError> {
        self.begin_recording()?;
        self.end_pass();
        if self.is_backbuffer(texture) {
            self.acquire()?;
        }

        let (image, desc, old_layout) = {
            let (image, desc, layout) = self.image_state(texture)?;
            (image, desc, std::mem::replace(layout, new_layout))
        };

        if old_layout != new_layout {
            let barrier = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
                .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
                .old_layout(old_layout)
                .new_layout(new_layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(subresource_range(aspect(desc.format)))
                .build();
            unsafe {
                self.ctx.device.cmd_pipeline_barrier(
                    self.command_buffer,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }
        }
        Ok((image, desc))
    }

    /// End and submit the recording. An acquired backbuffer is presented;
    /// returns true when the swapchain no longer matches the window.
    fn submit(&mut self) -> Result<bool, GpuError> {
        if !self.recording {
            return Ok(false);
        }
        self.end_pass();

        let acquired = self
            .backbuffer
            .as_ref()
            .and_then(|b| b.acquired.map(|(index, _)| (b.id, index)));
        if let Some((id, _)) = acquired {
            self.prepare(id, vk::ImageLayout::PRESENT_SRC_KHR)?;
        }

        let device = &self.ctx.device;
        unsafe { device.end_command_buffer(self.command_buffer) }
            .context("Failed to end command buffer")?;
        self.recording = false;

        let command_buffers = [self.command_buffer];
        let wait_semaphores = [self.sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::TRANSFER];
        let signal_semaphores = [self.sync.render_finished];

        let mut submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
        if acquired.is_some() {
            submit_info = submit_info
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .signal_semaphores(&signal_semaphores);
        }

        unsafe {
            device
                .reset_fences(&[self.sync.in_flight_fence])
                .context("Failed to reset fence")?;
            device
                .queue_submit(
                    self.ctx.graphics_queue,
                    &[submit_info.build()],
                    self.sync.in_flight_fence,
                )
                .context("Failed to submit command buffer")?;
        }

        let (Some((_, index)), Some(backbuffer)) = (acquired, self.backbuffer.as_mut()) else {
            return Ok(false);
        };
        backbuffer.acquired = None;
        Ok(backbuffer
            .swapchain
            .present(self.ctx.graphics_queue, index, &signal_semaphores)?)
    }

    /// Flush pending work and wait for the GPU so resources can be destroyed.
    fn retire(&mut self) {
        if let Err(e) = self.submit() {
            log::warn!("Failed to flush commands before release: {}", e);
        }
        if let Err(e) = self.sync.wait(&self.ctx.device) {
            log::warn!("Failed to wait for GPU before release: {}", e);
        }
    }

    fn upload(&mut self, texture: TextureId, data: &[u8]) -> Result<(), GpuError> {
        let (staging, staging_memory) = memory::create_buffer_with_data(
            &self.ctx,
            vk::BufferUsageFlags::TRANSFER_SRC,
            data,
        )?;

        let result = (|| -> Result<(), GpuError> {
            let (image, desc) = self.prepare(texture, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
            let region = vk::BufferImageCopy::builder()
                .image_subresource(subresource_layers(aspect(desc.format)))
                .image_extent(vk::Extent3D {
                    width: desc.width,
                    height: desc.height,
                    depth: 1,
                })
                .build();
            unsafe {
                self.ctx.device.cmd_copy_buffer_to_image(
                    self.command_buffer,
                    staging,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            self.prepare(texture, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;
            self.submit()?;
            self.sync.wait(&self.ctx.device)?;
            Ok(())
        })();

        memory::destroy_buffer(&self.ctx, staging, staging_memory);
        result
    }

    fn view(&self, view: ViewId) -> Result<&View, GpuError> {
        self.views.get(&view).ok_or(GpuError::UnknownHandle {
            kind: "view",
            id: view.0,
        })
    }

    fn begin_pass(&mut self, rtv: ViewId, dsv: ViewId) -> Result<vk::Extent2D, GpuError> {
        if let Some(extent) = self.pass_extent {
            return Ok(extent);
        }

        let (color_texture, color_view) = match self.view(rtv)? {
            View::RenderTarget {
                texture,
                view: Some(view),
            } => (*texture, *view),
            View::RenderTarget { view: None, .. } => {
                return Err(GpuError::Unsupported("drawing into the backbuffer"))
            }
            _ => return Err(anyhow!("view {} is not a render target", rtv.0).into()),
        };
        let (depth_texture, depth_view) = match self.view(dsv)? {
            View::DepthStencil { texture, view } => (*texture, *view),
            _ => return Err(anyhow!("view {} is not a depth-stencil view", dsv.0).into()),
        };

        let (_, desc) = self.prepare(color_texture, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)?;
        self.prepare(
            depth_texture,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )?;
        let extent = vk::Extent2D {
            width: desc.width,
            height: desc.height,
        };

        let framebuffer = match self.framebuffers.get(&(rtv, dsv)) {
            Some(&framebuffer) => framebuffer,
            None => {
                let framebuffer = pipeline::create_framebuffer(
                    &self.ctx.device,
                    self.render_pass,
                    color_view,
                    depth_view,
                    extent,
                )?;
                self.framebuffers.insert((rtv, dsv), framebuffer);
                framebuffer
            }
        };

        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            });
        unsafe {
            self.ctx.device.cmd_begin_render_pass(
                self.command_buffer,
                &begin_info,
                vk::SubpassContents::INLINE,
            );
        }
        self.pass_extent = Some(extent);
        Ok(extent)
    }

    fn blit(
        &mut self,
        src: TextureId,
        src_rect: Option<Rect>,
        dst: TextureId,
        dst_rect: Option<Rect>,
    ) -> Result<(), GpuError> {
        let (src_image, src_desc) = self.prepare(src, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;
        let (dst_image, dst_desc) = self.prepare(dst, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;

        let src_rect = src_rect.unwrap_or(Rect::from_size(src_desc.width, src_desc.height));
        let dst_rect = dst_rect.unwrap_or(Rect::from_size(dst_desc.width, dst_desc.height));
        let offsets = |rect: Rect| {
            [
                vk::Offset3D {
                    x: rect.x,
                    y: rect.y,
                    z: 0,
                },
                vk::Offset3D {
                    x: rect.x + rect.width as i32,
                    y: rect.y + rect.height as i32,
                    z: 1,
                },
            ]
        };

        let region = vk::ImageBlit::builder()
            .src_subresource(subresource_layers(aspect(src_desc.format)))
            .src_offsets(offsets(src_rect))
            .dst_subresource(subresource_layers(aspect(dst_desc.format)))
            .dst_offsets(offsets(dst_rect))
            .build();

        unsafe {
            self.ctx.device.cmd_blit_image(
                self.command_buffer,
                src_image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                vk::Filter::LINEAR,
            );
        }
        Ok(())
    }

    fn destroy_texture(&self, texture: Texture) {
        if let Some(memory) = texture.memory {
            unsafe {
                self.ctx.device.destroy_image(texture.image, None);
                self.ctx.device.free_memory(memory, None);
            }
        }
    }

    fn destroy_view(&self, view: View) {
        let device = &self.ctx.device;
        match view {
            View::RenderTarget { view, .. } => {
                if let Some(view) = view {
                    unsafe { device.destroy_image_view(view, None) };
                }
            }
            View::DepthStencil { view, .. } => unsafe { device.destroy_image_view(view, None) },
            View::ShaderResource { view, set } => {
                self.pipeline.free_texture_set(device, set);
                unsafe { device.destroy_image_view(view, None) };
            }
        }
    }
}

impl GraphicsDevice for VulkanDevice {
    fn native_handle(&self) -> usize {
        self.ctx.device.handle().as_raw() as usize
    }

    fn native_device(&self) -> Option<NativeDevice> {
        Some(NativeDevice {
            instance: self.ctx.instance.instance.handle().as_raw(),
            physical_device: self.ctx.physical_device.as_raw(),
            device: self.ctx.device.handle().as_raw(),
            queue_family_index: self.ctx.graphics_queue_family,
            queue_index: 0,
        })
    }

    fn create_swapchain(
        &mut self,
        window: RawWindowHandle,
        width: u32,
        height: u32,
    ) -> Result<(), GpuError> {
        self.release_swapchain();

        let swapchain = Swapchain::new(&self.ctx, window, width, height)?;
        let id = TextureId(self.next_id());
        self.backbuffer = Some(Backbuffer {
            id,
            swapchain,
            acquired: None,
        });
        Ok(())
    }

    fn release_swapchain(&mut self) {
        if self.backbuffer.is_some() {
            self.retire();
            self.backbuffer = None;
        }
    }

    fn backbuffer(&self) -> Option<TextureId> {
        self.backbuffer.as_ref().map(|b| b.id)
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

        let (image, memory) = memory::create_image(&self.ctx, desc)?;
        let id = TextureId(self.next_id());
        self.textures.insert(
            id,
            Texture {
                image,
                memory: Some(memory),
                desc: *desc,
                layout: vk::ImageLayout::UNDEFINED,
            },
        );

        if let Some(data) = initial_data {
            if let Err(e) = self.upload(id, data) {
                self.release_texture(id);
                return Err(e);
            }
        }
        Ok(id)
    }

    fn export_texture(&self, texture: TextureId) -> Result<ExternalTexture, GpuError> {
        let tex = self.textures.get(&texture).ok_or(GpuError::UnknownHandle {
            kind: "texture",
            id: texture.0,
        })?;
        Ok(ExternalTexture {
            handle: tex.image.as_raw(),
            width: tex.desc.width,
            height: tex.desc.height,
            format: tex.desc.format,
        })
    }

    fn release_texture(&mut self, texture: TextureId) {
        if !self.textures.contains_key(&texture) {
            log::warn!("Released unknown texture {:?}", texture);
            return;
        }
        self.retire();
        if let Some(tex) = self.textures.remove(&texture) {
            self.destroy_texture(tex);
        }
    }

    fn import_texture(&mut self, handle: u64, desc: &TextureDesc) -> Result<TextureId, GpuError> {
        let id = TextureId(self.next_id());
        self.textures.insert(
            id,
            Texture {
                image: vk::Image::from_raw(handle),
                memory: None,
                desc: *desc,
                layout: IMPORTED_LAYOUT,
            },
        );
        Ok(id)
    }

    fn flush_texture(&mut self, texture: TextureId) -> Result<(), GpuError> {
        let imported = self
            .textures
            .get(&texture)
            .ok_or(GpuError::UnknownHandle {
                kind: "texture",
                id: texture.0,
            })?
            .memory
            .is_none();
        if imported {
            self.prepare(texture, IMPORTED_LAYOUT)?;
        }
        self.submit()?;
        self.sync.wait(&self.ctx.device)?;
        Ok(())
    }

    fn create_render_target_view(&mut self, texture: TextureId) -> Result<ViewId, GpuError> {
        let view = if self.is_backbuffer(texture) {
            None
        } else {
            let tex = self.textures.get(&texture).ok_or(GpuError::UnknownHandle {
                kind: "texture",
                id: texture.0,
            })?;
            if !tex.desc.usage.render_target {
                return Err(anyhow!("texture {} is not a render target", texture.0).into());
            }
            Some(memory::create_image_view(&self.ctx, tex.image, tex.desc.format)?)
        };

        let id = ViewId(self.next_id());
        self.views.insert(id, View::RenderTarget { texture, view });
        Ok(id)
    }

    fn create_depth_stencil_view(&mut self, texture: TextureId) -> Result<ViewId, GpuError> {
        let tex = self.textures.get(&texture).ok_or(GpuError::UnknownHandle {
            kind: "texture",
            id: texture.0,
        })?;
        if tex.desc.format != TextureFormat::D32Float {
            return Err(anyhow!("texture {} has no depth format", texture.0).into());
        }
        let view = memory::create_image_view(&self.ctx, tex.image, tex.desc.format)?;

        let id = ViewId(self.next_id());
        self.views.insert(id, View::DepthStencil { texture, view });
        Ok(id)
    }

    fn create_shader_resource_view(
        &mut self,
        texture: &ExternalTexture,
    ) -> Result<ViewId, GpuError> {
        let image = vk::Image::from_raw(texture.handle);
        let view = memory::create_image_view(&self.ctx, image, texture.format)?;
        let set = match self.pipeline.allocate_texture_set(&self.ctx.device, view) {
            Ok(set) => set,
            Err(e) => {
                unsafe { self.ctx.device.destroy_image_view(view, None) };
                return Err(e.into());
            }
        };

        let id = ViewId(self.next_id());
        self.views.insert(id, View::ShaderResource { view, set });
        Ok(id)
    }

    fn release_view(&mut self, view: ViewId) {
        if !self.views.contains_key(&view) {
            log::warn!("Released unknown view {:?}", view);
            return;
        }
        self.retire();

        let stale: Vec<_> = self
            .framebuffers
            .keys()
            .filter(|(color, depth)| *color == view || *depth == view)
            .copied()
            .collect();
        for key in stale {
            if let Some(framebuffer) = self.framebuffers.remove(&key) {
                unsafe { self.ctx.device.destroy_framebuffer(framebuffer, None) };
            }
        }
        if self.target.is_some_and(|(rtv, dsv)| rtv == view || dsv == Some(view)) {
            self.target = None;
        }

        if let Some(removed) = self.views.remove(&view) {
            self.destroy_view(removed);
        }
    }

    fn create_mesh(&mut self, mesh: &MeshData) -> Result<MeshId, GpuError> {
        let (vertex_buffer, vertex_memory) = memory::create_buffer_with_data(
            &self.ctx,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &mesh.vertices,
        )?;
        let (index_buffer, index_memory) = match memory::create_buffer_with_data(
            &self.ctx,
            vk::BufferUsageFlags::INDEX_BUFFER,
            &mesh.indices,
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                memory::destroy_buffer(&self.ctx, vertex_buffer, vertex_memory);
                return Err(e.into());
            }
        };

        let id = MeshId(self.next_id());
        self.meshes.insert(
            id,
            Mesh {
                vertex_buffer,
                vertex_memory,
                index_buffer,
                index_memory,
                index_count: mesh.indices.len() as u32,
            },
        );
        Ok(id)
    }

    fn release_mesh(&mut self, mesh: MeshId) {
        if !self.meshes.contains_key(&mesh) {
            log::warn!("Released unknown mesh {:?}", mesh);
            return;
        }
        self.retire();
        if let Some(mesh) = self.meshes.remove(&mesh) {
            memory::destroy_buffer(&self.ctx, mesh.vertex_buffer, mesh.vertex_memory);
            memory::destroy_buffer(&self.ctx, mesh.index_buffer, mesh.index_memory);
        }
    }

    fn set_render_target(&mut self, rtv: ViewId, dsv: Option<ViewId>) -> Result<(), GpuError> {
        self.view(rtv)?;
        if let Some(dsv) = dsv {
            self.view(dsv)?;
        }
        if self.target != Some((rtv, dsv)) {
            self.end_pass();
            self.target = Some((rtv, dsv));
        }
        Ok(())
    }

    fn clear_render_target(&mut self, rtv: ViewId, color: [f32; 4]) -> Result<(), GpuError> {
        let texture = match self.view(rtv)? {
            View::RenderTarget { texture, .. } => *texture,
            _ => return Err(anyhow!("view {} is not a render target", rtv.0).into()),
        };
        let (image, _) = self.prepare(texture, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
        let clear = vk::ClearColorValue { float32: color };
        unsafe {
            self.ctx.device.cmd_clear_color_image(
                self.command_buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear,
                &[subresource_range(vk::ImageAspectFlags::COLOR)],
            );
        }
        Ok(())
    }

    fn clear_depth_stencil(
        &mut self,
        dsv: ViewId,
        depth: f32,
        stencil: u8,
    ) -> Result<(), GpuError> {
        let texture = match self.view(dsv)? {
            View::DepthStencil { texture, .. } => *texture,
            _ => return Err(anyhow!("view {} is not a depth-stencil view", dsv.0).into()),
        };
        let (image, _) = self.prepare(texture, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
        let clear = vk::ClearDepthStencilValue {
            depth,
            stencil: stencil as u32,
        };
        unsafe {
            self.ctx.device.cmd_clear_depth_stencil_image(
                self.command_buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear,
                &[subresource_range(vk::ImageAspectFlags::DEPTH)],
            );
        }
        Ok(())
    }

    fn set_viewport(&mut self, viewport: Viewport) -> Result<(), GpuError> {
        self.viewport = Some(viewport);
        Ok(())
    }

    fn draw_mesh(
        &mut self,
        mesh: MeshId,
        texture: ViewId,
        view: Mat4,
        projection: Mat4,
    ) -> Result<(), GpuError> {
        let (rtv, dsv) = self
            .target
            .ok_or_else(|| anyhow!("draw without a render target"))?;
        let dsv = dsv.ok_or(GpuError::Unsupported("drawing without a depth buffer"))?;
        let set = match self.view(texture)? {
            View::ShaderResource { set, .. } => *set,
            _ => return Err(anyhow!("view {} is not a shader resource", texture.0).into()),
        };
        let (vertex_buffer, index_buffer, index_count) = self
            .meshes
            .get(&mesh)
            .map(|m| (m.vertex_buffer, m.index_buffer, m.index_count))
            .ok_or(GpuError::UnknownHandle {
                kind: "mesh",
                id: mesh.0,
            })?;

        let extent = self.begin_pass(rtv, dsv)?;
        let viewport = self.viewport.unwrap_or(Viewport::from(Rect::from_size(
            extent.width,
            extent.height,
        )));

        // Negative height flips y so clip space matches the projection's y-up
        let vk_viewport = vk::Viewport {
            x: viewport.x,
            y: viewport.y + viewport.height,
            width: viewport.width,
            height: -viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: viewport.x as i32,
                y: viewport.y as i32,
            },
            extent: vk::Extent2D {
                width: viewport.width as u32,
                height: viewport.height as u32,
            },
        };
        let matrices = Matrices { view, projection };

        let device = &self.ctx.device;
        let cb = self.command_buffer;
        unsafe {
            device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);
            device.cmd_set_viewport(cb, 0, &[vk_viewport]);
            device.cmd_set_scissor(cb, 0, &[scissor]);
            device.cmd_bind_descriptor_sets(
                cb,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout,
                0,
                &[set],
                &[],
            );
            device.cmd_push_constants(
                cb,
                self.pipeline.layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(&matrices),
            );
            device.cmd_bind_vertex_buffers(cb, 0, &[vertex_buffer], &[0]);
            device.cmd_bind_index_buffer(cb, index_buffer, 0, vk::IndexType::UINT32);
            device.cmd_draw_indexed(cb, index_count, 1, 0, 0, 0);
        }
        Ok(())
    }

    fn copy_texture(&mut self, dst: TextureId, src: TextureId) -> Result<(), GpuError> {
        // A blit rather than a copy: the backbuffer is BGRA, the mirror RGBA
        self.blit(src, None, dst, None)
    }

    fn blit_texture(
        &mut self,
        src: TextureId,
        src_rect: Rect,
        dst: TextureId,
        dst_rect: Rect,
    ) -> Result<(), GpuError> {
        self.blit(src, Some(src_rect), dst, Some(dst_rect))
    }

    /// The sync interval is fixed by the present mode chosen at swapchain creation.
    fn present(&mut self, _sync_interval: u32) -> Result<(), GpuError> {
        if self.backbuffer.is_none() {
            return Err(GpuError::NoSwapchain);
        }
        self.acquire()?;
        if self.submit()? {
            log::warn!("Swapchain out of date, waiting for the window size to be reset");
        }
        Ok(())
    }

    fn set_multithread_protected(&mut self, enabled: bool) -> Result<(), GpuError> {
        // Vulkan objects are externally synchronized; the flag only records intent
        self.multithread_protected = enabled;
        log::debug!("Multithread protection: {}", enabled);
        Ok(())
    }

    fn set_maximum_frame_latency(&mut self, frames: u32) -> Result<(), GpuError> {
        self.max_frame_latency = frames;
        log::debug!(
            "Maximum frame latency: {} (one submission is ever in flight)",
            frames
        );
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        if !self.textures.is_empty() || !self.views.is_empty() || !self.meshes.is_empty() {
            log::warn!(
                "Dropping device with {} textures, {} views, {} meshes still alive",
                self.textures.len(),
                self.views.len(),
                self.meshes.len()
            );
        }
        if let Err(e) = self.ctx.wait_idle() {
            log::error!("Failed to wait for device idle: {}", e);
        }

        let views: Vec<_> = self.views.drain().map(|(_, view)| view).collect();
        for view in views {
            self.destroy_view(view);
        }

        let device = &self.ctx.device;
        unsafe {
            for (_, framebuffer) in self.framebuffers.drain() {
                device.destroy_framebuffer(framebuffer, None);
            }
        }
        let textures: Vec<_> = self.textures.drain().map(|(_, tex)| tex).collect();
        for tex in textures {
            self.destroy_texture(tex);
        }
        for (_, mesh) in self.meshes.drain() {
            memory::destroy_buffer(&self.ctx, mesh.vertex_buffer, mesh.vertex_memory);
            memory::destroy_buffer(&self.ctx, mesh.index_buffer, mesh.index_memory);
        }
        self.backbuffer = None;

        let device = &self.ctx.device;
        self.pipeline.destroy(device);
        self.sync.destroy(device);
        unsafe {
            device.destroy_render_pass(self.render_pass, None);
            device.destroy_command_pool(self.command_pool, None);
        }
    }
}
