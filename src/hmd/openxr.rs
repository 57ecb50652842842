// OpenXR runtime - a real headset through the Khronos loader
//
// Uses XR_KHR_vulkan_enable (the legacy path): the runtime names the instance
// and device extensions it needs, the backend creates its own Vulkan device
// with them, and the XR session is created from that device's raw handles the
// first time a swap texture set is requested.
//
// Eye rings stay ordinary device textures so the device keeps its two-slot
// ring. On submit each eye is blitted into an acquired swapchain image, which
// is handed back to the compositor in COLOR_ATTACHMENT_OPTIMAL.

use std::collections::HashMap;
use std::time::Instant;

use anyhow::anyhow;
use ash::vk;
use glam::{Quat, Vec3};
use ::openxr as xr;

use super::{
    mirror_half, Eye, EyeRenderDesc, Extent, FovPort, HmdDesc, HmdRuntime, HmdSession,
    LayerEyeFov, MirrorTexture, SwapTextureSet, SwapTextureSetId, TrackingState,
};
use crate::backend::{
    vulkan, AdapterLuid, GraphicsDevice, GraphicsRequirements, Rect, TextureDesc, TextureFormat,
    TextureId, TextureUsage,
};
use crate::error::HmdError;
use crate::pose::Pose;
use crate::surface::EYE_RING_SIZE;

const VIEW_TYPE: xr::ViewConfigurationType = xr::ViewConfigurationType::PRIMARY_STEREO;

/// What OpenXR does not report before the first frame.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenXrConfig {
    pub application_name: String,
    /// Left eye FOV used until views are located; the right eye is mirrored.
    pub eye_fov: FovPort,
    pub ipd: f32,
    pub refresh_rate: f32,
}

impl Default for OpenXrConfig {
    fn default() -> Self {
        Self {
            application_name: "vr360-render".to_string(),
            eye_fov: FovPort {
                up_tan: 1.33,
                down_tan: 1.33,
                left_tan: 1.06,
                right_tan: 1.06,
            },
            ipd: 0.064,
            refresh_rate: 90.0,
        }
    }
}

fn xr_error(what: &'static str) -> impl FnOnce(xr::sys::Result) -> HmdError {
    move |result| HmdError::Runtime(anyhow!("{what} failed: {result}"))
}

pub struct OpenXrRuntime {
    config: OpenXrConfig,
    instance: Option<xr::Instance>,
}

impl OpenXrRuntime {
    pub fn new(config: OpenXrConfig) -> Self {
        Self {
            config,
            instance: None,
        }
    }
}

impl HmdRuntime for OpenXrRuntime {
    type Session = OpenXrSession;

    fn initialize(&mut self) -> Result<(), HmdError> {
        let entry = unsafe { xr::Entry::load() }
            .map_err(|e| anyhow!("Failed to load the OpenXR loader: {e}"))?;

        let available = entry
            .enumerate_extensions()
            .map_err(xr_error("xrEnumerateInstanceExtensionProperties"))?;
        if !available.khr_vulkan_enable {
            return Err(anyhow!("OpenXR runtime does not support XR_KHR_vulkan_enable").into());
        }
        let mut extensions = xr::ExtensionSet::default();
        extensions.khr_vulkan_enable = true;

        let instance = entry
            .create_instance(
                &xr::ApplicationInfo {
                    application_name: &self.config.application_name,
                    application_version: 0,
                    engine_name: "vr360-render",
                    engine_version: 0,
                    api_version: xr::Version::new(1, 0, 0),
                },
                &extensions,
                &[],
            )
            .map_err(xr_error("xrCreateInstance"))?;

        if let Ok(props) = instance.properties() {
            log::info!(
                "OpenXR runtime: {} {}",
                props.runtime_name,
                props.runtime_version
            );
        }
        self.instance = Some(instance);
        Ok(())
    }

    fn create_session(&mut self) -> Result<(OpenXrSession, AdapterLuid), HmdError> {
        let instance = self.instance.clone().ok_or(HmdError::NotInitialized)?;
        let system = match instance.system(xr::FormFactor::HEAD_MOUNTED_DISPLAY) {
            Ok(system) => system,
            Err(xr::sys::Result::ERROR_FORM_FACTOR_UNAVAILABLE) => return Err(HmdError::NoHmd),
            Err(e) => return Err(xr_error("xrGetSystem")(e)),
        };
        let system_name = instance
            .system_properties(system)
            .map(|props| props.system_name)
            .unwrap_or_else(|_| "OpenXR HMD".to_string());

        // Must be queried before a session may be created
        let vk_requirements = instance
            .graphics_requirements::<xr::Vulkan>(system)
            .map_err(xr_error("xrGetVulkanGraphicsRequirementsKHR"))?;
        log::debug!(
            "OpenXR Vulkan API range: {}..={}",
            vk_requirements.min_api_version_supported,
            vk_requirements.max_api_version_supported
        );

        let requirements = GraphicsRequirements {
            instance_extensions: split_extensions(
                &instance
                    .vulkan_legacy_instance_extensions(system)
                    .map_err(xr_error("xrGetVulkanInstanceExtensionsKHR"))?,
            ),
            device_extensions: split_extensions(
                &instance
                    .vulkan_legacy_device_extensions(system)
                    .map_err(xr_error("xrGetVulkanDeviceExtensionsKHR"))?,
            ),
        };

        let adapter = vulkan::select_adapter(&requirements.instance_extensions, |vk_instance| {
            let physical = unsafe {
                instance.vulkan_graphics_device(system, vk_instance as usize as _)
            }
            .map_err(|e| anyhow!("xrGetVulkanGraphicsDeviceKHR failed: {e}"))?;
            Ok(physical as usize as u64)
        })?;
        let luid = match adapter {
            Some(adapter) => {
                log::info!("OpenXR runtime wants adapter {} ({})", adapter.index, adapter.name);
                adapter.luid
            }
            None => AdapterLuid::default(),
        };

        let views = instance
            .enumerate_view_configuration_views(system, VIEW_TYPE)
            .map_err(xr_error("xrEnumerateViewConfigurationViews"))?;
        let [left, ..] = views.as_slice() else {
            return Err(anyhow!("OpenXR system reports no stereo views").into());
        };
        let recommended = Extent {
            width: left.recommended_image_rect_width,
            height: left.recommended_image_rect_height,
        };
        let blend_mode = instance
            .enumerate_environment_blend_modes(system, VIEW_TYPE)
            .map_err(xr_error("xrEnumerateEnvironmentBlendModes"))?
            .first()
            .copied()
            .unwrap_or(xr::EnvironmentBlendMode::OPAQUE);

        let session = OpenXrSession {
            config: self.config.clone(),
            instance,
            system,
            system_name,
            recommended,
            blend_mode,
            requirements,
            xr: None,
            swapchains: HashMap::new(),
            mirror: None,
            frame: None,
            events: xr::EventDataBuffer::new(),
            epoch: Instant::now(),
            last_display_time: 0.0,
            next_id: 0,
        };
        Ok((session, luid))
    }

    fn shutdown(&mut self) {
        if self.instance.take().is_some() {
            log::info!("OpenXR runtime shut down");
        }
    }
}

/// The XR session proper, bound to one Vulkan device.
struct XrSession {
    session: xr::Session<xr::Vulkan>,
    frame_waiter: xr::FrameWaiter,
    frame_stream: xr::FrameStream<xr::Vulkan>,
    local: xr::Space,
    view: xr::Space,
    running: bool,
}

struct EyeSwapchain {
    swapchain: xr::Swapchain<xr::Vulkan>,
    /// Compositor images, imported into the device.
    images: Vec<TextureId>,
    /// Ring the device renders into.
    ring: Vec<TextureId>,
    width: u32,
    height: u32,
}

impl EyeSwapchain {
    fn release<D: GraphicsDevice>(self, device: &mut D) {
        for texture in self.ring.into_iter().chain(self.images) {
            device.release_texture(texture);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MirrorTarget {
    id: u32,
    texture: TextureId,
    width: u32,
    height: u32,
}

pub struct OpenXrSession {
    config: OpenXrConfig,
    instance: xr::Instance,
    system: xr::SystemId,
    system_name: String,
    /// Per-eye image size at a pixel density of one.
    recommended: Extent,
    blend_mode: xr::EnvironmentBlendMode,
    requirements: GraphicsRequirements,
    xr: Option<XrSession>,
    swapchains: HashMap<SwapTextureSetId, EyeSwapchain>,
    mirror: Option<MirrorTarget>,
    /// Frame begun by `predicted_display_time`, ended by `submit_frame`.
    frame: Option<xr::FrameState>,
    events: xr::EventDataBuffer,
    epoch: Instant,
    last_display_time: f64,
    next_id: u32,
}

impl OpenXrSession {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn eye_fov(&self, eye: Eye) -> FovPort {
        match eye {
            Eye::Left => self.config.eye_fov,
            Eye::Right => self.config.eye_fov.mirrored(),
        }
    }

    fn bind<D: GraphicsDevice>(&mut self, device: &D) -> Result<&mut XrSession, HmdError> {
        if self.xr.is_none() {
            let native = device
                .native_device()
                .ok_or_else(|| anyhow!("OpenXR needs a Vulkan device"))?;
            let create_info = xr::vulkan::SessionCreateInfo {
                instance: native.instance as usize as _,
                physical_device: native.physical_device as usize as _,
                device: native.device as usize as _,
                queue_family_index: native.queue_family_index,
                queue_index: native.queue_index,
            };
            let (session, frame_waiter, frame_stream) = unsafe {
                self.instance
                    .create_session::<xr::Vulkan>(self.system, &create_info)
            }
            .map_err(xr_error("xrCreateSession"))?;
            let local = session
                .create_reference_space(xr::ReferenceSpaceType::LOCAL, xr::Posef::IDENTITY)
                .map_err(xr_error("xrCreateReferenceSpace"))?;
            let view = session
                .create_reference_space(xr::ReferenceSpaceType::VIEW, xr::Posef::IDENTITY)
                .map_err(xr_error("xrCreateReferenceSpace"))?;
            log::info!("OpenXR session created on {}", self.system_name);
            self.xr = Some(XrSession {
                session,
                frame_waiter,
                frame_stream,
                local,
                view,
                running: false,
            });
        }
        self.xr
            .as_mut()
            .ok_or_else(|| anyhow!("OpenXR session missing").into())
    }

    /// Drain the event queue, starting and stopping the session as asked.
    fn poll_events(&mut self) -> Result<(), HmdError> {
        let Some(xr) = self.xr.as_mut() else {
            return Ok(());
        };
        while let Some(event) = self
            .instance
            .poll_event(&mut self.events)
            .map_err(xr_error("xrPollEvent"))?
        {
            match event {
                xr::Event::SessionStateChanged(change) => {
                    let state = change.state();
                    log::info!("OpenXR session state {:?}", state);
                    match state {
                        xr::SessionState::READY => {
                            xr.session.begin(VIEW_TYPE).map_err(xr_error("xrBeginSession"))?;
                            xr.running = true;
                        }
                        xr::SessionState::STOPPING => {
                            xr.session.end().map_err(xr_error("xrEndSession"))?;
                            xr.running = false;
                        }
                        xr::SessionState::EXITING | xr::SessionState::LOSS_PENDING => {
                            xr.running = false;
                        }
                        _ => {}
                    }
                }
                xr::Event::InstanceLossPending(_) => {
                    xr.running = false;
                    return Err(anyhow!("OpenXR instance is being lost").into());
                }
                xr::Event::EventsLost(lost) => {
                    log::warn!("OpenXR dropped {} events", lost.lost_event_count());
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn composite_eye<D: GraphicsDevice>(
        &self,
        device: &mut D,
        eye: Eye,
        source: TextureId,
        viewport: Rect,
    ) -> Result<(), HmdError> {
        let Some(mirror) = self.mirror else {
            return Ok(());
        };
        let dst = mirror_half(eye, mirror.width, mirror.height);
        device
            .blit_texture(source, viewport, mirror.texture, dst)
            .map_err(HmdError::Texture)
    }

    fn ring_texture(&self, layer: &LayerEyeFov, eye: Eye) -> Result<TextureId, HmdError> {
        let texture_ref = layer.color_texture[eye.index()];
        let chain = self
            .swapchains
            .get(&texture_ref.set)
            .ok_or(HmdError::UnknownTextureSet(texture_ref.set.0))?;
        chain
            .ring
            .get(texture_ref.index)
            .copied()
            .ok_or(HmdError::InvalidLayer {
                index: texture_ref.index,
                len: chain.ring.len(),
            })
    }

    /// Copy one eye into the next compositor image of its swapchain.
    fn hand_over<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
        layer: &LayerEyeFov,
        eye: Eye,
    ) -> Result<(), HmdError> {
        let source = self.ring_texture(layer, eye)?;
        let set = layer.color_texture[eye.index()].set;
        let chain = self
            .swapchains
            .get_mut(&set)
            .ok_or(HmdError::UnknownTextureSet(set.0))?;

        let index = chain
            .swapchain
            .acquire_image()
            .map_err(xr_error("xrAcquireSwapchainImage"))? as usize;
        chain
            .swapchain
            .wait_image(xr::Duration::INFINITE)
            .map_err(xr_error("xrWaitSwapchainImage"))?;
        let image = *chain.images.get(index).ok_or(HmdError::InvalidLayer {
            index,
            len: chain.images.len(),
        })?;
        let full = Rect::from_size(chain.width, chain.height);
        let copied = device
            .blit_texture(source, layer.viewport[eye.index()], image, full)
            .and_then(|()| device.flush_texture(image));
        // Released even on failure so the swapchain is not left acquired
        chain
            .swapchain
            .release_image()
            .map_err(xr_error("xrReleaseSwapchainImage"))?;
        copied.map_err(HmdError::Texture)
    }
}

impl HmdSession for OpenXrSession {
    fn hmd_desc(&self) -> HmdDesc {
        HmdDesc {
            product_name: self.system_name.clone(),
            resolution: Extent {
                width: self.recommended.width * 2,
                height: self.recommended.height,
            },
            default_eye_fov: [self.eye_fov(Eye::Left), self.eye_fov(Eye::Right)],
            display_refresh_rate: self.config.refresh_rate,
        }
    }

    fn graphics_requirements(&self) -> GraphicsRequirements {
        self.requirements.clone()
    }

    fn fov_texture_size(&self, eye: Eye, fov: &FovPort, pixels_per_display_pixel: f32) -> Extent {
        scaled_extent(self.recommended, &self.eye_fov(eye), fov, pixels_per_display_pixel)
    }

    fn render_desc(&self, eye: Eye, fov: &FovPort) -> EyeRenderDesc {
        let half_ipd = self.config.ipd * 0.5;
        let x = match eye {
            Eye::Left => -half_ipd,
            Eye::Right => half_ipd,
        };
        EyeRenderDesc {
            eye,
            fov: *fov,
            hmd_to_eye_offset: Vec3::new(x, 0.0, 0.0),
        }
    }

    fn create_swap_texture_set<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
        desc: &TextureDesc,
    ) -> Result<SwapTextureSet, HmdError> {
        let xr = self.bind(device)?;
        let swapchain = xr
            .session
            .create_swapchain(&xr::SwapchainCreateInfo {
                create_flags: xr::SwapchainCreateFlags::EMPTY,
                usage_flags: xr::SwapchainUsageFlags::COLOR_ATTACHMENT
                    | xr::SwapchainUsageFlags::TRANSFER_DST,
                format: swapchain_format(desc.format),
                sample_count: 1,
                width: desc.width,
                height: desc.height,
                face_count: 1,
                array_size: 1,
                mip_count: 1,
            })
            .map_err(xr_error("xrCreateSwapchain"))?;
        let handles = swapchain
            .enumerate_images()
            .map_err(xr_error("xrEnumerateSwapchainImages"))?;

        let mut chain = EyeSwapchain {
            swapchain,
            images: Vec::with_capacity(handles.len()),
            ring: Vec::with_capacity(EYE_RING_SIZE),
            width: desc.width,
            height: desc.height,
        };
        let image_desc = TextureDesc {
            usage: TextureUsage::RENDER_TARGET,
            ..*desc
        };
        for handle in handles {
            match device.import_texture(handle, &image_desc) {
                Ok(texture) => chain.images.push(texture),
                Err(e) => {
                    chain.release(device);
                    return Err(HmdError::Texture(e));
                }
            }
        }
        for _ in 0..EYE_RING_SIZE {
            match device.create_texture(desc, None) {
                Ok(texture) => chain.ring.push(texture),
                Err(e) => {
                    chain.release(device);
                    return Err(HmdError::Texture(e));
                }
            }
        }

        let id = SwapTextureSetId(self.next_id());
        let textures = chain.ring.clone();
        log::debug!(
            "OpenXR swapchain {:?}: {}x{}, {} images",
            id,
            desc.width,
            desc.height,
            chain.images.len()
        );
        self.swapchains.insert(id, chain);
        Ok(SwapTextureSet { id, textures })
    }

    fn destroy_swap_texture_set<D: GraphicsDevice>(&mut self, device: &mut D, set: SwapTextureSet) {
        match self.swapchains.remove(&set.id) {
            Some(chain) => chain.release(device),
            None => log::warn!("Destroying unknown swap texture set {:?}", set.id),
        }
    }

    fn create_mirror_texture<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
        desc: &TextureDesc,
    ) -> Result<MirrorTexture, HmdError> {
        let texture = device.create_texture(desc, None).map_err(HmdError::Texture)?;
        let id = self.next_id();
        self.mirror = Some(MirrorTarget {
            id,
            texture,
            width: desc.width,
            height: desc.height,
        });
        Ok(MirrorTexture {
            id,
            texture,
            width: desc.width,
            height: desc.height,
        })
    }

    fn destroy_mirror_texture<D: GraphicsDevice>(&mut self, device: &mut D, mirror: MirrorTexture) {
        if self.mirror.is_some_and(|m| m.id == mirror.id) {
            self.mirror = None;
        }
        device.release_texture(mirror.texture);
    }

    fn predicted_display_time(&mut self, _frame_index: u64) -> Result<f64, HmdError> {
        self.poll_events()?;
        let running = self.xr.as_ref().is_some_and(|xr| xr.running);
        let time = match self.xr.as_mut() {
            Some(xr) if running => {
                let state = xr.frame_waiter.wait().map_err(xr_error("xrWaitFrame"))?;
                xr.frame_stream.begin().map_err(xr_error("xrBeginFrame"))?;
                let time = seconds_from_time(state.predicted_display_time);
                self.frame = Some(state);
                time
            }
            // Not shown yet: run on the wall clock so the mirror keeps updating
            _ => self.epoch.elapsed().as_secs_f64(),
        };
        self.last_display_time = time;
        Ok(time)
    }

    /// OpenXR has no portable clock query; the last predicted display time
    /// stands in for "now".
    fn time_in_seconds(&self) -> f64 {
        self.last_display_time
    }

    fn tracking_state(&self, abs_time: f64, _latency_marker: bool) -> TrackingState {
        let untracked = TrackingState {
            head_pose: Pose::IDENTITY,
            sample_time: abs_time,
            orientation_tracked: false,
            position_tracked: false,
        };
        let Some(xr) = self.xr.as_ref().filter(|xr| xr.running) else {
            return untracked;
        };
        match xr.view.locate(&xr.local, time_from_seconds(abs_time)) {
            Ok(location) => {
                let flags = location.location_flags;
                TrackingState {
                    head_pose: pose_from_xr(&location.pose),
                    sample_time: abs_time,
                    orientation_tracked: flags
                        .contains(xr::SpaceLocationFlags::ORIENTATION_TRACKED),
                    position_tracked: flags.contains(xr::SpaceLocationFlags::POSITION_TRACKED),
                }
            }
            Err(e) => {
                log::warn!("xrLocateSpace failed: {e}");
                untracked
            }
        }
    }

    fn submit_frame<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
        _frame_index: u64,
        layers: &[LayerEyeFov],
    ) -> Result<(), HmdError> {
        for layer in layers {
            for eye in Eye::ALL {
                let texture = self.ring_texture(layer, eye)?;
                self.composite_eye(device, eye, texture, layer.viewport[eye.index()])?;
            }
        }

        let Some(state) = self.frame.take() else {
            return Ok(());
        };
        if state.should_render {
            for layer in layers {
                for eye in Eye::ALL {
                    self.hand_over(device, layer, eye)?;
                }
            }
        }

        let Some(xr) = self.xr.as_mut() else {
            return Ok(());
        };
        let mut projection_views = Vec::with_capacity(layers.len());
        if state.should_render {
            for layer in layers {
                let mut views = Vec::with_capacity(2);
                for eye in Eye::ALL {
                    let i = eye.index();
                    let set = layer.color_texture[i].set;
                    let chain = self
                        .swapchains
                        .get(&set)
                        .ok_or(HmdError::UnknownTextureSet(set.0))?;
                    let rect = xr::Rect2Di {
                        offset: xr::Offset2Di { x: 0, y: 0 },
                        extent: xr::Extent2Di {
                            width: chain.width as i32,
                            height: chain.height as i32,
                        },
                    };
                    views.push(
                        xr::CompositionLayerProjectionView::new()
                            .pose(pose_to_xr(&layer.render_pose[i]))
                            .fov(fov_to_xr(&layer.fov[i]))
                            .sub_image(
                                xr::SwapchainSubImage::new()
                                    .swapchain(&chain.swapchain)
                                    .image_array_index(0)
                                    .image_rect(rect),
                            ),
                    );
                }
                projection_views.push(views);
            }
        }
        let projections: Vec<_> = projection_views
            .iter()
            .map(|views| {
                xr::CompositionLayerProjection::new()
                    .space(&xr.local)
                    .views(views)
            })
            .collect();
        let composition: Vec<&xr::CompositionLayerBase<xr::Vulkan>> =
            projections.iter().map(|layer| &**layer).collect();

        xr.frame_stream
            .end(state.predicted_display_time, self.blend_mode, &composition)
            .map_err(xr_error("xrEndFrame"))
    }

    fn detach_device(&mut self) {
        self.frame = None;
        self.mirror = None;
        if !self.swapchains.is_empty() {
            log::warn!("{} OpenXR swapchains outlived the device", self.swapchains.len());
            self.swapchains.clear();
        }
        if let Some(xr) = self.xr.take() {
            if xr.running {
                if let Err(e) = xr.session.request_exit() {
                    log::warn!("xrRequestExitSession failed: {e}");
                }
            }
            log::info!("OpenXR session released");
        }
    }

    fn destroy(mut self) {
        self.detach_device();
        log::info!("OpenXR session destroyed");
    }
}

/// Runtime extension lists are single strings separated by spaces.
fn split_extensions(list: &str) -> Vec<String> {
    list.split_whitespace().map(str::to_owned).collect()
}

/// Vulkan format a swapchain must use to receive eye textures of `format`.
fn swapchain_format(format: TextureFormat) -> u32 {
    let format = match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
        TextureFormat::D32Float => vk::Format::D32_SFLOAT,
    };
    format.as_raw() as u32
}

/// Scale the runtime's recommended size by how much of the default frustum
/// `fov` covers and by the requested density.
fn scaled_extent(recommended: Extent, default: &FovPort, fov: &FovPort, density: f32) -> Extent {
    let x = (fov.left_tan + fov.right_tan) / (default.left_tan + default.right_tan);
    let y = (fov.up_tan + fov.down_tan) / (default.up_tan + default.down_tan);
    let width = (recommended.width as f32 * x * density).round();
    let height = (recommended.height as f32 * y * density).round();
    Extent {
        width: (width as u32).max(1),
        height: (height as u32).max(1),
    }
}

/// Tangents to signed half angles: left and down are negative.
fn fov_to_xr(fov: &FovPort) -> xr::Fovf {
    xr::Fovf {
        angle_left: -fov.left_tan.atan(),
        angle_right: fov.right_tan.atan(),
        angle_up: fov.up_tan.atan(),
        angle_down: -fov.down_tan.atan(),
    }
}

fn pose_to_xr(pose: &Pose) -> xr::Posef {
    let q = pose.orientation;
    let p = pose.position;
    xr::Posef {
        orientation: xr::Quaternionf {
            x: q.x,
            y: q.y,
            z: q.z,
            w: q.w,
        },
        position: xr::Vector3f {
            x: p.x,
            y: p.y,
            z: p.z,
        },
    }
}

fn pose_from_xr(pose: &xr::Posef) -> Pose {
    let q = &pose.orientation;
    let p = &pose.position;
    Pose::new(
        Quat::from_xyzw(q.x, q.y, q.z, q.w).normalize(),
        Vec3::new(p.x, p.y, p.z),
    )
}

fn time_from_seconds(seconds: f64) -> xr::Time {
    xr::Time::from_nanos((seconds * 1e9).round() as i64)
}

fn seconds_from_time(time: xr::Time) -> f64 {
    time.as_nanos() as f64 / 1e9
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-5;

    #[test]
    fn test_extension_list_is_split_on_whitespace() {
        let list = "VK_KHR_external_memory  VK_KHR_dedicated_allocation\tVK_KHR_win32_keyed_mutex ";
        assert_eq!(
            split_extensions(list),
            vec![
                "VK_KHR_external_memory",
                "VK_KHR_dedicated_allocation",
                "VK_KHR_win32_keyed_mutex",
            ]
        );
        assert!(split_extensions("").is_empty());
    }

    #[test]
    fn test_fov_angles_are_signed() {
        let fov = FovPort {
            up_tan: 1.0,
            down_tan: 0.5,
            left_tan: 1.2,
            right_tan: 0.8,
        };
        let angles = fov_to_xr(&fov);
        assert!((angles.angle_up - std::f32::consts::FRAC_PI_4).abs() < EPSILON);
        assert!((angles.angle_down + 0.5f32.atan()).abs() < EPSILON);
        assert!((angles.angle_left + 1.2f32.atan()).abs() < EPSILON);
        assert!((angles.angle_right - 0.8f32.atan()).abs() < EPSILON);
    }

    #[test]
    fn test_pose_survives_conversion() {
        let pose = Pose::new(
            Quat::from_rotation_y(0.9) * Quat::from_rotation_x(0.4),
            Vec3::new(0.1, 1.6, -0.2),
        );
        let back = pose_from_xr(&pose_to_xr(&pose));
        assert!(back.orientation.abs_diff_eq(pose.orientation, EPSILON));
        assert!(back.position.abs_diff_eq(pose.position, EPSILON));
    }

    #[test]
    fn test_time_is_nanoseconds() {
        let time = time_from_seconds(1.5);
        assert_eq!(time.as_nanos(), 1_500_000_000);
        assert_eq!(seconds_from_time(time), 1.5);
    }

    #[test]
    fn test_texture_size_follows_fov_and_density() {
        let config = OpenXrConfig::default();
        let recommended = Extent {
            width: 1440,
            height: 1600,
        };
        let same = scaled_extent(recommended, &config.eye_fov, &config.eye_fov, 1.0);
        assert_eq!(same, recommended);

        let dense = scaled_extent(recommended, &config.eye_fov, &config.eye_fov, 1.5);
        assert_eq!(dense, Extent { width: 2160, height: 2400 });

        let narrow = FovPort {
            left_tan: config.eye_fov.left_tan * 0.5,
            right_tan: config.eye_fov.right_tan * 0.5,
            ..config.eye_fov
        };
        let half = scaled_extent(recommended, &config.eye_fov, &narrow, 1.0);
        assert_eq!(half, Extent { width: 720, height: 1600 });
    }

    #[test]
    fn test_swapchain_formats_match_eye_formats() {
        assert_eq!(
            swapchain_format(TextureFormat::Rgba8UnormSrgb),
            vk::Format::R8G8B8A8_SRGB.as_raw() as u32
        );
        assert_eq!(
            swapchain_format(TextureFormat::Bgra8UnormSrgb),
            vk::Format::B8G8R8A8_SRGB.as_raw() as u32
        );
    }
}
