// VR device - lifecycle of the GPU context, HMD session and eye resources
//
// Creation order (init):  runtime -> session -> GPU device -> eye rings and
//                         depth -> mirror -> sphere -> camera -> eye descs
// Swapchain (reset):      window swapchain -> backbuffer view -> latency
// Destruction (close):    exact reverse, tolerating anything left unbuilt
//
// A failed init leaves whatever it built in place; `close` releases exactly
// those pieces.

use std::sync::Arc;

use raw_window_handle::RawWindowHandle;

use crate::backend::{
    ExternalTexture, GraphicsApi, GraphicsDevice, Rect, TextureDesc, TextureFormat, TextureId,
    TextureUsage, ViewId,
};
use crate::camera::{CameraModel, DEFAULT_MOVE_STEP, DEFAULT_TURN_STEP};
use crate::error::{DeviceError, GpuError, InitStage};
use crate::hmd::{Eye, EyeRenderDesc, HmdDesc, HmdRuntime, HmdSession, MirrorTexture};
use crate::input::{InputState, KeyBindings, KeyMessage, PlaybackSignals};
use crate::scene::{SphereScene, DEFAULT_RADIUS, DEFAULT_TESSELLATION};
use crate::surface::{DepthSurface, EyeSurfaceSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Uninitialized,
    Initialized,
    Rendering,
    Closed,
}

/// Handle kinds exchanged with the frame allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleType {
    GraphicsDevice,
    DeviceWindow,
    DeviceManager,
    VaDisplay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeHandle {
    Device(usize),
    Window(RawWindowHandle),
}

/// Tunables that do not come from the HMD.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSettings {
    pub clear_color: [f32; 4],
    pub move_step: f32,
    pub turn_step: f32,
    pub sphere_radius: f32,
    pub sphere_tessellation: u32,
    /// Eye render target density relative to the display, 1.0 = native.
    pub pixel_density: f32,
    pub key_bindings: KeyBindings,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 0.0],
            move_step: DEFAULT_MOVE_STEP,
            turn_step: DEFAULT_TURN_STEP,
            sphere_radius: DEFAULT_RADIUS,
            sphere_tessellation: DEFAULT_TESSELLATION,
            pixel_density: 1.0,
            key_bindings: KeyBindings::default(),
        }
    }
}

/// Device plus the window-dependent pieces rebuilt by `reset`.
pub(crate) struct GpuContext<D> {
    pub(crate) device: D,
    pub(crate) backbuffer_view: Option<ViewId>,
}

/// A texture the device created for a frame source, e.g. a still image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTexture {
    pub id: TextureId,
    pub texture: ExternalTexture,
}

fn mirror_desc(width: u32, height: u32) -> TextureDesc {
    TextureDesc {
        width,
        height,
        format: TextureFormat::Rgba8UnormSrgb,
        usage: TextureUsage::RENDER_TARGET,
    }
}

pub struct VrDevice<A: GraphicsApi, R: HmdRuntime> {
    pub(crate) api: A,
    pub(crate) runtime: R,
    pub(crate) settings: DeviceSettings,
    pub(crate) state: DeviceState,
    pub(crate) window: Option<RawWindowHandle>,
    pub(crate) window_size: (u32, u32),

    pub(crate) runtime_started: bool,
    pub(crate) session: Option<R::Session>,
    pub(crate) hmd_desc: Option<HmdDesc>,
    pub(crate) gpu: Option<GpuContext<A::Device>>,
    pub(crate) eye_surfaces: [Option<EyeSurfaceSet>; 2],
    pub(crate) depth_surfaces: [Option<DepthSurface>; 2],
    pub(crate) viewports: [Rect; 2],
    pub(crate) mirror: Option<MirrorTexture>,
    pub(crate) scene: Option<SphereScene>,
    pub(crate) camera: CameraModel,
    pub(crate) eye_render_desc: Option<[EyeRenderDesc; 2]>,

    pub(crate) input: InputState,
    pub(crate) frame_index: u64,
}

impl<A: GraphicsApi, R: HmdRuntime> VrDevice<A, R> {
    pub fn new(api: A, runtime: R, settings: DeviceSettings, signals: Arc<PlaybackSignals>) -> Self {
        let input = InputState::new(settings.key_bindings.clone(), signals);
        Self {
            api,
            runtime,
            settings,
            state: DeviceState::Uninitialized,
            window: None,
            window_size: (0, 0),
            runtime_started: false,
            session: None,
            hmd_desc: None,
            gpu: None,
            eye_surfaces: [None, None],
            depth_surfaces: [None, None],
            viewports: [Rect::default(); 2],
            mirror: None,
            scene: None,
            camera: CameraModel::default(),
            eye_render_desc: None,
            input,
            frame_index: 0,
        }
    }

    /// Bring up the HMD session, the GPU device and every eye resource.
    ///
    /// The swapchain is not created here; call `reset` next.
    pub fn init(&mut self, window: RawWindowHandle) -> Result<(), DeviceError> {
        if self.state != DeviceState::Uninitialized || self.runtime_started {
            return Err(DeviceError::InvalidState {
                operation: "init",
                state: self.state,
            });
        }
        self.window = Some(window);

        self.runtime
            .initialize()
            .map_err(|e| DeviceError::init(InitStage::RuntimeStart, e))?;
        self.runtime_started = true;

        let (session, luid) = self
            .runtime
            .create_session()
            .map_err(|e| DeviceError::init(InitStage::SessionCreate, e))?;
        let desc = session.hmd_desc();
        log::info!(
            "HMD: {} {}x{} @ {} Hz",
            desc.product_name,
            desc.resolution.width,
            desc.resolution.height,
            desc.display_refresh_rate
        );
        let session = self.session.insert(session);

        // Desktop window mirrors the HMD at half resolution
        self.window_size = (desc.resolution.width / 2, desc.resolution.height / 2);

        let requirements = session.graphics_requirements();
        if !requirements.is_empty() {
            log::info!(
                "HMD requires instance extensions {:?}, device extensions {:?}",
                requirements.instance_extensions,
                requirements.device_extensions
            );
        }
        self.api.require(&requirements);

        let adapters = self
            .api
            .enumerate_adapters()
            .map_err(|e| DeviceError::init(InitStage::DeviceCreate, e))?;
        let adapter = adapters.iter().find(|a| a.luid == luid);
        match adapter {
            Some(a) => log::info!("Using adapter {} ({}) matching the HMD", a.index, a.name),
            None => log::warn!("No adapter matches HMD LUID {:?}, using the default", luid),
        }
        let device = self
            .api
            .create_device(adapter)
            .map_err(|e| DeviceError::init(InitStage::DeviceCreate, e))?;
        let gpu = self.gpu.insert(GpuContext {
            device,
            backbuffer_view: None,
        });

        for eye in Eye::ALL {
            let i = eye.index();
            let size =
                session.fov_texture_size(eye, &desc.default_eye_fov[i], self.settings.pixel_density);
            let surface =
                EyeSurfaceSet::create(session, &mut gpu.device, size.width, size.height)
                    .map_err(|e| DeviceError::init(InitStage::EyeSurfaces, e))?;
            self.eye_surfaces[i] = Some(surface);
            let depth = DepthSurface::create(&mut gpu.device, size.width, size.height)
                .map_err(|e| DeviceError::init(InitStage::EyeSurfaces, e))?;
            self.depth_surfaces[i] = Some(depth);
            self.viewports[i] = Rect::from_size(size.width, size.height);
            log::info!("{:?} eye target: {}x{}", eye, size.width, size.height);
        }

        let (width, height) = self.window_size;
        let mirror = session
            .create_mirror_texture(&mut gpu.device, &mirror_desc(width, height))
            .map_err(|e| DeviceError::init(InitStage::MirrorTexture, e))?;
        self.mirror = Some(mirror);

        let scene = SphereScene::create(
            &mut gpu.device,
            self.settings.sphere_radius,
            self.settings.sphere_tessellation,
        )
        .map_err(|e| DeviceError::init(InitStage::Scene, e))?;
        self.scene = Some(scene);

        self.camera = CameraModel::default();
        self.eye_render_desc = Some(
            Eye::ALL.map(|eye| session.render_desc(eye, &desc.default_eye_fov[eye.index()])),
        );

        gpu.device
            .set_multithread_protected(true)
            .map_err(|e| DeviceError::init(InitStage::Multithread, e))?;

        self.hmd_desc = Some(desc);
        self.state = DeviceState::Initialized;
        log::info!("VR device initialized");
        Ok(())
    }

    /// Rebuild the swapchain for the stored window and size.
    pub fn reset(&mut self) -> Result<(), DeviceError> {
        let invalid = DeviceError::InvalidState {
            operation: "reset",
            state: self.state,
        };
        if !matches!(self.state, DeviceState::Initialized | DeviceState::Rendering) {
            return Err(invalid);
        }
        let (Some(window), Some(gpu), Some(session)) =
            (self.window, self.gpu.as_mut(), self.session.as_mut())
        else {
            return Err(invalid);
        };
        let (width, height) = self.window_size;

        if let Some(view) = gpu.backbuffer_view.take() {
            gpu.device.release_view(view);
        }
        gpu.device.create_swapchain(window, width, height)?;
        let backbuffer = gpu.device.backbuffer().ok_or(GpuError::NoSwapchain)?;
        gpu.backbuffer_view = Some(gpu.device.create_render_target_view(backbuffer)?);
        gpu.device.set_maximum_frame_latency(1)?;

        let stale = self
            .mirror
            .as_ref()
            .is_some_and(|m| (m.width, m.height) != (width, height));
        if stale {
            if let Some(old) = self.mirror.take() {
                session.destroy_mirror_texture(&mut gpu.device, old);
            }
            let mirror = session.create_mirror_texture(&mut gpu.device, &mirror_desc(width, height))?;
            self.mirror = Some(mirror);
            log::debug!("Mirror texture recreated at {}x{}", width, height);
        }

        log::debug!("Swapchain reset to {}x{}", width, height);
        Ok(())
    }

    /// Record a new desktop client size; takes effect on the next `reset`.
    pub fn set_window_size(&mut self, width: u32, height: u32) {
        self.window_size = (width.max(1), height.max(1));
    }

    pub fn window_size(&self) -> (u32, u32) {
        self.window_size
    }

    pub fn get_handle(&self, kind: HandleType) -> Result<NativeHandle, DeviceError> {
        match (kind, self.gpu.as_ref()) {
            (HandleType::GraphicsDevice, Some(gpu)) => {
                Ok(NativeHandle::Device(gpu.device.native_handle()))
            }
            _ => Err(DeviceError::UnsupportedHandle(kind)),
        }
    }

    pub fn set_handle(&mut self, kind: HandleType, handle: NativeHandle) -> Result<(), DeviceError> {
        match (kind, handle) {
            (HandleType::DeviceWindow, NativeHandle::Window(window)) => {
                self.window = Some(window);
                Ok(())
            }
            _ => Err(DeviceError::UnsupportedHandle(kind)),
        }
    }

    pub fn on_key(&mut self, message: KeyMessage, code: u32) {
        self.input.on_key(message, code);
    }

    /// Release everything in reverse creation order. Safe to call repeatedly
    /// and after a failed `init`.
    pub fn close(&mut self) {
        if self.state == DeviceState::Closed {
            return;
        }

        if let Some(gpu) = self.gpu.as_mut() {
            if let Some(scene) = self.scene.take() {
                scene.destroy(&mut gpu.device);
            }
            if let Some(session) = self.session.as_mut() {
                if let Some(mirror) = self.mirror.take() {
                    session.destroy_mirror_texture(&mut gpu.device, mirror);
                }
                for i in 0..2 {
                    if let Some(surface) = self.eye_surfaces[i].take() {
                        surface.destroy(session, &mut gpu.device);
                    }
                    if let Some(depth) = self.depth_surfaces[i].take() {
                        depth.destroy(&mut gpu.device);
                    }
                }
                session.detach_device();
            }
            if let Some(view) = gpu.backbuffer_view.take() {
                gpu.device.release_view(view);
            }
            gpu.device.release_swapchain();
        }
        self.gpu = None;

        if let Some(session) = self.session.take() {
            session.destroy();
        }
        if self.runtime_started {
            self.runtime.shutdown();
            self.runtime_started = false;
        }

        self.eye_render_desc = None;
        self.state = DeviceState::Closed;
        log::info!("VR device closed");
    }

    /// Upload pixels as a sampled texture a frame allocator can hand back.
    pub fn create_frame_texture(
        &mut self,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> Result<FrameTexture, DeviceError> {
        let gpu = self.gpu.as_mut().ok_or(DeviceError::InvalidState {
            operation: "create_frame_texture",
            state: self.state,
        })?;
        let desc = TextureDesc {
            width,
            height,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::SHADER_RESOURCE,
        };
        let id = gpu.device.create_texture(&desc, Some(rgba))?;
        match gpu.device.export_texture(id) {
            Ok(texture) => Ok(FrameTexture { id, texture }),
            Err(e) => {
                gpu.device.release_texture(id);
                Err(e.into())
            }
        }
    }

    pub fn release_frame_texture(&mut self, frame: FrameTexture) {
        if let Some(gpu) = self.gpu.as_mut() {
            gpu.device.release_texture(frame.id);
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    pub fn eye_ring_index(&self, eye: Eye) -> Option<usize> {
        self.eye_surfaces[eye.index()]
            .as_ref()
            .map(EyeSurfaceSet::current_index)
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn hmd_desc(&self) -> Option<&HmdDesc> {
        self.hmd_desc.as_ref()
    }

    pub fn eye_viewport(&self, eye: Eye) -> Rect {
        self.viewports[eye.index()]
    }

    pub fn signals(&self) -> &Arc<PlaybackSignals> {
        self.input.signals()
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }
}

impl<A: GraphicsApi, R: HmdRuntime> Drop for VrDevice<A, R> {
    fn drop(&mut self) {
        self.close();
    }
}
