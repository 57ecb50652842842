// Swapchain - Window presentation
//
// The mirror is copied into the swapchain image with a transfer, nothing
// renders into it directly, so the images need no views.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use raw_window_handle::RawWindowHandle;

use super::context::DeviceContext;

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    surface: vk::SurfaceKHR,
    surface_loader: khr::Surface,
}

impl Swapchain {
    /// Create a surface for `window` and a swapchain on it.
    pub fn new(ctx: &DeviceContext, window: RawWindowHandle, width: u32, height: u32) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let surface_loader = khr::Surface::new(&ctx.instance.entry, &ctx.instance.instance);
        let surface = create_surface(ctx, window)?;

        match Self::create(ctx, &surface_loader, surface, width, height) {
            Ok((swapchain, swapchain_loader, images, format, extent)) => Ok(Self {
                swapchain,
                swapchain_loader,
                images,
                format,
                extent,
                surface,
                surface_loader,
            }),
            Err(e) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn create(
        ctx: &DeviceContext,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
    ) -> Result<(vk::SwapchainKHR, khr::Swapchain, Vec<vk::Image>, vk::Format, vk::Extent2D)> {
        let physical_device = ctx.physical_device;

        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(
                physical_device,
                ctx.graphics_queue_family,
                surface,
            )
        }?;
        if !supported {
            anyhow::bail!("Graphics queue cannot present to this window");
        }

        let surface_caps = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)
        }?;
        let formats =
            unsafe { surface_loader.get_physical_device_surface_formats(physical_device, surface) }?;
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)
        }?;

        // Choose surface format (prefer SRGB)
        let surface_format = formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_SRGB
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .context("No suitable surface format")?;

        // The mirror is presented without waiting for vblank: IMMEDIATE, then
        // MAILBOX, then FIFO which is always available
        let present_mode = present_modes
            .iter()
            .copied()
            .find(|&mode| mode == vk::PresentModeKHR::IMMEDIATE)
            .or_else(|| {
                present_modes
                    .iter()
                    .copied()
                    .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
            })
            .unwrap_or(vk::PresentModeKHR::FIFO);

        log::info!("Present mode: {:?}", present_mode);

        let extent = if surface_caps.current_extent.width != u32::MAX {
            surface_caps.current_extent
        } else {
            vk::Extent2D {
                width: width.clamp(
                    surface_caps.min_image_extent.width,
                    surface_caps.max_image_extent.width,
                ),
                height: height.clamp(
                    surface_caps.min_image_extent.height,
                    surface_caps.max_image_extent.height,
                ),
            }
        };

        let mut image_count = surface_caps.min_image_count + 1;
        if surface_caps.max_image_count > 0 && image_count > surface_caps.max_image_count {
            image_count = surface_caps.max_image_count;
        }

        let swapchain_loader = khr::Swapchain::new(&ctx.instance.instance, &ctx.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }?;
        let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e.into());
            }
        };

        log::info!("Created swapchain with {} images", images.len());

        Ok((swapchain, swapchain_loader, images, surface_format.format, extent))
    }

    /// Acquire next image for rendering
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<(u32, bool)> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok((index, suboptimal)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                anyhow::bail!("Swapchain out of date")
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Present an image; `Ok(true)` means the swapchain should be recreated
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

#[cfg(target_os = "windows")]
fn create_surface(ctx: &DeviceContext, window: RawWindowHandle) -> Result<vk::SurfaceKHR> {
    let RawWindowHandle::Win32(handle) = window else {
        anyhow::bail!("Expected a Win32 window handle, got {:?}", window);
    };

    let loader = khr::Win32Surface::new(&ctx.instance.entry, &ctx.instance.instance);
    let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0);
    let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
        .hinstance(hinstance as vk::HINSTANCE)
        .hwnd(handle.hwnd.get() as vk::HWND);

    unsafe { loader.create_win32_surface(&create_info, None) }
        .context("Failed to create Win32 surface")
}

#[cfg(not(target_os = "windows"))]
fn create_surface(_ctx: &DeviceContext, window: RawWindowHandle) -> Result<vk::SurfaceKHR> {
    anyhow::bail!("Platform not supported for window surfaces: {:?}", window)
}
