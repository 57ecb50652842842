// Vulkan instance + logical device
//
// Responsibilities:
// - Instance creation with validation layers and runtime-required extensions
// - Adapter enumeration with LUIDs (to match the HMD's adapter)
// - Physical device selection (explicit adapter, else prefer discrete GPU)
// - Logical device + graphics queue creation

use anyhow::{Context, Result};
use ash::extensions::ext::DebugUtils;
use ash::vk::Handle;
use ash::{vk, Entry};
use std::ffi::{CStr, CString};
use std::sync::Arc;

use crate::backend::{AdapterInfo, AdapterLuid};

/// Loaded Vulkan library + instance, shared by every device it creates
pub struct Instance {
    pub entry: Entry,
    pub instance: ash::Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl Instance {
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        extra_extensions: &[String],
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;
        let instance =
            Self::create_instance(&entry, app_name, enable_validation, extra_extensions)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        Ok(Arc::new(Self {
            entry,
            instance,
            debug_utils,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        extra_extensions: &[String],
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("vr360-render")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions = vec![DebugUtils::name().as_ptr()];

        // Platform-specific surface extensions
        #[cfg(target_os = "windows")]
        {
            extensions.push(ash::extensions::khr::Surface::name().as_ptr());
            extensions.push(ash::extensions::khr::Win32Surface::name().as_ptr());
        }

        let extra = extension_names(extra_extensions)?;
        for name in &extra {
            if !extensions.iter().any(|&p| unsafe { CStr::from_ptr(p) } == name.as_c_str()) {
                extensions.push(name.as_ptr());
            }
        }

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    /// Every GPU with a graphics queue, with its LUID when the driver reports one.
    pub fn adapters(&self) -> Result<Vec<(vk::PhysicalDevice, AdapterInfo)>> {
        let devices = unsafe { self.instance.enumerate_physical_devices() }?;

        let mut adapters = Vec::with_capacity(devices.len());
        for (index, device) in devices.into_iter().enumerate() {
            let mut id_props = vk::PhysicalDeviceIDProperties::default();
            let mut props2 = vk::PhysicalDeviceProperties2::builder().push_next(&mut id_props);
            unsafe {
                self.instance
                    .get_physical_device_properties2(device, &mut props2)
            };
            let name = unsafe { CStr::from_ptr(props2.properties.device_name.as_ptr()) }
                .to_string_lossy()
                .into_owned();

            let luid = if id_props.device_luid_valid == vk::TRUE {
                AdapterLuid(id_props.device_luid)
            } else {
                AdapterLuid::default()
            };

            adapters.push((
                device,
                AdapterInfo {
                    index: index as u32,
                    name,
                    luid,
                },
            ));
        }
        Ok(adapters)
    }

    /// The adapter behind a raw `VkPhysicalDevice` handle of this instance.
    pub fn adapter_for(&self, physical_device: u64) -> Result<Option<AdapterInfo>> {
        Ok(self
            .adapters()?
            .into_iter()
            .find(|(device, _)| device.as_raw() == physical_device)
            .map(|(_, info)| info))
    }
}

fn extension_names(names: &[String]) -> Result<Vec<CString>> {
    names
        .iter()
        .map(|name| {
            CString::new(name.as_str())
                .with_context(|| format!("Invalid extension name {:?}", name))
        })
        .collect()
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Logical device + graphics queue
pub struct DeviceContext {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub instance: Arc<Instance>,
}

impl DeviceContext {
    /// Create a device on `physical_device`, or on the best GPU found.
    pub fn new(
        instance: Arc<Instance>,
        physical_device: Option<vk::PhysicalDevice>,
        extra_extensions: &[String],
    ) -> Result<Self> {
        let (physical_device, graphics_queue_family) = match physical_device {
            Some(device) => {
                let family = Self::graphics_queue_family(&instance.instance, device)
                    .context("Selected adapter has no graphics queue")?;
                (device, family)
            }
            None => Self::pick_physical_device(&instance.instance)?,
        };

        let (device, graphics_queue) = Self::create_logical_device(
            &instance.instance,
            physical_device,
            graphics_queue_family,
            extra_extensions,
        )?;

        let properties = unsafe {
            instance
                .instance
                .get_physical_device_properties(physical_device)
        };
        let memory_properties = unsafe {
            instance
                .instance
                .get_physical_device_memory_properties(physical_device)
        };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        Ok(Self {
            device,
            physical_device,
            graphics_queue,
            graphics_queue_family,
            properties,
            memory_properties,
            instance,
        })
    }

    fn graphics_queue_family(instance: &ash::Instance, device: vk::PhysicalDevice) -> Option<u32> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };
        queue_families
            .iter()
            .position(|props| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|i| i as u32)
    }

    fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };

            if let Some(graphics_family) = Self::graphics_queue_family(instance, device) {
                // Prefer discrete GPU
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    _ => 1,
                };

                if score > best_score {
                    best_score = score;
                    best_device = Some((device, graphics_family));
                }
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
        extra_extensions: &[String],
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extra = extension_names(extra_extensions)?;
        let swapchain = ash::extensions::khr::Swapchain::name();
        let mut extensions = vec![swapchain.as_ptr()];
        extensions.extend(
            extra
                .iter()
                .filter(|name| name.as_c_str() != swapchain)
                .map(|name| name.as_ptr()),
        );
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");
        let _ = self.wait_idle();
        unsafe {
            self.device.destroy_device(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
