// Vulkan backend
//
// Direct ash bindings, no wrapper crates. Window surfaces are Win32 only,
// matching where HMD runtimes live.

mod context;
mod device;
mod memory;
mod pipeline;
mod shader;
mod swapchain;
mod sync;

pub use device::{VulkanDevice, VulkanGraphics};

use ash::vk::Handle;

use crate::backend::AdapterInfo;

/// Ask an outside party which GPU it wants for a Vulkan instance created with
/// `extensions`. `select` gets the raw `VkInstance` and returns the raw
/// `VkPhysicalDevice` it picked; the instance is dropped before returning.
pub fn select_adapter(
    extensions: &[String],
    select: impl FnOnce(u64) -> anyhow::Result<u64>,
) -> anyhow::Result<Option<AdapterInfo>> {
    let instance = context::Instance::new("vr360-render adapter query", false, extensions)?;
    let physical_device = select(instance.instance.handle().as_raw())?;
    instance.adapter_for(physical_device)
}
