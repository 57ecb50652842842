// Memory helpers: buffers, images and their device memory
//
// Plain vkAllocateMemory per resource. A frame has a handful of long-lived
// targets plus one staging buffer per upload, so no sub-allocator.

use anyhow::{Context, Result};
use ash::vk;

use super::context::DeviceContext;
use crate::backend::{TextureDesc, TextureFormat};

pub fn vk_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
        TextureFormat::D32Float => vk::Format::D32_SFLOAT,
    }
}

pub fn aspect(format: TextureFormat) -> vk::ImageAspectFlags {
    match format {
        TextureFormat::D32Float => vk::ImageAspectFlags::DEPTH,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Find a suitable memory type index
pub fn find_memory_type(
    ctx: &DeviceContext,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    let mem_properties = &ctx.memory_properties;

    for i in 0..mem_properties.memory_type_count {
        let has_type = (type_filter & (1 << i)) != 0;
        let has_properties = mem_properties.memory_types[i as usize]
            .property_flags
            .contains(properties);

        if has_type && has_properties {
            return Ok(i);
        }
    }

    anyhow::bail!("Failed to find suitable memory type")
}

fn allocate(
    ctx: &DeviceContext,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let memory_type_index = find_memory_type(ctx, requirements.memory_type_bits, properties)?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    unsafe { ctx.device.allocate_memory(&alloc_info, None) }.context("Failed to allocate memory")
}

/// Helper to create a GPU buffer with specified usage and memory properties
pub fn create_buffer(
    ctx: &DeviceContext,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_properties: vk::MemoryPropertyFlags,
) -> Result<(vk::Buffer, vk::DeviceMemory)> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { ctx.device.create_buffer(&buffer_info, None) }
        .context("Failed to create buffer")?;

    let requirements = unsafe { ctx.device.get_buffer_memory_requirements(buffer) };
    let memory = match allocate(ctx, requirements, memory_properties) {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { ctx.device.destroy_buffer(buffer, None) };
            return Err(e);
        }
    };

    unsafe { ctx.device.bind_buffer_memory(buffer, memory, 0) }
        .context("Failed to bind buffer memory")?;

    Ok((buffer, memory))
}

/// Create a host-visible buffer and fill it with data
pub fn create_buffer_with_data<T: bytemuck::Pod>(
    ctx: &DeviceContext,
    usage: vk::BufferUsageFlags,
    data: &[T],
) -> Result<(vk::Buffer, vk::DeviceMemory)> {
    let bytes: &[u8] = bytemuck::cast_slice(data);
    let size = bytes.len() as vk::DeviceSize;

    let (buffer, memory) = create_buffer(
        ctx,
        size,
        usage,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;

    unsafe {
        let ptr = ctx
            .device
            .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())? as *mut u8;
        ptr.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        ctx.device.unmap_memory(memory);
    }

    Ok((buffer, memory))
}

pub fn destroy_buffer(ctx: &DeviceContext, buffer: vk::Buffer, memory: vk::DeviceMemory) {
    unsafe {
        ctx.device.destroy_buffer(buffer, None);
        ctx.device.free_memory(memory, None);
    }
}

/// Device-local 2D image matching `desc`, in UNDEFINED layout.
pub fn create_image(ctx: &DeviceContext, desc: &TextureDesc) -> Result<(vk::Image, vk::DeviceMemory)> {
    let mut usage = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    if desc.usage.render_target {
        usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if desc.usage.shader_resource {
        usage |= vk::ImageUsageFlags::SAMPLED;
    }
    if desc.usage.depth_stencil {
        usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }

    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: desc.width,
            height: desc.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .format(vk_format(desc.format))
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(usage)
        .samples(vk::SampleCountFlags::TYPE_1)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let image = unsafe { ctx.device.create_image(&image_info, None) }
        .context("Failed to create image")?;

    let requirements = unsafe { ctx.device.get_image_memory_requirements(image) };
    let memory = match allocate(ctx, requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { ctx.device.destroy_image(image, None) };
            return Err(e);
        }
    };

    unsafe { ctx.device.bind_image_memory(image, memory, 0) }
        .context("Failed to bind image memory")?;

    Ok((image, memory))
}

pub fn create_image_view(
    ctx: &DeviceContext,
    image: vk::Image,
    format: TextureFormat,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(vk_format(format))
        .subresource_range(subresource_range(aspect(format)));

    unsafe { ctx.device.create_image_view(&view_info, None) }
        .context("Failed to create image view")
}

pub fn subresource_range(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

pub fn subresource_layers(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}
