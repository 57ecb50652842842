// Shader module loading
//
// SPIR-V is compiled by build.rs into OUT_DIR and embedded at compile time.

use anyhow::{Context, Result};
use ash::vk;

pub const SPHERE_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/sphere.vert.spv"));
pub const SPHERE_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/sphere.frag.spv"));

/// Load SPIR-V shader from bytes and create a shader module
pub fn create_shader_module(device: &ash::Device, code: &[u8]) -> Result<vk::ShaderModule> {
    // read_spv copies into u32 words, so the embedded bytes need no alignment
    let words = ash::util::read_spv(&mut std::io::Cursor::new(code))
        .context("Invalid SPIR-V")?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    unsafe { device.create_shader_module(&create_info, None) }
        .context("Failed to create shader module")
}
