// Build script to compile GLSL shaders to SPIR-V
//
// Only the Vulkan backend needs shaders; the default build skips glslc.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    if env::var_os("CARGO_FEATURE_VULKAN").is_none() {
        return;
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));

    // Compile shaders using glslc (part of Vulkan SDK)
    compile_shader("shaders/sphere.vert", &out_dir.join("sphere.vert.spv"));
    compile_shader("shaders/sphere.frag", &out_dir.join("sphere.frag.spv"));
}

fn compile_shader(input: &str, output: &Path) {
    let result = Command::new("glslc")
        .arg(Path::new(input))
        .arg("-o")
        .arg(output)
        .status();

    match result {
        Ok(status) if status.success() => {
            println!("cargo:rerun-if-changed={}", input);
        }
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            // The SPIR-V is embedded with include_bytes!, so a missing
            // compiler cannot be worked around
            panic!(
                "glslc not found ({}). Install the Vulkan SDK to build with the `vulkan` feature.",
                e
            );
        }
    }
}
