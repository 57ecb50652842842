// Error taxonomy
//
// Every fallible path returns one of these instead of aborting. The host
// decides what is fatal; the device only reports.

use std::fmt;

use thiserror::Error;

use crate::device::{DeviceState, HandleType};
use crate::frame::MemId;

/// Status codes exchanged with the host, one per error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    Unsupported,
    DeviceFailed,
    AllocatorFailed,
}

impl Status {
    /// Collapse a device result into its status code.
    pub fn of<T>(result: &Result<T, DeviceError>) -> Self {
        match result {
            Ok(_) => Status::Success,
            Err(e) => e.status(),
        }
    }
}

/// Step of `VrDevice::init` that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitStage {
    RuntimeStart,
    SessionCreate,
    DeviceCreate,
    EyeSurfaces,
    MirrorTexture,
    Scene,
    Multithread,
}

impl fmt::Display for InitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InitStage::RuntimeStart => "HMD runtime start",
            InitStage::SessionCreate => "HMD session creation",
            InitStage::DeviceCreate => "GPU device creation",
            InitStage::EyeSurfaces => "eye surface creation",
            InitStage::MirrorTexture => "mirror texture creation",
            InitStage::Scene => "scene creation",
            InitStage::Multithread => "multithread protection",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("initialization failed during {stage}")]
    Init {
        stage: InitStage,
        #[source]
        source: Box<DeviceError>,
    },
    #[error("unsupported handle type {0:?}")]
    UnsupportedHandle(HandleType),
    #[error("frame allocator could not resolve surface {mem_id:?}")]
    Allocator {
        mem_id: MemId,
        #[source]
        source: AllocatorError,
    },
    #[error("{operation} is not valid while the device is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: DeviceState,
    },
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error(transparent)]
    Hmd(#[from] HmdError),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
}

impl DeviceError {
    pub fn status(&self) -> Status {
        match self {
            DeviceError::UnsupportedHandle(_) => Status::Unsupported,
            DeviceError::Allocator { .. } => Status::AllocatorFailed,
            _ => Status::DeviceFailed,
        }
    }

    pub(crate) fn init(stage: InitStage, source: impl Into<DeviceError>) -> Self {
        DeviceError::Init {
            stage,
            source: Box::new(source.into()),
        }
    }
}

/// Failures reported by a graphics backend.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no swapchain has been created")]
    NoSwapchain,
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u32 },
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
    #[error("initial data is {actual} bytes, texture needs {expected}")]
    InitialDataSize { expected: usize, actual: usize },
    #[error("mesh needs {0} vertices, more than 32-bit indices can address")]
    IndexOverflow(usize),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Failures reported by the HMD runtime.
#[derive(Debug, Error)]
pub enum HmdError {
    #[error("HMD runtime is not initialized")]
    NotInitialized,
    #[error("no HMD detected")]
    NoHmd,
    #[error("unknown swap texture set {0}")]
    UnknownTextureSet(u32),
    #[error("layer references slot {index} of a ring with {len} textures")]
    InvalidLayer { index: usize, len: usize },
    #[error("compositor texture allocation failed")]
    Texture(#[source] GpuError),
    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("runtime returned a ring of {actual} textures, expected {expected}")]
    RingSize { expected: usize, actual: usize },
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error(transparent)]
    Hmd(#[from] HmdError),
}

/// Failure reported by the external frame allocator.
#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("surface {0:?} is not known to the allocator")]
    UnknownSurface(MemId),
    #[error("allocator failure: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown key name '{name}' bound to {action}")]
    UnknownKey { name: String, action: &'static str },
    #[error("eye field of view needs four positive tangents, got {0:?}")]
    InvalidFov([f32; 4]),
    #[error("sphere tessellation {value} is above the maximum of {max}")]
    Tessellation { value: u32, max: u32 },
    #[error("pixel density must be a positive number, got {0}")]
    PixelDensity(f32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let unsupported = DeviceError::UnsupportedHandle(HandleType::VaDisplay);
        assert_eq!(unsupported.status(), Status::Unsupported);

        let alloc = DeviceError::Allocator {
            mem_id: MemId(7),
            source: AllocatorError::UnknownSurface(MemId(7)),
        };
        assert_eq!(alloc.status(), Status::AllocatorFailed);

        let init = DeviceError::init(InitStage::SessionCreate, HmdError::NoHmd);
        assert_eq!(init.status(), Status::DeviceFailed);
        assert_eq!(Status::of::<()>(&Ok(())), Status::Success);
        assert_eq!(Status::of::<()>(&Err(init)), Status::DeviceFailed);
    }

    #[test]
    fn test_init_error_keeps_source() {
        let err = DeviceError::init(InitStage::SessionCreate, HmdError::NoHmd);
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("no HMD detected"));
        assert!(err.to_string().contains("HMD session creation"));
    }
}
