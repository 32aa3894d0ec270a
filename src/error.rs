// Device errors
//
// Soft failures surface as `DeviceError`; contract violations (stale handles,
// exhausted pools, drawing outside a pass) panic instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("shader state '{name}' failed to compile")]
    ShaderCompilation { name: String },

    #[error("missing device capability: {0}")]
    MissingCapability(String),

    #[error("no suitable GPU adapter found")]
    NoSuitableAdapter,

    #[error("surface error: {0}")]
    Surface(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type DeviceResult<T> = Result<T, DeviceError>;
