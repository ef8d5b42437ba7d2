//! Error types for the texture streaming subsystem

use std::path::PathBuf;

use thiserror::Error;

use crate::core::types::TextureId;

/// Reason a GPU operation failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceFailure {
    #[error("device lost")]
    DeviceLost,

    #[error("out of device memory")]
    OutOfMemory,

    #[error("{0}")]
    Other(String),
}

/// Main error type for the streaming subsystem
#[derive(Debug, Error)]
pub enum Error {
    /// Source image unreadable or corrupt; the texture keeps its last good residency
    #[error("Asset error ({}): {reason}", .path.display())]
    Asset { path: PathBuf, reason: String },

    /// Mip index or resident count outside the texture's chain
    #[error("Mip range error: requested {requested}, valid range is {min}..={max}")]
    Range { requested: u32, min: u32, max: u32 },

    /// GPU upload or object creation failed
    #[error("GPU error: {0}")]
    Device(#[from] DeviceFailure),

    /// Texture went away while its request was queued or in flight
    #[error("Stale request for {0}")]
    StaleRequest(TextureId),

    /// Next level is larger than the budget can hold even with every other
    /// texture at its baseline; the request is dropped
    #[error("{texture} needs {needed} bytes for its next mip, at most {capacity} can be made free")]
    OverBudget { texture: TextureId, needed: u64, capacity: u64 },

    #[error("{0} was already disposed")]
    AlreadyDisposed(TextureId),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an asset error for `path`
    pub fn asset(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Asset {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the scheduler should drop this failure without reporting it
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleRequest(_))
    }
}
