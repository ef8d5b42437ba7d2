//! Rktri texture streaming - adaptive mip residency under a GPU memory budget

pub mod core;
pub mod render;
pub mod streaming;

pub use crate::core::{DeviceFailure, Error, PixelFormat, Result, TextureId};
pub use crate::render::{GpuBackend, HeadlessBackend, WgpuContext};
pub use crate::streaming::{
    BindableHandle, MipStore, RequestOutcome, StreamingConfig, StreamingScheduler, StreamingStats,
    StreamingTexture,
};
