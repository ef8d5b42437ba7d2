//! GPU interfaces used by the streaming subsystem

pub mod gpu;
pub mod disposal;
pub mod headless;
pub mod context;

pub use context::WgpuContext;
pub use disposal::{DeferredDisposal, FrameFence};
pub use gpu::{CommandRecorder, GpuBackend, ImageDesc, ImageLayout, MipRegion, Retired};
pub use headless::HeadlessBackend;
