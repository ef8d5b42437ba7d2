//! Adaptive texture streaming
//!
//! Textures start with a 1x1 baseline and gain mip levels in the background,
//! highest priority first, while resident bytes stay under a fixed budget.

pub mod config;
pub mod budget;
pub mod priority;
pub mod mip_store;
pub mod texture;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use config::StreamingConfig;
pub use budget::BudgetTracker;
pub use priority::{StreamQueue, StreamRequest, view_priority, VISIBLE_BONUS};
pub use mip_store::{
    DecodedImage, ImageFileDecoder, MipData, MipStore, SourceDecoder, SourceInfo,
    blob_path, generate_mip_chain, mip_byte_size, mip_dimensions, mip_level_count,
};
pub use texture::{BindableHandle, StreamingTexture};
pub use scheduler::{FailureCallback, RequestOutcome, StreamingScheduler, StreamingStats};
