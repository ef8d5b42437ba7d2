//! Graphics-context abstraction consumed by streaming textures
//!
//! The streaming code never talks to a device directly. It records layout
//! transitions and buffer-to-image copies into a single-time command, creates
//! views and samplers over a mip range, and hands replaced objects back for
//! frame-fenced destruction.

use std::ops::Range;

use crate::core::{PixelFormat, Result};

/// Layout of one mip level of an image
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ImageLayout {
    #[default]
    Undefined,
    /// Writable by transfer commands
    TransferDst,
    /// Readable by shaders
    ShaderReadOnly,
}

/// Parameters for allocating a streaming image
#[derive(Clone, Debug)]
pub struct ImageDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    /// Full chain length; storage for every level is addressable
    pub mip_levels: u32,
    pub format: PixelFormat,
}

/// Destination of a buffer-to-image copy: one whole mip level
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MipRegion {
    pub mip_level: u32,
    pub width: u32,
    pub height: u32,
}

/// Commands recorded inside [`GpuBackend::submit_single_time_command`]
pub trait CommandRecorder<I> {
    /// Transition a single mip level to `layout`
    fn transition_mip_layout(&mut self, image: &I, layout: ImageLayout, mip_level: u32);

    /// Copy tightly packed texel rows into `region`
    fn copy_buffer_to_image_region(&mut self, image: &I, region: MipRegion, data: &[u8]);
}

/// GPU object handed to [`GpuBackend::defer_disposal`]
pub enum Retired<B: GpuBackend + ?Sized> {
    View(B::View),
    Sampler(B::Sampler),
    /// Backing storage of evicted levels; the image itself stays alive
    MipLevels { image: B::Image, levels: Range<u32> },
    Image(B::Image),
}

impl<B: GpuBackend + ?Sized> std::fmt::Debug for Retired<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::View(_) => f.write_str("Retired::View"),
            Self::Sampler(_) => f.write_str("Retired::Sampler"),
            Self::MipLevels { levels, .. } => write!(f, "Retired::MipLevels({levels:?})"),
            Self::Image(_) => f.write_str("Retired::Image"),
        }
    }
}

/// Device operations required by the streaming subsystem
///
/// Implementations must be callable from worker threads. Handles are cheap
/// clones (reference counted) so the render thread can hold them for a frame.
pub trait GpuBackend: Send + Sync + 'static {
    type Image: Clone + Send + Sync + 'static;
    type View: Clone + Send + Sync + 'static;
    type Sampler: Clone + Send + Sync + 'static;

    /// Allocate an image with room for the whole mip chain
    fn create_image(&self, desc: &ImageDesc) -> Result<Self::Image>;

    /// Record commands, submit them, and block until the GPU finished them
    ///
    /// On error nothing recorded may have become visible to shaders.
    fn submit_single_time_command<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&mut dyn CommandRecorder<Self::Image>);

    /// View over mips `base_mip..base_mip + mip_count`
    fn create_image_view(
        &self,
        image: &Self::Image,
        base_mip: u32,
        mip_count: u32,
    ) -> Result<Self::View>;

    /// Linear sampler clamped to LODs `0.0..=max_lod`
    fn create_sampler(&self, max_lod: f32) -> Result<Self::Sampler>;

    /// Destroy `resource` once every frame that could reference it has retired
    fn defer_disposal(&self, resource: Retired<Self>);
}
