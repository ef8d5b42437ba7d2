//! Core type aliases, identifiers and re-exports

use std::sync::atomic::{AtomicU64, Ordering};

pub use glam::Vec3;

/// Standard Result type for the streaming subsystem
pub type Result<T> = std::result::Result<T, crate::core::error::Error>;

static NEXT_TEXTURE_ID: AtomicU64 = AtomicU64::new(1);

/// Stable unique identifier of a streaming texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(u64);

impl TextureId {
    /// Allocate a fresh process-unique id
    pub fn next() -> Self {
        Self(NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Build an id from a raw value (tests, tooling)
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw id value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TextureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tex#{}", self.0)
    }
}

/// Texel layout of source images and GPU images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum PixelFormat {
    #[default]
    Rgba8Unorm,
    Rgba8UnormSrgb,
    R8Unorm,
}

impl PixelFormat {
    /// Bytes occupied by one texel
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            Self::Rgba8Unorm | Self::Rgba8UnormSrgb => 4,
            Self::R8Unorm => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texture_ids_are_unique() {
        let a = TextureId::next();
        let b = TextureId::next();
        assert_ne!(a, b);
        assert!(b.raw() > a.raw());
    }

    #[test]
    fn test_pixel_format_sizes() {
        assert_eq!(PixelFormat::Rgba8Unorm.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::Rgba8UnormSrgb.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::R8Unorm.bytes_per_pixel(), 1);
    }
}
