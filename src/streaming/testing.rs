//! Shared fixtures for streaming tests

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::core::{Error, PixelFormat, Result};
use crate::streaming::mip_store::{DecodedImage, MipStore, SourceDecoder, SourceInfo};

/// Gradient images of a fixed size
///
/// Paths containing `missing` fail like absent files; `broken` paths report
/// a header but fail to decode.
pub struct SyntheticDecoder {
    pub width: u32,
    pub height: u32,
    pub decodes: AtomicUsize,
    pub fail_decodes: AtomicBool,
}

impl SyntheticDecoder {
    pub fn new(width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            width,
            height,
            decodes: AtomicUsize::new(0),
            fail_decodes: AtomicBool::new(false),
        })
    }

    pub fn decode_count(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }
}

impl SourceDecoder for SyntheticDecoder {
    fn decode(&self, path: &Path) -> Result<DecodedImage> {
        self.dimensions(path)?;
        if self.fail_decodes.load(Ordering::SeqCst) || path.to_string_lossy().contains("broken") {
            return Err(Error::asset(path, "corrupt image data"));
        }
        self.decodes.fetch_add(1, Ordering::SeqCst);
        let pixels = (0..self.width * self.height)
            .flat_map(|i| [(i % 256) as u8, 0, 255, 255])
            .collect();
        Ok(DecodedImage {
            width: self.width,
            height: self.height,
            format: PixelFormat::Rgba8Unorm,
            pixels,
        })
    }

    fn dimensions(&self, path: &Path) -> Result<SourceInfo> {
        if path.to_string_lossy().contains("missing") {
            return Err(Error::asset(path, "file not found"));
        }
        Ok(SourceInfo::new(self.width, self.height, PixelFormat::Rgba8Unorm))
    }
}

/// Store over a fresh temp cache directory; keep the guard alive
pub fn synthetic_store(
    width: u32,
    height: u32,
) -> (Arc<MipStore>, Arc<SyntheticDecoder>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("temp dir");
    let decoder = SyntheticDecoder::new(width, height);
    let store = Arc::new(MipStore::with_decoder(dir.path(), decoder.clone()));
    (store, decoder, dir)
}
