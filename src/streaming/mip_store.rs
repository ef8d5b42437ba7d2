//! Mip chain generation and on-disk mip cache
//!
//! A source image is decoded once, downsampled with a 2x2 box filter down to
//! 1x1, and every level is written to the cache directory as its own blob.
//! Mip indices here are GPU level indices: level 0 is full resolution.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rayon::prelude::*;
use rkyv::{Archive, Deserialize, Serialize};

use crate::core::{Error, PixelFormat, Result};

const BLOB_VERSION: u32 = 1;
const BLOB_EXTENSION: &str = "rkmip";

/// Number of levels in a full chain: `floor(log2(max(w, h))) + 1`
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Dimensions of mip `level` for a `width` x `height` base
pub fn mip_dimensions(width: u32, height: u32, level: u32) -> (u32, u32) {
    let w = width.checked_shr(level).unwrap_or(0).max(1);
    let h = height.checked_shr(level).unwrap_or(0).max(1);
    (w, h)
}

/// Bytes occupied by mip `level`: `max(w>>m,1) * max(h>>m,1) * bpp`
pub fn mip_byte_size(width: u32, height: u32, level: u32, format: PixelFormat) -> u64 {
    let (w, h) = mip_dimensions(width, height, level);
    w as u64 * h as u64 * format.bytes_per_pixel() as u64
}

/// Fully decoded source image with tightly packed rows
#[derive(Clone, Debug)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pixels: Vec<u8>,
}

/// Base dimensions of a source, known without decoding its texels
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub mip_levels: u32,
}

impl SourceInfo {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            mip_levels: mip_level_count(width, height),
        }
    }

    pub fn level_bytes(&self, level: u32) -> u64 {
        mip_byte_size(self.width, self.height, level, self.format)
    }
}

/// Texels of one mip level
#[derive(Clone, Debug, PartialEq)]
pub struct MipData {
    pub level: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pixels: Vec<u8>,
}

/// Reads source images
pub trait SourceDecoder: Send + Sync {
    /// Decode the whole image
    fn decode(&self, path: &Path) -> Result<DecodedImage>;

    /// Read only the header
    fn dimensions(&self, path: &Path) -> Result<SourceInfo>;
}

/// Decoder for any format the `image` crate reads, expanded to RGBA8
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageFileDecoder;

impl SourceDecoder for ImageFileDecoder {
    fn decode(&self, path: &Path) -> Result<DecodedImage> {
        let rgba = image::open(path).map_err(|e| Error::asset(path, e))?.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(DecodedImage {
            width,
            height,
            format: PixelFormat::Rgba8Unorm,
            pixels: rgba.into_raw(),
        })
    }

    fn dimensions(&self, path: &Path) -> Result<SourceInfo> {
        let (width, height) = image::image_dimensions(path).map_err(|e| Error::asset(path, e))?;
        Ok(SourceInfo::new(width, height, PixelFormat::Rgba8Unorm))
    }
}

/// Serialized form of one cached mip level
#[derive(Archive, Deserialize, Serialize)]
struct MipBlob {
    version: u32,
    width: u32,
    height: u32,
    format: u8,
    pixels: Vec<u8>,
}

fn format_code(format: PixelFormat) -> u8 {
    match format {
        PixelFormat::Rgba8Unorm => 0,
        PixelFormat::Rgba8UnormSrgb => 1,
        PixelFormat::R8Unorm => 2,
    }
}

fn format_from_code(code: u8) -> Option<PixelFormat> {
    match code {
        0 => Some(PixelFormat::Rgba8Unorm),
        1 => Some(PixelFormat::Rgba8UnormSrgb),
        2 => Some(PixelFormat::R8Unorm),
        _ => None,
    }
}

/// Build every level of the chain, level 0 first
pub fn generate_mip_chain(image: &DecodedImage) -> Result<Vec<MipData>> {
    let bpp = image.format.bytes_per_pixel() as usize;
    let expected = image.width as usize * image.height as usize * bpp;
    if image.width == 0 || image.height == 0 || image.pixels.len() != expected {
        return Err(Error::Asset {
            path: PathBuf::new(),
            reason: format!(
                "decoded {}x{} image has {} bytes, expected {}",
                image.width,
                image.height,
                image.pixels.len(),
                expected
            ),
        });
    }

    let levels = mip_level_count(image.width, image.height);
    let mut chain = Vec::with_capacity(levels as usize);
    chain.push(MipData {
        level: 0,
        width: image.width,
        height: image.height,
        format: image.format,
        pixels: image.pixels.clone(),
    });

    for level in 1..levels {
        let prev = &chain[level as usize - 1];
        let (width, height) = mip_dimensions(image.width, image.height, level);
        let pixels = downsample(&prev.pixels, prev.width, prev.height, width, height, bpp);
        chain.push(MipData {
            level,
            width,
            height,
            format: image.format,
            pixels,
        });
    }
    Ok(chain)
}

/// 2x2 box filter; edge texels are reused for odd or unit dimensions
fn downsample(src: &[u8], sw: u32, sh: u32, dw: u32, dh: u32, bpp: usize) -> Vec<u8> {
    let (sw, sh, dw, dh) = (sw as usize, sh as usize, dw as usize, dh as usize);
    let mut dst = vec![0u8; dw * dh * bpp];

    dst.par_chunks_mut(dw * bpp).enumerate().for_each(|(y, row)| {
        let y0 = (y * 2).min(sh - 1);
        let y1 = (y * 2 + 1).min(sh - 1);
        for x in 0..dw {
            let x0 = (x * 2).min(sw - 1);
            let x1 = (x * 2 + 1).min(sw - 1);
            for c in 0..bpp {
                let sum = src[(y0 * sw + x0) * bpp + c] as u32
                    + src[(y0 * sw + x1) * bpp + c] as u32
                    + src[(y1 * sw + x0) * bpp + c] as u32
                    + src[(y1 * sw + x1) * bpp + c] as u32;
                row[x * bpp + c] = ((sum + 2) / 4) as u8;
            }
        }
    });
    dst
}

/// FNV-1a over the path bytes; stable across builds so cache names survive
/// toolchain upgrades
fn path_hash(source: &Path) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for &byte in source.as_os_str().as_encoded_bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Cache file for (source, level)
///
/// Format: `<stem>_<hash16>_mip<NN>.rkmip`, where the hash covers the full
/// source path so same-named files in different folders do not collide.
pub fn blob_path(cache_dir: &Path, source: &Path, level: u32) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "texture".to_string());
    let name = format!(
        "{}_{:016x}_mip{:02}.{}",
        stem,
        path_hash(source),
        level,
        BLOB_EXTENSION
    );
    cache_dir.join(name)
}

fn encode_blob(mip: &MipData) -> io::Result<Vec<u8>> {
    let blob = MipBlob {
        version: BLOB_VERSION,
        width: mip.width,
        height: mip.height,
        format: format_code(mip.format),
        pixels: mip.pixels.clone(),
    };
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&blob)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

fn decode_blob(data: &[u8]) -> io::Result<MipBlob> {
    let decompressed = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("LZ4 decompression failed: {}", e))
        })?;

    // Archived data must be aligned; decompressed bytes carry no guarantee
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(decompressed.len());
    aligned.extend_from_slice(&decompressed);

    let archived = rkyv::access::<ArchivedMipBlob, rkyv::rancor::Error>(&aligned)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    rkyv::deserialize::<MipBlob, rkyv::rancor::Error>(archived)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

/// Write through a temp file so readers never see a partial blob
fn write_blob_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);
    let tmp = path.with_extension(format!(
        "{}.tmp{}_{}",
        BLOB_EXTENSION,
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp);
    })
}

/// Produces mip levels of source images, backed by a disk cache
pub struct MipStore {
    cache_dir: PathBuf,
    decoder: Arc<dyn SourceDecoder>,
    infos: Mutex<HashMap<PathBuf, SourceInfo>>,
    /// Sources whose blobs could not be written; always regenerated
    uncacheable: Mutex<HashSet<PathBuf>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MipStore {
    /// Store reading sources with the `image` crate
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self::with_decoder(cache_dir, Arc::new(ImageFileDecoder))
    }

    pub fn with_decoder(cache_dir: impl Into<PathBuf>, decoder: Arc<dyn SourceDecoder>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            decoder,
            infos: Mutex::new(HashMap::new()),
            uncacheable: Mutex::new(HashSet::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Base dimensions and chain length of `source`
    pub fn describe(&self, source: &Path) -> Result<SourceInfo> {
        if let Some(info) = self.infos.lock().get(source) {
            return Ok(*info);
        }
        let info = self.decoder.dimensions(source)?;
        if info.width == 0 || info.height == 0 {
            return Err(Error::asset(source, "image has zero size"));
        }
        self.infos.lock().insert(source.to_path_buf(), info);
        Ok(info)
    }

    /// Texels of level `mip` of `source`
    pub fn load(&self, source: &Path, mip: u32) -> Result<MipData> {
        let info = self.describe(source)?;
        if mip >= info.mip_levels {
            return Err(Error::Range {
                requested: mip,
                min: 0,
                max: info.mip_levels - 1,
            });
        }

        let caching = !self.is_caching_disabled(source);
        if caching {
            if let Some(data) = self.read_cached(source, &info, mip) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(data);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let mut chain = self.generate(source, &info)?;
        if caching {
            self.write_chain(source, &chain);
        }
        Ok(chain.swap_remove(mip as usize))
    }

    /// Generate and cache every level of `source`; returns the level count
    pub fn warm(&self, source: &Path) -> Result<u32> {
        let info = self.describe(source)?;
        let chain = self.generate(source, &info)?;
        self.write_chain(source, &chain);
        if self.is_caching_disabled(source) {
            return Err(Error::asset(source, "mip cache is not writable"));
        }
        Ok(chain.len() as u32)
    }

    pub fn is_caching_disabled(&self, source: &Path) -> bool {
        self.uncacheable.lock().contains(source)
    }

    pub fn cache_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn generate(&self, source: &Path, info: &SourceInfo) -> Result<Vec<MipData>> {
        let decoded = self.decoder.decode(source)?;
        let header = (info.width, info.height, info.format);
        if (decoded.width, decoded.height, decoded.format) != header {
            return Err(Error::asset(source, "decoded image does not match its header"));
        }
        generate_mip_chain(&decoded).map_err(|e| match e {
            Error::Asset { reason, .. } => Error::asset(source, reason),
            other => other,
        })
    }

    fn read_cached(&self, source: &Path, info: &SourceInfo, mip: u32) -> Option<MipData> {
        let path = blob_path(&self.cache_dir, source, mip);
        let bytes = std::fs::read(&path).ok()?;
        let blob = match decode_blob(&bytes) {
            Ok(blob) => blob,
            Err(e) => {
                log::warn!("Discarding corrupt mip blob {}: {}", path.display(), e);
                return None;
            }
        };

        let (width, height) = mip_dimensions(info.width, info.height, mip);
        let format = format_from_code(blob.format)?;
        let expected = width as usize * height as usize * format.bytes_per_pixel() as usize;
        if blob.version != BLOB_VERSION
            || blob.width != width
            || blob.height != height
            || format != info.format
            || blob.pixels.len() != expected
        {
            log::debug!("Stale mip blob {}, regenerating", path.display());
            return None;
        }

        Some(MipData {
            level: mip,
            width,
            height,
            format,
            pixels: blob.pixels,
        })
    }

    fn write_chain(&self, source: &Path, chain: &[MipData]) {
        let result = std::fs::create_dir_all(&self.cache_dir).and_then(|_| {
            chain.par_iter().try_for_each(|mip| {
                let bytes = encode_blob(mip)?;
                write_blob_atomic(&blob_path(&self.cache_dir, source, mip.level), &bytes)
            })
        });

        if let Err(e) = result {
            log::warn!(
                "Mip cache write failed for {} ({}); caching disabled for this source",
                source.display(),
                e
            );
            self.uncacheable.lock().insert(source.to_path_buf());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::testing::SyntheticDecoder;

    #[test]
    fn test_mip_math() {
        assert_eq!(mip_level_count(256, 256), 9);
        assert_eq!(mip_level_count(256, 64), 9);
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(3, 1), 2);
        assert_eq!(mip_byte_size(256, 64, 0, PixelFormat::Rgba8Unorm), 65536);
        assert_eq!(mip_byte_size(256, 64, 7, PixelFormat::Rgba8Unorm), 8);
        assert_eq!(mip_byte_size(256, 64, 40, PixelFormat::R8Unorm), 1);
    }

    #[test]
    fn test_blob_path_is_stable() {
        let dir = Path::new("cache");
        let path = blob_path(dir, Path::new("a"), 3);
        // FNV-1a of the single byte "a"
        assert_eq!(path, dir.join("a_af63dc4c8601ec8c_mip03.rkmip"));

        let other = blob_path(dir, Path::new("other/a"), 3);
        assert_ne!(path, other);
    }

    #[test]
    fn test_chain_reaches_one_by_one() {
        let image = DecodedImage {
            width: 4,
            height: 2,
            format: PixelFormat::R8Unorm,
            pixels: vec![0, 4, 8, 12, 4, 8, 12, 16],
        };
        let chain = generate_mip_chain(&image).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!((chain[1].width, chain[1].height), (2, 1));
        assert_eq!(chain[1].pixels, vec![4, 12]);
        assert_eq!((chain[2].width, chain[2].height), (1, 1));
        assert_eq!(chain[2].pixels, vec![8]);
    }

    #[test]
    fn test_chain_rejects_short_pixel_buffer() {
        let image = DecodedImage {
            width: 4,
            height: 4,
            format: PixelFormat::Rgba8Unorm,
            pixels: vec![0; 10],
        };
        assert!(matches!(generate_mip_chain(&image), Err(Error::Asset { .. })));
    }

    #[test]
    fn test_load_caches_every_level() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = SyntheticDecoder::new(16, 8);
        let store = MipStore::with_decoder(dir.path(), decoder.clone());
        let source = Path::new("textures/brick.png");

        let mip = store.load(source, 1).unwrap();
        assert_eq!((mip.width, mip.height), (8, 4));
        assert_eq!(mip.pixels.len(), 8 * 4 * 4);
        assert_eq!(store.cache_misses(), 1);

        for level in 0..5 {
            assert!(blob_path(dir.path(), source, level).exists());
        }

        let again = store.load(source, 1).unwrap();
        assert_eq!(again, mip);
        store.load(source, 4).unwrap();
        assert_eq!(store.cache_hits(), 2);
        assert_eq!(decoder.decode_count(), 1);

        // A fresh store reads the same blobs without decoding
        let fresh = MipStore::with_decoder(dir.path(), decoder.clone());
        assert_eq!(fresh.load(source, 1).unwrap(), mip);
        assert_eq!(decoder.decode_count(), 1);
    }

    #[test]
    fn test_corrupt_blob_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = SyntheticDecoder::new(8, 8);
        let store = MipStore::with_decoder(dir.path(), decoder.clone());
        let source = Path::new("rock.png");

        let good = store.load(source, 2).unwrap();
        let path = blob_path(dir.path(), source, 2);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert_eq!(store.load(source, 2).unwrap(), good);
        assert_eq!(decoder.decode_count(), 2);
    }

    #[test]
    fn test_out_of_range_mip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MipStore::with_decoder(dir.path(), SyntheticDecoder::new(8, 8));

        let err = store.load(Path::new("a.png"), 4).unwrap_err();
        assert!(matches!(err, Error::Range { requested: 4, min: 0, max: 3 }));
    }

    #[test]
    fn test_missing_source_is_asset_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = MipStore::with_decoder(dir.path(), SyntheticDecoder::new(8, 8));

        let err = store.load(Path::new("missing.png"), 0).unwrap_err();
        assert!(matches!(err, Error::Asset { .. }));
    }

    #[test]
    fn test_cache_write_failure_disables_caching_for_source() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let decoder = SyntheticDecoder::new(8, 8);
        let store = MipStore::with_decoder(blocker.join("mips"), decoder.clone());
        let source = Path::new("grass.png");

        let first = store.load(source, 1).unwrap();
        assert!(store.is_caching_disabled(source));
        assert!(!store.is_caching_disabled(Path::new("other.png")));

        // Still served, regenerated on demand
        assert_eq!(store.load(source, 1).unwrap(), first);
        assert_eq!(decoder.decode_count(), 2);
        assert_eq!(store.cache_hits(), 0);
    }

    #[test]
    fn test_image_file_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checker.png");
        let img = image::RgbaImage::from_fn(4, 2, |x, _| {
            if x % 2 == 0 { image::Rgba([255, 255, 255, 255]) } else { image::Rgba([0, 0, 0, 255]) }
        });
        img.save(&path).unwrap();

        let store = MipStore::new(dir.path().join("cache"));
        let info = store.describe(&path).unwrap();
        assert_eq!(info, SourceInfo::new(4, 2, PixelFormat::Rgba8Unorm));

        let mip = store.load(&path, 1).unwrap();
        assert_eq!((mip.width, mip.height), (2, 1));
        // Each 2x2 block averages one white and one black column
        assert_eq!(&mip.pixels[0..4], &[128, 128, 128, 255]);

        let err = store.describe(&dir.path().join("nope.png")).unwrap_err();
        assert!(matches!(err, Error::Asset { .. }));
    }
}
