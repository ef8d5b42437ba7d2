//! Streaming texture: a GPU image whose resident mip range changes at runtime
//!
//! Residency grows from the coarsest level towards full resolution. With `k`
//! levels resident out of `n`, GPU mips `n-k..n` hold data and the published
//! view covers exactly that range, so the sampler's LOD 0 is always the
//! finest resident level.
//!
//! Render code reads [`StreamingTexture::current_bindable`], a snapshot that
//! is swapped atomically. Promote, evict and dispose serialize on the
//! per-texture transition lock and hand replaced objects to deferred
//! disposal, so a frame that captured the old snapshot keeps valid handles.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::core::{Error, Result, TextureId};
use crate::render::gpu::{GpuBackend, ImageDesc, ImageLayout, MipRegion, Retired};
use crate::streaming::mip_store::{MipData, MipStore, SourceInfo};
use crate::streaming::scheduler::{RequestOutcome, StreamingScheduler};

/// View and sampler to bind for one frame
pub struct BindableHandle<B: GpuBackend> {
    pub view: B::View,
    pub sampler: B::Sampler,
    /// Bumped on every residency change
    pub generation: u64,
    pub resident_mips: u32,
}

impl<B: GpuBackend> Clone for BindableHandle<B> {
    fn clone(&self) -> Self {
        Self {
            view: self.view.clone(),
            sampler: self.sampler.clone(),
            generation: self.generation,
            resident_mips: self.resident_mips,
        }
    }
}

/// GPU objects owned by the texture, guarded by the transition lock
struct GpuObjects<B: GpuBackend> {
    image: B::Image,
    view: B::View,
    sampler: B::Sampler,
}

pub struct StreamingTexture<B: GpuBackend> {
    id: TextureId,
    source: PathBuf,
    info: SourceInfo,
    backend: Arc<B>,
    resident: AtomicU32,
    generation: AtomicU64,
    disposed: AtomicBool,
    /// `None` once disposed
    transition: Mutex<Option<GpuObjects<B>>>,
    published: RwLock<Option<Arc<BindableHandle<B>>>>,
    last_error: Mutex<Option<Arc<Error>>>,
}

impl<B: GpuBackend> StreamingTexture<B> {
    /// Create a texture with only its 1x1 baseline level resident
    ///
    /// The baseline is loaded and uploaded synchronously.
    pub fn create(
        backend: Arc<B>,
        store: &MipStore,
        source: impl Into<PathBuf>,
    ) -> Result<Arc<Self>> {
        let source = source.into();
        let info = store.describe(&source)?;
        let baseline = store.load(&source, info.mip_levels - 1)?;
        Self::with_baseline(backend, source, info, &baseline)
    }

    /// Create a texture from an already loaded baseline level
    pub fn with_baseline(
        backend: Arc<B>,
        source: PathBuf,
        info: SourceInfo,
        baseline: &MipData,
    ) -> Result<Arc<Self>> {
        let id = TextureId::next();
        let total = info.mip_levels;
        check_level_data(&source, &info, total - 1, baseline)?;

        let image = backend.create_image(&ImageDesc {
            label: format!("{} ({})", source.display(), id),
            width: info.width,
            height: info.height,
            mip_levels: total,
            format: info.format,
        })?;

        let created = upload_level(backend.as_ref(), &image, baseline).and_then(|_| {
            let view = backend.create_image_view(&image, total - 1, 1)?;
            match backend.create_sampler(0.0) {
                Ok(sampler) => Ok((view, sampler)),
                Err(e) => {
                    backend.defer_disposal(Retired::View(view));
                    Err(e)
                }
            }
        });
        let (view, sampler) = match created {
            Ok(objects) => objects,
            Err(e) => {
                backend.defer_disposal(Retired::Image(image));
                return Err(e);
            }
        };

        log::debug!(
            "Created streaming texture {} for {} ({}x{}, {} mips)",
            id,
            source.display(),
            info.width,
            info.height,
            total
        );

        let published = Arc::new(BindableHandle {
            view: view.clone(),
            sampler: sampler.clone(),
            generation: 0,
            resident_mips: 1,
        });

        Ok(Arc::new(Self {
            id,
            source,
            info,
            backend,
            resident: AtomicU32::new(1),
            generation: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            transition: Mutex::new(Some(GpuObjects { image, view, sampler })),
            published: RwLock::new(Some(published)),
            last_error: Mutex::new(None),
        }))
    }

    // --- Queries ---

    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn info(&self) -> &SourceInfo {
        &self.info
    }

    pub fn total_mip_levels(&self) -> u32 {
        self.info.mip_levels
    }

    pub fn resident_mip_count(&self) -> u32 {
        self.resident.load(Ordering::Acquire)
    }

    pub fn is_fully_resident(&self) -> bool {
        self.resident_mip_count() >= self.info.mip_levels
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Changes whenever the bindable snapshot is replaced
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Snapshot to bind this frame; `None` after disposal
    pub fn current_bindable(&self) -> Option<Arc<BindableHandle<B>>> {
        self.published.read().clone()
    }

    /// Most recent streaming failure, for diagnostics
    ///
    /// Cleared by the next successful promotion.
    pub fn last_stream_error(&self) -> Option<Arc<Error>> {
        self.last_error.lock().clone()
    }

    pub(crate) fn record_error(&self, error: Arc<Error>) {
        *self.last_error.lock() = Some(error);
    }

    /// GPU mip index holding the `count`-th resident level
    pub fn gpu_level(&self, count: u32) -> u32 {
        self.info.mip_levels - count
    }

    /// Bytes added by growing residency from `count - 1` to `count` levels
    pub fn level_bytes(&self, count: u32) -> u64 {
        self.info.level_bytes(self.gpu_level(count))
    }

    /// Bytes of the always-resident 1x1 level
    pub fn baseline_bytes(&self) -> u64 {
        self.level_bytes(1)
    }

    /// Bytes held with `count` levels resident
    pub fn footprint_for(&self, count: u32) -> u64 {
        (1..=count.min(self.info.mip_levels)).map(|c| self.level_bytes(c)).sum()
    }

    /// Bytes held at the current residency
    pub fn footprint_bytes(&self) -> u64 {
        self.footprint_for(self.resident_mip_count())
    }

    /// Smallest eviction that frees at least `needed` bytes
    ///
    /// Returns the resident count to evict down to; 1 if even that falls short.
    pub fn evict_target_for(&self, needed: u64) -> u32 {
        let mut target = self.resident_mip_count();
        let mut freed = 0;
        while target > 1 && freed < needed {
            freed += self.level_bytes(target);
            target -= 1;
        }
        target
    }

    // --- Transitions ---

    /// Ask `scheduler` for one more level; no-op when fully resident
    pub fn request_promotion(
        self: &Arc<Self>,
        scheduler: &StreamingScheduler<B>,
        priority: f32,
    ) -> Result<RequestOutcome> {
        if self.is_fully_resident() {
            return Ok(RequestOutcome::AlreadyResident);
        }
        scheduler.request_stream(self, self.resident_mip_count() + 1, priority)
    }

    /// Upload `data` and grow residency to `target` levels
    ///
    /// `target` must be exactly one more than the current residency. On any
    /// failure the texture keeps its previous residency and bindable; success
    /// clears the last stream error.
    pub fn promote(&self, target: u32, data: &MipData) -> Result<()> {
        let total = self.info.mip_levels;
        if target < 2 || target > total {
            return Err(Error::Range { requested: target, min: 2, max: total });
        }

        let mut guard = self.transition.lock();
        let Some(objects) = guard.as_mut() else {
            return Err(Error::StaleRequest(self.id));
        };
        let resident = self.resident.load(Ordering::Acquire);
        if target != resident + 1 {
            return Err(Error::Range {
                requested: target,
                min: resident + 1,
                max: (resident + 1).min(total),
            });
        }
        let level = self.gpu_level(target);
        check_level_data(&self.source, &self.info, level, data)?;

        upload_level(self.backend.as_ref(), &objects.image, data)?;
        let view = self.backend.create_image_view(&objects.image, level, target)?;
        let sampler = match self.backend.create_sampler((target - 1) as f32) {
            Ok(sampler) => sampler,
            Err(e) => {
                self.backend.defer_disposal(Retired::View(view));
                return Err(e);
            }
        };

        let old_view = std::mem::replace(&mut objects.view, view.clone());
        let old_sampler = std::mem::replace(&mut objects.sampler, sampler.clone());
        self.publish(view, sampler, target);
        self.backend.defer_disposal(Retired::View(old_view));
        self.backend.defer_disposal(Retired::Sampler(old_sampler));
        *self.last_error.lock() = None;
        drop(guard);

        log::debug!("{}: promoted to {}/{} mips", self.id, target, total);
        Ok(())
    }

    /// Shrink residency to `target` levels and return the bytes released
    ///
    /// `target >= resident` changes nothing. Released storage is destroyed
    /// once in-flight frames retire.
    pub fn evict(&self, target: u32) -> Result<u64> {
        let total = self.info.mip_levels;
        if target < 1 || target > total {
            return Err(Error::Range { requested: target, min: 1, max: total });
        }

        let mut guard = self.transition.lock();
        let Some(objects) = guard.as_mut() else {
            return Err(Error::StaleRequest(self.id));
        };
        let resident = self.resident.load(Ordering::Acquire);
        if target >= resident {
            return Ok(0);
        }

        let base = self.gpu_level(target);
        let view = self.backend.create_image_view(&objects.image, base, target)?;
        let sampler = match self.backend.create_sampler((target - 1) as f32) {
            Ok(sampler) => sampler,
            Err(e) => {
                self.backend.defer_disposal(Retired::View(view));
                return Err(e);
            }
        };

        let old_view = std::mem::replace(&mut objects.view, view.clone());
        let old_sampler = std::mem::replace(&mut objects.sampler, sampler.clone());
        self.publish(view, sampler, target);

        let evicted = self.gpu_level(resident)..base;
        let freed: u64 = evicted.clone().map(|level| self.info.level_bytes(level)).sum();
        self.backend.defer_disposal(Retired::View(old_view));
        self.backend.defer_disposal(Retired::Sampler(old_sampler));
        self.backend.defer_disposal(Retired::MipLevels {
            image: objects.image.clone(),
            levels: evicted,
        });
        drop(guard);

        log::debug!("{}: evicted {} -> {} mips ({} bytes)", self.id, resident, target, freed);
        Ok(freed)
    }

    /// Release every GPU object after in-flight frames retire
    ///
    /// Queued or running stream jobs for this texture become stale.
    pub fn dispose(&self) -> Result<()> {
        let mut guard = self.transition.lock();
        let Some(objects) = guard.take() else {
            return Err(Error::AlreadyDisposed(self.id));
        };
        self.disposed.store(true, Ordering::Release);
        *self.published.write() = None;
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.retire(objects);
        drop(guard);

        log::debug!("{}: disposed", self.id);
        Ok(())
    }

    fn publish(&self, view: B::View, sampler: B::Sampler, resident: u32) {
        let generation = self.generation.load(Ordering::Acquire) + 1;
        *self.published.write() = Some(Arc::new(BindableHandle {
            view,
            sampler,
            generation,
            resident_mips: resident,
        }));
        self.resident.store(resident, Ordering::Release);
        self.generation.store(generation, Ordering::Release);
    }

    fn retire(&self, objects: GpuObjects<B>) {
        self.backend.defer_disposal(Retired::View(objects.view));
        self.backend.defer_disposal(Retired::Sampler(objects.sampler));
        self.backend.defer_disposal(Retired::Image(objects.image));
    }
}

impl<B: GpuBackend> Drop for StreamingTexture<B> {
    fn drop(&mut self) {
        if let Some(objects) = self.transition.get_mut().take() {
            log::trace!("{}: dropped without dispose, deferring GPU objects", self.id);
            self.retire(objects);
        }
    }
}

impl<B: GpuBackend> std::fmt::Debug for StreamingTexture<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingTexture")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("resident", &self.resident_mip_count())
            .field("total", &self.info.mip_levels)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn check_level_data(source: &Path, info: &SourceInfo, level: u32, data: &MipData) -> Result<()> {
    let expected = info.level_bytes(level);
    if data.level != level || data.format != info.format || data.pixels.len() as u64 != expected {
        return Err(Error::asset(
            source,
            format!(
                "mip data for level {} has {} bytes (level {}), expected {}",
                level,
                data.pixels.len(),
                data.level,
                expected
            ),
        ));
    }
    Ok(())
}

/// One submission: to transfer layout, copy, back to shader-read
fn upload_level<B: GpuBackend>(backend: &B, image: &B::Image, data: &MipData) -> Result<()> {
    let region = MipRegion {
        mip_level: data.level,
        width: data.width,
        height: data.height,
    };
    backend.submit_single_time_command(|cmd| {
        cmd.transition_mip_layout(image, ImageLayout::TransferDst, region.mip_level);
        cmd.copy_buffer_to_image_region(image, region, &data.pixels);
        cmd.transition_mip_layout(image, ImageLayout::ShaderReadOnly, region.mip_level);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DeviceFailure;
    use crate::render::headless::HeadlessBackend;
    use crate::streaming::testing::synthetic_store;

    type Fixture = (
        Arc<HeadlessBackend>,
        Arc<StreamingTexture<HeadlessBackend>>,
        Arc<MipStore>,
        tempfile::TempDir,
    );

    fn texture_sized(width: u32, height: u32) -> Fixture {
        let (store, _decoder, dir) = synthetic_store(width, height);
        let backend = Arc::new(HeadlessBackend::new());
        let texture = StreamingTexture::create(backend.clone(), &store, "brick.png").unwrap();
        (backend, texture, store, dir)
    }

    fn texture_256x64() -> Fixture {
        texture_sized(256, 64)
    }

    fn promote_next(texture: &StreamingTexture<HeadlessBackend>, store: &MipStore) -> Result<()> {
        let target = texture.resident_mip_count() + 1;
        let data = store.load(texture.source(), texture.gpu_level(target))?;
        texture.promote(target, &data)
    }

    #[test]
    fn test_create_uploads_baseline() {
        let (backend, texture, _store, _dir) = texture_256x64();
        assert_eq!(texture.total_mip_levels(), 9);
        assert_eq!(texture.resident_mip_count(), 1);
        assert!(!texture.is_fully_resident());

        let bindable = texture.current_bindable().unwrap();
        assert_eq!(bindable.view.base_mip, 8);
        assert_eq!(bindable.view.mip_count, 1);
        assert_eq!(bindable.sampler.max_lod, 0.0);

        let image = bindable.view.image;
        assert_eq!(backend.mip_layout(&image, 8), Some(ImageLayout::ShaderReadOnly));
        assert_eq!(backend.image_resident_bytes(&image), 4);
        assert_eq!(texture.footprint_bytes(), 4);
    }

    #[test]
    fn test_promote_one_level_at_a_time() {
        let (backend, texture, store, _dir) = texture_256x64();

        promote_next(&texture, &store).unwrap();
        assert_eq!(texture.resident_mip_count(), 2);
        let bindable = texture.current_bindable().unwrap();
        assert_eq!((bindable.view.base_mip, bindable.view.mip_count), (7, 2));
        assert_eq!(bindable.sampler.max_lod, 1.0);
        assert_eq!(bindable.generation, texture.generation());

        // Skipping a level is a range error
        let data = store.load(texture.source(), 5).unwrap();
        assert!(matches!(texture.promote(4, &data), Err(Error::Range { .. })));
        assert!(matches!(texture.promote(10, &data), Err(Error::Range { .. })));

        while !texture.is_fully_resident() {
            promote_next(&texture, &store).unwrap();
        }
        assert_eq!(texture.resident_mip_count(), 9);
        assert_eq!(backend.image_resident_bytes(&bindable.view.image), texture.footprint_bytes());
        assert_eq!(texture.footprint_bytes(), texture.footprint_for(9));
    }

    #[test]
    fn test_failed_upload_keeps_residency() {
        let (backend, texture, store, _dir) = texture_256x64();
        promote_next(&texture, &store).unwrap();
        let before = texture.current_bindable().unwrap();

        backend.fail_next_submit(DeviceFailure::DeviceLost);
        let err = promote_next(&texture, &store).unwrap_err();
        assert!(matches!(err, Error::Device(DeviceFailure::DeviceLost)));
        assert_eq!(texture.resident_mip_count(), 2);
        assert_eq!(texture.current_bindable().unwrap().view, before.view);
        assert_eq!(backend.mip_contents(&before.view.image, 6), None);

        backend.fail_next_view(DeviceFailure::OutOfMemory);
        assert!(promote_next(&texture, &store).is_err());
        assert_eq!(texture.resident_mip_count(), 2);
        assert_eq!(texture.generation(), before.generation);

        // The next attempt succeeds from the same state
        texture.record_error(Arc::new(Error::StaleRequest(texture.id())));
        promote_next(&texture, &store).unwrap();
        assert_eq!(texture.resident_mip_count(), 3);
        assert!(texture.last_stream_error().is_none());
    }

    #[test]
    fn test_mismatched_data_is_asset_error() {
        let (_backend, texture, store, _dir) = texture_256x64();
        let wrong_level = store.load(texture.source(), 3).unwrap();
        assert!(matches!(texture.promote(2, &wrong_level), Err(Error::Asset { .. })));
        assert_eq!(texture.resident_mip_count(), 1);
    }

    #[test]
    fn test_swapped_view_survives_in_flight_frame() {
        let (backend, texture, store, _dir) = texture_256x64();

        // Render thread captures the snapshot while recording frame 1
        let frame = backend.begin_frame();
        let captured = texture.current_bindable().unwrap();

        promote_next(&texture, &store).unwrap();
        assert_ne!(texture.current_bindable().unwrap().view, captured.view);

        backend.collect_garbage();
        assert!(backend.is_view_live(&captured.view));

        backend.complete_frame(frame);
        assert!(backend.is_view_destroyed(&captured.view));
        assert!(backend.is_view_live(&texture.current_bindable().unwrap().view));
    }

    #[test]
    fn test_evict_frees_exact_level_bytes() {
        let (backend, texture, store, _dir) = texture_256x64();
        for _ in 0..3 {
            promote_next(&texture, &store).unwrap();
        }
        assert_eq!(texture.resident_mip_count(), 4);

        // GPU levels 5, 6 and 7: 8x2, 4x1 and 2x1 RGBA texels
        let expected = 8 * 2 * 4 + 4 * 4 + 2 * 4;
        assert_eq!(texture.evict(1).unwrap(), expected);
        assert_eq!(texture.resident_mip_count(), 1);
        assert_eq!(texture.footprint_bytes(), 4);

        let image = texture.current_bindable().unwrap().view.image;
        backend.complete_frame(backend.fence().current_frame());
        assert_eq!(backend.image_resident_bytes(&image), 4);
    }

    #[test]
    fn test_evict_square_texture_to_baseline() {
        let (_backend, texture, store, _dir) = texture_sized(256, 256);
        for _ in 0..3 {
            promote_next(&texture, &store).unwrap();
        }
        // GPU levels 5, 6 and 7: 8x8, 4x4 and 2x2 RGBA texels
        assert_eq!(texture.evict(1).unwrap(), 336);
        assert_eq!(texture.footprint_bytes(), texture.baseline_bytes());
    }

    #[test]
    fn test_evict_full_chain_top_levels() {
        let (_backend, texture, store, _dir) = texture_256x64();
        while !texture.is_fully_resident() {
            promote_next(&texture, &store).unwrap();
        }
        // 256x64, 128x32 and 64x16 RGBA texels
        assert_eq!(texture.evict(6).unwrap(), 65536 + 16384 + 4096);
        assert_eq!(texture.evict(6).unwrap(), 0);
        assert_eq!(texture.evict(9).unwrap(), 0);
        assert!(matches!(texture.evict(0), Err(Error::Range { .. })));
        assert!(matches!(texture.evict(10), Err(Error::Range { .. })));
    }

    #[test]
    fn test_evict_target_for() {
        let (_backend, texture, store, _dir) = texture_256x64();
        for _ in 0..3 {
            promote_next(&texture, &store).unwrap();
        }
        assert_eq!(texture.evict_target_for(1), 3);
        assert_eq!(texture.evict_target_for(64 + 16), 2);
        assert_eq!(texture.evict_target_for(u64::MAX), 1);
    }

    #[test]
    fn test_dispose_twice() {
        let (backend, texture, store, _dir) = texture_256x64();
        let view = texture.current_bindable().unwrap().view;

        texture.dispose().unwrap();
        assert!(texture.is_disposed());
        assert!(texture.current_bindable().is_none());
        assert!(matches!(texture.dispose(), Err(Error::AlreadyDisposed(_))));
        assert!(matches!(promote_next(&texture, &store), Err(Error::StaleRequest(_))));

        backend.complete_frame(backend.fence().current_frame());
        assert!(backend.is_view_destroyed(&view));
        assert_eq!(backend.image_count(), 0);
    }

    #[test]
    fn test_drop_defers_gpu_objects() {
        let (backend, texture, _store, _dir) = texture_256x64();
        drop(texture);
        assert!(backend.pending_disposals() > 0);
        backend.collect_garbage();
        assert_eq!(backend.image_count(), 0);
        assert_eq!(backend.live_view_count(), 0);
        assert_eq!(backend.live_sampler_count(), 0);
    }

    #[test]
    fn test_failed_create_releases_image() {
        let (store, _decoder, _dir) = synthetic_store(16, 16);
        let backend = Arc::new(HeadlessBackend::new());
        backend.fail_next_submit(DeviceFailure::OutOfMemory);

        let err = StreamingTexture::create(backend.clone(), &store, "a.png").unwrap_err();
        assert!(matches!(err, Error::Device(DeviceFailure::OutOfMemory)));
        backend.collect_garbage();
        assert_eq!(backend.image_count(), 0);
    }

    #[test]
    fn test_failed_image_creation() {
        let (store, _decoder, _dir) = synthetic_store(16, 16);
        let backend = Arc::new(HeadlessBackend::new());
        backend.fail_next_image(DeviceFailure::OutOfMemory);

        let err = StreamingTexture::create(backend.clone(), &store, "a.png").unwrap_err();
        assert!(matches!(err, Error::Device(DeviceFailure::OutOfMemory)));
        assert_eq!(backend.image_count(), 0);
        assert_eq!(backend.live_view_count(), 0);

        // Only the next creation fails
        assert!(StreamingTexture::create(backend.clone(), &store, "a.png").is_ok());
    }
}
