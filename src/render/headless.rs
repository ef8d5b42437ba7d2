//! CPU-side GPU backend
//!
//! Keeps image storage in host memory and tracks every view and sampler it
//! hands out, so tools and tests can run the streaming system without a
//! device, inject device failures, and drive the frame fence by hand.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::core::{DeviceFailure, Error, Result};
use crate::render::disposal::{DeferredDisposal, FrameFence};
use crate::render::gpu::{CommandRecorder, GpuBackend, ImageDesc, ImageLayout, MipRegion, Retired};

/// Image handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeadlessImage(u64);

/// View handle over a mip range
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeadlessView {
    pub id: u64,
    pub image: HeadlessImage,
    pub base_mip: u32,
    pub mip_count: u32,
}

/// Sampler handle
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HeadlessSampler {
    pub id: u64,
    pub max_lod: f32,
}

struct ImageStorage {
    desc: ImageDesc,
    mips: Vec<Option<Vec<u8>>>,
    layouts: Vec<ImageLayout>,
}

impl ImageStorage {
    fn resident_bytes(&self) -> u64 {
        self.mips.iter().flatten().map(|m| m.len() as u64).sum()
    }
}

enum Op {
    Transition { image: HeadlessImage, layout: ImageLayout, mip_level: u32 },
    Copy { image: HeadlessImage, region: MipRegion, data: Vec<u8> },
}

#[derive(Default)]
struct Recorder {
    ops: Vec<Op>,
}

impl CommandRecorder<HeadlessImage> for Recorder {
    fn transition_mip_layout(
        &mut self,
        image: &HeadlessImage,
        layout: ImageLayout,
        mip_level: u32,
    ) {
        self.ops.push(Op::Transition { image: *image, layout, mip_level });
    }

    fn copy_buffer_to_image_region(
        &mut self,
        image: &HeadlessImage,
        region: MipRegion,
        data: &[u8],
    ) {
        self.ops.push(Op::Copy { image: *image, region, data: data.to_vec() });
    }
}

#[derive(Default)]
struct Faults {
    submit: VecDeque<DeviceFailure>,
    view: VecDeque<DeviceFailure>,
    image: VecDeque<DeviceFailure>,
}

#[derive(Default)]
struct DeviceState {
    images: HashMap<HeadlessImage, ImageStorage>,
    live_views: HashMap<u64, HeadlessView>,
    destroyed_views: HashSet<u64>,
    live_samplers: HashSet<u64>,
    submissions: u64,
    faults: Faults,
}

/// Host-memory implementation of [`GpuBackend`]
pub struct HeadlessBackend {
    state: Mutex<DeviceState>,
    fence: FrameFence,
    disposal: DeferredDisposal<Retired<HeadlessBackend>>,
    next_handle: AtomicU64,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeviceState::default()),
            fence: FrameFence::new(),
            disposal: DeferredDisposal::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    // --- Fault injection ---

    /// Make the next single-time submission fail with `failure`
    pub fn fail_next_submit(&self, failure: DeviceFailure) {
        self.state.lock().faults.submit.push_back(failure);
    }

    /// Make the next view creation fail with `failure`
    pub fn fail_next_view(&self, failure: DeviceFailure) {
        self.state.lock().faults.view.push_back(failure);
    }

    /// Make the next image allocation fail with `failure`
    pub fn fail_next_image(&self, failure: DeviceFailure) {
        self.state.lock().faults.image.push_back(failure);
    }

    // --- Frame control ---

    /// Begin recording a frame; returns its index
    pub fn begin_frame(&self) -> u64 {
        self.fence.begin_frame()
    }

    /// Signal that `frame` finished on the "GPU" and release what it protected
    pub fn complete_frame(&self, frame: u64) -> usize {
        self.fence.complete_frame(frame);
        self.collect_garbage()
    }

    /// Destroy every deferred object whose frames have completed
    pub fn collect_garbage(&self) -> usize {
        let retired = self.disposal.collect(self.fence.completed_frame());
        let count = retired.len();
        if count > 0 {
            let mut state = self.state.lock();
            for resource in retired {
                Self::destroy(&mut state, resource);
            }
        }
        count
    }

    fn destroy(state: &mut DeviceState, resource: Retired<HeadlessBackend>) {
        match resource {
            Retired::View(view) => {
                state.live_views.remove(&view.id);
                state.destroyed_views.insert(view.id);
            }
            Retired::Sampler(sampler) => {
                state.live_samplers.remove(&sampler.id);
            }
            Retired::MipLevels { image, levels } => {
                if let Some(storage) = state.images.get_mut(&image) {
                    for level in levels {
                        if let Some(mip) = storage.mips.get_mut(level as usize) {
                            *mip = None;
                        }
                        if let Some(layout) = storage.layouts.get_mut(level as usize) {
                            *layout = ImageLayout::Undefined;
                        }
                    }
                }
            }
            Retired::Image(image) => {
                state.images.remove(&image);
            }
        }
    }

    /// The fence driving deferred disposal
    pub fn fence(&self) -> &FrameFence {
        &self.fence
    }

    // --- Inspection ---

    /// Whether `view` can still be bound safely
    pub fn is_view_live(&self, view: &HeadlessView) -> bool {
        self.state.lock().live_views.contains_key(&view.id)
    }

    /// Whether `view` has been destroyed
    pub fn is_view_destroyed(&self, view: &HeadlessView) -> bool {
        self.state.lock().destroyed_views.contains(&view.id)
    }

    pub fn live_view_count(&self) -> usize {
        self.state.lock().live_views.len()
    }

    pub fn live_sampler_count(&self) -> usize {
        self.state.lock().live_samplers.len()
    }

    pub fn image_count(&self) -> usize {
        self.state.lock().images.len()
    }

    /// Objects waiting on the fence
    pub fn pending_disposals(&self) -> usize {
        self.disposal.pending_count()
    }

    /// Completed single-time submissions
    pub fn submission_count(&self) -> u64 {
        self.state.lock().submissions
    }

    /// Texel bytes of one level, if allocated
    pub fn mip_contents(&self, image: &HeadlessImage, level: u32) -> Option<Vec<u8>> {
        let state = self.state.lock();
        state.images.get(image)?.mips.get(level as usize)?.clone()
    }

    pub fn mip_layout(&self, image: &HeadlessImage, level: u32) -> Option<ImageLayout> {
        let state = self.state.lock();
        state.images.get(image)?.layouts.get(level as usize).copied()
    }

    /// Bytes of level storage currently allocated for `image`
    pub fn image_resident_bytes(&self, image: &HeadlessImage) -> u64 {
        self.state
            .lock()
            .images
            .get(image)
            .map(ImageStorage::resident_bytes)
            .unwrap_or(0)
    }

    /// Bytes of level storage allocated across all images
    pub fn resident_bytes(&self) -> u64 {
        self.state.lock().images.values().map(ImageStorage::resident_bytes).sum()
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuBackend for HeadlessBackend {
    type Image = HeadlessImage;
    type View = HeadlessView;
    type Sampler = HeadlessSampler;

    fn create_image(&self, desc: &ImageDesc) -> Result<Self::Image> {
        let mut state = self.state.lock();
        if let Some(failure) = state.faults.image.pop_front() {
            return Err(failure.into());
        }
        let image = HeadlessImage(self.handle());
        let levels = desc.mip_levels as usize;
        state.images.insert(image, ImageStorage {
            desc: desc.clone(),
            mips: vec![None; levels],
            layouts: vec![ImageLayout::Undefined; levels],
        });
        log::trace!("headless: created image {:?} '{}' ({} mips)", image, desc.label, levels);
        Ok(image)
    }

    fn submit_single_time_command<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&mut dyn CommandRecorder<Self::Image>),
    {
        let mut recorder = Recorder::default();
        record(&mut recorder);

        let mut state = self.state.lock();
        if let Some(failure) = state.faults.submit.pop_front() {
            return Err(failure.into());
        }

        // Validate the whole batch against a scratch copy of the layouts
        // before touching storage
        let mut layouts: HashMap<(HeadlessImage, u32), ImageLayout> = HashMap::new();
        for op in &recorder.ops {
            let (image, level) = match op {
                Op::Transition { image, mip_level, .. } => (*image, *mip_level),
                Op::Copy { image, region, .. } => (*image, region.mip_level),
            };
            let storage = state.images.get(&image).ok_or_else(|| {
                Error::Device(DeviceFailure::Other(format!("unknown image {image:?}")))
            })?;
            if level >= storage.desc.mip_levels {
                return Err(DeviceFailure::Other(format!("mip {level} out of bounds")).into());
            }
            let current = layouts
                .get(&(image, level))
                .copied()
                .unwrap_or(storage.layouts[level as usize]);
            match op {
                Op::Transition { layout, .. } => {
                    layouts.insert((image, level), *layout);
                }
                Op::Copy { region, data, .. } => {
                    let expected = region.width as usize
                        * region.height as usize
                        * storage.desc.format.bytes_per_pixel() as usize;
                    if data.len() != expected {
                        return Err(DeviceFailure::Other(format!(
                            "copy of {} bytes into a {} byte region",
                            data.len(),
                            expected
                        ))
                        .into());
                    }
                    if current != ImageLayout::TransferDst {
                        return Err(DeviceFailure::Other(format!(
                            "mip {level} is not in TransferDst layout"
                        ))
                        .into());
                    }
                }
            }
        }

        for ((image, level), layout) in layouts {
            if let Some(storage) = state.images.get_mut(&image) {
                storage.layouts[level as usize] = layout;
            }
        }
        for op in recorder.ops {
            if let Op::Copy { image, region, data } = op {
                if let Some(storage) = state.images.get_mut(&image) {
                    storage.mips[region.mip_level as usize] = Some(data);
                }
            }
        }
        state.submissions += 1;
        Ok(())
    }

    fn create_image_view(
        &self,
        image: &Self::Image,
        base_mip: u32,
        mip_count: u32,
    ) -> Result<Self::View> {
        let mut state = self.state.lock();
        if let Some(failure) = state.faults.view.pop_front() {
            return Err(failure.into());
        }
        let levels = state
            .images
            .get(image)
            .map(|s| s.desc.mip_levels)
            .ok_or_else(|| DeviceFailure::Other(format!("unknown image {image:?}")))?;
        if mip_count == 0 || base_mip + mip_count > levels {
            return Err(DeviceFailure::Other(format!(
                "view {}..{} exceeds {} mips",
                base_mip,
                base_mip + mip_count,
                levels
            ))
            .into());
        }
        let view = HeadlessView {
            id: self.handle(),
            image: *image,
            base_mip,
            mip_count,
        };
        state.live_views.insert(view.id, view);
        Ok(view)
    }

    fn create_sampler(&self, max_lod: f32) -> Result<Self::Sampler> {
        let sampler = HeadlessSampler { id: self.handle(), max_lod };
        self.state.lock().live_samplers.insert(sampler.id);
        Ok(sampler)
    }

    fn defer_disposal(&self, resource: Retired<Self>) {
        log::trace!("headless: deferring {:?} past frame {}", resource, self.fence.current_frame());
        self.disposal.defer(resource, &self.fence);
    }
}
