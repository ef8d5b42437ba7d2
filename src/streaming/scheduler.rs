//! Background scheduler for texture streaming
//!
//! Requests are kept in a coalescing priority queue. A fixed pool of worker
//! threads takes the highest-priority request whose next mip level fits the
//! budget, reserves those bytes, and loads and uploads the level outside the
//! scheduler lock. When the head of the queue does not fit, workers evict
//! least-recently-used textures (if enabled) or sleep until woken.
//!
//! Lock order: the scheduler lock is never held while a texture's transition
//! lock is taken. At most one job (promotion or eviction) runs per texture;
//! requests arriving meanwhile are parked and re-queued when it finishes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::core::{Error, Result, TextureId};
use crate::render::gpu::GpuBackend;
use crate::streaming::budget::BudgetTracker;
use crate::streaming::config::StreamingConfig;
use crate::streaming::mip_store::MipStore;
use crate::streaming::priority::{StreamQueue, StreamRequest};
use crate::streaming::texture::StreamingTexture;

/// What happened to a [`StreamingScheduler::request_stream`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// New queue entry
    Queued,
    /// Merged into the texture's queued request
    Coalesced,
    /// A job is running for the texture; re-queued when it finishes
    Parked,
    /// Residency already meets the target
    AlreadyResident,
}

/// Called from worker threads for asset and device failures and for requests
/// dropped because their next level can never fit the budget
pub type FailureCallback = Arc<dyn Fn(TextureId, &Error) + Send + Sync>;

/// Snapshot of scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamingStats {
    pub queued: usize,
    pub in_flight: usize,
    pub tracked: usize,
    pub used_bytes: u64,
    pub budget_bytes: u64,
    pub pressure: f32,
    pub promotions: u64,
    pub evictions: u64,
    pub stale_dropped: u64,
    pub over_budget: u64,
    pub asset_failures: u64,
    pub device_failures: u64,
    pub bytes_streamed: u64,
    pub bytes_evicted: u64,
}

#[derive(Default)]
struct Counters {
    promotions: u64,
    evictions: u64,
    stale_dropped: u64,
    over_budget: u64,
    asset_failures: u64,
    device_failures: u64,
    bytes_streamed: u64,
    bytes_evicted: u64,
}

struct State<B: GpuBackend> {
    queue: StreamQueue,
    tracker: BudgetTracker,
    registry: HashMap<TextureId, Weak<StreamingTexture<B>>>,
    in_flight: HashSet<TextureId>,
    parked: HashMap<TextureId, StreamRequest>,
    frame: u64,
    counters: Counters,
    shutdown: bool,
}

enum Job<B: GpuBackend> {
    Promote {
        texture: Arc<StreamingTexture<B>>,
        target: u32,
        /// Bytes charged to the tracker at dequeue
        reserved: u64,
        /// Residency the request ultimately asked for
        final_target: u32,
        priority: f32,
        /// Queue position among equal priorities, kept for the continuation
        seq: u64,
    },
    Evict {
        texture: Arc<StreamingTexture<B>>,
        target: u32,
    },
    /// Request dropped at dequeue; only reported
    Reject {
        texture: Arc<StreamingTexture<B>>,
        error: Error,
    },
}

struct Shared<B: GpuBackend> {
    state: Mutex<State<B>>,
    /// Wakes workers when requests arrive or bytes are released
    work_ready: Condvar,
    /// Wakes `wait_idle` callers when a job finishes
    idle: Condvar,
    store: Arc<MipStore>,
    config: StreamingConfig,
    on_failure: RwLock<Option<FailureCallback>>,
}

/// Priority-driven streaming of mip levels under a memory budget
pub struct StreamingScheduler<B: GpuBackend> {
    shared: Arc<Shared<B>>,
    workers: Vec<JoinHandle<()>>,
}

impl<B: GpuBackend> StreamingScheduler<B> {
    /// Validate `config` and start `config.worker_count` worker threads
    pub fn new(config: StreamingConfig, store: Arc<MipStore>) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: StreamQueue::new(),
                tracker: BudgetTracker::new(config.budget_bytes),
                registry: HashMap::new(),
                in_flight: HashSet::new(),
                parked: HashMap::new(),
                frame: 0,
                counters: Counters::default(),
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
            store,
            config,
            on_failure: RwLock::new(None),
        });

        let mut workers = Vec::with_capacity(shared.config.worker_count);
        for index in 0..shared.config.worker_count {
            let worker_shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("texstream-worker-{}", index))
                .spawn(move || worker_shared.worker_loop())?;
            workers.push(handle);
        }

        log::info!(
            "Texture streaming started: {} workers, budget {:.1} MB",
            workers.len(),
            shared.config.budget_bytes as f64 / (1024.0 * 1024.0)
        );
        Ok(Self { shared, workers })
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Arc<MipStore> {
        &self.shared.store
    }

    /// Start tracking a texture's resident bytes without requesting anything
    pub fn register(&self, texture: &Arc<StreamingTexture<B>>) -> Result<()> {
        if texture.is_disposed() {
            return Err(Error::StaleRequest(texture.id()));
        }
        let mut state = self.shared.state.lock();
        Self::track_locked(&mut state, texture);
        Ok(())
    }

    /// Ask for `texture` to reach `target` resident levels
    ///
    /// Non-blocking. `target` must lie in `1..=total_mip_levels`.
    pub fn request_stream(
        &self,
        texture: &Arc<StreamingTexture<B>>,
        target: u32,
        priority: f32,
    ) -> Result<RequestOutcome> {
        let id = texture.id();
        let total = texture.total_mip_levels();
        if target < 1 || target > total {
            return Err(Error::Range { requested: target, min: 1, max: total });
        }
        if texture.is_disposed() {
            return Err(Error::StaleRequest(id));
        }

        let mut state = self.shared.state.lock();
        Self::track_locked(&mut state, texture);
        let frame = state.frame;
        state.tracker.touch(id, frame);

        if target <= texture.resident_mip_count() {
            return Ok(RequestOutcome::AlreadyResident);
        }

        let request = StreamRequest { texture: id, target, priority };
        if state.in_flight.contains(&id) {
            state
                .parked
                .entry(id)
                .and_modify(|parked| {
                    parked.target = parked.target.max(target);
                    parked.priority = priority;
                })
                .or_insert(request);
            log::trace!("{}: job in flight, parked request for {} mips", id, target);
            return Ok(RequestOutcome::Parked);
        }

        let created = state.queue.push(request);
        drop(state);
        self.shared.work_ready.notify_one();

        Ok(if created { RequestOutcome::Queued } else { RequestOutcome::Coalesced })
    }

    /// Replace priorities of queued and parked requests
    ///
    /// Rebuilds the whole queue: O(n) in the number of queued textures per
    /// call. Suitable for queues in the low hundreds; callers with larger
    /// queues should send only the priorities that changed, and not every
    /// frame. Returns how many queued requests were updated.
    pub fn update_priorities(&self, updates: &[(TextureId, f32)]) -> usize {
        let mut state = self.shared.state.lock();
        for &(id, priority) in updates {
            if let Some(parked) = state.parked.get_mut(&id) {
                parked.priority = priority;
            }
        }
        let changed = state.queue.update_priorities(updates);
        drop(state);
        self.shared.work_ready.notify_all();
        changed
    }

    /// Untrack and dispose `texture` immediately, dropping its requests
    ///
    /// Returns the bytes that were charged to it. A job already running for
    /// the texture finishes against a disposed texture and is discarded.
    pub fn evict_texture(&self, texture: &Arc<StreamingTexture<B>>) -> Result<u64> {
        let id = texture.id();
        let freed = {
            let mut state = self.shared.state.lock();
            state.registry.remove(&id);
            state.queue.remove(id);
            state.parked.remove(&id);
            state.tracker.untrack(id).unwrap_or(0)
        };
        self.shared.work_ready.notify_all();
        self.shared.idle.notify_all();

        texture.dispose()?;
        log::debug!("{}: evicted from streaming ({} bytes)", id, freed);
        Ok(freed)
    }

    /// Shrink `texture` to `target` resident levels through the scheduler
    ///
    /// Returns the bytes released. Returns 0 without changes while a job is
    /// running for the texture. Failures go to the caller, not the failure
    /// callback.
    pub fn demote(&self, texture: &Arc<StreamingTexture<B>>, target: u32) -> Result<u64> {
        let id = texture.id();
        let total = texture.total_mip_levels();
        if target < 1 || target > total {
            return Err(Error::Range { requested: target, min: 1, max: total });
        }
        if texture.is_disposed() {
            return Err(Error::StaleRequest(id));
        }
        {
            let mut state = self.shared.state.lock();
            if state.in_flight.contains(&id) {
                log::debug!("{}: demote refused, job in flight", id);
                return Ok(0);
            }
            Self::track_locked(&mut state, texture);
            state.in_flight.insert(id);
        }
        self.shared.run_evict(texture, target)
    }

    /// Mark a texture as used this frame (LRU order)
    pub fn touch(&self, id: TextureId) {
        let mut state = self.shared.state.lock();
        let frame = state.frame;
        state.tracker.touch(id, frame);
    }

    /// Advance the LRU clock and forget textures that were dropped or disposed
    /// outside the scheduler
    pub fn begin_frame(&self) -> u64 {
        let mut state = self.shared.state.lock();
        state.frame += 1;

        let dead: Vec<TextureId> = state
            .registry
            .iter()
            .filter(|(id, weak)| {
                !state.in_flight.contains(*id)
                    && weak.upgrade().is_none_or(|texture| texture.is_disposed())
            })
            .map(|(&id, _)| id)
            .collect();

        for id in &dead {
            Shared::forget_locked(&mut state, *id);
        }
        let frame = state.frame;
        drop(state);

        if !dead.is_empty() {
            log::debug!("Swept {} dropped streaming textures", dead.len());
            self.shared.work_ready.notify_all();
            self.shared.idle.notify_all();
        }
        frame
    }

    /// Run up to `max_jobs` jobs on the calling thread; returns how many ran
    pub fn process_pending(&self, max_jobs: usize) -> usize {
        let mut ran = 0;
        while ran < max_jobs {
            let job = {
                let mut state = self.shared.state.lock();
                self.shared.next_job(&mut state)
            };
            match job {
                Some(job) => {
                    self.shared.run(job);
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }

    /// Block until the queue is empty and no job is running
    ///
    /// Returns false on timeout, e.g. when the head request cannot fit.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if state.queue.is_empty() && state.in_flight.is_empty() {
                return true;
            }
            if self.shared.idle.wait_until(&mut state, deadline).timed_out() {
                return state.queue.is_empty() && state.in_flight.is_empty();
            }
        }
    }

    pub fn set_failure_callback<F>(&self, callback: F)
    where
        F: Fn(TextureId, &Error) + Send + Sync + 'static,
    {
        *self.shared.on_failure.write() = Some(Arc::new(callback));
    }

    pub fn clear_failure_callback(&self) {
        *self.shared.on_failure.write() = None;
    }

    pub fn stats(&self) -> StreamingStats {
        let state = self.shared.state.lock();
        let c = &state.counters;
        StreamingStats {
            queued: state.queue.len(),
            in_flight: state.in_flight.len(),
            tracked: state.tracker.tracked_count(),
            used_bytes: state.tracker.used_bytes(),
            budget_bytes: state.tracker.budget_bytes(),
            pressure: state.tracker.pressure(),
            promotions: c.promotions,
            evictions: c.evictions,
            stale_dropped: c.stale_dropped,
            over_budget: c.over_budget,
            asset_failures: c.asset_failures,
            device_failures: c.device_failures,
            bytes_streamed: c.bytes_streamed,
            bytes_evicted: c.bytes_evicted,
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.shared.state.lock().tracker.used_bytes()
    }

    pub fn budget_bytes(&self) -> u64 {
        self.shared.config.budget_bytes
    }

    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_in_flight(&self, id: TextureId) -> bool {
        self.shared.state.lock().in_flight.contains(&id)
    }

    fn track_locked(state: &mut State<B>, texture: &Arc<StreamingTexture<B>>) {
        let id = texture.id();
        state.registry.entry(id).or_insert_with(|| Arc::downgrade(texture));
        if state.tracker.track(id, texture.footprint_bytes(), texture.baseline_bytes()) {
            log::trace!("{}: tracking {} bytes", id, texture.footprint_bytes());
        }
    }
}

impl<B: GpuBackend> Drop for StreamingScheduler<B> {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work_ready.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Texture streaming worker panicked");
            }
        }
        log::info!("Texture streaming stopped");
    }
}

impl<B: GpuBackend> Shared<B> {
    fn worker_loop(&self) {
        loop {
            let job = {
                let mut state = self.state.lock();
                loop {
                    if state.shutdown {
                        return;
                    }
                    if let Some(job) = self.next_job(&mut state) {
                        break job;
                    }
                    if state.queue.is_empty() && state.in_flight.is_empty() {
                        self.idle.notify_all();
                    }
                    self.work_ready.wait_for(&mut state, self.config.idle_sleep());
                }
            };
            self.run(job);
        }
    }

    /// Pick the next job, reserving budget for promotions
    ///
    /// Only the head of the queue is considered; lower priorities wait even
    /// if they would fit.
    fn next_job(&self, state: &mut State<B>) -> Option<Job<B>> {
        loop {
            let head = state.queue.peek()?;
            let id = head.texture;

            let live = state
                .registry
                .get(&id)
                .and_then(Weak::upgrade)
                .filter(|texture| !texture.is_disposed());
            let Some(texture) = live else {
                state.queue.remove(id);
                state.counters.stale_dropped += 1;
                if !state.in_flight.contains(&id) {
                    Self::forget_locked(state, id);
                }
                log::trace!("{}: dropped stale request", id);
                continue;
            };

            if state.in_flight.contains(&id) {
                if let Some(request) = state.queue.remove(id) {
                    let parked = state.parked.entry(id).or_insert(request);
                    parked.target = parked.target.max(request.target);
                    parked.priority = request.priority;
                }
                continue;
            }

            let resident = texture.resident_mip_count();
            if head.target <= resident {
                state.queue.remove(id);
                continue;
            }

            let target = resident + 1;
            let bytes = texture.level_bytes(target);
            if state.tracker.can_allocate(bytes) {
                let (_, seq) = state.queue.pop_with_seq()?;
                state.tracker.update_usage(id, bytes as i64);
                state.in_flight.insert(id);
                log::trace!("{}: dequeued promotion to {} ({} bytes)", id, target, bytes);
                return Some(Job::Promote {
                    texture,
                    target,
                    reserved: bytes,
                    final_target: head.target,
                    priority: head.priority,
                    seq,
                });
            }

            // Everything else at baseline still leaves no room: drop the
            // request instead of blocking the queue behind it
            let available = state.tracker.available();
            let others = state.tracker.evictable_bytes(0, 0, |t| t == id);
            let capacity = available.saturating_add(others);
            if bytes > capacity {
                state.queue.remove(id);
                state.counters.over_budget += 1;
                return Some(Job::Reject {
                    error: Error::OverBudget { texture: id, needed: bytes, capacity },
                    texture,
                });
            }

            if !self.config.evict_under_pressure {
                return None;
            }
            let needed = bytes.saturating_sub(available);
            let in_flight = &state.in_flight;
            let busy = |t: TextureId| t == id || in_flight.contains(&t);
            let grace = self.config.eviction_grace_frames;
            // Wait rather than evict when the victims available now cannot
            // cover the shortfall together
            if state.tracker.evictable_bytes(state.frame, grace, &busy) < needed {
                return None;
            }
            let victim_id = state.tracker.eviction_candidate(needed, state.frame, grace, &busy)?;

            let victim = state
                .registry
                .get(&victim_id)
                .and_then(Weak::upgrade)
                .filter(|texture| !texture.is_disposed());
            match victim {
                Some(victim) => {
                    let victim_target = victim.evict_target_for(needed);
                    state.in_flight.insert(victim_id);
                    log::trace!(
                        "{}: evicting {} to {} mips for {}",
                        victim_id,
                        victim.resident_mip_count(),
                        victim_target,
                        id
                    );
                    return Some(Job::Evict { texture: victim, target: victim_target });
                }
                None => Self::forget_locked(state, victim_id),
            }
        }
    }

    fn run(&self, job: Job<B>) {
        match job {
            Job::Promote { texture, target, reserved, final_target, priority, seq } => {
                let continuation =
                    StreamRequest { texture: texture.id(), target: final_target, priority };
                self.run_promote(&texture, target, reserved, continuation, seq)
            }
            Job::Evict { texture, target } => {
                if let Err(e) = self.run_evict(&texture, target) {
                    if e.is_stale() {
                        log::trace!("{}: stale eviction dropped", texture.id());
                    } else {
                        self.report_failure(&texture, e);
                    }
                }
            }
            Job::Reject { texture, error } => {
                self.idle.notify_all();
                self.report_failure(&texture, error);
            }
        }
    }

    fn run_promote(
        &self,
        texture: &Arc<StreamingTexture<B>>,
        target: u32,
        reserved: u64,
        continuation: StreamRequest,
        seq: u64,
    ) {
        let id = texture.id();
        let result = self
            .store
            .load(texture.source(), texture.gpu_level(target))
            .and_then(|data| texture.promote(target, &data));

        let failure = {
            let mut state = self.state.lock();
            state.in_flight.remove(&id);
            let failure = match result {
                Ok(()) => {
                    state.counters.promotions += 1;
                    state.counters.bytes_streamed += reserved;
                    if continuation.target > target && state.registry.contains_key(&id) {
                        state.queue.requeue(continuation, seq);
                    }
                    None
                }
                Err(e) => {
                    state.tracker.update_usage(id, -(reserved as i64));
                    match &e {
                        Error::StaleRequest(_) => {
                            state.counters.stale_dropped += 1;
                            Self::forget_locked(&mut state, id);
                        }
                        Error::Device(_) => state.counters.device_failures += 1,
                        _ => state.counters.asset_failures += 1,
                    }
                    Some(e)
                }
            };
            Self::release_locked(&mut state, id);
            failure
        };
        self.work_ready.notify_all();
        self.idle.notify_all();

        match failure {
            None => log::trace!("{}: streamed to {} mips", id, target),
            Some(e) if e.is_stale() => log::trace!("{}: stale promotion dropped", id),
            Some(e) => self.report_failure(texture, e),
        }
    }

    /// Evict on the calling thread; the texture must already be marked in flight
    fn run_evict(&self, texture: &Arc<StreamingTexture<B>>, target: u32) -> Result<u64> {
        let id = texture.id();
        let result = texture.evict(target);

        {
            let mut state = self.state.lock();
            state.in_flight.remove(&id);
            match &result {
                Ok(freed) => {
                    state.tracker.update_usage(id, -(*freed as i64));
                    if *freed > 0 {
                        state.counters.evictions += 1;
                        state.counters.bytes_evicted += freed;
                    }
                }
                Err(e) if e.is_stale() => Self::forget_locked(&mut state, id),
                Err(_) => {}
            }
            Self::release_locked(&mut state, id);
        }
        self.work_ready.notify_all();
        self.idle.notify_all();
        result
    }

    /// Re-queue whatever arrived while the texture's job was running
    fn release_locked(state: &mut State<B>, id: TextureId) {
        if let Some(request) = state.parked.remove(&id) {
            if state.registry.contains_key(&id) {
                state.queue.push(request);
            }
        }
    }

    /// Drop every trace of a texture that went away
    fn forget_locked(state: &mut State<B>, id: TextureId) {
        state.registry.remove(&id);
        if state.queue.remove(id).is_some() {
            state.counters.stale_dropped += 1;
        }
        state.parked.remove(&id);
        state.tracker.untrack(id);
    }

    fn report_failure(&self, texture: &StreamingTexture<B>, error: Error) {
        log::warn!("{}: streaming {} failed: {}", texture.id(), texture.source().display(), error);
        let error = Arc::new(error);
        texture.record_error(Arc::clone(&error));
        let callback = self.on_failure.read().clone();
        if let Some(callback) = callback {
            callback(texture.id(), &error);
        }
    }
}
