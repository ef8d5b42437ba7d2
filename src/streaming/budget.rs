//! Memory budget management for streaming
//!
//! Tracks GPU bytes held by streaming textures against a fixed budget and
//! keeps an LRU order so the scheduler can pick eviction victims. Not
//! internally synchronized; the scheduler lock guards it.

use std::collections::HashMap;

use crate::core::TextureId;

#[derive(Debug, Clone, Copy)]
struct Allocation {
    /// Bytes currently charged to the texture (resident mips plus reservations)
    bytes: u64,
    /// Bytes that can never be evicted (the baseline mip)
    baseline: u64,
    /// Frame of the most recent `touch`
    last_touched: u64,
}

/// Budget tracker for resident texture memory
///
/// `used_bytes` always equals the sum of all tracked allocations.
pub struct BudgetTracker {
    budget_bytes: u64,
    used_bytes: u64,
    allocations: HashMap<TextureId, Allocation>,
    /// Access order: oldest first, newest last
    access_order: Vec<TextureId>,
}

impl BudgetTracker {
    /// Create a tracker with a budget in bytes
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            budget_bytes,
            used_bytes: 0,
            allocations: HashMap::new(),
            access_order: Vec::new(),
        }
    }

    // --- Tracking methods ---

    /// Register a texture's current footprint
    ///
    /// Returns false (and changes nothing) when the texture is already tracked.
    pub fn track(&mut self, id: TextureId, footprint: u64, baseline: u64) -> bool {
        if self.allocations.contains_key(&id) {
            return false;
        }
        self.allocations.insert(
            id,
            Allocation {
                bytes: footprint,
                baseline: baseline.min(footprint),
                last_touched: 0,
            },
        );
        self.access_order.push(id);
        self.used_bytes = self.used_bytes.saturating_add(footprint);
        true
    }

    /// Stop tracking a texture and return the bytes it held
    pub fn untrack(&mut self, id: TextureId) -> Option<u64> {
        let alloc = self.allocations.remove(&id)?;
        self.access_order.retain(|&t| t != id);
        self.used_bytes = self.used_bytes.saturating_sub(alloc.bytes);
        Some(alloc.bytes)
    }

    /// Apply an incremental footprint change
    ///
    /// Negative deltas never take an allocation below zero. Returns false for
    /// untracked textures.
    pub fn update_usage(&mut self, id: TextureId, delta: i64) -> bool {
        let Some(alloc) = self.allocations.get_mut(&id) else {
            return false;
        };
        if delta >= 0 {
            let add = delta as u64;
            alloc.bytes = alloc.bytes.saturating_add(add);
            self.used_bytes = self.used_bytes.saturating_add(add);
        } else {
            let sub = delta.unsigned_abs().min(alloc.bytes);
            alloc.bytes -= sub;
            self.used_bytes = self.used_bytes.saturating_sub(sub);
        }
        true
    }

    /// Mark a texture as used in `frame`, moving it to the LRU tail
    pub fn touch(&mut self, id: TextureId, frame: u64) {
        let Some(alloc) = self.allocations.get_mut(&id) else {
            return;
        };
        alloc.last_touched = alloc.last_touched.max(frame);
        if let Some(pos) = self.access_order.iter().position(|&t| t == id) {
            self.access_order.remove(pos);
        }
        self.access_order.push(id);
    }

    /// Least-recently-used texture worth evicting to free `needed` bytes
    ///
    /// Textures for which `is_busy` returns true, and textures touched within
    /// the last `grace_frames` frames, are skipped. Prefers the oldest texture
    /// that alone frees `needed`; otherwise the oldest with anything evictable.
    pub fn eviction_candidate(
        &self,
        needed: u64,
        frame: u64,
        grace_frames: u64,
        is_busy: impl Fn(TextureId) -> bool,
    ) -> Option<TextureId> {
        let mut fallback = None;
        for &id in &self.access_order {
            let Some(alloc) = self.allocations.get(&id) else {
                continue;
            };
            let evictable = alloc.bytes.saturating_sub(alloc.baseline);
            let in_grace = frame.saturating_sub(alloc.last_touched) < grace_frames;
            if evictable == 0 || in_grace || is_busy(id) {
                continue;
            }
            if evictable >= needed {
                return Some(id);
            }
            fallback.get_or_insert(id);
        }
        fallback
    }

    /// Bytes above baseline held by textures that pass the same filters as
    /// [`BudgetTracker::eviction_candidate`]
    ///
    /// With `grace_frames = 0` and an `is_busy` that only excludes the
    /// requester, this is everything eviction could ever free for it.
    pub fn evictable_bytes(
        &self,
        frame: u64,
        grace_frames: u64,
        is_busy: impl Fn(TextureId) -> bool,
    ) -> u64 {
        self.allocations
            .iter()
            .filter(|&(&id, alloc)| {
                frame.saturating_sub(alloc.last_touched) >= grace_frames && !is_busy(id)
            })
            .map(|(_, alloc)| alloc.bytes.saturating_sub(alloc.baseline))
            .sum()
    }

    // --- Query methods ---

    /// Check if `extra` more bytes fit in the budget
    pub fn can_allocate(&self, extra: u64) -> bool {
        self.used_bytes.saturating_add(extra) <= self.budget_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    /// Bytes still available before the budget is reached
    pub fn available(&self) -> u64 {
        self.budget_bytes.saturating_sub(self.used_bytes)
    }

    /// Memory pressure (0.0 to 1.0+)
    ///
    /// Values above 1.0 mean baselines alone exceed the budget.
    pub fn pressure(&self) -> f32 {
        if self.budget_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f32 / self.budget_bytes as f32
    }

    /// Bytes charged to a texture
    pub fn allocation(&self, id: TextureId) -> Option<u64> {
        self.allocations.get(&id).map(|a| a.bytes)
    }

    pub fn is_tracked(&self, id: TextureId) -> bool {
        self.allocations.contains_key(&id)
    }

    pub fn tracked_count(&self) -> usize {
        self.allocations.len()
    }

    /// Sum of all allocations, recomputed (consistency checks)
    pub fn recount(&self) -> u64 {
        self.allocations.values().map(|a| a.bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> TextureId {
        TextureId::from_raw(raw)
    }

    #[test]
    fn test_budget_new() {
        let budget = BudgetTracker::new(1024);
        assert_eq!(budget.used_bytes(), 0);
        assert_eq!(budget.available(), 1024);
        assert!(budget.can_allocate(1024));
        assert!(!budget.can_allocate(1025));
    }

    #[test]
    fn test_track_is_idempotent() {
        let mut budget = BudgetTracker::new(1024);
        assert!(budget.track(id(1), 100, 4));
        assert!(!budget.track(id(1), 500, 4));

        assert_eq!(budget.used_bytes(), 100);
        assert_eq!(budget.tracked_count(), 1);
    }

    #[test]
    fn test_untrack_returns_bytes() {
        let mut budget = BudgetTracker::new(1024);
        budget.track(id(1), 100, 4);
        budget.track(id(2), 50, 4);

        assert_eq!(budget.untrack(id(1)), Some(100));
        assert_eq!(budget.untrack(id(1)), None);
        assert_eq!(budget.used_bytes(), 50);
        assert_eq!(budget.used_bytes(), budget.recount());
    }

    #[test]
    fn test_update_usage() {
        let mut budget = BudgetTracker::new(1024);
        budget.track(id(1), 100, 4);

        assert!(budget.update_usage(id(1), 200));
        assert_eq!(budget.allocation(id(1)), Some(300));
        assert!(budget.update_usage(id(1), -1000)); // clamps at zero
        assert_eq!(budget.allocation(id(1)), Some(0));
        assert_eq!(budget.used_bytes(), 0);

        assert!(!budget.update_usage(id(9), 10));
        assert_eq!(budget.used_bytes(), budget.recount());
    }

    #[test]
    fn test_pressure() {
        let mut budget = BudgetTracker::new(1000);
        budget.track(id(1), 900, 4);
        assert!((budget.pressure() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_eviction_prefers_lru_that_frees_enough() {
        let mut budget = BudgetTracker::new(10_000);
        budget.track(id(1), 100, 4); // oldest, small
        budget.track(id(2), 1000, 4);
        budget.track(id(3), 1000, 4);

        assert_eq!(budget.eviction_candidate(500, 10, 0, |_| false), Some(id(2)));

        budget.touch(id(2), 10);
        assert_eq!(budget.eviction_candidate(500, 10, 0, |_| false), Some(id(3)));
    }

    #[test]
    fn test_eviction_falls_back_to_any_evictable() {
        let mut budget = BudgetTracker::new(10_000);
        budget.track(id(1), 100, 4);
        budget.track(id(2), 200, 4);

        assert_eq!(budget.eviction_candidate(5000, 10, 0, |_| false), Some(id(1)));
    }

    #[test]
    fn test_evictable_bytes_respects_filters() {
        let mut budget = BudgetTracker::new(10_000);
        budget.track(id(1), 100, 4);
        budget.track(id(2), 200, 4);
        budget.track(id(3), 4, 4);
        budget.touch(id(2), 9);

        assert_eq!(budget.evictable_bytes(10, 0, |_| false), 96 + 196);
        assert_eq!(budget.evictable_bytes(10, 0, |t| t == id(1)), 196);
        // id(2) is inside a two frame grace window
        assert_eq!(budget.evictable_bytes(10, 2, |_| false), 96);
    }

    #[test]
    fn test_eviction_skips_busy_baseline_and_recent() {
        let mut budget = BudgetTracker::new(10_000);
        budget.track(id(1), 4, 4); // baseline only
        budget.track(id(2), 1000, 4);
        budget.track(id(3), 1000, 4);
        budget.touch(id(3), 9);

        assert_eq!(budget.eviction_candidate(10, 10, 0, |t| t == id(2)), Some(id(3)));
        // id(3) was touched one frame ago, inside a two frame grace window
        assert_eq!(budget.eviction_candidate(10, 10, 2, |t| t == id(2)), None);
    }
}
