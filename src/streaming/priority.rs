//! Priority queue for texture stream requests
//!
//! One entry per texture. Re-submitting a texture coalesces into its existing
//! entry: the newest priority wins and the target becomes the larger of the
//! two. Superseded heap entries are skipped lazily when they reach the top.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::core::types::{TextureId, Vec3};

/// Priority bonus for textures on visible surfaces
pub const VISIBLE_BONUS: f32 = 100.0;

/// Priority for a texture whose surface is centered at `center`
///
/// Closer is higher; visible surfaces get a flat bonus so anything on screen
/// outranks everything off screen.
pub fn view_priority(camera_pos: Vec3, center: Vec3, radius: f32, visible: bool) -> f32 {
    let distance = (camera_pos.distance(center) - radius).max(0.0);
    1.0 / (distance + 1.0) + if visible { VISIBLE_BONUS } else { 0.0 }
}

/// Request to raise a texture to `target` resident mips
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamRequest {
    pub texture: TextureId,
    pub target: u32,
    /// Higher = serviced first
    pub priority: f32,
}

#[derive(Clone, Copy, Debug)]
struct HeapEntry {
    priority: f32,
    seq: u64,
    texture: TextureId,
}

impl Eq for HeapEntry {}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on priority; among equals the older request wins
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Copy, Debug)]
struct Pending {
    target: u32,
    priority: f32,
    seq: u64,
}

/// Coalescing max-priority queue of stream requests
#[derive(Default)]
pub struct StreamQueue {
    heap: BinaryHeap<HeapEntry>,
    pending: HashMap<TextureId, Pending>,
    next_seq: u64,
}

impl StreamQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request, coalescing with any queued request for the same texture
    ///
    /// Returns true if a new entry was created.
    pub fn push(&mut self, request: StreamRequest) -> bool {
        self.insert(request, None)
    }

    /// Put back the continuation of a popped request at its original place
    /// among equal priorities
    ///
    /// Keeps a multi-level request ahead of equal-priority requests that were
    /// queued after it.
    pub fn requeue(&mut self, request: StreamRequest, seq: u64) -> bool {
        self.insert(request, Some(seq))
    }

    fn insert(&mut self, request: StreamRequest, seq: Option<u64>) -> bool {
        let created = match self.pending.get_mut(&request.texture) {
            Some(pending) => {
                pending.target = pending.target.max(request.target);
                if pending.priority.to_bits() != request.priority.to_bits() {
                    pending.priority = request.priority;
                    self.heap.push(HeapEntry {
                        priority: request.priority,
                        seq: pending.seq,
                        texture: request.texture,
                    });
                }
                false
            }
            None => {
                let seq = seq.unwrap_or_else(|| {
                    let next = self.next_seq;
                    self.next_seq += 1;
                    next
                });
                self.pending.insert(
                    request.texture,
                    Pending {
                        target: request.target,
                        priority: request.priority,
                        seq,
                    },
                );
                self.heap.push(HeapEntry {
                    priority: request.priority,
                    seq,
                    texture: request.texture,
                });
                true
            }
        };

        if self.heap.len() > self.pending.len() * 2 + 64 {
            self.rebuild();
        }
        created
    }

    /// Highest-priority request, without removing it
    pub fn peek(&mut self) -> Option<StreamRequest> {
        self.discard_superseded();
        let top = self.heap.peek()?;
        let pending = self.pending.get(&top.texture)?;
        Some(StreamRequest {
            texture: top.texture,
            target: pending.target,
            priority: pending.priority,
        })
    }

    /// Remove and return the highest-priority request
    pub fn pop(&mut self) -> Option<StreamRequest> {
        self.pop_with_seq().map(|(request, _)| request)
    }

    /// Like [`StreamQueue::pop`], also returning the entry's FIFO sequence
    /// number for [`StreamQueue::requeue`]
    pub fn pop_with_seq(&mut self) -> Option<(StreamRequest, u64)> {
        self.discard_superseded();
        let top = self.heap.pop()?;
        let pending = self.pending.remove(&top.texture)?;
        let request = StreamRequest {
            texture: top.texture,
            target: pending.target,
            priority: pending.priority,
        };
        Some((request, pending.seq))
    }

    /// Drop the queued request for `texture`, if any
    pub fn remove(&mut self, texture: TextureId) -> Option<StreamRequest> {
        self.pending.remove(&texture).map(|p| StreamRequest {
            texture,
            target: p.target,
            priority: p.priority,
        })
    }

    /// Replace priorities of queued requests and rebuild the heap
    ///
    /// Entries not named keep their priority. Textures that are not queued
    /// are ignored. Cost is O(n) in the queue length per call, which is fine
    /// for queues in the low hundreds; larger queues should batch updates.
    pub fn update_priorities(&mut self, updates: &[(TextureId, f32)]) -> usize {
        let mut changed = 0;
        for &(texture, priority) in updates {
            if let Some(pending) = self.pending.get_mut(&texture) {
                pending.priority = priority;
                changed += 1;
            }
        }
        self.rebuild();
        changed
    }

    pub fn contains(&self, texture: TextureId) -> bool {
        self.pending.contains_key(&texture)
    }

    /// Queued target for `texture`
    pub fn target_of(&self, texture: TextureId) -> Option<u32> {
        self.pending.get(&texture).map(|p| p.target)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.pending.clear();
    }

    fn rebuild(&mut self) {
        self.heap = self
            .pending
            .iter()
            .map(|(&texture, p)| HeapEntry {
                priority: p.priority,
                seq: p.seq,
                texture,
            })
            .collect();
    }

    fn discard_superseded(&mut self) {
        while let Some(top) = self.heap.peek() {
            let live = self.pending.get(&top.texture).is_some_and(|p| {
                p.seq == top.seq && p.priority.to_bits() == top.priority.to_bits()
            });
            if live {
                break;
            }
            self.heap.pop();
        }
    }
}
