use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::Result;
use crate::frame::{Frame, PoolTag, Shape};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of handing a frame back to a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    /// Pushed onto the free list.
    Recycled,
    /// Allocated before the last resize; dropped.
    Stale,
    /// Not allocated by this pool; dropped.
    Foreign,
}

/// Recycles frames of one fixed shape. The free list is a stack: the most
/// recently freed frame is handed out first.
pub struct FramePool {
    id: u64,
    generation: u64,
    shape: Shape,
    free: Vec<Frame>,
    allocations: u64,
    total_allocations: u64,
    outstanding: usize,
    stale_rejected: u64,
}

impl FramePool {
    pub fn new(shape: Shape) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            generation: 0,
            shape,
            free: Vec::new(),
            allocations: 0,
            total_allocations: 0,
            outstanding: 0,
            stale_rejected: 0,
        }
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    fn tag(&self) -> PoolTag {
        PoolTag {
            pool_id: self.id,
            generation: self.generation,
        }
    }

    /// Allocates a fresh zeroed frame, bypassing the free list.
    pub fn allocate(&mut self) -> Result<Frame> {
        let frame = Frame::new(self.shape)?.with_tag(self.tag());
        self.allocations += 1;
        self.total_allocations += 1;
        self.outstanding += 1;
        log::trace!("allocated frame {} ({} allocations)", self.shape, self.allocations);
        Ok(frame)
    }

    pub fn get_frame(&mut self) -> Result<Frame> {
        match self.free.pop() {
            Some(frame) => {
                self.outstanding += 1;
                Ok(frame)
            }
            None => self.allocate(),
        }
    }

    pub fn free_frame(&mut self, frame: Frame) -> Release {
        let Some(tag) = frame.tag() else {
            log::warn!("rejecting foreign frame {} returned to pool {}", frame.shape(), self.id);
            return Release::Foreign;
        };
        if tag.pool_id != self.id {
            log::warn!(
                "rejecting frame of pool {} returned to pool {}",
                tag.pool_id,
                self.id
            );
            return Release::Foreign;
        }
        if tag.generation != self.generation || frame.shape() != self.shape {
            self.stale_rejected += 1;
            log::debug!(
                "dropping stale frame {} (pool is now {})",
                frame.shape(),
                self.shape
            );
            return Release::Stale;
        }
        self.outstanding = self.outstanding.saturating_sub(1);
        self.free.push(frame);
        Release::Recycled
    }

    /// Switches the pool to a new shape. Frames of the old shape still in
    /// flight are rejected when they come back.
    pub fn set_size(&mut self, shape: Shape) {
        if self.outstanding > 0 {
            log::warn!(
                "resizing pool {} from {} to {} with {} frames outstanding",
                self.id,
                self.shape,
                shape,
                self.outstanding
            );
        }
        self.drain();
        self.shape = shape;
        self.generation += 1;
        self.allocations = 0;
        self.outstanding = 0;
    }

    /// Drops every frame on the free list and reports pool usage.
    pub fn drain(&mut self) {
        log::info!(
            "cleaning up {} frames ({}) - {} allocations",
            self.free.len(),
            self.shape,
            self.allocations
        );
        self.free.clear();
    }

    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    pub fn total_allocations(&self) -> u64 {
        self.total_allocations
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn stale_rejected(&self) -> u64 {
        self.stale_rejected
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        log::debug!(
            "pool {} ({}) dropped: {} frames retained, {} allocations",
            self.id,
            self.shape,
            self.free.len(),
            self.total_allocations
        );
    }
}

/// A pool shared between the capture side and the encoder thread.
#[derive(Clone)]
pub struct SharedPool(Arc<Mutex<FramePool>>);

impl SharedPool {
    pub fn new(shape: Shape) -> Self {
        Self(Arc::new(Mutex::new(FramePool::new(shape))))
    }

    pub fn lock(&self) -> MutexGuard<'_, FramePool> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get_frame(&self) -> Result<Frame> {
        self.lock().get_frame()
    }

    pub fn free_frame(&self, frame: Frame) -> Release {
        self.lock().free_frame(frame)
    }

    pub fn shape(&self) -> Shape {
        self.lock().shape()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PoolRole {
    /// RGBA frames read back from the frame source.
    Capture,
    /// RGB frames queued for the encoder.
    Encode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub role: PoolRole,
}

impl PoolKey {
    pub fn new(shape: Shape, role: PoolRole) -> Self {
        Self {
            width: shape.width,
            height: shape.height,
            depth: shape.depth,
            role,
        }
    }

    pub fn shape(&self) -> Shape {
        Shape::new(self.width, self.height, self.depth)
    }
}

/// Session-scoped set of pools. Two sessions never share a registry.
#[derive(Default)]
pub struct PoolRegistry {
    pools: HashMap<PoolKey, SharedPool>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool(&mut self, shape: Shape, role: PoolRole) -> SharedPool {
        self.pools
            .entry(PoolKey::new(shape, role))
            .or_insert_with(|| SharedPool::new(shape))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Drains every pool and forgets them.
    pub fn drain_all(&mut self) {
        for (key, pool) in self.pools.drain() {
            log::debug!("draining {:?} pool {}", key.role, key.shape());
            pool.lock().drain();
        }
    }
}

#[cfg(test)]
#[path = "pool_test.rs"]
mod pool_test;
