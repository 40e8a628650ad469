// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Emulated physical memory with per-frame reference counts
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FramePool (alloc/free_frames/failpoints), FrameRef (clone = +1, drop = -1)
//! DEPENDS_ON: spin::Mutex (free list, frame contents)
//! INVARIANTS: A frame is back on the free list iff its count reached zero; fresh frames are
//!             zero-filled; frame numbers are only reachable through FrameRef

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{fence, AtomicUsize, Ordering};

#[cfg(feature = "failpoints")]
use core::sync::atomic::AtomicIsize;

use spin::Mutex;

use super::PAGE_SIZE;
use crate::types::Pfn;

struct FrameSlot {
    refs: AtomicUsize,
    bytes: Mutex<Option<Box<[u8]>>>,
}

impl FrameSlot {
    const fn empty() -> Self {
        Self { refs: AtomicUsize::new(0), bytes: Mutex::new(None) }
    }
}

struct PoolInner {
    slots: Box<[FrameSlot]>,
    free: Mutex<Vec<Pfn>>,
    // Remaining successful allocations; negative means unlimited.
    #[cfg(feature = "failpoints")]
    budget: AtomicIsize,
}

impl PoolInner {
    fn slot(&self, pfn: Pfn) -> &FrameSlot {
        &self.slots[pfn.as_index()]
    }

    #[cfg(feature = "failpoints")]
    fn take_budget(&self) -> bool {
        self.budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| match left {
                left if left < 0 => Some(left),
                0 => None,
                left => Some(left - 1),
            })
            .is_ok()
    }

    #[cfg(not(feature = "failpoints"))]
    fn take_budget(&self) -> bool {
        true
    }

    fn release(&self, pfn: Pfn) {
        *self.slot(pfn).bytes.lock() = None;
        self.free.lock().push(pfn);
    }
}

/// Fixed pool of emulated physical frames.
///
/// Cloning the pool yields another handle to the same frames.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    /// Creates a pool of `frames` free frames.
    pub fn new(frames: usize) -> Self {
        let slots: Vec<FrameSlot> = (0..frames).map(|_| FrameSlot::empty()).collect();
        // Popped from the back, so low frame numbers are handed out first.
        let free = (0..frames).rev().map(Pfn::from_index).collect();
        Self {
            inner: Arc::new(PoolInner {
                slots: slots.into_boxed_slice(),
                free: Mutex::new(free),
                #[cfg(feature = "failpoints")]
                budget: AtomicIsize::new(-1),
            }),
        }
    }

    /// Allocates a zero-filled frame with a reference count of one.
    #[must_use]
    pub fn alloc(&self) -> Option<FrameRef> {
        if !self.inner.take_budget() {
            crate::log_debug!(target: "mm", "frame alloc denied by failpoint");
            return None;
        }
        let pfn = self.inner.free.lock().pop()?;
        let slot = self.inner.slot(pfn);
        *slot.bytes.lock() = Some(vec![0_u8; PAGE_SIZE].into_boxed_slice());
        slot.refs.store(1, Ordering::Release);
        Some(FrameRef { pool: Arc::clone(&self.inner), pfn })
    }

    /// Total number of frames.
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    /// Frames currently on the free list.
    pub fn free_frames(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Frames currently referenced by at least one handle.
    pub fn used_frames(&self) -> usize {
        self.capacity() - self.free_frames()
    }
}

#[cfg(feature = "failpoints")]
impl FramePool {
    /// Lets the next `successes` allocations through, then fails every allocation until
    /// [`FramePool::clear_failpoint`] is called.
    pub fn fail_after(&self, successes: usize) {
        let budget = isize::try_from(successes).unwrap_or(isize::MAX);
        self.inner.budget.store(budget, Ordering::Release);
    }

    /// Removes an allocation budget installed by [`FramePool::fail_after`].
    pub fn clear_failpoint(&self) {
        self.inner.budget.store(-1, Ordering::Release);
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("capacity", &self.capacity())
            .field("free", &self.free_frames())
            .finish()
    }
}

/// Owning handle to one physical frame.
///
/// Every clone counts as one reference; the frame returns to its pool when the last handle
/// is dropped. Page tables hold these handles, never bare frame numbers.
pub struct FrameRef {
    pool: Arc<PoolInner>,
    pfn: Pfn,
}

impl FrameRef {
    pub fn pfn(&self) -> Pfn {
        self.pfn
    }

    pub fn phys_addr(&self) -> usize {
        self.pfn.phys_addr()
    }

    /// Current number of handles (mappings plus transient holders) to this frame.
    pub fn ref_count(&self) -> usize {
        self.pool.slot(self.pfn).refs.load(Ordering::Acquire)
    }

    /// Returns true if both handles name the same physical frame.
    pub fn same_frame(&self, other: &FrameRef) -> bool {
        Arc::ptr_eq(&self.pool, &other.pool) && self.pfn == other.pfn
    }

    /// Copies bytes starting at `offset` into `buf`; reads past the page end are truncated.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> usize {
        let guard = self.pool.slot(self.pfn).bytes.lock();
        let Some(bytes) = guard.as_deref() else {
            return 0;
        };
        if offset >= bytes.len() {
            return 0;
        }
        let src = &bytes[offset..];
        let len = src.len().min(buf.len());
        buf[..len].copy_from_slice(&src[..len]);
        len
    }

    /// Copies `data` into the frame at `offset`; writes past the page end are truncated.
    pub fn write(&self, offset: usize, data: &[u8]) -> usize {
        let mut guard = self.pool.slot(self.pfn).bytes.lock();
        let Some(bytes) = guard.as_deref_mut() else {
            return 0;
        };
        if offset >= bytes.len() {
            return 0;
        }
        let dst = &mut bytes[offset..];
        let len = dst.len().min(data.len());
        dst[..len].copy_from_slice(&data[..len]);
        len
    }
}

impl Clone for FrameRef {
    fn clone(&self) -> Self {
        self.pool.slot(self.pfn).refs.fetch_add(1, Ordering::Relaxed);
        Self { pool: Arc::clone(&self.pool), pfn: self.pfn }
    }
}

impl Drop for FrameRef {
    fn drop(&mut self) {
        if self.pool.slot(self.pfn).refs.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            self.pool.release(self.pfn);
        }
    }
}

impl fmt::Debug for FrameRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameRef({}, refs={})", self.pfn, self.ref_count())
    }
}
