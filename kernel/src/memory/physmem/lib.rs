// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The physical frame allocator: a LIFO stack of free user frames, plus
//! per-frame reference counts used by the copy-on-write virtual memory
//! code to know when a frame can be reused outright versus must be
//! copied.
//!
//! Frames below [`memlayout::KERNEL_RESERVED_PHYS`] belong to the kernel
//! and are never placed on the free stack; every other frame, up to
//! [`memlayout::RAM_SIZE`], is allocatable.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;
use lazy_static::lazy_static;
use memlayout::{KERNEL_RESERVED_PHYS, PAGE_SIZE, RAM_SIZE};
use pretty::Bytes;
use spin::Mutex;

/// Identifies a physical page frame by its index: frame `i` covers
/// physical addresses `[i * PAGE_SIZE, (i + 1) * PAGE_SIZE)`.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Frame(u32);

impl Frame {
    /// Returns the frame containing the given physical address.
    ///
    pub const fn containing(phys_addr: u32) -> Self {
        Frame(phys_addr / PAGE_SIZE)
    }

    /// Returns this frame's index.
    ///
    pub const fn index(self) -> u32 {
        self.0
    }

    /// Returns the physical address of the start of this frame.
    ///
    pub const fn start_address(self) -> u32 {
        self.0 * PAGE_SIZE
    }
}

struct Allocator {
    /// Free user frames, most recently freed on top.
    free: Vec<u32>,
    /// Reference counts, indexed by frame number across the whole
    /// physical address space (including the kernel region, whose
    /// entries are always a single implicit reference and never
    /// touched).
    refcounts: Vec<Mutex<u32>>,
    total_frames: u32,
}

impl Allocator {
    fn new() -> Self {
        Allocator {
            free: Vec::new(),
            refcounts: Vec::new(),
            total_frames: 0,
        }
    }
}

lazy_static! {
    static ref ALLOCATOR: Mutex<Allocator> = Mutex::new(Allocator::new());
}

/// Initializes the frame allocator, treating every frame from
/// [`KERNEL_RESERVED_PHYS`] up to [`RAM_SIZE`] as a free user frame.
///
/// Must be called exactly once, early in boot, before any call to
/// [`allocate_frame`].
pub fn init() {
    let mut allocator = ALLOCATOR.lock();
    let total_frames = RAM_SIZE / PAGE_SIZE;
    let first_user_frame = KERNEL_RESERVED_PHYS / PAGE_SIZE;

    allocator.total_frames = total_frames;
    allocator.refcounts = (0..total_frames).map(|_| Mutex::new(0)).collect();
    allocator.free = (first_user_frame..total_frames).rev().collect();

    let free_count = allocator.free.len();
    drop(allocator);
    serial::println!(
        "physmem: {} frames free ({})",
        free_count,
        Bytes::from_u64(free_count as u64 * PAGE_SIZE as u64)
    );
}

/// Pops a free frame off the stack and sets its reference count to 1.
///
/// Returns `None` (the allocator's out-of-memory sentinel) if no frames
/// remain; callers surface this as `NOMEM`.
pub fn allocate_frame() -> Option<Frame> {
    let mut allocator = ALLOCATOR.lock();
    let index = allocator.free.pop()?;
    *allocator.refcounts[index as usize].lock() = 1;
    Some(Frame(index))
}

/// Increments a frame's reference count, for example when a second page
/// table entry is made to reference it during copy-on-write cloning.
///
pub fn incref(frame: Frame) {
    let allocator = ALLOCATOR.lock();
    *allocator.refcounts[frame.index() as usize].lock() += 1;
}

/// Decrements a frame's reference count, freeing it (pushing it back
/// onto the free stack) if it reaches zero.
///
/// # Panics
///
/// Panics if the frame's reference count was already zero.
pub fn decref(frame: Frame) {
    let mut allocator = ALLOCATOR.lock();
    let reached_zero = {
        let mut count = allocator.refcounts[frame.index() as usize].lock();
        assert!(*count > 0, "decref on a frame with a zero refcount");
        *count -= 1;
        *count == 0
    };
    if reached_zero {
        allocator.free.push(frame.index());
    }
}

/// Returns a frame's current reference count.
///
pub fn refcount(frame: Frame) -> u32 {
    let allocator = ALLOCATOR.lock();
    *allocator.refcounts[frame.index() as usize].lock()
}

/// Returns the number of frames currently on the free stack.
///
pub fn free_frames() -> usize {
    ALLOCATOR.lock().free.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset(total_frames: u32) {
        let mut allocator = ALLOCATOR.lock();
        let first_user_frame = KERNEL_RESERVED_PHYS / PAGE_SIZE;
        allocator.total_frames = total_frames;
        allocator.refcounts = (0..total_frames).map(|_| Mutex::new(0)).collect();
        allocator.free = (first_user_frame..total_frames).rev().collect();
    }

    #[test]
    fn allocate_then_free_round_trips() {
        reset(KERNEL_RESERVED_PHYS / PAGE_SIZE + 16);
        let before = free_frames();
        let frame = allocate_frame().expect("allocation should succeed");
        assert_eq!(free_frames(), before - 1);
        assert_eq!(refcount(frame), 1);
        decref(frame);
        assert_eq!(free_frames(), before);
    }

    #[test]
    fn shared_frame_is_not_freed_until_last_decref() {
        reset(KERNEL_RESERVED_PHYS / PAGE_SIZE + 16);
        let frame = allocate_frame().unwrap();
        incref(frame);
        assert_eq!(refcount(frame), 2);
        let before = free_frames();
        decref(frame);
        assert_eq!(free_frames(), before);
        decref(frame);
        assert_eq!(free_frames(), before + 1);
    }

    #[test]
    fn exhausting_the_stack_returns_none() {
        reset(KERNEL_RESERVED_PHYS / PAGE_SIZE + 1);
        let first = allocate_frame();
        assert!(first.is_some());
        assert!(allocate_frame().is_none());
    }
}
