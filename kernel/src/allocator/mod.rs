//! Provides the kernel's heap, used by Rust's runtime for every `alloc::`
//! allocation the kernel itself makes (thread/task records, driver
//! queues, frame-allocator bookkeeping).
//!
//! The heap lives inside a fixed, statically-sized region of the
//! direct-mapped kernel area, which is already present and writable
//! before paging is touched, so there is no page-table dance to set it
//! up: we hand the region straight to `linked_list_allocator`.

use linked_list_allocator::LockedHeap;

/// The size of the kernel heap, in bytes.
///
const HEAP_SIZE: usize = 1024 * 1024; // 1 MiB

#[repr(align(4096))]
struct HeapRegion([u8; HEAP_SIZE]);

static mut HEAP_REGION: HeapRegion = HeapRegion([0; HEAP_SIZE]);

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Initializes the global allocator.
///
/// Must be called exactly once, early in boot, before any `alloc::`
/// allocation is made.
///
/// # Safety
///
/// Must not be called more than once.
pub unsafe fn init() {
    let start = HEAP_REGION.0.as_mut_ptr();
    ALLOCATOR.lock().init(start, HEAP_SIZE);
}
