// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The schedulable unit: a kernel stack, a scheduling status, and the
//! bookkeeping the scheduler and the user-driver framework hang off it.
//!
//! This crate deliberately knows nothing about queues, blocking, or tasks:
//! it is the bottom of the multitasking stack, so that the scheduler, the
//! synchronization primitives, and the lifecycle calls (which all need to
//! manipulate threads) can each build on it without a dependency cycle.

#![no_std]

extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;

/// The size of a thread's kernel stack.
///
/// Threads never recurse deeply in the kernel (syscalls run to completion
/// except at well-defined blocking points), so a small, fixed stack is
/// enough; there is no provision for stack growth.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Uniquely identifies a thread (and, since a task's id equals its first
/// thread's id, a task too).
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(u32);

impl Tid {
    /// The reserved id of the scheduler's idle thread.
    ///
    pub const IDLE: Tid = Tid(0);

    fn next() -> Tid {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        Tid(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns this id's numerical value, for passing across the syscall
    /// boundary.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Wraps a raw id received from user space.
    ///
    pub const fn from_u32(id: u32) -> Tid {
        Tid(id)
    }
}

/// A thread's scheduling state.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Currently executing on the CPU.
    Running,
    /// On the runqueue, waiting for its turn.
    Runnable,
    /// Blocked in a mutex, condition variable, semaphore wait, sleep, or
    /// `udriv_wait`.
    Waiting,
    /// Blocked in `deschedule`, waiting for a matching `make_runnable`.
    Descheduled,
    /// Has vanished; its record is retained only until the owning task is
    /// fully torn down.
    Exited,
}

/// A thread's private, fixed-size kernel stack.
///
pub struct KernelStack(alloc::boxed::Box<[u8; KERNEL_STACK_SIZE]>);

impl KernelStack {
    fn new() -> Self {
        KernelStack(alloc::boxed::Box::new([0u8; KERNEL_STACK_SIZE]))
    }

    /// Returns the address one past the top of the stack (the stack grows
    /// down from here).
    pub fn top(&self) -> u32 {
        self.0.as_ptr() as u32 + KERNEL_STACK_SIZE as u32
    }

    /// Returns whether `addr` lies within this stack's bytes.
    ///
    pub fn contains(&self, addr: u32) -> bool {
        let base = self.0.as_ptr() as u32;
        addr >= base && addr < base + KERNEL_STACK_SIZE as u32
    }
}

/// A single thread of execution.
///
/// `saved_sp` and the kernel stack's contents are only meaningful while the
/// thread is not [`Status::Running`]; the scheduler is the sole reader and
/// writer of `saved_sp`, always with interrupts disabled.
pub struct Thread {
    id: Tid,
    /// The task this thread belongs to. Lifecycle owns the actual `Task`
    /// record; this is just the id linking back to it.
    task: AtomicU32,
    kernel_stack: KernelStack,
    saved_sp: UnsafeCell<u32>,
    status: Mutex<Status>,
    /// The tick count at which a sleeping thread should wake; ignored
    /// otherwise.
    wake_time: AtomicU64,
    /// `deschedule`'s reject flag, read by the caller before it blocks.
    descheduled: Mutex<bool>,
    /// Driver ids this thread currently owns, for `udriv_*` bookkeeping.
    pub udriv_list: Mutex<Vec<u32>>,
    /// Driver ids with a pending message for this thread, FIFO.
    pub pending_driver_queue: Mutex<VecDeque<u32>>,
    /// The physical address of the owning task's page directory.
    ///
    /// Cached here, rather than looked up from the task record on every
    /// switch, so the scheduler (which sits below the lifecycle layer that
    /// owns tasks) can reload `cr3` using nothing but the `Thread` it is
    /// switching to.
    pd_phys_addr: AtomicU32,
}

// Thread's only non-Sync field (`saved_sp`) is touched exclusively by the
// scheduler while the thread is not running, always under the scheduler's
// own lock; see `scheduler::context_switch`.
unsafe impl Sync for Thread {}

impl Thread {
    /// Returns this thread's id.
    ///
    pub fn id(&self) -> Tid {
        self.id
    }

    /// Returns the id of the task this thread belongs to.
    ///
    pub fn task(&self) -> Tid {
        Tid(self.task.load(Ordering::Relaxed))
    }

    /// Fixes up this thread's task id.
    ///
    /// A task's id equals its first thread's id, which is only known
    /// once the thread itself has been created; the lifecycle layer
    /// calls this once, immediately after, to close that loop.
    pub fn set_task(&self, task: Tid) {
        self.task.store(task.as_u32(), Ordering::Relaxed);
    }

    /// Returns this thread's current status.
    ///
    pub fn status(&self) -> Status {
        *self.status.lock()
    }

    /// Sets this thread's status.
    ///
    pub fn set_status(&self, status: Status) {
        *self.status.lock() = status;
    }

    /// Returns the tick count at which this thread should wake, if
    /// sleeping.
    pub fn wake_time(&self) -> u64 {
        self.wake_time.load(Ordering::Relaxed)
    }

    /// Sets the tick count at which this thread should wake.
    ///
    pub fn set_wake_time(&self, ticks: u64) {
        self.wake_time.store(ticks, Ordering::Relaxed);
    }

    /// Returns the top of this thread's kernel stack, for programming
    /// `esp0` on a context switch into it.
    pub fn kernel_stack_top(&self) -> u32 {
        self.kernel_stack.top()
    }

    /// Returns a pointer to this thread's saved stack pointer cell.
    ///
    /// # Safety
    ///
    /// Must only be dereferenced by the scheduler, with interrupts
    /// disabled, while this thread is not running.
    pub unsafe fn saved_sp_ptr(&self) -> *mut u32 {
        self.saved_sp.get()
    }

    /// Reads the thread's saved stack pointer.
    ///
    pub fn saved_sp(&self) -> u32 {
        unsafe { *self.saved_sp.get() }
    }

    /// Overwrites the thread's saved stack pointer.
    ///
    /// Used when crafting a brand-new or cloned kernel stack before the
    /// thread has ever run.
    pub fn set_saved_sp(&self, sp: u32) {
        unsafe { *self.saved_sp.get() = sp };
    }

    /// Returns a mutable view of this thread's kernel stack bytes.
    ///
    /// # Safety
    ///
    /// The caller must ensure the thread is not concurrently running on
    /// this stack.
    pub unsafe fn kernel_stack_bytes(&self) -> &mut [u8; KERNEL_STACK_SIZE] {
        let ptr = &raw const *self.kernel_stack.0 as *mut [u8; KERNEL_STACK_SIZE];
        &mut *ptr
    }

    /// Sets `deschedule`'s reject flag, read once by the thread as it
    /// decides whether to actually block.
    pub fn set_descheduled_reject(&self, reject: bool) {
        *self.descheduled.lock() = reject;
    }

    /// Returns `deschedule`'s reject flag.
    ///
    pub fn descheduled_reject(&self) -> bool {
        *self.descheduled.lock()
    }

    /// Returns the physical address of the owning task's page directory.
    ///
    pub fn pd_phys_addr(&self) -> u32 {
        self.pd_phys_addr.load(Ordering::Relaxed)
    }

    /// Records the physical address of the owning task's page directory.
    ///
    /// Called by the lifecycle layer whenever a task's address space is
    /// created, cloned, or replaced (`exec`), for every thread in the task.
    pub fn set_pd_phys_addr(&self, addr: u32) {
        self.pd_phys_addr.store(addr, Ordering::Relaxed);
    }
}

lazy_static! {
    static ref THREADS: Mutex<BTreeMap<Tid, alloc::sync::Arc<Thread>>> =
        Mutex::new(BTreeMap::new());
}

/// Creates a new thread under the given task and registers it.
///
pub fn create(task: Tid) -> alloc::sync::Arc<Thread> {
    let id = Tid::next();
    let thread = alloc::sync::Arc::new(Thread {
        id,
        task: AtomicU32::new(task.as_u32()),
        kernel_stack: KernelStack::new(),
        saved_sp: UnsafeCell::new(0),
        status: Mutex::new(Status::Runnable),
        wake_time: AtomicU64::new(0),
        descheduled: Mutex::new(false),
        udriv_list: Mutex::new(Vec::new()),
        pending_driver_queue: Mutex::new(VecDeque::new()),
        pd_phys_addr: AtomicU32::new(0),
    });
    THREADS.lock().insert(id, thread.clone());
    thread
}

/// Registers the first thread of the bootstrap/idle task under the
/// reserved [`Tid::IDLE`].
///
pub fn create_idle() -> alloc::sync::Arc<Thread> {
    let thread = alloc::sync::Arc::new(Thread {
        id: Tid::IDLE,
        task: AtomicU32::new(Tid::IDLE.as_u32()),
        kernel_stack: KernelStack::new(),
        saved_sp: UnsafeCell::new(0),
        status: Mutex::new(Status::Running),
        wake_time: AtomicU64::new(0),
        descheduled: Mutex::new(false),
        udriv_list: Mutex::new(Vec::new()),
        pending_driver_queue: Mutex::new(VecDeque::new()),
        pd_phys_addr: AtomicU32::new(0),
    });
    THREADS.lock().insert(Tid::IDLE, thread.clone());
    thread
}

/// Looks up a thread by id.
///
pub fn get(id: Tid) -> Option<alloc::sync::Arc<Thread>> {
    THREADS.lock().get(&id).cloned()
}

/// Removes a thread's record entirely, releasing its kernel stack.
///
/// Called once a vanished thread's resources have been fully reclaimed.
pub fn remove(id: Tid) {
    THREADS.lock().remove(&id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_threads_get_distinct_ids() {
        let a = create(Tid::from_u32(100));
        let b = create(Tid::from_u32(100));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.task(), Tid::from_u32(100));
    }

    #[test]
    fn kernel_stack_top_is_stack_aligned() {
        let t = create(Tid::from_u32(1));
        assert_eq!(t.kernel_stack_top() % 4, 0);
        assert!(t.kernel_stack.contains(t.kernel_stack_top() - 1));
    }

    #[test]
    fn status_round_trips() {
        let t = create(Tid::from_u32(1));
        assert_eq!(t.status(), Status::Runnable);
        t.set_status(Status::Waiting);
        assert_eq!(t.status(), Status::Waiting);
    }
}
