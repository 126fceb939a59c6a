// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Blocking synchronization built on top of the scheduler: a `Mutex` and
//! `CondVar` in the style of the standard library's, plus a counting
//! `Semaphore`, all of which park the calling thread (rather than spin)
//! when contended.
//!
//! Before the scheduler is driving more than one thread, there is by
//! construction no contention to block on, so every lock here degrades to
//! a plain spin until [`enable_scheduling`] is called at the point the
//! first thread is about to leave the kernel's bootstrap path. Calling it
//! twice, or locking before it is called, is harmless.

#![no_std]

extern crate alloc;

use alloc::collections::VecDeque;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex as SpinLock;
use thread::{Status, Tid};

static SCHEDULING_ENABLED: AtomicBool = AtomicBool::new(false);

/// Marks the point past which blocking on a contended lock is safe,
/// because a scheduler is actually running to wake the blocked thread
/// back up.
///
/// Called exactly once, immediately before the kernel's bootstrap thread
/// first `iret`s into its own (or another thread's) execution proper.
pub fn enable_scheduling() {
    SCHEDULING_ENABLED.store(true, Ordering::Release);
}

fn scheduling_enabled() -> bool {
    SCHEDULING_ENABLED.load(Ordering::Acquire)
}

/// A mutual-exclusion lock that parks waiting threads instead of
/// spinning.
///
pub struct Mutex<T> {
    locked: AtomicBool,
    waiters: SpinLock<VecDeque<Tid>>,
    value: UnsafeCell<T>,
}

// Safety: access to `value` is only ever granted through a `MutexGuard`,
// which `Mutex::lock` only ever hands out to one thread at a time.
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new, unlocked mutex wrapping `value`.
    ///
    pub const fn new(value: T) -> Self {
        Mutex {
            locked: AtomicBool::new(false),
            waiters: SpinLock::new(VecDeque::new()),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, blocking the calling thread if it is held.
    ///
    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            if !self.locked.swap(true, Ordering::Acquire) {
                return MutexGuard { mutex: self };
            }
            if !scheduling_enabled() {
                // Nothing else can be running yet to release the lock;
                // spin rather than parking into a scheduler that has no
                // other thread queued to eventually resume us.
                continue;
            }
            let current = scheduler::current();
            self.waiters.lock().push_back(current);
            if let Some(thread) = thread::get(current) {
                thread.set_status(Status::Waiting);
            }
            scheduler::context_switch();
        }
    }

    /// Attempts to acquire the lock without blocking, disabling
    /// interrupts for the duration of the attempt and restoring whatever
    /// interrupt-enable state was observed on entry.
    ///
    /// For use from contexts (interrupt handlers, the allocator) that
    /// must never park a thread. Returns `None` if the lock is held.
    pub fn try_lock_irqsave(&self) -> Option<MutexGuard<'_, T>> {
        let was_enabled = arch::interrupts_enabled();
        arch::disable_interrupts();
        let acquired = !self.locked.swap(true, Ordering::Acquire);
        if was_enabled {
            arch::enable_interrupts();
        }
        if acquired {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
        if let Some(tid) = self.waiters.lock().pop_front() {
            scheduler::wake(tid);
        }
    }
}

/// An RAII guard releasing a [`Mutex`] when dropped.
///
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<'a, T> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<'a, T> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// A condition variable, used together with a [`Mutex`] guarding the
/// condition being waited on.
///
pub struct CondVar {
    waiters: SpinLock<VecDeque<Tid>>,
}

impl CondVar {
    /// Creates a new condition variable with no waiters.
    ///
    pub const fn new() -> Self {
        CondVar {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Atomically releases `guard`'s mutex and blocks the calling thread,
    /// re-acquiring the mutex before returning.
    ///
    /// The ordering here is load-bearing: the thread enqueues itself and
    /// sets its own status to `Waiting` *before* releasing the outer
    /// mutex. Releasing first would let a concurrent `notify` run (and
    /// find no waiter to wake) between the release and the enqueue,
    /// losing the wakeup permanently.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.mutex;
        let current = scheduler::current();
        self.waiters.lock().push_back(current);
        if let Some(thread) = thread::get(current) {
            thread.set_status(Status::Waiting);
        }
        drop(guard);
        scheduler::context_switch();
        mutex.lock()
    }

    /// Wakes one waiting thread, if any.
    ///
    pub fn notify_one(&self) {
        if let Some(tid) = self.waiters.lock().pop_front() {
            scheduler::wake(tid);
        }
    }

    /// Wakes every waiting thread.
    ///
    pub fn notify_all(&self) {
        let mut waiters = self.waiters.lock();
        while let Some(tid) = waiters.pop_front() {
            scheduler::wake(tid);
        }
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

/// A counting semaphore.
///
pub struct Semaphore {
    count: SpinLock<i32>,
    waiters: SpinLock<VecDeque<Tid>>,
}

impl Semaphore {
    /// Creates a semaphore with the given initial count.
    ///
    pub const fn new(initial: i32) -> Self {
        Semaphore {
            count: SpinLock::new(initial),
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Decrements the count, blocking the calling thread while it is
    /// zero or negative.
    pub fn wait(&self) {
        loop {
            let mut count = self.count.lock();
            if *count > 0 {
                *count -= 1;
                return;
            }
            drop(count);
            let current = scheduler::current();
            self.waiters.lock().push_back(current);
            if let Some(thread) = thread::get(current) {
                thread.set_status(Status::Waiting);
            }
            scheduler::context_switch();
        }
    }

    /// Increments the count and wakes one waiting thread, if any.
    ///
    pub fn signal(&self) {
        let mut count = self.count.lock();
        *count += 1;
        drop(count);
        if let Some(tid) = self.waiters.lock().pop_front() {
            scheduler::wake(tid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_round_trips_value() {
        let m = Mutex::new(5);
        {
            let mut guard = m.lock();
            *guard += 1;
        }
        assert_eq!(*m.lock(), 6);
    }

    #[test]
    fn try_lock_irqsave_fails_while_held() {
        let m = Mutex::new(0);
        let guard = m.lock();
        assert!(m.try_lock_irqsave().is_none());
        drop(guard);
        assert!(m.try_lock_irqsave().is_some());
    }

    #[test]
    fn semaphore_wait_consumes_a_signal() {
        let s = Semaphore::new(0);
        s.signal();
        s.wait();
        assert_eq!(*s.count.lock(), 0);
    }

    #[test]
    fn condvar_notify_one_wakes_a_single_waiter() {
        let cv = CondVar::new();
        cv.waiters.lock().push_back(Tid::from_u32(1));
        cv.waiters.lock().push_back(Tid::from_u32(2));
        cv.notify_one();
        assert_eq!(cv.waiters.lock().len(), 1);
    }
}
