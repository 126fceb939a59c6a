// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Preemptive round-robin scheduling: a runqueue, a wake-time-ordered sleep
//! queue, a driver-priority queue that always runs before ordinary
//! runnable threads, and the low-level context switch that moves the CPU
//! from one thread's kernel stack to another's.
//!
//! The scheduler knows threads only through [`thread::Thread`]; it has no
//! notion of tasks, address spaces, or syscalls. Anything above this layer
//! (`sync`, `lifecycle`, `udrivers`) calls into [`context_switch`], [`wake`],
//! and friends rather than manipulating queues directly.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use lazy_static::lazy_static;
use list::List;
use spin::Mutex;
use syscalls::Error;
use thread::{Status, Tid};

/// Ticks since boot, advanced by [`tick`].
///
static TICKS: AtomicU64 = AtomicU64::new(0);

struct State {
    current: Tid,
    idle: Tid,
    runqueue: List<Tid>,
    driver_queue: List<Tid>,
    /// Sleeping threads, kept sorted ascending by wake time so the head
    /// is always the next thread due to wake.
    sleepq: Vec<Tid>,
}

impl State {
    const fn new() -> Self {
        State {
            current: Tid::IDLE,
            idle: Tid::IDLE,
            runqueue: List::new(),
            driver_queue: List::new(),
            sleepq: Vec::new(),
        }
    }

    fn insert_sleeping(&mut self, tid: Tid, wake_time: u64) {
        let pos = self
            .sleepq
            .iter()
            .position(|&other| {
                thread::get(other).map(|t| t.wake_time()).unwrap_or(0) > wake_time
            })
            .unwrap_or(self.sleepq.len());
        self.sleepq.insert(pos, tid);
    }
}

lazy_static! {
    static ref STATE: Mutex<State> = Mutex::new(State::new());
}

/// Creates the idle thread and makes it the initially-running thread.
///
/// Must be called once, during boot, before the first timer tick or
/// syscall can reach [`context_switch`].
pub fn init() {
    let idle = thread::create_idle();
    let mut state = STATE.lock();
    state.current = idle.id();
    state.idle = idle.id();
}

/// Returns the id of the thread currently executing.
///
pub fn current() -> Tid {
    STATE.lock().current
}

/// Returns the number of timer ticks since boot.
///
pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Advances the tick counter and preempts the running thread.
///
/// Called from the timer interrupt handler, with interrupts already
/// disabled (they are re-enabled, if appropriate, by the handler's own
/// `iret`).
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    context_switch();
}

/// Marks `tid` runnable and appends it to the ordinary runqueue.
///
/// Used to wake a thread blocked in a mutex, condition variable,
/// semaphore, or sleep.
pub fn wake(tid: Tid) {
    if let Some(thread) = thread::get(tid) {
        thread.set_status(Status::Runnable);
        STATE.lock().runqueue.push_back(tid);
    }
}

/// Marks `tid` runnable and appends it to the driver-priority queue,
/// which [`next_thread`] always drains before the ordinary runqueue.
///
/// Used to wake a thread blocked in `udriv_wait` once a message arrives.
pub fn wake_driver_priority(tid: Tid) {
    if let Some(thread) = thread::get(tid) {
        thread.set_status(Status::Runnable);
        STATE.lock().driver_queue.push_back(tid);
    }
}

/// Appends a freshly created, already-[`Status::Runnable`] thread to the
/// runqueue.
///
/// Used by the lifecycle layer when `fork`/`thread_fork` bring a new
/// thread into existence.
pub fn enqueue(tid: Tid) {
    STATE.lock().runqueue.push_back(tid);
}

/// Wakes a thread blocked in `deschedule`, as the `make_runnable` syscall.
///
/// Returns `Err(Error::Inval)` if `tid` does not name a thread currently
/// blocked in `deschedule`.
pub fn make_runnable(tid: Tid) -> Result<(), Error> {
    let thread = thread::get(tid).ok_or(Error::Inval)?;
    if thread.status() != Status::Descheduled {
        return Err(Error::Inval);
    }
    thread.set_status(Status::Runnable);
    STATE.lock().runqueue.push_back(tid);
    Ok(())
}

/// Sets the calling thread's status and blocks it by switching away.
///
/// The caller is responsible for having already arranged to be woken
/// (queued on a mutex/condvar waiter list, `udriv_list`, etc.) before
/// calling this, since `status` alone is not enough to find the thread
/// again.
pub fn block_current(status: Status) {
    let current = thread::get(current()).expect("current thread missing");
    current.set_status(status);
    context_switch();
}

/// Puts the calling thread to sleep for `ticks` timer ticks.
///
/// Returns immediately, without switching away, if `ticks` is zero.
pub fn sleep(ticks: u32) {
    if ticks == 0 {
        return;
    }
    let current_tid = current();
    let thread = thread::get(current_tid).expect("current thread missing");
    let wake_time = get_ticks() + ticks as u64;
    thread.set_wake_time(wake_time);
    thread.set_status(Status::Waiting);
    STATE.lock().insert_sleeping(current_tid, wake_time);
    context_switch();
}

/// Implements the `yield` syscall: `target` is `None` for a plain yield
/// (give up the CPU, but keep running if nothing else is ready) or
/// `Some(tid)` to prefer switching to a specific thread next.
///
/// Fails with [`Error::Inval`] if `target` names a thread that does not
/// exist, and with [`Error::Failure`] if it names a thread that is not
/// runnable (blocked, descheduled, or exited).
pub fn yield_now(target: Option<Tid>) -> Result<(), Error> {
    if let Some(tid) = target {
        let thread = thread::get(tid).ok_or(Error::Inval)?;
        match thread.status() {
            Status::Running => {}
            Status::Runnable => {
                let mut state = STATE.lock();
                if let Some(moved) = remove_from_runqueue(&mut state.runqueue, tid) {
                    state.runqueue.push_front(moved);
                }
            }
            Status::Waiting | Status::Descheduled | Status::Exited => return Err(Error::Failure),
        }
    }
    context_switch();
    Ok(())
}

/// Removes the first occurrence of `tid` from `queue`, preserving the
/// relative order of everything else, and returns it if found.
fn remove_from_runqueue(queue: &mut List<Tid>, tid: Tid) -> Option<Tid> {
    let mut rest = Vec::with_capacity(queue.len());
    let mut found = None;
    while let Some(next) = queue.pop_front() {
        if found.is_none() && next == tid {
            found = Some(next);
        } else {
            rest.push(next);
        }
    }
    for item in rest {
        queue.push_back(item);
    }
    found
}

/// Chooses the next thread to run, in priority order: a driver-priority
/// thread, then a sleeper whose wake time has arrived, then the runqueue
/// head, then the idle thread.
fn next_thread(state: &mut State) -> Tid {
    if let Some(tid) = state.driver_queue.pop_front() {
        return tid;
    }
    if let Some(&tid) = state.sleepq.first() {
        let due = thread::get(tid)
            .map(|t| t.wake_time() <= get_ticks())
            .unwrap_or(true);
        if due {
            state.sleepq.remove(0);
            if let Some(thread) = thread::get(tid) {
                thread.set_status(Status::Runnable);
            }
            return tid;
        }
    }
    if let Some(tid) = state.runqueue.pop_front() {
        return tid;
    }
    state.idle
}

/// Switches the CPU away from the calling thread.
///
/// If the calling thread is still [`Status::Running`] (it was preempted
/// or called this directly rather than having already blocked) and is
/// not the idle thread, it is made [`Status::Runnable`] and appended to
/// the runqueue before the switch. A thread that already set its own
/// status elsewhere (blocking on a mutex, sleeping, descheduling) is
/// left exactly as it queued itself.
///
/// Restores the interrupt-enable state observed on entry once control
/// returns to this thread, whether that is immediately (nothing else to
/// run) or after every other runnable thread has had its turn.
pub fn context_switch() {
    let restart_interrupts = arch::interrupts_enabled();
    arch::disable_interrupts();

    let mut state = STATE.lock();
    let current_tid = state.current;
    let current = thread::get(current_tid).expect("current thread missing");

    if current.status() == Status::Running && current_tid != state.idle {
        current.set_status(Status::Runnable);
        state.runqueue.push_back(current_tid);
    }

    let next_tid = next_thread(&mut state);
    if next_tid == current_tid {
        drop(state);
        current.set_status(Status::Running);
        if restart_interrupts {
            arch::enable_interrupts();
        }
        return;
    }

    let next = thread::get(next_tid).expect("scheduled thread missing");
    next.set_status(Status::Running);
    state.current = next_tid;
    drop(state);

    segmentation::set_kernel_stack(next.kernel_stack_top());
    // Safety: `pd_phys_addr` is only ever set to the physical address of
    // a page directory built by `virtmem`, and the kernel's half of every
    // address space is identical, so switching to it cannot invalidate
    // code we are currently running.
    unsafe { arch::regs::write_cr3(next.pd_phys_addr()) };

    // Safety: `current` is the thread we are switching away from, not
    // running again until some future `switch_stack` lands back here;
    // `next`'s saved stack pointer was either written by a previous call
    // to this function or seeded by thread/task creation to point at
    // `arch::iret_trampoline`.
    unsafe {
        let current_sp_ptr = current.saved_sp_ptr();
        let new_sp = next.saved_sp();
        arch::switch_stack(current_sp_ptr, &new_sp as *const u32);
    }

    if restart_interrupts {
        arch::enable_interrupts();
    }
}

/// A scratch kernel stack used only to step a retiring thread off its
/// own stack before that stack is freed.
///
/// Never associated with a [`thread::Thread`] or scheduled directly;
/// [`retire_current`] rebuilds its landing header on every use, so
/// nothing needs to persist across retirements.
struct RetireStack(UnsafeCell<[u8; thread::KERNEL_STACK_SIZE]>);

unsafe impl Sync for RetireStack {}

static RETIRE_STACK: RetireStack = RetireStack(UnsafeCell::new([0u8; thread::KERNEL_STACK_SIZE]));

/// The id of the thread currently being retired, read back by
/// [`retire_continue`] once it is safely off that thread's stack.
static RETIRING: AtomicU32 = AtomicU32::new(Tid::IDLE.as_u32());

/// The thread [`retire_continue`] should switch into next, chosen by
/// [`retire_current`] before it ever leaves the caller's stack.
static RETIRE_NEXT: AtomicU32 = AtomicU32::new(Tid::IDLE.as_u32());

const RETIRE_SAVE_WORDS: usize = 6; // ebp, edi, esi, ebx, eflags, return address

/// Rebuilds the scratch stack's `switch_stack` landing header, pointing
/// its return address at [`retire_continue`], and returns its top.
fn retire_stack_sp() -> *const u32 {
    unsafe {
        let bytes = &mut *RETIRE_STACK.0.get();
        let top = bytes.as_mut_ptr().add(bytes.len()) as *mut u32;
        let base = top.sub(RETIRE_SAVE_WORDS);
        let words = core::slice::from_raw_parts_mut(base, RETIRE_SAVE_WORDS);
        words[0] = 0; // ebp
        words[1] = 0; // edi
        words[2] = 0; // esi
        words[3] = 0; // ebx
        words[4] = 0x202; // eflags restored by popfd, before retire_continue runs
        words[5] = retire_continue as usize as u32;
        base as *const u32
    }
}

/// Lands on [`RETIRE_STACK`] once [`retire_current`] has switched off the
/// retiring thread's own stack: frees that thread's record and kernel
/// stack, then switches into whatever was already chosen to run next.
extern "C" fn retire_continue() -> ! {
    let tid = Tid::from_u32(RETIRING.load(Ordering::Relaxed));
    thread::remove(tid);

    let next_tid = Tid::from_u32(RETIRE_NEXT.load(Ordering::Relaxed));
    let next = thread::get(next_tid).expect("scheduled thread missing");

    segmentation::set_kernel_stack(next.kernel_stack_top());
    unsafe {
        arch::regs::write_cr3(next.pd_phys_addr());
        let mut discard: u32 = 0;
        let new_sp = next.saved_sp();
        arch::switch_stack(&mut discard as *mut u32, &new_sp as *const u32);
    }
    unreachable!("switch_stack lands back inside `next`, never on the retire stack")
}

/// Removes the calling thread from scheduling for good: unlike
/// [`context_switch`], `tid` is never made runnable again, and its
/// [`thread::Thread`] record and kernel stack are freed as part of the
/// switch rather than left behind.
///
/// Used by a thread that has fully exited, once every data structure
/// that could still reach it by id (the task's thread list, any
/// scheduler queue) has already forgotten it. Freeing the thread's own
/// kernel stack while still running on it would corrupt the very stack
/// the CPU is executing from, so the free happens only after switching
/// onto [`RETIRE_STACK`], a stack no live thread ever owns.
///
/// # Safety
///
/// The caller must be `tid`'s own thread, must already be unreachable
/// from every queue, and must not touch `tid`'s kernel stack again
/// after calling this.
pub unsafe fn retire_current(tid: Tid) -> ! {
    arch::disable_interrupts();

    let next_tid = {
        let mut state = STATE.lock();
        let next_tid = next_thread(&mut state);
        state.current = next_tid;
        next_tid
    };
    let next = thread::get(next_tid).expect("scheduled thread missing");
    next.set_status(Status::Running);

    RETIRING.store(tid.as_u32(), Ordering::Relaxed);
    RETIRE_NEXT.store(next_tid.as_u32(), Ordering::Relaxed);

    let mut discard: u32 = 0;
    arch::switch_stack(&mut discard as *mut u32, retire_stack_sp());
    unreachable!("retire_continue never switches back onto the caller's own stack")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset() {
        let mut state = STATE.lock();
        *state = State::new();
        TICKS.store(0, Ordering::Relaxed);
    }

    #[test]
    fn wake_appends_to_runqueue_in_order() {
        reset();
        let a = thread::create(Tid::from_u32(1));
        let b = thread::create(Tid::from_u32(1));
        a.set_status(Status::Waiting);
        b.set_status(Status::Waiting);
        wake(a.id());
        wake(b.id());

        let mut state = STATE.lock();
        assert_eq!(state.runqueue.pop_front(), Some(a.id()));
        assert_eq!(state.runqueue.pop_front(), Some(b.id()));
    }

    #[test]
    fn make_runnable_rejects_a_thread_not_descheduled() {
        reset();
        let a = thread::create(Tid::from_u32(1));
        a.set_status(Status::Runnable);
        assert_eq!(make_runnable(a.id()), Err(Error::Inval));

        a.set_status(Status::Descheduled);
        assert_eq!(make_runnable(a.id()), Ok(()));
        assert_eq!(a.status(), Status::Runnable);
    }

    #[test]
    fn make_runnable_rejects_an_unknown_tid() {
        reset();
        assert_eq!(make_runnable(Tid::from_u32(999_999)), Err(Error::Inval));
    }

    #[test]
    fn sleeping_threads_wake_in_wake_time_order() {
        reset();
        let a = thread::create(Tid::from_u32(1));
        let b = thread::create(Tid::from_u32(1));
        let mut state = STATE.lock();
        state.insert_sleeping(a.id(), 10);
        state.insert_sleeping(b.id(), 5);
        assert_eq!(state.sleepq, [b.id(), a.id()]);
    }

    #[test]
    fn next_thread_prefers_driver_queue_over_runqueue() {
        reset();
        let driver = thread::create(Tid::from_u32(1));
        let ordinary = thread::create(Tid::from_u32(1));
        let mut state = STATE.lock();
        state.runqueue.push_back(ordinary.id());
        state.driver_queue.push_back(driver.id());
        assert_eq!(next_thread(&mut state), driver.id());
    }

    #[test]
    fn next_thread_falls_back_to_idle_when_empty() {
        reset();
        let idle = thread::create_idle();
        let mut state = STATE.lock();
        state.idle = idle.id();
        assert_eq!(next_thread(&mut state), idle.id());
    }

    #[test]
    fn yield_now_rejects_a_waiting_target() {
        reset();
        let a = thread::create(Tid::from_u32(1));
        a.set_status(Status::Waiting);
        assert_eq!(yield_now(Some(a.id())), Err(Error::Failure));
    }

    #[test]
    fn yield_now_rejects_an_unknown_tid() {
        reset();
        assert_eq!(yield_now(Some(Tid::from_u32(999_999))), Err(Error::Inval));
    }
}
