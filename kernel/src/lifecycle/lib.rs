// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The task record and the POSIX-flavored process/thread lifecycle built
//! on top of it: `fork`, `thread_fork`, `exec`, `wait`, `vanish`, and
//! `set_status`.
//!
//! `Task` lives here rather than in the `thread` crate so that its
//! locks and exit condition variable can be real [`sync::Mutex`] and
//! [`sync::CondVar`] instances without pulling `sync` (which already
//! depends on `scheduler`, which depends on `thread`) underneath
//! `thread` itself.

#![no_std]

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use lazy_static::lazy_static;
use spin::Mutex as SpinLock;
use syscalls::Error;
use thread::Tid;
use virtmem::AddressSpace;

/// A task's installed software-exception handler, per `swexn`.
///
#[derive(Clone, Copy)]
pub struct SwexnHandler {
    pub handler_eip: u32,
    pub arg: u32,
    pub exception_stack_top: u32,
}

struct ChildList {
    alive: Vec<Tid>,
    dead: Vec<DeadChild>,
}

struct DeadChild {
    tid: Tid,
    exit_status: i32,
}

/// A process: an address space, a set of threads, and the parent/child
/// bookkeeping `wait`/`vanish` operate on.
///
pub struct Task {
    id: Tid,
    space: SpinLock<AddressSpace>,
    parent: AtomicU32,
    /// Guards the thread list ("thread_list_lock" in the design).
    threads: sync::Mutex<Vec<Tid>>,
    /// Guards both child lists together ("child_list_lock").
    children: sync::Mutex<ChildList>,
    exit_status: AtomicI32,
    swexn: sync::Mutex<Option<SwexnHandler>>,
    exec_lock: sync::Mutex<()>,
    fork_lock: sync::Mutex<()>,
    vanish_lock: sync::Mutex<()>,
    exit_cv: sync::CondVar,
}

impl Task {
    /// Returns this task's id (equal to its first thread's id).
    ///
    pub fn id(&self) -> Tid {
        self.id
    }

    /// Returns this task's parent's id.
    ///
    pub fn parent(&self) -> Tid {
        Tid::from_u32(self.parent.load(Ordering::Relaxed))
    }

    /// Records `status` as this task's exit status, for a later `wait`
    /// by the parent.
    pub fn set_status(&self, status: i32) {
        self.exit_status.store(status, Ordering::Relaxed);
    }

    /// Installs or clears (pass `None`) the task's software-exception
    /// handler.
    pub fn set_swexn_handler(&self, handler: Option<SwexnHandler>) {
        *self.swexn.lock() = handler;
    }

    /// Returns and clears the installed handler, implementing its
    /// one-shot contract.
    pub fn take_swexn_handler(&self) -> Option<SwexnHandler> {
        self.swexn.lock().take()
    }

    /// Returns the physical address of this task's page directory.
    ///
    pub fn pd_phys_addr(&self) -> u32 {
        self.space.lock().pd_frame().start_address()
    }

    /// Locks and returns this task's address space, for callers (the
    /// `swexn` dispatcher, `udriv_mmap`) that need to validate or extend
    /// its mappings.
    pub fn space(&self) -> spin::MutexGuard<'_, AddressSpace> {
        self.space.lock()
    }
}

lazy_static! {
    static ref TASKS: SpinLock<alloc::collections::BTreeMap<Tid, Arc<Task>>> =
        SpinLock::new(alloc::collections::BTreeMap::new());
}

/// The first task ever created; every re-parented orphan becomes its
/// child. Zero (`Tid::IDLE`) means "not yet assigned", since no real
/// task is ever given that id.
static INIT_TASK: AtomicU32 = AtomicU32::new(0);

/// Looks up a task by id.
///
pub fn get(id: Tid) -> Option<Arc<Task>> {
    TASKS.lock().get(&id).cloned()
}

fn init_task() -> Arc<Task> {
    get(Tid::from_u32(INIT_TASK.load(Ordering::Relaxed))).expect("init task not yet created")
}

/// Builds a brand-new task with a fresh address space and a single
/// thread, parented to `parent`.
///
/// Does not map any segments or seed a user entry point; callers use
/// [`load_task`] (a fresh task) or [`fork`]/[`thread_fork`] (a cloned
/// one) to finish bringing the task to life.
fn create_task(parent: Tid) -> Result<(Arc<Task>, Arc<thread::Thread>), Error> {
    let space = virtmem::create_page_directory().map_err(|_| Error::NoMem)?;
    let first_thread = thread::create(Tid::IDLE);
    first_thread.set_task(first_thread.id());
    first_thread.set_pd_phys_addr(space.pd_frame().start_address());
    let id = first_thread.id();

    let task = Arc::new(Task {
        id,
        space: SpinLock::new(space),
        parent: AtomicU32::new(parent.as_u32()),
        threads: sync::Mutex::new(alloc::vec![id]),
        children: sync::Mutex::new(ChildList {
            alive: Vec::new(),
            dead: Vec::new(),
        }),
        exit_status: AtomicI32::new(0),
        swexn: sync::Mutex::new(None),
        exec_lock: sync::Mutex::new(()),
        fork_lock: sync::Mutex::new(()),
        vanish_lock: sync::Mutex::new(()),
        exit_cv: sync::CondVar::new(),
    });
    TASKS.lock().insert(id, task.clone());
    INIT_TASK
        .compare_exchange(0, id.as_u32(), Ordering::AcqRel, Ordering::Acquire)
        .ok();
    Ok((task, first_thread))
}

/// Writes the argument vector onto the top of a fresh user stack, in the
/// layout a freshly `exec`'d or bootstrap program expects: the argument
/// strings themselves (packed, top-down), a null word, the pointer
/// array indexing them, `stack_low`, `stack_high`, `argv`, `argc`, and a
/// fake return address of zero at the very bottom.
///
/// Returns the resulting stack pointer.
///
/// # Safety
///
/// The caller's address space must already be active (`virtmem::activate`
/// called), with `[stack_low, stack_top)` mapped user-writable: every
/// address here is a plain user virtual address, written through
/// directly rather than via the physmap.
unsafe fn write_argv(stack_top: u32, stack_low: u32, argv: &[&str]) -> u32 {
    let mut sp = stack_top;
    let mut string_addrs = Vec::with_capacity(argv.len());
    for arg in argv.iter().rev() {
        let bytes = arg.as_bytes();
        sp -= bytes.len() as u32 + 1;
        sp &= !0x3; // keep the pointer array that follows word-aligned
        let dst = sp as *mut u8;
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        *dst.add(bytes.len()) = 0;
        string_addrs.push(sp);
    }
    string_addrs.reverse();

    // null word terminating the argv pointer array's preceding gap isn't
    // needed separately: the pointer array itself is argv.len() entries.
    sp -= 4;
    *(sp as *mut u32) = 0;

    let argv_array_addr = sp - (argv.len() as u32) * 4;
    let mut p = argv_array_addr;
    for addr in &string_addrs {
        *(p as *mut u32) = *addr;
        p += 4;
    }
    sp = argv_array_addr;

    let mut push = |value: u32| {
        sp -= 4;
        *(sp as *mut u32) = value;
    };
    push(stack_low);
    push(stack_top);
    push(argv_array_addr);
    push(argv.len() as u32);
    push(0); // fake return eip
    sp
}

/// Builds the stack frame a freshly created thread resumes into: a
/// `switch_stack`-compatible register-save block whose return address is
/// [`arch::iret_trampoline`], sitting directly above a bare `iret` frame
/// for `eip`/`esp3`.
fn seed_user_entry(th: &thread::Thread, eip: u32, esp3: u32) {
    const WORDS: usize = 11;
    let top = th.kernel_stack_top();
    let base = top - (WORDS as u32) * 4;
    unsafe {
        let bytes = th.kernel_stack_bytes();
        let words = core::slice::from_raw_parts_mut(
            (&mut bytes[..]).as_mut_ptr().add(bytes.len() - WORDS * 4) as *mut u32,
            WORDS,
        );
        words[0] = 0; // ebp
        words[1] = 0; // edi
        words[2] = 0; // esi
        words[3] = 0; // ebx
        words[4] = 0x202; // eflags restored by popfd, before the trampoline runs
        words[5] = arch::iret_trampoline as usize as u32;
        words[6] = eip;
        words[7] = segmentation::USER_CODE_SELECTOR as u32;
        words[8] = 0x202; // IF=1, IOPL=0
        words[9] = esp3;
        words[10] = segmentation::USER_DATA_SELECTOR as u32;
    }
    th.set_saved_sp(base);
}

/// Returns the byte offset of `frame` from the base of `thread`'s kernel
/// stack, for locating the matching frame inside a byte-for-byte copy of
/// that stack sitting in some other thread's stack storage.
fn frame_offset_from_base(thread: &thread::Thread, frame: &arch::TrapFrame) -> usize {
    let base = thread.kernel_stack_top() as usize - thread::KERNEL_STACK_SIZE;
    frame as *const arch::TrapFrame as usize - base
}

/// Finishes turning a raw byte-for-byte kernel-stack clone into a
/// resumable thread: zeroes the cloned trap frame's return value (the
/// fork/thread_fork return value a child observes) and splices in a
/// `switch_stack`-compatible register-save block, terminated by
/// [`arch::resume_trampoline`], directly below the frame.
fn splice_cloned_frame(child: &thread::Thread, frame_offset: usize) {
    const SAVE_WORDS: usize = 6; // ebp, edi, esi, ebx, eflags, return address
    let retaddr_offset = frame_offset - 4;
    let saved_sp_offset = frame_offset - SAVE_WORDS * 4;
    unsafe {
        let bytes = child.kernel_stack_bytes();
        let ptr = (&mut bytes[..]).as_mut_ptr();
        let frame = &mut *(ptr.add(frame_offset) as *mut arch::TrapFrame);
        frame.set_return_value(0);
        *(ptr.add(retaddr_offset) as *mut u32) = arch::resume_trampoline as usize as u32;
    }
    let base = child.kernel_stack_top() - thread::KERNEL_STACK_SIZE as u32;
    child.set_saved_sp(base + saved_sp_offset as u32);
}

/// Maps a program image's segments and stack, writes `argv` onto the
/// stack, and seeds the task's (single) thread to enter at `entry`.
///
/// Used both for the very first (bootstrap) task and by `exec`, which
/// calls it against a brand-new address space before discarding the old
/// one.
pub fn load_task(
    task: &Task,
    thread: &thread::Thread,
    entry: u32,
    segments: &[virtmem::Segment],
    argv: &[&str],
) -> Result<(), Error> {
    let space = task.space.lock();
    let stack = virtmem::Segment {
        va: memlayout::USER_STACK.start(),
        len: memlayout::USER_STACK.end() - memlayout::USER_STACK.start() + 1,
        writable: true,
    };
    let stack_low = stack.va;
    let stack_high = memlayout::STACK_TOP;
    virtmem::setup_page_table(&space, segments, stack).map_err(|_| Error::NoMem)?;
    unsafe { virtmem::activate(&space) };
    let esp3 = unsafe { write_argv(stack_high, stack_low, argv) };
    unsafe { arch::regs::flush_tlb() };
    seed_user_entry(thread, entry, esp3);
    Ok(())
}

/// Brings the very first task into existence and schedules it.
///
/// Special only in that there is no parent to serialize against and no
/// previous address space to discard; from here on `fork`, `thread_fork`,
/// and `exec` handle every other task the same way.
pub fn load_bootstrap_task(entry: u32, segments: &[virtmem::Segment], argv: &[&str]) -> Result<Tid, Error> {
    let (task, thread) = create_task(Tid::IDLE)?;
    load_task(&task, &thread, entry, segments, argv)?;
    scheduler::enqueue(thread.id());
    Ok(task.id())
}

/// Clones the calling task: a new task with a copy-on-write clone of the
/// caller's address space, a thread cloned from the caller's own kernel
/// stack (so it resumes at the same syscall site), and the caller's
/// swexn installation carried over.
///
/// `frame` is the caller's live trap frame for this syscall; its `eax`
/// is what the clone will see as its own return value once resumed, so
/// the clone's copy is rewritten to 0 while the caller's is left for the
/// normal syscall return path to fill in with the child's tid.
pub fn fork(task: &Task, thread: &thread::Thread, frame: &arch::TrapFrame) -> Result<Tid, Error> {
    let _serialize = task.fork_lock.lock();

    let child_space = {
        let space = task.space.lock();
        virtmem::clone_paging_info(&space).map_err(|_| Error::NoMem)?
    };
    // clone_paging_info rewrote the parent's own PTEs to COW too; make
    // sure the parent's TLB reflects that before anyone writes through a
    // stale translation.
    unsafe { arch::regs::flush_tlb() };

    let child_thread = thread::create(Tid::IDLE);
    unsafe {
        let src = thread.kernel_stack_bytes();
        let dst = child_thread.kernel_stack_bytes();
        dst.copy_from_slice(src);
    }
    child_thread.set_task(child_thread.id());
    child_thread.set_pd_phys_addr(child_space.pd_frame().start_address());

    // The copied stack holds a duplicate of `frame` at the same offset
    // from its own base; mutate the child's copy in place there.
    let offset = frame_offset_from_base(thread, frame);
    splice_cloned_frame(&child_thread, offset);

    let child_id = child_thread.id();
    let child_task = Arc::new(Task {
        id: child_id,
        space: SpinLock::new(child_space),
        parent: AtomicU32::new(task.id().as_u32()),
        threads: sync::Mutex::new(alloc::vec![child_id]),
        children: sync::Mutex::new(ChildList {
            alive: Vec::new(),
            dead: Vec::new(),
        }),
        exit_status: AtomicI32::new(0),
        swexn: sync::Mutex::new(*task.swexn.lock()),
        exec_lock: sync::Mutex::new(()),
        fork_lock: sync::Mutex::new(()),
        vanish_lock: sync::Mutex::new(()),
        exit_cv: sync::CondVar::new(),
    });
    TASKS.lock().insert(child_id, child_task);

    task.children.lock().alive.push(child_id);
    scheduler::enqueue(child_id);
    Ok(child_id)
}

/// Creates a new thread under `task`, sharing its address space, cloned
/// from `thread`'s kernel stack the same way `fork` clones a task.
pub fn thread_fork(
    task: &Task,
    thread: &thread::Thread,
    frame: &arch::TrapFrame,
) -> Result<Tid, Error> {
    let child = thread::create(task.id());
    unsafe {
        let src = thread.kernel_stack_bytes();
        let dst = child.kernel_stack_bytes();
        dst.copy_from_slice(src);
    }
    child.set_pd_phys_addr(thread.pd_phys_addr());

    let offset = frame_offset_from_base(thread, frame);
    splice_cloned_frame(&child, offset);

    let child_id = child.id();
    task.threads.lock().push(child_id);
    scheduler::enqueue(child_id);
    Ok(child_id)
}

/// Replaces the calling task's program image.
///
/// Serialized per task. Builds the new address space and seeds the new
/// entry point before touching the old one, so a failure partway through
/// leaves the caller's existing image untouched.
pub fn exec(
    task: &Task,
    thread: &thread::Thread,
    entry: u32,
    segments: &[virtmem::Segment],
    argv: &[&str],
) -> Result<(), Error> {
    if argv.len() > syscalls::NUM_ARGS_MAX {
        return Err(Error::Big);
    }
    let _serialize = task.exec_lock.lock();

    let new_space = virtmem::create_page_directory().map_err(|_| Error::NoMem)?;
    let stack = virtmem::Segment {
        va: memlayout::USER_STACK.start(),
        len: memlayout::USER_STACK.end() - memlayout::USER_STACK.start() + 1,
        writable: true,
    };
    let stack_low = stack.va;
    let stack_high = memlayout::STACK_TOP;
    if virtmem::setup_page_table(&new_space, segments, stack).is_err() {
        return Err(Error::NoMem);
    }
    unsafe { virtmem::activate(&new_space) };
    let esp3 = unsafe { write_argv(stack_high, stack_low, argv) };
    unsafe { arch::regs::flush_tlb() };

    let old_space = core::mem::replace(&mut *task.space.lock(), new_space);
    thread.set_pd_phys_addr(task.space.lock().pd_frame().start_address());
    seed_user_entry(thread, entry, esp3);
    drop(old_space); // releases the old PD's frames

    // A successful exec leaves exactly one thread alive in the task;
    // any other thread the caller had running is discarded along with
    // the old address space it was sharing.
    let mut threads = task.threads.lock();
    for &id in threads.iter() {
        if id != thread.id() {
            thread::remove(id);
        }
    }
    threads.clear();
    threads.push(thread.id());

    Ok(())
}

/// Blocks until a child exits, reaping it and returning its id.
///
/// Fails with [`Error::Failure`] if the caller has no children at all
/// (neither alive nor already dead).
pub fn wait(task: &Task) -> Result<(Tid, i32), Error> {
    let mut children = task.children.lock();
    loop {
        if let Some(dead) = children.dead.pop() {
            return Ok((dead.tid, dead.exit_status));
        }
        if children.alive.is_empty() {
            return Err(Error::Failure);
        }
        children = task.exit_cv.wait(children);
    }
}

/// Tears down the calling thread, and — if it was the task's last one —
/// the whole task: its children are re-parented to the init task, its
/// address space is freed, and it is moved onto its parent's dead-child
/// list.
///
/// The vanishing thread's own record and kernel stack are reclaimed by
/// [`scheduler::retire_current`] rather than here: by the time this
/// function reaches it, `thread_id` has already been unlinked from
/// `task.threads` (and, transitively, from every scheduler queue, since
/// a running thread is never enqueued), so it is safe to free once the
/// CPU has stepped off its stack.
pub fn vanish(task: &Task, thread_id: Tid) {
    if let Some(th) = thread::get(thread_id) {
        th.set_status(thread::Status::Exited);
    }
    let was_last = {
        let mut threads = task.threads.lock();
        threads.retain(|&id| id != thread_id);
        threads.is_empty()
    };

    if !was_last {
        unsafe { scheduler::retire_current(thread_id) };
    }

    let _serialize = task.vanish_lock.lock();

    {
        let init = init_task();
        if init.id() != task.id() {
            let mut ours = task.children.lock();
            let mut init_children = init.children.lock();
            for tid in ours.alive.drain(..) {
                if let Some(child) = get(tid) {
                    child.parent.store(init.id().as_u32(), Ordering::Relaxed);
                }
                init_children.alive.push(tid);
            }
            for dead in ours.dead.drain(..) {
                init_children.dead.push(dead);
            }
        }
    }

    // The caller's own thread has already left this address space (its
    // kernel stack never touches user memory again before the final
    // context switch below), so freeing it here cannot run out from
    // under anyone.
    virtmem::free_address_space(&task.space.lock());

    if let Some(parent) = get(task.parent()) {
        let mut parent_children = parent.children.lock();
        parent_children.alive.retain(|&id| id != task.id());
        parent_children.dead.push(DeadChild {
            tid: task.id(),
            exit_status: task.exit_status.load(Ordering::Relaxed),
        });
        let now_empty = parent_children.alive.is_empty();
        drop(parent_children);
        if now_empty {
            parent.exit_cv.notify_all();
        } else {
            parent.exit_cv.notify_one();
        }
    }

    TASKS.lock().remove(&task.id());
    unsafe { scheduler::retire_current(thread_id) };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() {
        physmem::init();
        unsafe { virtmem::init() };
    }

    #[test]
    fn create_task_assigns_id_equal_to_first_thread() {
        setup();
        let (task, thread) = create_task(Tid::IDLE).unwrap();
        assert_eq!(task.id(), thread.id());
    }

    #[test]
    fn wait_fails_with_no_children() {
        setup();
        let (task, _thread) = create_task(Tid::IDLE).unwrap();
        assert_eq!(wait(&task).err(), Some(Error::Failure));
    }
}
