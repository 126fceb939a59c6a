// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Decodes and dispatches the syscall vector.
//!
//! The calling convention is the one [`syscalls::Syscall`] documents:
//! the call number in `eax`, a pointer to a packed, `#[repr(C)]`
//! argument struct in `ebx` for any call that takes arguments, and the
//! result (or a negative [`syscalls::Error`]) returned in `eax`.
//!
//! Console I/O (`readline`, `print`, the cursor and terminal-color
//! calls, `getchar`) has no backing driver in this build: there is no
//! console component among the ones this kernel implements, so those
//! calls always fail with [`Error::Failure`]. `read_file` is similarly
//! limited: the static program table in [`super::programs`] only knows
//! entry points and segments, not file contents, so it always fails
//! with [`Error::NotAvail`].

use crate::programs;
use alloc::string::String;
use alloc::vec::Vec;
use arch::TrapFrame;
use lifecycle::Task;
use swexn::Ureg;
use syscalls::{Error, Syscall};
use thread::{Status, Thread, Tid};

const MAX_FILENAME: usize = 64;
const MAX_ARG: usize = 128;

fn dispatch_inner(frame: &mut TrapFrame) -> Result<u32, Error> {
    let syscall = Syscall::from_usize(frame.eax as usize).ok_or(Error::Inval)?;

    let tid = scheduler::current();
    let thread = thread::get(tid).ok_or(Error::Failure)?;
    let task = lifecycle::get(thread.task()).ok_or(Error::Failure)?;

    match syscall {
        Syscall::GetTid => Ok(tid.as_u32()),

        Syscall::Fork => {
            let child = lifecycle::fork(&task, &thread, &*frame)?;
            Ok(child.as_u32())
        }

        Syscall::ThreadFork => {
            let child = lifecycle::thread_fork(&task, &thread, &*frame)?;
            Ok(child.as_u32())
        }

        Syscall::Exec => do_exec(&task, &thread, &*frame),

        Syscall::SetStatus => {
            let args: SetStatusArgs = read_args(&task, &*frame)?;
            task.set_status(args.status);
            Ok(0)
        }

        Syscall::Wait => do_wait(&task, &*frame),

        Syscall::Vanish => {
            lifecycle::vanish(&task, tid);
            Ok(0) // unreachable: vanish never returns to a live stack
        }

        Syscall::Yield => {
            let args: YieldArgs = read_args(&task, &*frame)?;
            let target = if args.target == u32::MAX {
                None
            } else {
                Some(Tid::from_u32(args.target))
            };
            scheduler::yield_now(target)?;
            Ok(0)
        }

        Syscall::Sleep => {
            let args: SleepArgs = read_args(&task, &*frame)?;
            scheduler::sleep(args.ticks);
            Ok(0)
        }

        Syscall::Deschedule => do_deschedule(&task, &*frame),

        Syscall::MakeRunnable => {
            let args: MakeRunnableArgs = read_args(&task, &*frame)?;
            scheduler::make_runnable(Tid::from_u32(args.tid))?;
            Ok(0)
        }

        Syscall::GetTicks => Ok(scheduler::get_ticks() as u32),

        Syscall::NewPages => {
            let args: NewPagesArgs = read_args(&task, &*frame)?;
            let space = task.space();
            virtmem::new_pages(&space, args.base, args.len).map_err(virtmem_error)?;
            Ok(0)
        }

        Syscall::RemovePages => {
            let args: RemovePagesArgs = read_args(&task, &*frame)?;
            let space = task.space();
            virtmem::remove_pages(&space, args.base).map_err(virtmem_error)?;
            Ok(0)
        }

        Syscall::ReadLine
        | Syscall::Print
        | Syscall::GetCursorPos
        | Syscall::SetCursorPos
        | Syscall::SetTermColor
        | Syscall::GetChar => Err(Error::Failure),

        Syscall::Swexn => do_swexn(&task, frame),

        Syscall::UdrivRegister => {
            let args: UdrivRegisterArgs = read_args(&task, &*frame)?;
            let id = udrivers::udriv_register(tid, args.id, args.in_port as u16, args.in_bytes as u8)?;
            Ok(id)
        }

        Syscall::UdrivDeregister => {
            let args: UdrivDeregisterArgs = read_args(&task, &*frame)?;
            udrivers::udriv_deregister(tid, args.id)?;
            Ok(0)
        }

        Syscall::UdrivSend => {
            let args: UdrivSendArgs = read_args(&task, &*frame)?;
            udrivers::udriv_send(args.id, args.payload, args.size as u8)?;
            Ok(0)
        }

        Syscall::UdrivWait => do_udriv_wait(&task, &thread, &*frame),

        Syscall::UdrivInb => {
            let args: UdrivInbArgs = read_args(&task, &*frame)?;
            let byte = udrivers::udriv_inb(tid, args.port as u16)?;
            Ok(byte as u32)
        }

        Syscall::UdrivOutb => {
            let args: UdrivOutbArgs = read_args(&task, &*frame)?;
            udrivers::udriv_outb(tid, args.port as u16, args.value as u8)?;
            Ok(0)
        }

        Syscall::UdrivMmap => {
            let args: UdrivMmapArgs = read_args(&task, &*frame)?;
            udrivers::udriv_mmap(tid, &task, args.phys, args.virt, args.len)?;
            Ok(0)
        }

        Syscall::ReadFile => Err(Error::NotAvail),

        Syscall::Halt => {
            arch::disable_interrupts();
            loop {
                arch::hlt();
            }
        }
    }
}

/// Entry point called from the naked syscall stub with a pointer to the
/// frame `pushad` built on the kernel stack.
pub extern "C" fn dispatch(frame: *mut TrapFrame) {
    let frame = unsafe { &mut *frame };
    let result = dispatch_inner(frame);
    frame.set_return_value(match result {
        Ok(value) => value as i32,
        Err(err) => err as i32,
    });
}

fn virtmem_error(err: virtmem::Error) -> Error {
    match err {
        virtmem::Error::Inval => Error::Inval,
        virtmem::Error::NoMem => Error::NoMem,
    }
}

/// Reads a fixed-size argument struct from the user pointer in `ebx`,
/// refusing to dereference it unless every byte lies in a mapped page
/// of the caller's own address space.
fn read_args<T: Copy>(task: &Task, frame: &TrapFrame) -> Result<T, Error> {
    let ptr = frame.ebx;
    let len = core::mem::size_of::<T>() as u32;
    if ptr == 0 || !virtmem::is_range_mapped(&task.space(), ptr, len) {
        return Err(Error::Inval);
    }
    Ok(unsafe { core::ptr::read_unaligned(ptr as *const T) })
}

#[derive(Clone, Copy)]
#[repr(C)]
struct SetStatusArgs {
    status: i32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct WaitArgs {
    status_ptr: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct YieldArgs {
    target: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct SleepArgs {
    ticks: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct DescheduleArgs {
    reject_ptr: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct MakeRunnableArgs {
    tid: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct NewPagesArgs {
    base: u32,
    len: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct RemovePagesArgs {
    base: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct ExecArgs {
    filename: u32,
    argv: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct SwexnArgs {
    esp3: u32,
    eip: u32,
    arg: u32,
    newureg: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct UdrivRegisterArgs {
    id: u32,
    in_port: u32,
    in_bytes: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct UdrivDeregisterArgs {
    id: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct UdrivSendArgs {
    id: u32,
    payload: u32,
    size: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct UdrivWaitOut {
    id: u32,
    payload: u32,
    size: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct UdrivWaitArgs {
    out_ptr: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct UdrivInbArgs {
    port: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct UdrivOutbArgs {
    port: u32,
    value: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct UdrivMmapArgs {
    phys: u32,
    virt: u32,
    len: u32,
}

fn do_wait(task: &Task, frame: &TrapFrame) -> Result<u32, Error> {
    let args: WaitArgs = read_args(task, &*frame)?;
    let (child, status) = lifecycle::wait(task)?;
    if args.status_ptr != 0 {
        let space = task.space();
        if !virtmem::is_writable(&space, args.status_ptr, 4) {
            return Err(Error::Inval);
        }
        unsafe { core::ptr::write_unaligned(args.status_ptr as *mut i32, status) };
    }
    Ok(child.as_u32())
}

fn do_deschedule(task: &Task, frame: &TrapFrame) -> Result<u32, Error> {
    let args: DescheduleArgs = read_args(task, &*frame)?;
    if args.reject_ptr == 0 || !virtmem::is_range_mapped(&task.space(), args.reject_ptr, 4) {
        return Err(Error::Inval);
    }
    // Read the flag before blocking so a `make_runnable` racing the
    // caller's own check can't be lost: if it is already nonzero we
    // never deschedule at all.
    let reject = unsafe { core::ptr::read_unaligned(args.reject_ptr as *const i32) };
    if reject != 0 {
        return Ok(0);
    }
    scheduler::block_current(Status::Descheduled);
    Ok(0)
}

fn do_swexn(task: &Task, frame: &mut TrapFrame) -> Result<u32, Error> {
    let args: SwexnArgs = read_args(task, &*frame)?;
    let ureg = if args.newureg != 0 {
        if !virtmem::is_range_mapped(&task.space(), args.newureg, core::mem::size_of::<Ureg>() as u32) {
            return Err(Error::Inval);
        }
        Some(unsafe { core::ptr::read_unaligned(args.newureg as *const Ureg) })
    } else {
        None
    };
    swexn::swexn(task, frame, args.esp3, args.eip, args.arg, ureg.as_ref())?;
    Ok(0)
}

fn do_udriv_wait(task: &Task, thread: &Thread, frame: &TrapFrame) -> Result<u32, Error> {
    let args: UdrivWaitArgs = read_args(task, &*frame)?;
    let (id, payload, size) = udrivers::udriv_wait(thread)?;
    let space = task.space();
    if !virtmem::is_writable(&space, args.out_ptr, core::mem::size_of::<UdrivWaitOut>() as u32) {
        return Err(Error::Inval);
    }
    let out = UdrivWaitOut { id, payload, size: size as u32 };
    unsafe { core::ptr::write_unaligned(args.out_ptr as *mut UdrivWaitOut, out) };
    Ok(0)
}

/// Copies a NUL-terminated string out of the caller's address space,
/// refusing anything longer than `max`.
fn read_cstr(task: &Task, ptr: u32, max: usize) -> Result<String, Error> {
    if ptr == 0 {
        return Err(Error::Inval);
    }
    let space = task.space();
    let mut bytes = Vec::new();
    for i in 0..max as u32 {
        let addr = ptr + i;
        if !virtmem::is_range_mapped(&space, addr, 1) {
            return Err(Error::Inval);
        }
        let byte = unsafe { *(addr as *const u8) };
        if byte == 0 {
            return Ok(String::from_utf8(bytes).map_err(|_| Error::Inval)?);
        }
        bytes.push(byte);
    }
    Err(Error::Big)
}

fn do_exec(task: &Task, thread: &Thread, frame: &TrapFrame) -> Result<u32, Error> {
    let args: ExecArgs = read_args(task, &*frame)?;
    let filename = read_cstr(task, args.filename, MAX_FILENAME)?;

    let mut argv_storage: Vec<String> = Vec::new();
    if args.argv != 0 {
        // Walks one slot past NUM_ARGS_MAX so that exactly NUM_ARGS_MAX
        // real arguments followed by a NULL terminator still succeeds;
        // only the (NUM_ARGS_MAX + 1)th argument is rejected.
        for i in 0..=syscalls::NUM_ARGS_MAX as u32 {
            let entry_ptr = args.argv + i * 4;
            if !virtmem::is_range_mapped(&task.space(), entry_ptr, 4) {
                return Err(Error::Inval);
            }
            let str_ptr = unsafe { core::ptr::read_unaligned(entry_ptr as *const u32) };
            if str_ptr == 0 {
                break;
            }
            if argv_storage.len() == syscalls::NUM_ARGS_MAX {
                return Err(Error::Big);
            }
            argv_storage.push(read_cstr(task, str_ptr, MAX_ARG)?);
        }
    }

    let (entry, segments) = programs::lookup(&filename).ok_or(Error::Inval)?;
    let argv: Vec<&str> = argv_storage.iter().map(String::as_str).collect();
    lifecycle::exec(task, thread, entry, segments, &argv)?;
    Ok(0)
}
