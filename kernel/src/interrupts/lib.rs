// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Installs the interrupt descriptor table and routes every trap to the
//! component that owns it: a page fault at a COW page retries through
//! [`virtmem::handle_cow`], any other recoverable fault goes to
//! [`swexn::dispatch`] or else kills the thread via [`lifecycle::vanish`],
//! a device IRQ is forwarded to [`udrivers::udriv_send`], the timer tick
//! drives [`scheduler::tick`], and the syscall vector dispatches to
//! whichever of LC/UD/SX/V/S the call names.
//!
//! Every vector shares the same low-level shape: a naked stub pushes a
//! dummy error code (if the CPU doesn't push one of its own) and the
//! vector number, saves the general-purpose registers with `pushad`, and
//! calls into Rust with a pointer to the resulting [`arch::TrapFrame`].
//! On return it restores those registers and `iret`s. This is exactly
//! the frame layout `lifecycle::fork`/`thread_fork` assume when cloning a
//! kernel stack mid-syscall.

#![no_std]

extern crate alloc;

mod pic;
mod programs;
mod syscall;

use arch::idt::InterruptDescriptorTable;
use arch::TrapFrame;
use core::arch::{asm, naked_asm};
use lazy_static::lazy_static;
use segmentation::KERNEL_CODE_SELECTOR;
use spin::Mutex;
use thread::Tid;

const VECTOR_INVALID_OPCODE: u8 = 6;
const VECTOR_DOUBLE_FAULT: u8 = 8;
const VECTOR_GENERAL_PROTECTION: u8 = 13;
const VECTOR_PAGE_FAULT: u8 = 14;
const VECTOR_TIMER: u8 = pic::PIC1_OFFSET;
const VECTOR_KEYBOARD: u8 = pic::PIC1_OFFSET + 1;
const VECTOR_SERIAL: u8 = pic::PIC1_OFFSET + 4;
pub const VECTOR_SYSCALL: u8 = 0x80;

/// The driver id a keyboard interrupt reports its scancode under, and
/// the matching id for the COM1 serial line. Kept here rather than in
/// `udrivers` since they are this platform's fixed IDT/device wiring,
/// not part of the permission-table format itself.
const DEVICE_KEYBOARD: u32 = 0;
const DEVICE_SERIAL: u32 = 1;

lazy_static! {
    static ref IDT: Mutex<InterruptDescriptorTable> = Mutex::new(InterruptDescriptorTable::new());
}

/// Builds the IDT, remaps and masks the PIC, and loads both.
///
/// Must run after [`segmentation::init`] (the gates reference the kernel
/// code selector) and before interrupts are enabled.
pub fn init() {
    pic::init();

    let mut idt = IDT.lock();
    idt.set_handler(VECTOR_INVALID_OPCODE, invalid_opcode_stub as usize as u32, KERNEL_CODE_SELECTOR, 0);
    idt.set_handler(VECTOR_DOUBLE_FAULT, double_fault_stub as usize as u32, KERNEL_CODE_SELECTOR, 0);
    idt.set_handler(VECTOR_GENERAL_PROTECTION, general_protection_stub as usize as u32, KERNEL_CODE_SELECTOR, 0);
    idt.set_handler(VECTOR_PAGE_FAULT, page_fault_stub as usize as u32, KERNEL_CODE_SELECTOR, 0);
    idt.set_handler(VECTOR_TIMER, timer_stub as usize as u32, KERNEL_CODE_SELECTOR, 0);
    idt.set_handler(VECTOR_KEYBOARD, keyboard_stub as usize as u32, KERNEL_CODE_SELECTOR, 0);
    idt.set_handler(VECTOR_SERIAL, serial_stub as usize as u32, KERNEL_CODE_SELECTOR, 0);
    // DPL 3: reachable from user mode via `int 0x80`.
    idt.set_handler(VECTOR_SYSCALL, syscall_stub as usize as u32, KERNEL_CODE_SELECTOR, 3);

    unsafe { load_idt(&idt) };
    drop(idt);

    pic::unmask(0); // timer
    pic::unmask(1); // keyboard
    pic::unmask(4); // COM1
}

unsafe fn load_idt(idt: &InterruptDescriptorTable) {
    // `IDT` is a `'static` lazily-initialized table that is never moved
    // or freed once `init` has run, satisfying `load`'s safety contract
    // even though the reference here is borrowed from a `Mutex`.
    let static_ref: &'static InterruptDescriptorTable = &*(idt as *const InterruptDescriptorTable);
    static_ref.load();
}

// Naked entry stubs. Each saves `pushad`-order registers on top of a
// vector/error-code pair, calls the matching Rust handler with a pointer
// to the resulting `TrapFrame`, then restores and `iret`s.

#[unsafe(naked)]
unsafe extern "C" fn invalid_opcode_stub() -> ! {
    naked_asm!(
        "push 0",
        "push {v}",
        "pushad",
        "push esp",
        "call {h}",
        "add esp, 4",
        "popad",
        "add esp, 8",
        "iretd",
        v = const VECTOR_INVALID_OPCODE,
        h = sym fault_entry);
}

#[unsafe(naked)]
unsafe extern "C" fn double_fault_stub() -> ! {
    // The CPU itself pushes a (always zero) error code for #DF.
    naked_asm!(
        "push {v}",
        "pushad",
        "push esp",
        "call {h}",
        "add esp, 4",
        "popad",
        "add esp, 8",
        "iretd",
        v = const VECTOR_DOUBLE_FAULT,
        h = sym fault_entry,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn general_protection_stub() -> ! {
    naked_asm!(
        "push {v}",
        "pushad",
        "push esp",
        "call {h}",
        "add esp, 4",
        "popad",
        "add esp, 8",
        "iretd",
        v = const VECTOR_GENERAL_PROTECTION,
        h = sym fault_entry);
}

#[unsafe(naked)]
unsafe extern "C" fn page_fault_stub() -> ! {
    naked_asm!(
        "push {v}",
        "pushad",
        "push esp",
        "call {h}",
        "add esp, 4",
        "popad",
        "add esp, 8",
        "iretd",
        v = const VECTOR_PAGE_FAULT,
        h = sym fault_entry);
}

#[unsafe(naked)]
unsafe extern "C" fn timer_stub() -> ! {
    naked_asm!(
        "push 0",
        "push {v}",
        "pushad",
        "push esp",
        "call {h}",
        "add esp, 4",
        "popad",
        "add esp, 8",
        "iretd",
        v = const VECTOR_TIMER,
        h = sym device_entry);
}

#[unsafe(naked)]
unsafe extern "C" fn keyboard_stub() -> ! {
    naked_asm!(
        "push 0",
        "push {v}",
        "pushad",
        "push esp",
        "call {h}",
        "add esp, 4",
        "popad",
        "add esp, 8",
        "iretd",
        v = const VECTOR_KEYBOARD,
        h = sym device_entry);
}

#[unsafe(naked)]
unsafe extern "C" fn serial_stub() -> ! {
    naked_asm!(
        "push 0",
        "push {v}",
        "pushad",
        "push esp",
        "call {h}",
        "add esp, 4",
        "popad",
        "add esp, 8",
        "iretd",
        v = const VECTOR_SERIAL,
        h = sym device_entry);
}

#[unsafe(naked)]
unsafe extern "C" fn syscall_stub() -> ! {
    naked_asm!(
        "push 0",
        "push {v}",
        "pushad",
        "push esp",
        "call {h}",
        "add esp, 4",
        "popad",
        "add esp, 8",
        "iretd",
        v = const VECTOR_SYSCALL,
        h = sym syscall::dispatch);
}

/// Routes a CPU exception: a page fault at a COW page retries through
/// `virtmem::handle_cow`; anything else recoverable is handed to the
/// task's installed `swexn` handler; failing that, the thread is killed.
extern "C" fn fault_entry(frame: *mut TrapFrame) {
    let frame = unsafe { &mut *frame };
    let tid = scheduler::current();
    let thread = match thread::get(tid) {
        Some(t) => t,
        None => return,
    };
    let task = match lifecycle::get(thread.task()) {
        Some(t) => t,
        None => return,
    };

    let cr2 = if frame.vector == VECTOR_PAGE_FAULT as u32 {
        arch::regs::read_cr2()
    } else {
        0
    };

    if frame.vector == VECTOR_PAGE_FAULT as u32 {
        let result = {
            let space = task.space();
            virtmem::handle_cow(&space, cr2)
        };
        match result {
            Ok(()) => return, // retry the faulting instruction
            Err(virtmem::Error::NoMem) => {
                kill(&task, tid);
                return;
            }
            Err(virtmem::Error::Inval) => {} // not a COW fault; fall through
        }
    }

    if swexn::dispatch(&task, frame, frame.vector, cr2) {
        return;
    }

    kill(&task, tid);
}

fn kill(task: &lifecycle::Task, tid: Tid) {
    task.set_status(-2);
    lifecycle::vanish(task, tid);
}

/// Routes a device interrupt: the timer drives `scheduler::tick`;
/// everything else is read off the device and handed to its driver via
/// `udriv_send`.
extern "C" fn device_entry(frame: *mut TrapFrame) {
    let frame = unsafe { &*frame };
    let vector = frame.vector as u8;

    if vector == VECTOR_TIMER {
        pic::acknowledge(vector);
        scheduler::tick();
        return;
    }

    if vector == VECTOR_KEYBOARD {
        let scancode = unsafe { arch::Port::<u8>::new(0x60).read() };
        pic::acknowledge(vector);
        let _ = udrivers::udriv_send(DEVICE_KEYBOARD, scancode as u32, 1);
        return;
    }

    if vector == VECTOR_SERIAL {
        pic::acknowledge(vector);
        let _ = udrivers::udriv_send(DEVICE_SERIAL, 0, 0);
        return;
    }

    pic::acknowledge(vector);
}

/// Looks up a program's entry point and segments in the static program
/// table, for the initial boot task and any later `exec`.
pub use programs::lookup as lookup_program;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_do_not_collide() {
        let vectors = [
            VECTOR_INVALID_OPCODE,
            VECTOR_DOUBLE_FAULT,
            VECTOR_GENERAL_PROTECTION,
            VECTOR_PAGE_FAULT,
            VECTOR_TIMER,
            VECTOR_KEYBOARD,
            VECTOR_SERIAL,
            VECTOR_SYSCALL,
        ];
        for (i, a) in vectors.iter().enumerate() {
            for (j, b) in vectors.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b);
                }
            }
        }
    }
}
