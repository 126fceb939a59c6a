// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The user-mode software-exception dispatcher: lets a task install a
//! handler that intercepts a recoverable fault before the kernel kills
//! the faulting thread, and the `swexn` syscall itself (install,
//! deregister, and optional in-place register rewrite) that drives it.

#![no_std]

use lifecycle::{SwexnHandler, Task};
use syscalls::Error;

/// `eflags` bit 9: interrupts enabled.
const EFLAGS_IF: u32 = 1 << 9;
/// `eflags` bits 12-13: I/O privilege level.
const EFLAGS_IOPL: u32 = 0b11 << 12;

/// The register snapshot handed to a user exception handler, built from
/// the kernel's [`arch::TrapFrame`] plus the fault's cause and faulting
/// address.
///
/// Field order matches what the handler, called as `handler(arg, ureg)`,
/// expects to find through its `ureg_t *` argument.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Ureg {
    pub cause: u32,
    pub cr2: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

impl Ureg {
    fn from_frame(frame: &arch::TrapFrame, cause: u32, cr2: u32) -> Ureg {
        Ureg {
            cause,
            cr2,
            edi: frame.edi,
            esi: frame.esi,
            ebp: frame.ebp,
            ebx: frame.ebx,
            edx: frame.edx,
            ecx: frame.ecx,
            eax: frame.eax,
            error_code: frame.error_code,
            eip: frame.eip,
            cs: frame.cs,
            eflags: frame.eflags,
            esp: frame.useresp,
            ss: frame.ss,
        }
    }

    fn apply_to_frame(&self, frame: &mut arch::TrapFrame) {
        frame.edi = self.edi;
        frame.esi = self.esi;
        frame.ebp = self.ebp;
        frame.ebx = self.ebx;
        frame.edx = self.edx;
        frame.ecx = self.ecx;
        frame.eax = self.eax;
        frame.eip = self.eip;
        frame.cs = self.cs;
        frame.eflags = self.eflags;
        frame.useresp = self.esp;
        frame.ss = self.ss;
    }
}

/// Implements the `swexn(esp3, eip, arg, newureg)` syscall.
///
/// `(esp3, eip) == (0, 0)` deregisters any installed handler. Otherwise
/// the pair is validated and installed as the task's one-shot handler.
/// If `newureg` is given, it is validated and spliced directly into the
/// calling thread's trap frame, so the syscall's "return" is actually a
/// jump into the caller-chosen register state.
pub fn swexn(
    task: &Task,
    frame: &mut arch::TrapFrame,
    esp3: u32,
    eip: u32,
    arg: u32,
    newureg: Option<&Ureg>,
) -> Result<(), Error> {
    if esp3 == 0 && eip == 0 {
        task.set_swexn_handler(None);
    } else {
        if esp3 == 0 || esp3 % 4 != 0 || eip == 0 {
            return Err(Error::Inval);
        }
        let needed = core::mem::size_of::<Ureg>() as u32 + core::mem::size_of::<HandlerFrame>() as u32;
        let space = task.space();
        if !virtmem::is_writable(&space, esp3 - needed, needed) {
            return Err(Error::Inval);
        }
        drop(space);
        task.set_swexn_handler(Some(SwexnHandler {
            handler_eip: eip,
            arg,
            exception_stack_top: esp3,
        }));
    }

    if let Some(ureg) = newureg {
        if ureg.eflags & EFLAGS_IF == 0 || ureg.eflags & EFLAGS_IOPL != 0 {
            return Err(Error::Inval);
        }
        ureg.apply_to_frame(frame);
    }
    Ok(())
}

/// The call frame synthesized just below the copied [`Ureg`], giving the
/// handler its two arguments as though it had been `call`ed with them.
#[repr(C)]
struct HandlerFrame {
    return_address: u32,
    arg: u32,
    ureg_ptr: u32,
}

/// Attempts to deliver a recoverable fault to the task's installed
/// handler, consuming it (handlers are one-shot).
///
/// On success, `frame` has been rewritten to resume execution in the
/// handler, on the task's exception stack, and the caller should treat
/// the fault as handled rather than fatal. Returns `false` if no handler
/// was installed, or if the exception stack turned out not to be
/// writable, in which case the caller falls back to killing the thread.
pub fn dispatch(task: &Task, frame: &mut arch::TrapFrame, cause: u32, cr2: u32) -> bool {
    let handler = match task.take_swexn_handler() {
        Some(h) => h,
        None => return false,
    };

    let ureg = Ureg::from_frame(frame, cause, cr2);
    let ureg_size = core::mem::size_of::<Ureg>() as u32;
    let ureg_addr = (handler.exception_stack_top - ureg_size) & !0x3;
    let call_frame_size = core::mem::size_of::<HandlerFrame>() as u32;
    let esp_new = ureg_addr - call_frame_size;

    {
        let space = task.space();
        if !virtmem::is_writable(&space, esp_new, ureg_size + call_frame_size) {
            return false;
        }
    }

    unsafe {
        *(ureg_addr as *mut Ureg) = ureg;
        let call_frame = &mut *(esp_new as *mut HandlerFrame);
        call_frame.return_address = frame.eip;
        call_frame.arg = handler.arg;
        call_frame.ureg_ptr = ureg_addr;
    }

    frame.eip = handler.handler_eip;
    frame.useresp = esp_new;
    frame.cs = segmentation::USER_CODE_SELECTOR as u32;
    frame.ss = segmentation::USER_DATA_SELECTOR as u32;
    frame.eflags = EFLAGS_IF;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_frame() -> arch::TrapFrame {
        arch::TrapFrame {
            edi: 0,
            esi: 0,
            ebp: 0,
            esp_dummy: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            vector: 14,
            error_code: 0,
            eip: 0x1000,
            cs: segmentation::USER_CODE_SELECTOR as u32,
            eflags: EFLAGS_IF,
            useresp: 0x8000_0000,
            ss: segmentation::USER_DATA_SELECTOR as u32,
        }
    }

    #[test]
    fn ureg_round_trips_fault_fields() {
        let frame = setup_frame();
        let ureg = Ureg::from_frame(&frame, 14, 0xdead_beef);
        assert_eq!(ureg.cause, 14);
        assert_eq!(ureg.cr2, 0xdead_beef);
        assert_eq!(ureg.eip, frame.eip);
    }

    #[test]
    fn apply_to_frame_rewrites_entry_point() {
        let mut frame = setup_frame();
        let mut ureg = Ureg::from_frame(&frame, 0, 0);
        ureg.eip = 0x2000;
        ureg.eflags = EFLAGS_IF;
        ureg.apply_to_frame(&mut frame);
        assert_eq!(frame.eip, 0x2000);
    }
}
