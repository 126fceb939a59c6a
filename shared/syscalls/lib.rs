// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides the system-call surface shared between the kernel and user
//! space: the set of syscalls, their software-interrupt vector, and the
//! small set of error codes returned by a failing call.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::panic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![forbid(unsafe_code)]

/// The interrupt vector used for the system-call software interrupt
/// (`int SYSCALL_VECTOR`).
///
pub const SYSCALL_VECTOR: u8 = 0x80;

/// The set of syscalls implemented by the kernel.
///
/// Each syscall is reached via [`SYSCALL_VECTOR`] with the call number in
/// `eax` and a pointer to a packed argument tuple in `ebx` (for calls
/// that take arguments). The result is returned in `eax`.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Syscall {
    /// Returns the id of the calling thread.
    GetTid = 0,

    /// Clones the calling task, including its address space (COW) and
    /// all open driver registrations.
    Fork = 1,

    /// Creates a new thread within the calling task, sharing its address
    /// space.
    ThreadFork = 2,

    /// Replaces the calling task's program image.
    Exec = 3,

    /// Records the calling task's exit status, to be observed by an
    /// ancestor's `wait`.
    SetStatus = 4,

    /// Blocks until a child task exits, returning its id and status.
    Wait = 5,

    /// Terminates the calling thread, tearing down its task if it was
    /// the task's last thread.
    Vanish = 6,

    /// Yields the processor, optionally to a specific thread.
    Yield = 7,

    /// Blocks the calling thread for a number of timer ticks.
    Sleep = 8,

    /// Blocks the calling thread until a matching `make_runnable`.
    Deschedule = 9,

    /// Wakes a thread blocked in `deschedule`.
    MakeRunnable = 10,

    /// Returns the number of timer ticks since boot.
    GetTicks = 11,

    /// Allocates a fresh region of zeroed, writable pages.
    NewPages = 12,

    /// Frees a region previously returned by `new_pages`.
    RemovePages = 13,

    /// Reads a line of input from the registered console driver.
    ReadLine = 14,

    /// Writes a buffer to the console.
    Print = 15,

    /// Returns the console cursor position.
    GetCursorPos = 16,

    /// Sets the console cursor position.
    SetCursorPos = 17,

    /// Sets the console's current text color.
    SetTermColor = 18,

    /// Reads a single character from the console, non-blocking.
    GetChar = 19,

    /// Installs, replaces, or deregisters the calling task's software
    /// exception handler.
    Swexn = 20,

    /// Registers the calling thread as the handler for a driver id.
    UdrivRegister = 21,

    /// Deregisters a driver id owned by the calling thread.
    UdrivDeregister = 22,

    /// Delivers a message to a driver's registered thread.
    UdrivSend = 23,

    /// Blocks until a message is pending for one of the calling thread's
    /// registered drivers.
    UdrivWait = 24,

    /// Reads a byte from an I/O port owned by one of the caller's
    /// drivers.
    UdrivInb = 25,

    /// Writes a byte to an I/O port owned by one of the caller's
    /// drivers.
    UdrivOutb = 26,

    /// Maps a physical MMIO region into the caller's address space.
    UdrivMmap = 27,

    /// Reads from the static in-memory program table.
    ReadFile = 28,

    /// Halts the system.
    Halt = 29,
    // Ensure new values are added to check_numerical_conversion below.
}

impl Syscall {
    /// Returns the syscall with the given numerical value, or `None` if
    /// it does not name a known syscall.
    pub fn from_usize(num: usize) -> Option<Self> {
        match num {
            0 => Some(Self::GetTid),
            1 => Some(Self::Fork),
            2 => Some(Self::ThreadFork),
            3 => Some(Self::Exec),
            4 => Some(Self::SetStatus),
            5 => Some(Self::Wait),
            6 => Some(Self::Vanish),
            7 => Some(Self::Yield),
            8 => Some(Self::Sleep),
            9 => Some(Self::Deschedule),
            10 => Some(Self::MakeRunnable),
            11 => Some(Self::GetTicks),
            12 => Some(Self::NewPages),
            13 => Some(Self::RemovePages),
            14 => Some(Self::ReadLine),
            15 => Some(Self::Print),
            16 => Some(Self::GetCursorPos),
            17 => Some(Self::SetCursorPos),
            18 => Some(Self::SetTermColor),
            19 => Some(Self::GetChar),
            20 => Some(Self::Swexn),
            21 => Some(Self::UdrivRegister),
            22 => Some(Self::UdrivDeregister),
            23 => Some(Self::UdrivSend),
            24 => Some(Self::UdrivWait),
            25 => Some(Self::UdrivInb),
            26 => Some(Self::UdrivOutb),
            27 => Some(Self::UdrivMmap),
            28 => Some(Self::ReadFile),
            29 => Some(Self::Halt),
            _ => None,
        }
    }
}

/// The set of error codes a syscall may return, as small negative
/// integers.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Error {
    /// Generic failure, including permission denial for
    /// `udriv_inb`/`udriv_outb`/`udriv_mmap`.
    Failure = -1,

    /// A malformed argument, invalid pointer, unaligned or out-of-range
    /// address, invalid id, or a status/state mismatch.
    Inval = -2,

    /// The requested resource is currently held by another caller.
    Busy = -3,

    /// A frame or heap allocation failed.
    NoMem = -4,

    /// The requested data is not yet available (non-blocking read
    /// paths).
    NotAvail = -5,

    /// An argument vector or filename exceeded a fixed kernel bound.
    Big = -6,
}

impl Error {
    /// Returns the error with the given numerical value, or `None` if it
    /// does not name a known error code.
    pub fn from_i32(num: i32) -> Option<Self> {
        match num {
            -1 => Some(Self::Failure),
            -2 => Some(Self::Inval),
            -3 => Some(Self::Busy),
            -4 => Some(Self::NoMem),
            -5 => Some(Self::NotAvail),
            -6 => Some(Self::Big),
            _ => None,
        }
    }
}

/// The maximum number of argument-vector entries `exec` accepts.
///
pub const NUM_ARGS_MAX: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_numerical_conversion() {
        let syscalls = [
            Syscall::GetTid,
            Syscall::Fork,
            Syscall::ThreadFork,
            Syscall::Exec,
            Syscall::SetStatus,
            Syscall::Wait,
            Syscall::Vanish,
            Syscall::Yield,
            Syscall::Sleep,
            Syscall::Deschedule,
            Syscall::MakeRunnable,
            Syscall::GetTicks,
            Syscall::NewPages,
            Syscall::RemovePages,
            Syscall::ReadLine,
            Syscall::Print,
            Syscall::GetCursorPos,
            Syscall::SetCursorPos,
            Syscall::SetTermColor,
            Syscall::GetChar,
            Syscall::Swexn,
            Syscall::UdrivRegister,
            Syscall::UdrivDeregister,
            Syscall::UdrivSend,
            Syscall::UdrivWait,
            Syscall::UdrivInb,
            Syscall::UdrivOutb,
            Syscall::UdrivMmap,
            Syscall::ReadFile,
            Syscall::Halt,
        ];

        for syscall in syscalls.iter().copied() {
            assert_eq!(Some(syscall), Syscall::from_usize(syscall as usize));
        }

        let errors = [
            Error::Failure,
            Error::Inval,
            Error::Busy,
            Error::NoMem,
            Error::NotAvail,
            Error::Big,
        ];

        for error in errors.iter().copied() {
            assert_eq!(Some(error), Error::from_i32(error as i32));
        }
    }
}
