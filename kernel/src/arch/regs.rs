// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Control-register access and interrupt enable/disable.

use core::arch::asm;

/// Reads CR2, the address that caused the most recent page fault.
///
pub fn read_cr2() -> u32 {
    let value: u32;
    unsafe {
        asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

/// Reads CR3, the physical address of the current page directory.
///
pub fn read_cr3() -> u32 {
    let value: u32;
    unsafe {
        asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

/// Loads CR3 with the physical address of a page directory, flushing the
/// entire (non-global) TLB.
///
/// # Safety
///
/// `pd_phys` must be the physical address of a valid, page-aligned page
/// directory that identity-maps (or otherwise correctly maps) the code
/// currently executing.
pub unsafe fn write_cr3(pd_phys: u32) {
    asm!("mov cr3, {}", in(reg) pd_phys, options(nomem, nostack, preserves_flags));
}

/// Reloads CR3 with its current value, flushing the whole TLB without
/// changing the active address space.
///
/// # Safety
///
/// Same caveats as [`write_cr3`].
pub unsafe fn flush_tlb() {
    let current = read_cr3();
    write_cr3(current);
}

/// Invalidates a single page's TLB entry.
///
/// # Safety
///
/// `addr` must not be in active use by code that assumes the mapping is
/// still valid mid-instruction.
pub unsafe fn invalidate_page(addr: u32) {
    asm!("invlpg [{}]", in(reg) addr, options(nostack, preserves_flags));
}

/// Returns whether interrupts are currently enabled, by inspecting the
/// interrupt flag (bit 9) in EFLAGS.
///
pub fn interrupts_enabled() -> bool {
    let flags: u32;
    unsafe {
        asm!(
            "pushfd",
            "pop {}",
            out(reg) flags,
            options(nomem, preserves_flags)
        );
    }
    flags & (1 << 9) != 0
}

/// Enables maskable interrupts.
///
pub fn enable_interrupts() {
    unsafe { asm!("sti", options(nomem, nostack)) };
}

/// Disables maskable interrupts.
///
pub fn disable_interrupts() {
    unsafe { asm!("cli", options(nomem, nostack)) };
}

/// Runs `f` with interrupts disabled, restoring the previous interrupt
/// flag state (rather than unconditionally re-enabling) on return.
///
/// This is the "int_save" pattern described in the kernel's concurrency
/// model: most critical sections can simply disable and re-enable, but
/// code that may be called both from contexts with interrupts enabled
/// and disabled needs to restore rather than clobber the prior state.
///
pub fn without_interrupts<F: FnOnce() -> R, R>(f: F) -> R {
    let was_enabled = interrupts_enabled();
    disable_interrupts();
    let result = f();
    if was_enabled {
        enable_interrupts();
    }
    result
}

/// Halts the CPU until the next interrupt.
///
pub fn hlt() {
    unsafe { asm!("hlt", options(nomem, nostack)) };
}
