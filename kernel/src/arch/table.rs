// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The shared `lgdt`/`lidt` descriptor-table-pointer format.

use core::arch::asm;

/// The structure loaded by `lgdt`/`lidt`: a 16-bit limit (size in bytes,
/// minus one) followed by a 32-bit linear base address. This is the
/// generic x86 descriptor table pointer used for both the GDT and IDT.
///
#[repr(C, packed)]
pub struct DescriptorTablePointer {
    pub limit: u16,
    pub base: u32,
}

/// Loads the interrupt descriptor table.
///
/// # Safety
///
/// `ptr` must reference a valid, live IDT for as long as interrupts
/// remain enabled.
pub unsafe fn lidt(ptr: &DescriptorTablePointer) {
    asm!("lidt [{}]", in(reg) ptr, options(readonly, nostack, preserves_flags));
}

/// Loads the global descriptor table.
///
/// # Safety
///
/// `ptr` must reference a valid, live GDT. The caller must reload the
/// segment registers afterwards, as `lgdt` alone does not do so.
pub unsafe fn lgdt(ptr: &DescriptorTablePointer) {
    asm!("lgdt [{}]", in(reg) ptr, options(readonly, nostack, preserves_flags));
}

/// Loads the task register with the given segment selector.
///
/// # Safety
///
/// `selector` must reference a valid, present TSS descriptor in the GDT.
pub unsafe fn ltr(selector: u16) {
    asm!("ltr {:x}", in(reg) selector, options(nomem, nostack, preserves_flags));
}
