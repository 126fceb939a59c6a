// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Manages segmentation for the kernel: the flat [Global Descriptor Table]
//! and the single Task State Segment (TSS) used to switch to ring 0 on
//! every trap from user mode.
//!
//! The GDT layout is fixed and flat — every segment covers the full 4 GiB
//! address space, so segmentation does no address translation of its own
//! and all protection is done through paging. The layout is:
//!
//! | Index | Descriptor    | Comment                                |
//! |-------|---------------|-----------------------------------------|
//! | 0     | NULL          | Not usable                              |
//! | 1     | `kernel_code` | Ring 0 code, flat                       |
//! | 2     | `kernel_data` | Ring 0 data/stacks, flat                |
//! | 3     | `user_code`   | Ring 3 code, flat                       |
//! | 4     | `user_data`   | Ring 3 data/stacks, flat                |
//! | 5     | `task_state`  | The TSS, used only for `esp0`/`ss0`     |
//!
//! [Global Descriptor Table]: https://en.wikipedia.org/wiki/Global_Descriptor_Table

#![no_std]

use arch::table::{lgdt, ltr, DescriptorTablePointer};
use core::arch::asm;
use core::mem::size_of;
use lazy_static::lazy_static;
use spin::Mutex;

/// Selector for the kernel code segment.
///
pub const KERNEL_CODE_SELECTOR: u16 = 1 << 3;
/// Selector for the kernel data segment.
///
pub const KERNEL_DATA_SELECTOR: u16 = 2 << 3;
/// Selector for the user code segment (RPL 3).
///
pub const USER_CODE_SELECTOR: u16 = (3 << 3) | 3;
/// Selector for the user data segment (RPL 3).
///
pub const USER_DATA_SELECTOR: u16 = (4 << 3) | 3;
/// Selector for the TSS.
///
const TASK_STATE_SELECTOR: u16 = 5 << 3;

const GDT_ENTRIES: usize = 6;

/// A raw 8-byte GDT segment descriptor.
///
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct SegmentDescriptor {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    limit_high_flags: u8,
    base_high: u8,
}

impl SegmentDescriptor {
    const fn null() -> Self {
        SegmentDescriptor {
            limit_low: 0,
            base_low: 0,
            base_mid: 0,
            access: 0,
            limit_high_flags: 0,
            base_high: 0,
        }
    }

    /// A flat segment spanning the whole 32-bit address space, in 4 KiB
    /// granular pages.
    ///
    const fn flat(access: u8) -> Self {
        SegmentDescriptor {
            limit_low: 0xffff,
            base_low: 0,
            base_mid: 0,
            access,
            // Flags nibble 0xC: granularity=4K, size=32-bit. Limit high
            // nibble 0xF completes the 20-bit limit field to its max.
            limit_high_flags: 0xc0 | 0x0f,
            base_high: 0,
        }
    }

    fn tss(base: u32, limit: u32) -> Self {
        SegmentDescriptor {
            limit_low: (limit & 0xffff) as u16,
            base_low: (base & 0xffff) as u16,
            base_mid: ((base >> 16) & 0xff) as u8,
            // Present, DPL 0, type 0x9 (32-bit TSS, not busy).
            access: 0x89,
            limit_high_flags: ((limit >> 16) & 0x0f) as u8,
            base_high: ((base >> 24) & 0xff) as u8,
        }
    }
}

const ACCESS_KERNEL_CODE: u8 = 0x9a; // present, ring 0, executable, readable
const ACCESS_KERNEL_DATA: u8 = 0x92; // present, ring 0, writable
const ACCESS_USER_CODE: u8 = 0xfa; // present, ring 3, executable, readable
const ACCESS_USER_DATA: u8 = 0xf2; // present, ring 3, writable

/// The 32-bit Task State Segment.
///
/// The kernel only relies on the hardware task-switch mechanism for one
/// thing: loading `esp0`/`ss0` on a ring 3 -> ring 0 transition, so that
/// every trap from user mode lands on the interrupted thread's kernel
/// stack. The other fields are unused but must be present for the
/// structure to have the shape the CPU expects.
///
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct TaskStateSegment {
    link: u32,
    pub esp0: u32,
    pub ss0: u32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u32,
    cs: u32,
    ss: u32,
    ds: u32,
    fs: u32,
    gs: u32,
    ldtr: u32,
    trap: u16,
    io_map_base: u16,
}

impl TaskStateSegment {
    const fn new() -> Self {
        TaskStateSegment {
            link: 0,
            esp0: 0,
            ss0: KERNEL_DATA_SELECTOR as u32,
            esp1: 0,
            ss1: 0,
            esp2: 0,
            ss2: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            fs: 0,
            gs: 0,
            ldtr: 0,
            trap: 0,
            // No I/O permission bitmap: set the base past the segment
            // limit so every `in`/`out` from ring 3 takes a #GP, as
            // I/O-port access is only ever granted through the
            // user-driver framework's inb/outb syscalls.
            io_map_base: size_of::<TaskStateSegment>() as u16,
        }
    }
}

struct Gdt {
    entries: [SegmentDescriptor; GDT_ENTRIES],
    tss: TaskStateSegment,
}

impl Gdt {
    const fn new() -> Self {
        Gdt {
            entries: [
                SegmentDescriptor::null(),
                SegmentDescriptor::flat(ACCESS_KERNEL_CODE),
                SegmentDescriptor::flat(ACCESS_KERNEL_DATA),
                SegmentDescriptor::flat(ACCESS_USER_CODE),
                SegmentDescriptor::flat(ACCESS_USER_DATA),
                SegmentDescriptor::null(), // patched with the TSS descriptor in init()
            ],
            tss: TaskStateSegment::new(),
        }
    }
}

lazy_static! {
    static ref GDT: Mutex<Gdt> = Mutex::new(Gdt::new());
}

/// Builds the TSS descriptor, loads the GDT and TSS, and reloads every
/// segment register to the kernel's flat selectors.
///
/// Must be called exactly once, early in boot, before interrupts are
/// enabled.
pub fn init() {
    let mut gdt = GDT.lock();
    let tss_base = (&gdt.tss) as *const TaskStateSegment as u32;
    let tss_limit = (size_of::<TaskStateSegment>() - 1) as u32;
    gdt.entries[5] = SegmentDescriptor::tss(tss_base, tss_limit);

    let ptr = DescriptorTablePointer {
        limit: (size_of::<[SegmentDescriptor; GDT_ENTRIES]>() - 1) as u16,
        base: gdt.entries.as_ptr() as u32,
    };
    drop(gdt);

    unsafe {
        lgdt(&ptr);
        reload_segments();
        ltr(TASK_STATE_SELECTOR);
    }
}

/// Reloads CS via a far jump and the data segment registers to the
/// kernel's flat selectors.
///
/// # Safety
///
/// The GDT must already be loaded with the kernel selectors this
/// function hard-codes.
unsafe fn reload_segments() {
    asm!(
        "push {code_sel}",
        "push 2f",
        "retf",
        "2:",
        code_sel = const KERNEL_CODE_SELECTOR as u32,
        options(preserves_flags)
    );
    asm!(
        "mov ds, {0:x}",
        "mov es, {0:x}",
        "mov fs, {0:x}",
        "mov gs, {0:x}",
        "mov ss, {0:x}",
        in(reg) KERNEL_DATA_SELECTOR,
        options(nostack, preserves_flags)
    );
}

/// Sets the kernel stack (`esp0`) used when a trap from ring 3 switches
/// to ring 0.
///
/// Called on every context switch with the new thread's kernel stack top
/// (or left unchanged for kernel threads, which never trap from a lower
/// privilege level).
pub fn set_kernel_stack(esp0: u32) {
    GDT.lock().tss.esp0 = esp0;
}
