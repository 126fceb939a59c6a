// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Brings up the kernel: the GDT/TSS, the physical and virtual memory
//! managers, the heap, the scheduler, the IDT and PIC, and finally the
//! first task.

#![no_std]

extern crate alloc;

use core::panic::PanicInfo;

pub mod allocator;

/// Runs every subsystem's bring-up in the order later stages depend on:
/// segmentation before interrupts (the IDT's gates name a GDT selector),
/// the heap before anything that allocates, the kernel page tables
/// before the first task's page directory is built from them, the
/// scheduler's idle thread before the timer can ever call
/// [`scheduler::tick`], and interrupts enabled only once all of that is
/// in place.
///
/// Must be called exactly once, before the first task is loaded.
pub fn init() {
    segmentation::init();
    physmem::init();
    unsafe { allocator::init() };
    unsafe { virtmem::init() };
    scheduler::init();
    time::init();
    interrupts::init();
    sync::enable_scheduling();
    arch::enable_interrupts();
}

/// Loads the named program from the static program table as the very
/// first task, and starts the scheduler running it.
///
/// # Panics
///
/// Panics if `name` is not in the program table, or if loading the task
/// fails; there is no one left to report the failure to.
pub fn spawn_init(name: &str, argv: &[&str]) {
    let (entry, segments) = interrupts::lookup_program(name).expect("unknown init program");
    lifecycle::load_bootstrap_task(entry, segments, argv).expect("failed to load init task");
}

#[alloc_error_handler]
fn alloc_error_handler(layout: alloc::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout)
}

/// Halts the CPU in a tight `hlt` loop, used once there is nothing left
/// for the boot thread to do but wait for an interrupt to reschedule it.
pub fn halt_loop() -> ! {
    loop {
        arch::hlt();
    }
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial::println!("{}", info);
    halt_loop()
}
