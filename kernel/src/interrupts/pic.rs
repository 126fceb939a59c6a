// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Drives the two cascaded [8259 Programmable Interrupt Controllers]
//! directly through [`arch::Port`], rather than through a dedicated PIC
//! crate: every PIC crate on crates.io assumes the `x86_64` port
//! primitives, which this kernel cannot use.
//!
//! [8259 Programmable Interrupt Controllers]: https://wiki.osdev.org/8259_PIC

use arch::Port;

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xa0;
const PIC2_DATA: u16 = 0xa1;

/// The IDT vector the master PIC's IRQ 0 is remapped to.
///
pub const PIC1_OFFSET: u8 = 32;
/// The IDT vector the slave PIC's IRQ 0 (== master's IRQ 8) is remapped to.
///
pub const PIC2_OFFSET: u8 = PIC1_OFFSET + 8;

const ICW1_INIT: u8 = 0x11; // edge triggered, cascade mode, expect ICW4
const ICW4_8086: u8 = 0x01;

/// Remaps both PICs past the CPU exception vectors and masks every line.
///
/// Individual lines are unmasked with [`unmask`] as their drivers are
/// brought up.
pub fn init() {
    unsafe {
        let mut cmd1 = Port::<u8>::new(PIC1_COMMAND);
        let mut data1 = Port::<u8>::new(PIC1_DATA);
        let mut cmd2 = Port::<u8>::new(PIC2_COMMAND);
        let mut data2 = Port::<u8>::new(PIC2_DATA);

        cmd1.write(ICW1_INIT);
        cmd2.write(ICW1_INIT);
        data1.write(PIC1_OFFSET);
        data2.write(PIC2_OFFSET);
        data1.write(4); // slave PIC lives on master's IRQ2
        data2.write(2); // slave PIC's identity, from the slave's own side
        data1.write(ICW4_8086);
        data2.write(ICW4_8086);

        data1.write(0xff); // mask every line by default
        data2.write(0xff);
    }
}

/// Unmasks IRQ `line` (0-15), allowing it to reach the CPU.
///
pub fn unmask(line: u8) {
    unsafe {
        let (port, bit) = if line < 8 {
            (PIC1_DATA, line)
        } else {
            (PIC2_DATA, line - 8)
        };
        let mut data = Port::<u8>::new(port);
        let mask = data.read();
        data.write(mask & !(1 << bit));
    }
}

/// Signals end-of-interrupt for `vector`, which must be one this module
/// remapped a PIC line onto.
pub fn acknowledge(vector: u8) {
    unsafe {
        if vector >= PIC2_OFFSET {
            Port::<u8>::new(PIC2_COMMAND).write(0x20);
        }
        Port::<u8>::new(PIC1_COMMAND).write(0x20);
    }
}
