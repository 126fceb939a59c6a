// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Drives the 16550 UART on COM1, used for early kernel logging before any
//! user-space console driver exists.
//!
//! This talks to the UART registers directly through [`arch::Port`] rather
//! than a dedicated UART crate, since the obvious one on crates.io pulls in
//! the 64-bit-only `x86_64` crate for its port primitives.

#![no_std]

use arch::{without_interrupts, Port};
use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;

const COM1: u16 = 0x3f8;

struct SerialPort {
    data: Port<u8>,
    interrupt_enable: Port<u8>,
    fifo_control: Port<u8>,
    line_control: Port<u8>,
    modem_control: Port<u8>,
    line_status: Port<u8>,
}

impl SerialPort {
    const fn new(base: u16) -> Self {
        SerialPort {
            data: Port::new(base),
            interrupt_enable: Port::new(base + 1),
            fifo_control: Port::new(base + 2),
            line_control: Port::new(base + 3),
            modem_control: Port::new(base + 4),
            line_status: Port::new(base + 5),
        }
    }

    /// # Safety
    ///
    /// Must be called exactly once, before any other method, and the
    /// caller must own exclusive access to the port range.
    unsafe fn init(&mut self) {
        self.interrupt_enable.write(0x00); // disable interrupts
        self.line_control.write(0x80); // enable DLAB to set baud rate divisor
        self.data.write(0x03); // divisor low byte: 38400 baud
        self.interrupt_enable.write(0x00); // divisor high byte
        self.line_control.write(0x03); // 8 bits, no parity, one stop bit
        self.fifo_control.write(0xc7); // enable + clear FIFOs, 14-byte threshold
        self.modem_control.write(0x0b); // RTS/DSR set, enable IRQs (unused)
        self.interrupt_enable.write(0x01); // enable "data received" interrupt
    }

    /// # Safety
    ///
    /// `self` must have been initialized with [`init`](Self::init).
    unsafe fn send(&mut self, byte: u8) {
        while self.line_status.read() & 0x20 == 0 {}
        match byte {
            b'\n' => {
                while self.line_status.read() & 0x20 == 0 {}
                self.data.write(b'\r');
                while self.line_status.read() & 0x20 == 0 {}
                self.data.write(b'\n');
            }
            byte => self.data.write(byte),
        }
    }

    /// Returns the next received byte, or `None` if the receive buffer is
    /// empty.
    ///
    /// # Safety
    ///
    /// `self` must have been initialized with [`init`](Self::init).
    unsafe fn try_recv(&mut self) -> Option<u8> {
        if self.line_status.read() & 0x01 != 0 {
            Some(self.data.read())
        } else {
            None
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            unsafe { self.send(byte) };
        }
        Ok(())
    }
}

lazy_static! {
    static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = SerialPort::new(COM1);
        unsafe { serial_port.init() };
        Mutex::new(serial_port)
    };
}

/// Reads one byte from COM1 if one is waiting, without blocking.
///
/// This exists for the hardware interrupt handler that bridges raw serial
/// bytes into the user-driver framework's message queue.
pub fn try_recv() -> Option<u8> {
    without_interrupts(|| unsafe { SERIAL1.lock().try_recv() })
}

/// Writes formatted text to the serial port, disabling interrupts for the
/// duration to avoid deadlocking against an interrupt handler that also
/// logs.
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    without_interrupts(|| {
        SERIAL1
            .lock()
            .write_fmt(args)
            .expect("printing to serial failed");
    });
}

/// Prints to the kernel's serial log.
///
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::_print(format_args!($($arg)*)));
}

/// Prints a line to the kernel's serial log.
///
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
