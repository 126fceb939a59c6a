// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial::println!("{}", info);
    kernel::halt_loop()
}

/// The boot stub hands off here once the CPU is in 32-bit protected
/// mode with a flat identity mapping; everything from here on is the
/// kernel proper.
#[no_mangle]
pub extern "C" fn _start() -> ! {
    kernel::init();
    kernel::spawn_init("init", &[]);
    kernel::halt_loop()
}
