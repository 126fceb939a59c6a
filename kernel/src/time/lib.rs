// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Programs the [Programmable Interval Timer](https://en.wikipedia.org/wiki/Programmable_interval_timer)
//! and gives the rest of the kernel a monotonic clock built on top of the
//! scheduler's tick counter.
//!
//! The scheduler (not this crate) owns the sleep queue and the tick
//! counter itself, since ticking is inseparable from deciding whether to
//! preempt; this crate is only responsible for getting the hardware to
//! raise that tick at a known rate, and for turning the resulting tick
//! count into [`Instant`]/[`Duration`] values callers can reason about in
//! real units.

#![no_std]

pub use core::time::Duration;

/// The PIT's crystal frequency; every programmable divisor is relative
/// to this.
const PIT_FREQUENCY: u32 = 1_193_182;

/// How many timer interrupts the PIT is programmed to raise per second.
///
pub const TICKS_PER_SECOND: u64 = 100;

/// How many nanoseconds pass between consecutive ticks.
///
pub const NANOSECONDS_PER_TICK: u64 = 1_000_000_000 / TICKS_PER_SECOND;

const PIT_COMMAND: u16 = 0x43;
const PIT_CHANNEL_0: u16 = 0x40;
const PIT_MODE_SQUARE_WAVE: u8 = 0x36;

/// Programs the PIT to raise IRQ0 at [`TICKS_PER_SECOND`] Hz.
///
/// Does not install the IDT entry for IRQ0; that is the `interrupts`
/// crate's job, since it owns the IDT and the fault/device routing the
/// tick ultimately reaches.
pub fn init() {
    let divisor = (PIT_FREQUENCY / TICKS_PER_SECOND as u32) as u16;
    unsafe {
        arch::Port::<u8>::new(PIT_COMMAND).write(PIT_MODE_SQUARE_WAVE);
        arch::Port::<u8>::new(PIT_CHANNEL_0).write((divisor & 0xff) as u8);
        arch::Port::<u8>::new(PIT_CHANNEL_0).write((divisor >> 8) as u8);
    }
}

/// Returns the number of timer ticks since boot.
///
pub fn ticks() -> u64 {
    scheduler::get_ticks()
}

/// A single point in the kernel's monotonically nondecreasing clock.
///
#[derive(Debug, Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
pub struct Instant(u64);

/// The `Instant` representing the moment the kernel booted.
///
pub const BOOT_TIME: Instant = Instant(0);

impl Instant {
    /// Returns an `Instant` representing the current tick count.
    ///
    pub fn now() -> Instant {
        Instant(ticks())
    }

    /// Returns an `Instant` that will occur after `wait` has passed,
    /// rounded up to the next whole tick.
    pub fn after(wait: Duration) -> Instant {
        let delta = (wait.as_nanos() + (NANOSECONDS_PER_TICK - 1) as u128) / NANOSECONDS_PER_TICK as u128;
        Instant(ticks() + delta as u64)
    }

    /// Returns this instant's raw tick count, for feeding into the
    /// scheduler's sleep queue.
    pub fn as_ticks(&self) -> u64 {
        self.0
    }

    /// Returns a `Duration` describing the time between `earlier` and
    /// `self`.
    ///
    /// # Panics
    ///
    /// Panics if `earlier` is later than `self`.
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        let ticks = self.0.checked_sub(earlier.0).expect("duration_since called with a later instant");
        let secs = ticks / TICKS_PER_SECOND;
        let rem = ticks % TICKS_PER_SECOND;
        Duration::new(secs, (rem * NANOSECONDS_PER_TICK) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_since_converts_ticks_to_whole_seconds() {
        let a = Instant(4 * TICKS_PER_SECOND);
        let b = Instant(6 * TICKS_PER_SECOND);
        assert_eq!(b.duration_since(a), Duration::from_secs(2));
    }

    #[test]
    fn after_rounds_up_partial_ticks() {
        let partial = Duration::from_nanos(NANOSECONDS_PER_TICK / 2);
        let delta = (partial.as_nanos() + (NANOSECONDS_PER_TICK - 1) as u128) / NANOSECONDS_PER_TICK as u128;
        assert_eq!(delta, 1);
    }
}
