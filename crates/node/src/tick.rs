//! Wrapping millisecond tick arithmetic.
//!
//! The loop clock is a free-running `u32` millisecond counter that rolls over
//! every ~49.7 days. Every comparison goes through a signed delta, so a
//! rollover between "now" and a deadline is harmless as long as the two are
//! less than 2^31 ms apart.

use std::time::{Duration, Instant};

use embedded_hal::delay::DelayNs;

pub type Tick = u32;

/// Largest span two ticks may be apart and still compare correctly.
pub const MAX_SPAN_MS: u32 = i32::MAX as u32;

/// True once `now` is at or past `deadline`.
pub fn reached(now: Tick, deadline: Tick) -> bool {
    now.wrapping_sub(deadline) as i32 >= 0
}

/// Milliseconds since `since`.
pub fn elapsed(now: Tick, since: Tick) -> u32 {
    now.wrapping_sub(since)
}

/// Milliseconds until `deadline`, zero once it has been reached.
pub fn remaining(now: Tick, deadline: Tick) -> u32 {
    if reached(now, deadline) {
        0
    } else {
        deadline.wrapping_sub(now)
    }
}

// ---------------------------------------------------------------------------
// Clock sources
// ---------------------------------------------------------------------------

pub trait Clock {
    fn now(&self) -> Tick;
}

/// Wall-independent clock built on `Instant`, truncated to the tick width.
///
/// `offset_ms` shifts the origin so a bench run can start just short of the
/// rollover instead of waiting seven weeks for it.
pub struct SystemClock {
    start: Instant,
    offset_ms: u32,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::with_offset(0)
    }

    pub fn with_offset(offset_ms: u32) -> Self {
        Self {
            start: Instant::now(),
            offset_ms,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Tick {
        (self.start.elapsed().as_millis() as u32).wrapping_add(self.offset_ms)
    }
}

/// Blocking delay for the short fixed waits the sensor drivers need.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(u64::from(ns)));
    }
}

// ===========================================================================
// Tests
// ===========================================================================
