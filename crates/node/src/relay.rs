//! Relay outputs. The `hw` feature gates the real rppal driver; without it a
//! mock board records pin levels and logs changes.
//!
//! Everything above this module speaks in logical on/off. Wiring polarity
//! (active-low boards are common) is resolved here and nowhere else.

use std::fmt;

use crate::tick::{self, Tick};

#[cfg(feature = "hw")]
use rppal::gpio::{Gpio, OutputPin};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relay {
    Light,
    Heater,
    Water,
    Circulation,
}

impl Relay {
    pub const ALL: [Relay; 4] = [Relay::Light, Relay::Heater, Relay::Water, Relay::Circulation];

    pub fn index(self) -> usize {
        match self {
            Relay::Light => 0,
            Relay::Heater => 1,
            Relay::Water => 2,
            Relay::Circulation => 3,
        }
    }
}

impl fmt::Display for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Relay::Light => "light",
            Relay::Heater => "heater",
            Relay::Water => "water",
            Relay::Circulation => "circulation",
        })
    }
}

/// Physical pin level for a logical state.
pub fn pin_level(on: bool, active_low: bool) -> bool {
    on != active_low
}

pub trait RelayDriver {
    fn write(&mut self, relay: Relay, on: bool);

    fn all_off(&mut self) {
        for relay in Relay::ALL {
            self.write(relay, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Timed relay bookkeeping
// ---------------------------------------------------------------------------

/// Logical state of a relay that switches itself off after a duration.
///
/// `off_at == 0` means "not scheduled". A deadline that computes to exactly
/// zero is nudged to 1 ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedRelay {
    relay: Relay,
    on: bool,
    off_at: Tick,
    max_secs: u32,
}

impl TimedRelay {
    pub fn new(relay: Relay, max_secs: u32) -> Self {
        debug_assert!(u64::from(max_secs) * 1000 < u64::from(tick::MAX_SPAN_MS));
        Self {
            relay,
            on: false,
            off_at: 0,
            max_secs,
        }
    }

    /// Switch on for `secs` (clamped to the configured maximum). Zero is an
    /// immediate off. Returns the duration actually applied.
    pub fn start(&mut self, now: Tick, secs: u32) -> u32 {
        let secs = secs.min(self.max_secs);
        if secs == 0 {
            self.stop();
            return 0;
        }
        let deadline = now.wrapping_add(secs * 1000);
        self.on = true;
        self.off_at = if deadline == 0 { 1 } else { deadline };
        secs
    }

    pub fn stop(&mut self) {
        self.on = false;
        self.off_at = 0;
    }

    /// Turn off if the deadline has passed. True when this call switched it off.
    pub fn service(&mut self, now: Tick) -> bool {
        if self.on && self.off_at != 0 && tick::reached(now, self.off_at) {
            self.stop();
            return true;
        }
        false
    }

    pub fn relay(&self) -> Relay {
        self.relay
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn off_at(&self) -> Option<Tick> {
        (self.off_at != 0).then_some(self.off_at)
    }

    /// Whole seconds left, rounded up so a running relay never reports 0.
    pub fn remaining_secs(&self, now: Tick) -> u32 {
        match self.off_at() {
            Some(deadline) if self.on => tick::remaining(now, deadline).div_ceil(1000),
            _ => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "hw")]
pub struct GpioRelays {
    pins: [OutputPin; 4], // indexed by Relay::index
    active_low: bool,
}

#[cfg(feature = "hw")]
impl GpioRelays {
    /// `pins` is BCM numbering in `Relay::ALL` order.
    pub fn new(pins: [u8; 4], active_low: bool) -> anyhow::Result<Self> {
        let gpio = Gpio::new()?;
        let open = |n: u8| -> anyhow::Result<OutputPin> {
            let mut pin = gpio.get(n)?.into_output();
            // Fail-safe: off before anything else can touch it
            if pin_level(false, active_low) {
                pin.set_high();
            } else {
                pin.set_low();
            }
            Ok(pin)
        };
        let pins = [open(pins[0])?, open(pins[1])?, open(pins[2])?, open(pins[3])?];
        tracing::info!(active_low, "gpio relay board initialised");
        Ok(Self { pins, active_low })
    }
}

#[cfg(feature = "hw")]
impl RelayDriver for GpioRelays {
    fn write(&mut self, relay: Relay, on: bool) {
        let pin = &mut self.pins[relay.index()];
        if pin_level(on, self.active_low) {
            pin.set_high();
        } else {
            pin.set_low();
        }
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development, no hardware)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MockRelays {
    levels: [bool; 4], // physical pin levels
    active_low: bool,
}

impl MockRelays {
    pub fn new(active_low: bool) -> Self {
        tracing::debug!(active_low, "[mock-gpio] relay board initialised (no hardware)");
        Self {
            levels: [pin_level(false, active_low); 4],
            active_low,
        }
    }

    pub fn level(&self, relay: Relay) -> bool {
        self.levels[relay.index()]
    }

    pub fn is_on(&self, relay: Relay) -> bool {
        self.levels[relay.index()] != self.active_low
    }
}

impl RelayDriver for MockRelays {
    fn write(&mut self, relay: Relay, on: bool) {
        let level = pin_level(on, self.active_low);
        if self.levels[relay.index()] != level {
            tracing::debug!(%relay, on, level, "[mock-gpio] relay changed");
        }
        self.levels[relay.index()] = level;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- TimedRelay -----------------------------------------------------------

    #[test]
    fn timed_relay_starts_off_and_unscheduled() {
        let r = TimedRelay::new(Relay::Water, 3600);
        assert!(!r.is_on());
        assert_eq!(r.off_at(), None);
        assert_eq!(r.remaining_secs(0), 0);
    }

    #[test]
    fn timed_relay_turns_off_at_deadline() {
        let mut r = TimedRelay::new(Relay::Water, 3600);
        assert_eq!(r.start(1_000, 5), 5);
        assert!(!r.service(5_999));
        assert!(r.is_on());
        assert!(r.service(6_000));
        assert!(!r.is_on());
        assert_eq!(r.off_at(), None);
    }

    #[test]
    fn timed_relay_zero_duration_is_off() {
        let mut r = TimedRelay::new(Relay::Circulation, 3600);
        r.start(0, 10);
        assert_eq!(r.start(500, 0), 0);
        assert!(!r.is_on());
    }

    #[test]
    fn timed_relay_clamps_to_max() {
        let mut r = TimedRelay::new(Relay::Circulation, 60);
        assert_eq!(r.start(0, 9_999), 60);
        assert_eq!(r.remaining_secs(0), 60);
    }

    #[test]
    fn timed_relay_deadline_on_zero_is_nudged() {
        let mut r = TimedRelay::new(Relay::Water, 3600);
        r.start(u32::MAX - 999, 1); // deadline wraps to exactly 0
        assert_eq!(r.off_at(), Some(1));
        assert!(!r.service(0));
        assert!(r.service(1));
    }

    #[test]
    fn timed_relay_remaining_rounds_up() {
        let mut r = TimedRelay::new(Relay::Water, 3600);
        r.start(0, 3);
        assert_eq!(r.remaining_secs(1), 3);
        assert_eq!(r.remaining_secs(2_001), 1);
        assert_eq!(r.remaining_secs(2_999), 1);
        assert_eq!(r.remaining_secs(3_000), 0);
    }

    #[test]
    fn timed_relay_across_rollover() {
        let mut r = TimedRelay::new(Relay::Water, 3600);
        let start = u32::MAX - 1_500;
        r.start(start, 3);
        assert!(!r.service(u32::MAX));
        assert!(!r.service(1_000));
        assert!(r.service(1_499));
    }

    // -- MockRelays -----------------------------------------------------------

    #[test]
    fn mock_relays_start_off_active_low() {
        let board = MockRelays::new(true);
        for relay in Relay::ALL {
            assert!(board.level(relay), "active-low off is a high pin");
            assert!(!board.is_on(relay));
        }
    }

    #[test]
    fn mock_relays_polarity() {
        let mut low = MockRelays::new(true);
        low.write(Relay::Heater, true);
        assert!(!low.level(Relay::Heater));
        assert!(low.is_on(Relay::Heater));

        let mut high = MockRelays::new(false);
        high.write(Relay::Heater, true);
        assert!(high.level(Relay::Heater));
        assert!(high.is_on(Relay::Heater));
    }

    #[test]
    fn mock_relays_all_off_resets_everything() {
        let mut board = MockRelays::new(true);
        for relay in Relay::ALL {
            board.write(relay, true);
        }
        board.all_off();
        assert!(Relay::ALL.iter().all(|r| !board.is_on(*r)));
    }

    #[test]
    fn relay_display_names() {
        let names: Vec<String> = Relay::ALL.iter().map(|r| r.to_string()).collect();
        assert_eq!(names, ["light", "heater", "water", "circulation"]);
    }
}
