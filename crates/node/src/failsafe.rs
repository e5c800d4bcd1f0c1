//! Hardware-level failsafes that hold regardless of what the link asks for:
//! the overtemperature lockout and the stale-sensor watchdog.

use std::fmt;

use crate::sensors::SensorReading;
use crate::tick::{self, Tick};

// ---------------------------------------------------------------------------
// Overtemperature lockout
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockoutState {
    Normal,
    Tripped,
}

/// Two-threshold hysteresis: trips strictly above `trip_c`, clears strictly
/// below `reset_c`. Anything in between leaves the state alone.
#[derive(Debug, Clone, Copy)]
pub struct HeaterLockout {
    state: LockoutState,
    trip_c: f32,
    reset_c: f32,
}

impl HeaterLockout {
    pub fn new(trip_c: f32, reset_c: f32) -> Self {
        debug_assert!(reset_c < trip_c);
        Self {
            state: LockoutState::Normal,
            trip_c,
            reset_c,
        }
    }

    /// Feed a fresh temperature. Returns the new state on a transition.
    pub fn update(&mut self, temperature_c: f32) -> Option<LockoutState> {
        let next = match self.state {
            LockoutState::Normal if temperature_c > self.trip_c => LockoutState::Tripped,
            LockoutState::Tripped if temperature_c < self.reset_c => LockoutState::Normal,
            _ => return None,
        };
        self.state = next;
        Some(next)
    }

    pub fn state(&self) -> LockoutState {
        self.state
    }

    pub fn is_tripped(&self) -> bool {
        self.state == LockoutState::Tripped
    }
}

// ---------------------------------------------------------------------------
// Stale-sensor watchdog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SensorWatchdog {
    last_update: Tick,
    stale_ms: u32,
    backoff_ms: u32,
    next_recovery: Option<Tick>,
    stale: bool,
    recovering: bool,
}

impl SensorWatchdog {
    pub fn new(now: Tick, stale_ms: u32, backoff_ms: u32) -> Self {
        Self {
            last_update: now,
            stale_ms,
            backoff_ms,
            next_recovery: None,
            stale: false,
            recovering: false,
        }
    }

    /// A successful bus read. The only thing that clears staleness.
    pub fn feed(&mut self, now: Tick) {
        self.last_update = now;
        self.stale = false;
        self.recovering = false;
    }

    /// Check the age of the last read and latch staleness once observed.
    ///
    /// The latch matters: after ~49 days of silence the wrapping delta would
    /// otherwise make the last update look recent again.
    pub fn check(&mut self, now: Tick) -> bool {
        if !self.stale && tick::elapsed(now, self.last_update) > self.stale_ms {
            self.stale = true;
        }
        self.stale
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    /// True if a recovery attempt may start now; arms the backoff if so.
    pub fn recovery_due(&mut self, now: Tick) -> bool {
        if !self.stale {
            return false;
        }
        if let Some(at) = self.next_recovery {
            if !tick::reached(now, at) {
                return false;
            }
        }
        self.next_recovery = Some(now.wrapping_add(self.backoff_ms));
        self.recovering = true;
        true
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Why a heater-enable request did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaterBlock {
    SensorStale,
}

impl fmt::Display for HeaterBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaterBlock::SensorStale => f.write_str("sensor data stale"),
        }
    }
}

/// What the controller must do after this iteration's evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Verdict {
    pub force_heater_off: bool,
    pub attempt_recovery: bool,
    pub lockout_changed: Option<bool>,
    pub became_stale: bool,
}

pub struct FailsafeSupervisor {
    lockout: HeaterLockout,
    watchdog: SensorWatchdog,
}

impl FailsafeSupervisor {
    pub fn new(lockout: HeaterLockout, watchdog: SensorWatchdog) -> Self {
        Self { lockout, watchdog }
    }

    pub fn on_fresh_reading(&mut self, now: Tick) {
        self.watchdog.feed(now);
    }

    pub fn evaluate(&mut self, now: Tick, reading: Option<&SensorReading>) -> Verdict {
        let was_stale = self.watchdog.is_stale();
        let stale = self.watchdog.check(now);

        let mut verdict = Verdict {
            became_stale: stale && !was_stale,
            ..Verdict::default()
        };

        if !stale {
            if let Some(reading) = reading {
                verdict.lockout_changed = self
                    .lockout
                    .update(reading.temperature_c)
                    .map(|s| s == LockoutState::Tripped);
            }
        }

        verdict.force_heater_off = stale || self.lockout.is_tripped();
        verdict.attempt_recovery = stale && self.watchdog.recovery_due(now);
        verdict
    }

    /// Gate a heater command. `Ok(false)` when the lockout silently
    /// downgrades an enable.
    pub fn heater_request(&mut self, now: Tick, on: bool) -> Result<bool, HeaterBlock> {
        if !on {
            return Ok(false);
        }
        if self.watchdog.check(now) {
            return Err(HeaterBlock::SensorStale);
        }
        Ok(!self.lockout.is_tripped())
    }

    pub fn lockout(&self) -> &HeaterLockout {
        &self.lockout
    }

    pub fn watchdog(&self) -> &SensorWatchdog {
        &self.watchdog
    }
}

// ===========================================================================
// Tests
// ===========================================================================
