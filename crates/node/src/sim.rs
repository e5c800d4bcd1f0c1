//! Stateful sensor simulator for local development.
//!
//! Models enough physics to exercise the failsafes end to end:
//! - Temporal coherence via random walk with mean reversion
//! - Heater warms the enclosure, circulation pulls it back toward ambient
//! - Soil dries slowly and wets while the pump runs; the tank drains with it
//! - Diurnal light cycle
//! - Bus flakiness (failed reads, silent dropouts) in the `flaky` scenario

use std::fmt;

use crate::sensors::{AnalogFrontEnd, AnalogSample, BusError, ClimateSample, ClimateSensor};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Comfortable room, slow soil drying, healthy bus.
    Nominal,
    /// Ambient well above the heater trip point. Exercises the lockout.
    Hot,
    /// Cold room. The fallback should keep asking for heat.
    Cold,
    /// Soil starts dry and the tank is nearly empty.
    Dry,
    /// Bus errors and multi-minute dropouts. Exercises staleness and recovery.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Self::Hot,
            "cold" => Self::Cold,
            "dry" => Self::Dry,
            "flaky" => Self::Flaky,
            _ => Self::Nominal, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nominal => write!(f, "nominal"),
            Self::Hot => write!(f, "hot"),
            Self::Cold => write!(f, "cold"),
            Self::Dry => write!(f, "dry"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Climate (bus sensor)
// ---------------------------------------------------------------------------

/// Simulated periodic CO2 / temperature / humidity sensor.
pub struct SimClimate {
    ambient_c: f64,
    temperature_c: f64,
    humidity_pct: f64,
    co2_ppm: f64,

    heater_on: bool,
    circulation_on: bool,

    /// Polls between measurements (the real part measures every 5 s).
    interval_polls: u32,
    polls: u32,
    periodic: bool,

    fail_prob: f32,
    dropout_prob: f32,
    dropout_polls: u32,
    dropout_left: u32,
}

impl SimClimate {
    /// `interval_polls` is how many `data_ready` calls make up one
    /// measurement period at the node's loop rate.
    pub fn new(scenario: Scenario, interval_polls: u32) -> Self {
        let (ambient, fail_prob, dropout_prob) = match scenario {
            Scenario::Nominal | Scenario::Dry => (22.0, 0.0, 0.0),
            Scenario::Hot => (38.0, 0.0, 0.0),
            Scenario::Cold => (12.0, 0.0, 0.0),
            Scenario::Flaky => (22.0, 0.05_f32, 0.002_f32),
        };
        Self {
            ambient_c: ambient,
            temperature_c: ambient + gaussian(0.0, 0.5),
            humidity_pct: 55.0,
            co2_ppm: 650.0,
            heater_on: false,
            circulation_on: false,
            interval_polls: interval_polls.max(1),
            polls: 0,
            periodic: true,
            fail_prob,
            dropout_prob,
            dropout_polls: interval_polls.saturating_mul(20),
            dropout_left: 0,
        }
    }

    pub fn set_heater(&mut self, on: bool) {
        self.heater_on = on;
    }

    pub fn set_circulation(&mut self, on: bool) {
        self.circulation_on = on;
    }

    pub fn temperature_c(&self) -> f64 {
        self.temperature_c
    }

    fn evolve(&mut self) {
        let heat = if self.heater_on { 0.35 } else { 0.0 };
        let pull = if self.circulation_on { 0.15 } else { 0.05 };
        self.temperature_c += heat + pull * (self.ambient_c - self.temperature_c) + gaussian(0.0, 0.05);
        self.humidity_pct =
            (self.humidity_pct + 0.05 * (55.0 - self.humidity_pct) + gaussian(0.0, 0.3)).clamp(5.0, 99.0);
        self.co2_ppm = (self.co2_ppm + 0.05 * (650.0 - self.co2_ppm) + gaussian(0.0, 8.0)).clamp(400.0, 5000.0);
    }
}

impl ClimateSensor for SimClimate {
    fn data_ready(&mut self) -> Result<bool, BusError> {
        if self.dropout_left > 0 {
            self.dropout_left -= 1;
            return Err(BusError::Nack);
        }
        if fastrand::f32() < self.dropout_prob {
            self.dropout_left = self.dropout_polls;
            return Err(BusError::Nack);
        }
        if !self.periodic {
            return Ok(false);
        }
        self.polls += 1;
        if self.polls >= self.interval_polls {
            self.polls = 0;
            self.evolve();
            return Ok(true);
        }
        Ok(false)
    }

    fn read_measurement(&mut self) -> Result<ClimateSample, BusError> {
        if fastrand::f32() < self.fail_prob {
            return Err(BusError::Crc);
        }
        Ok(ClimateSample {
            co2_ppm: self.co2_ppm.round() as u16,
            temperature_c: self.temperature_c as f32,
            humidity_pct: self.humidity_pct as f32,
        })
    }

    fn restart_bus(&mut self) -> Result<(), BusError> {
        self.dropout_left = 0;
        Ok(())
    }

    fn stop_periodic(&mut self) -> Result<(), BusError> {
        self.periodic = false;
        Ok(())
    }

    fn reinit(&mut self) -> Result<(), BusError> {
        self.polls = 0;
        Ok(())
    }

    fn start_periodic(&mut self) -> Result<(), BusError> {
        self.periodic = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Analog front end
// ---------------------------------------------------------------------------

/// Soil raw values follow the 10-bit convention of the link record: higher
/// is drier.
const SOIL_RAW_WET: f64 = 390.0;
const SOIL_RAW_DRY: f64 = 822.0;

/// Simulated light / soil channels and tank switch.
pub struct SimAnalog {
    soil: f64,
    walk_sigma: f64,
    drift_per_sample: f64,
    wet_rate: f64,
    pumping: bool,

    tank_level: f64,
    drain_per_sample: f64,

    diurnal_period_s: f64,
}

impl SimAnalog {
    /// `diurnal_period_s` controls the day/night cycle length. Use 600
    /// (10 min) for fast dev iteration or 86400 for real-time.
    pub fn new(scenario: Scenario, diurnal_period_s: f64) -> Self {
        let (start_frac, tank) = match scenario {
            Scenario::Dry => (0.95, 0.08),
            _ => (0.5, 1.0),
        };
        Self {
            soil: SOIL_RAW_WET + start_frac * (SOIL_RAW_DRY - SOIL_RAW_WET),
            walk_sigma: 0.6,
            drift_per_sample: 0.02,
            wet_rate: -1.5,
            pumping: false,
            tank_level: tank,
            drain_per_sample: 0.0005,
            diurnal_period_s,
        }
    }

    pub fn set_pumping(&mut self, active: bool) {
        self.pumping = active;
    }

    pub fn tank_level(&self) -> f64 {
        self.tank_level
    }
}

impl AnalogFrontEnd for SimAnalog {
    fn sample(&mut self) -> AnalogSample {
        let pumping = self.pumping && self.tank_level > 0.0;
        let wet = if pumping { self.wet_rate } else { 0.0 };
        if pumping {
            self.tank_level = (self.tank_level - self.drain_per_sample).max(0.0);
        }
        self.soil = (self.soil + self.drift_per_sample + wet + gaussian(0.0, self.walk_sigma))
            .clamp(SOIL_RAW_WET - 40.0, SOIL_RAW_DRY + 40.0);

        let now_s = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let phase = 2.0 * std::f64::consts::PI * now_s / self.diurnal_period_s;
        let light = 500.0 + 400.0 * phase.sin() + gaussian(0.0, 5.0);

        AnalogSample {
            light_raw: light.round().clamp(0.0, 1023.0) as u16,
            soil_raw: self.soil.round().clamp(0.0, 1023.0) as u16,
            water_ok: self.tank_level > 0.05,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
