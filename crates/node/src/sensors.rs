//! Sensor acquisition: analog/digital lines sampled every loop iteration, the
//! bus climate sensor read whenever it signals data-ready.
//!
//! A reading is never synthesized. Without a ready signal the cached climate
//! sample persists and ages; the watchdog in `failsafe` decides when it is too
//! old to trust.

use std::fmt;

use embedded_hal::delay::DelayNs;

use crate::tick::Tick;

/// Reinit needs ~20 ms on the SCD4x before the next command is accepted.
const REINIT_WAIT_MS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateSample {
    pub co2_ppm: u16,
    pub temperature_c: f32,
    pub humidity_pct: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AnalogSample {
    pub light_raw: u16,
    pub soil_raw: u16,
    pub water_ok: bool,
}

/// Everything the node knows about its environment at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub co2_ppm: u16,
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub light_raw: u16,
    pub soil_raw: u16,
    pub water_ok: bool,
    /// Tick of the climate read this reading is built on.
    pub captured_at: Tick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// No acknowledge from the device.
    Nack,
    /// Payload failed its checksum.
    Crc,
    /// Anything else the bus driver reported.
    Io,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BusError::Nack => "no acknowledge",
            BusError::Crc => "checksum mismatch",
            BusError::Io => "bus i/o error",
        })
    }
}

/// Periodic climate sensor (CO2 / temperature / humidity) on a shared bus.
pub trait ClimateSensor {
    fn data_ready(&mut self) -> Result<bool, BusError>;
    fn read_measurement(&mut self) -> Result<ClimateSample, BusError>;

    // Recovery steps, issued in this order by `Acquisition::recover`.
    fn restart_bus(&mut self) -> Result<(), BusError>;
    fn stop_periodic(&mut self) -> Result<(), BusError>;
    fn reinit(&mut self) -> Result<(), BusError>;
    fn start_periodic(&mut self) -> Result<(), BusError>;
}

/// Analog light/soil channels plus the tank level switch.
pub trait AnalogFrontEnd {
    fn sample(&mut self) -> AnalogSample;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Fresh,
    NotReady,
    Failed(BusError),
}

/// Owns the sensors and caches what they last reported.
pub struct Acquisition<C, A> {
    climate: C,
    analog: A,
    latest_climate: Option<(ClimateSample, Tick)>,
    latest_analog: AnalogSample,
}

impl<C: ClimateSensor, A: AnalogFrontEnd> Acquisition<C, A> {
    pub fn new(climate: C, analog: A) -> Self {
        Self {
            climate,
            analog,
            latest_climate: None,
            latest_analog: AnalogSample::default(),
        }
    }

    /// Sample the analog lines and, if the bus sensor has data, read it.
    pub fn poll(&mut self, now: Tick) -> PollOutcome {
        self.latest_analog = self.analog.sample();

        let ready = match self.climate.data_ready() {
            Ok(ready) => ready,
            Err(e) => return PollOutcome::Failed(e),
        };
        if !ready {
            return PollOutcome::NotReady;
        }
        match self.climate.read_measurement() {
            Ok(sample) => {
                self.latest_climate = Some((sample, now));
                PollOutcome::Fresh
            }
            Err(e) => PollOutcome::Failed(e),
        }
    }

    /// Bus recovery sequence. Stops at the first failing step.
    pub fn recover<D: DelayNs>(&mut self, delay: &mut D, settle_ms: u32) -> Result<(), BusError> {
        self.climate.restart_bus()?;
        self.climate.stop_periodic()?;
        delay.delay_ms(settle_ms);
        self.climate.reinit()?;
        delay.delay_ms(REINIT_WAIT_MS);
        self.climate.start_periodic()
    }

    /// Latest combined reading, if the climate sensor has ever reported.
    pub fn reading(&self) -> Option<SensorReading> {
        let (climate, captured_at) = self.latest_climate?;
        let analog = self.latest_analog;
        Some(SensorReading {
            co2_ppm: climate.co2_ppm,
            temperature_c: climate.temperature_c,
            humidity_pct: climate.humidity_pct,
            light_raw: analog.light_raw,
            soil_raw: analog.soil_raw,
            water_ok: analog.water_ok,
            captured_at,
        })
    }

    pub fn analog(&self) -> AnalogSample {
        self.latest_analog
    }

    pub fn climate_mut(&mut self) -> &mut C {
        &mut self.climate
    }

    pub fn analog_mut(&mut self) -> &mut A {
        &mut self.analog
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Scripted climate sensor shared by the node's unit tests.
    #[derive(Debug, Default)]
    pub(crate) struct FakeClimate {
        pub ready: bool,
        pub sample: Option<ClimateSample>,
        pub fail_reads: bool,
        pub fail_step: Option<&'static str>,
        pub calls: Vec<&'static str>,
    }

    impl FakeClimate {
        pub(crate) fn at(temperature_c: f32) -> Self {
            Self {
                ready: true,
                sample: Some(ClimateSample {
                    co2_ppm: 600,
                    temperature_c,
                    humidity_pct: 50.0,
                }),
                ..Self::default()
            }
        }

        fn step(&mut self, name: &'static str) -> Result<(), BusError> {
            self.calls.push(name);
            if self.fail_step == Some(name) {
                Err(BusError::Nack)
            } else {
                Ok(())
            }
        }
    }

    impl ClimateSensor for FakeClimate {
        fn data_ready(&mut self) -> Result<bool, BusError> {
            Ok(self.ready)
        }
        fn read_measurement(&mut self) -> Result<ClimateSample, BusError> {
            if self.fail_reads {
                return Err(BusError::Crc);
            }
            self.sample.ok_or(BusError::Io)
        }
        fn restart_bus(&mut self) -> Result<(), BusError> {
            self.step("restart_bus")
        }
        fn stop_periodic(&mut self) -> Result<(), BusError> {
            self.step("stop_periodic")
        }
        fn reinit(&mut self) -> Result<(), BusError> {
            self.step("reinit")
        }
        fn start_periodic(&mut self) -> Result<(), BusError> {
            self.step("start_periodic")
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct FakeAnalog(pub AnalogSample);

    impl AnalogFrontEnd for FakeAnalog {
        fn sample(&mut self) -> AnalogSample {
            self.0
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct CountingDelay {
        pub total_ms: u64,
    }

    impl DelayNs for CountingDelay {
        fn delay_ns(&mut self, ns: u32) {
            self.total_ms += u64::from(ns) / 1_000_000;
        }
    }

    fn analog() -> FakeAnalog {
        FakeAnalog(AnalogSample {
            light_raw: 512,
            soil_raw: 600,
            water_ok: true,
        })
    }

    #[test]
    fn no_reading_before_first_climate_sample() {
        let mut acq = Acquisition::new(FakeClimate::default(), analog());
        assert_eq!(acq.poll(10), PollOutcome::NotReady);
        assert!(acq.reading().is_none());
        assert_eq!(acq.analog().soil_raw, 600);
    }

    #[test]
    fn fresh_read_is_cached_with_capture_tick() {
        let mut acq = Acquisition::new(FakeClimate::at(21.5), analog());
        assert_eq!(acq.poll(1234), PollOutcome::Fresh);
        let r = acq.reading().unwrap();
        assert_eq!(r.captured_at, 1234);
        assert_eq!(r.temperature_c, 21.5);
        assert_eq!(r.soil_raw, 600);
    }

    #[test]
    fn failed_read_keeps_cached_sample() {
        let mut acq = Acquisition::new(FakeClimate::at(21.5), analog());
        acq.poll(100);
        acq.climate_mut().fail_reads = true;
        assert_eq!(acq.poll(200), PollOutcome::Failed(BusError::Crc));
        assert_eq!(acq.reading().unwrap().captured_at, 100);
    }

    #[test]
    fn recovery_runs_steps_in_order_with_settle() {
        let mut acq = Acquisition::new(FakeClimate::default(), analog());
        let mut delay = CountingDelay::default();
        acq.recover(&mut delay, 500).unwrap();
        assert_eq!(
            acq.climate_mut().calls,
            ["restart_bus", "stop_periodic", "reinit", "start_periodic"]
        );
        assert_eq!(delay.total_ms, 500 + u64::from(REINIT_WAIT_MS));
    }

    #[test]
    fn recovery_aborts_at_failing_step() {
        let climate = FakeClimate {
            fail_step: Some("stop_periodic"),
            ..FakeClimate::default()
        };
        let mut acq = Acquisition::new(climate, analog());
        let mut delay = CountingDelay::default();
        assert_eq!(acq.recover(&mut delay, 500), Err(BusError::Nack));
        assert_eq!(acq.climate_mut().calls, ["restart_bus", "stop_periodic"]);
        assert_eq!(delay.total_ms, 0);
    }
}
