//! The node's cooperative control loop.
//!
//! One call to [`Controller::step`] is one loop iteration, always in the same
//! order: service timed relays, poll sensors, run the failsafe supervisor,
//! then drain protocol input. Nothing in here blocks beyond the short fixed
//! waits of sensor recovery.

use std::io::{self, Write};

use embedded_hal::delay::DelayNs;
use tracing::{debug, error, info, warn};

use crate::failsafe::{FailsafeSupervisor, HeaterBlock, HeaterLockout, SensorWatchdog};
use crate::protocol::{self, Command, LineEvent, LineReader, ProtocolError, StatusRecord};
use crate::relay::{Relay, RelayDriver, TimedRelay};
use crate::sensors::{Acquisition, AnalogFrontEnd, ClimateSensor, PollOutcome};
use crate::tick::Tick;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerConfig {
    pub heater_trip_c: f32,
    pub heater_reset_c: f32,
    pub stale_ms: u32,
    pub recovery_backoff_ms: u32,
    pub settle_ms: u32,
    pub max_timed_sec: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            heater_trip_c: 35.0,
            heater_reset_c: 30.0,
            stale_ms: 30_000,
            recovery_backoff_ms: 60_000,
            settle_ms: 500,
            max_timed_sec: 3600,
        }
    }
}

/// Logical relay state as the node believes it, independent of wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuatorState {
    pub light: bool,
    pub heater: bool,
    pub heater_lockout: bool,
    pub water: bool,
    pub water_off_at: Option<Tick>,
    pub circulation: bool,
    pub circulation_off_at: Option<Tick>,
}

pub struct Controller<C, A, R, D> {
    acquisition: Acquisition<C, A>,
    failsafe: FailsafeSupervisor,
    relays: R,
    delay: D,
    settle_ms: u32,
    light: bool,
    heater: bool,
    water: TimedRelay,
    circulation: TimedRelay,
    reader: LineReader,
}

impl<C, A, R, D> Controller<C, A, R, D>
where
    C: ClimateSensor,
    A: AnalogFrontEnd,
    R: RelayDriver,
    D: DelayNs,
{
    pub fn new(cfg: ControllerConfig, climate: C, analog: A, mut relays: R, delay: D, now: Tick) -> Self {
        relays.all_off();
        info!(
            trip_c = cfg.heater_trip_c,
            reset_c = cfg.heater_reset_c,
            stale_ms = cfg.stale_ms,
            "controller initialised, all relays off"
        );
        Self {
            acquisition: Acquisition::new(climate, analog),
            failsafe: FailsafeSupervisor::new(
                HeaterLockout::new(cfg.heater_trip_c, cfg.heater_reset_c),
                SensorWatchdog::new(now, cfg.stale_ms, cfg.recovery_backoff_ms),
            ),
            relays,
            delay,
            settle_ms: cfg.settle_ms,
            light: false,
            heater: false,
            water: TimedRelay::new(Relay::Water, cfg.max_timed_sec),
            circulation: TimedRelay::new(Relay::Circulation, cfg.max_timed_sec),
            reader: LineReader::new(),
        }
    }

    /// One loop iteration. `input` is whatever arrived on the link since the
    /// last call; responses are written to `out`.
    pub fn step(&mut self, now: Tick, input: &[u8], out: &mut impl Write) -> io::Result<()> {
        self.service_timers(now);
        self.acquire(now);
        self.supervise(now);

        for &byte in input {
            if let Some(event) = self.reader.push(byte) {
                self.handle_line(now, event, out)?;
            }
        }
        Ok(())
    }

    // -- Loop stages ----------------------------------------------------------

    fn service_timers(&mut self, now: Tick) {
        for timed in [&mut self.water, &mut self.circulation] {
            if timed.service(now) {
                self.relays.write(timed.relay(), false);
                info!(relay = %timed.relay(), "timed relay expired");
            }
        }
    }

    fn acquire(&mut self, now: Tick) {
        match self.acquisition.poll(now) {
            PollOutcome::Fresh => self.failsafe.on_fresh_reading(now),
            PollOutcome::NotReady => {}
            PollOutcome::Failed(e) => {
                warn!(kind = "SensorCommFailure", error = %e, "climate read failed");
            }
        }
    }

    fn supervise(&mut self, now: Tick) {
        let reading = self.acquisition.reading();
        let verdict = self.failsafe.evaluate(now, reading.as_ref());

        if verdict.became_stale {
            error!(kind = "SensorStale", "climate data stale, heater locked off");
        }
        match verdict.lockout_changed {
            Some(true) => warn!(
                temperature_c = reading.map(|r| r.temperature_c),
                "overtemperature lockout tripped"
            ),
            Some(false) => info!(
                temperature_c = reading.map(|r| r.temperature_c),
                "overtemperature lockout cleared"
            ),
            None => {}
        }
        if verdict.force_heater_off && self.heater {
            self.set_heater(false);
            warn!("heater forced off by failsafe");
        }
        if verdict.attempt_recovery {
            info!(kind = "RecoveryInProgress", "restarting climate sensor");
            if let Err(e) = self.acquisition.recover(&mut self.delay, self.settle_ms) {
                error!(kind = "SensorCommFailure", error = %e, "sensor recovery step failed");
            }
        }
    }

    fn handle_line(&mut self, now: Tick, event: LineEvent, out: &mut impl Write) -> io::Result<()> {
        let line = match event {
            LineEvent::Line(line) => line,
            LineEvent::Malformed => {
                warn!(kind = "ProtocolParseError", "non-utf8 command line");
                return writeln!(out, "ERR bad encoding");
            }
        };
        match Command::parse(&line) {
            Ok(cmd) => self.execute(now, cmd, out),
            Err(ProtocolError::Empty) => Ok(()),
            Err(ProtocolError::UnknownVerb) => {
                let verb = protocol::tokens(&line).next().unwrap_or_default();
                debug!(kind = "ProtocolParseError", verb, "unknown verb");
                writeln!(out, "ERR unknown command: {verb}")
            }
            Err(e) => {
                debug!(kind = "ProtocolParseError", line = %line, error = %e, "rejected command");
                writeln!(out, "ERR {e}")
            }
        }
    }

    // -- Commands -------------------------------------------------------------

    /// Run one parsed command and write its full response.
    pub fn execute(&mut self, now: Tick, cmd: Command, out: &mut impl Write) -> io::Result<()> {
        match cmd {
            Command::Read => {
                writeln!(out, "{}", self.status(now).csv())?;
                writeln!(out, "OK")
            }
            Command::Print => {
                self.status(now).write_human(out)?;
                writeln!(out, "OK")
            }
            Command::Light(on) => {
                self.set_light(on);
                writeln!(out, "OK light={}", u8::from(self.light))
            }
            Command::Heater(on) => match self.heater_gate(now, on) {
                Ok(granted) => {
                    if on && !granted {
                        warn!("heater enable downgraded by overtemperature lockout");
                    }
                    self.set_heater(granted);
                    writeln!(
                        out,
                        "OK heater={} lockout={}",
                        u8::from(self.heater),
                        u8::from(self.failsafe.lockout().is_tripped())
                    )
                }
                Err(block) => {
                    warn!(kind = "SensorStale", "heater enable refused");
                    writeln!(out, "ERR heater refused: {block}")
                }
            },
            Command::WaterOn(secs) => {
                let applied = self.start_timed(Relay::Water, now, secs);
                writeln!(out, "OK water={} sec={applied}", u8::from(self.water.is_on()))
            }
            Command::WaterOff => {
                self.stop_timed(Relay::Water);
                writeln!(out, "OK water=0 sec=0")
            }
            Command::CirculationOn(secs) => {
                let applied = self.start_timed(Relay::Circulation, now, secs);
                writeln!(
                    out,
                    "OK circulation={} sec={applied}",
                    u8::from(self.circulation.is_on())
                )
            }
            Command::CirculationOff => {
                self.stop_timed(Relay::Circulation);
                writeln!(out, "OK circulation=0 sec=0")
            }
            Command::Timers => {
                writeln!(
                    out,
                    "water_rem={},circ_rem={}",
                    self.water.remaining_secs(now),
                    self.circulation.remaining_secs(now)
                )?;
                writeln!(out, "OK")
            }
            Command::Help => {
                for line in protocol::HELP {
                    writeln!(out, "{line}")?;
                }
                writeln!(out, "OK")
            }
        }
    }

    /// No climate sample at all is treated like stale data.
    fn heater_gate(&mut self, now: Tick, on: bool) -> Result<bool, HeaterBlock> {
        if on && self.acquisition.reading().is_none() {
            return Err(HeaterBlock::SensorStale);
        }
        self.failsafe.heater_request(now, on)
    }

    fn set_light(&mut self, on: bool) {
        if self.light != on {
            info!(relay = "light", on, "relay set");
        }
        self.light = on;
        self.relays.write(Relay::Light, on);
    }

    fn set_heater(&mut self, on: bool) {
        if self.heater != on {
            info!(relay = "heater", on, "relay set");
        }
        self.heater = on;
        self.relays.write(Relay::Heater, on);
    }

    fn timed_mut(&mut self, relay: Relay) -> &mut TimedRelay {
        match relay {
            Relay::Circulation => &mut self.circulation,
            _ => &mut self.water,
        }
    }

    fn start_timed(&mut self, relay: Relay, now: Tick, secs: u32) -> u32 {
        let timed = self.timed_mut(relay);
        let applied = timed.start(now, secs);
        let on = timed.is_on();
        self.relays.write(relay, on);
        info!(%relay, on, requested = secs, applied, "timed relay set");
        applied
    }

    fn stop_timed(&mut self, relay: Relay) {
        self.timed_mut(relay).stop();
        self.relays.write(relay, false);
        info!(%relay, on = false, "timed relay set");
    }

    /// Everything off, timers cleared. Used on orderly exit.
    pub fn shutdown(&mut self) {
        self.light = false;
        self.heater = false;
        self.water.stop();
        self.circulation.stop();
        self.relays.all_off();
        info!("controller shut down, all relays off");
    }

    // -- Observation ----------------------------------------------------------

    /// Snapshot for `r` / `p`. Reads nothing from hardware and changes nothing.
    pub fn status(&self, now: Tick) -> StatusRecord {
        let reading = self.acquisition.reading();
        let analog = self.acquisition.analog();
        StatusRecord {
            co2_ppm: reading.map_or(0, |r| r.co2_ppm),
            temperature_c: reading.map_or(0.0, |r| r.temperature_c),
            humidity_pct: reading.map_or(0.0, |r| r.humidity_pct),
            light_raw: analog.light_raw,
            soil_raw: analog.soil_raw,
            water_ok: analog.water_ok,
            light_on: self.light,
            heater_on: self.heater,
            heater_lockout: self.failsafe.lockout().is_tripped(),
            water_on: self.water.is_on(),
            circulation_on: self.circulation.is_on(),
            water_remaining_sec: self.water.remaining_secs(now),
            circulation_remaining_sec: self.circulation.remaining_secs(now),
            sensor_stale: self.failsafe.watchdog().is_stale() || reading.is_none(),
            has_climate: reading.is_some(),
        }
    }

    pub fn actuators(&self) -> ActuatorState {
        ActuatorState {
            light: self.light,
            heater: self.heater,
            heater_lockout: self.failsafe.lockout().is_tripped(),
            water: self.water.is_on(),
            water_off_at: self.water.off_at(),
            circulation: self.circulation.is_on(),
            circulation_off_at: self.circulation.off_at(),
        }
    }

    pub fn climate_mut(&mut self) -> &mut C {
        self.acquisition.climate_mut()
    }

    pub fn analog_mut(&mut self) -> &mut A {
        self.acquisition.analog_mut()
    }

    pub fn relays(&self) -> &R {
        &self.relays
    }
}

// ===========================================================================
// Tests
// ===========================================================================
