//! Controller driven through the line protocol, the way the hub sees it.

use std::cell::Cell;
use std::rc::Rc;

use embedded_hal::delay::DelayNs;
use plantops_node::protocol::INPUT_GAP;
use plantops_node::relay::{MockRelays, Relay};
use plantops_node::sensors::{AnalogFrontEnd, AnalogSample, BusError, ClimateSample, ClimateSensor};
use plantops_node::{Controller, ControllerConfig};

/// Climate sensor whose temperature and health the test flips from outside.
#[derive(Clone)]
struct Probe {
    temperature_c: Rc<Cell<f32>>,
    healthy: Rc<Cell<bool>>,
    restarts: Rc<Cell<u32>>,
}

impl Probe {
    fn new(t: f32) -> Self {
        Self {
            temperature_c: Rc::new(Cell::new(t)),
            healthy: Rc::new(Cell::new(true)),
            restarts: Rc::new(Cell::new(0)),
        }
    }
}

impl ClimateSensor for Probe {
    fn data_ready(&mut self) -> Result<bool, BusError> {
        if self.healthy.get() {
            Ok(true)
        } else {
            Err(BusError::Nack)
        }
    }
    fn read_measurement(&mut self) -> Result<ClimateSample, BusError> {
        Ok(ClimateSample {
            co2_ppm: 700,
            temperature_c: self.temperature_c.get(),
            humidity_pct: 45.0,
        })
    }
    fn restart_bus(&mut self) -> Result<(), BusError> {
        self.restarts.set(self.restarts.get() + 1);
        Ok(())
    }
    fn stop_periodic(&mut self) -> Result<(), BusError> {
        Ok(())
    }
    fn reinit(&mut self) -> Result<(), BusError> {
        Ok(())
    }
    fn start_periodic(&mut self) -> Result<(), BusError> {
        Ok(())
    }
}

struct Lines(AnalogSample);

impl AnalogFrontEnd for Lines {
    fn sample(&mut self) -> AnalogSample {
        self.0
    }
}

struct NoDelay;

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

type Node = Controller<Probe, Lines, MockRelays, NoDelay>;

fn node(probe: Probe, now: u32) -> Node {
    let lines = Lines(AnalogSample {
        light_raw: 410,
        soil_raw: 780,
        water_ok: true,
    });
    Controller::new(ControllerConfig::default(), probe, lines, MockRelays::new(true), NoDelay, now)
}

fn ask(node: &mut Node, now: u32, cmd: &str) -> Vec<String> {
    let mut out = Vec::new();
    node.step(now, format!("{cmd}\n").as_bytes(), &mut out).unwrap();
    String::from_utf8(out).unwrap().lines().map(str::to_owned).collect()
}

fn record(node: &mut Node, now: u32) -> Vec<String> {
    let reply = ask(node, now, "r");
    assert_eq!(reply.last().map(String::as_str), Some("OK"));
    reply[0].split(',').map(str::to_owned).collect()
}

#[test]
fn overtemperature_scenario() {
    let probe = Probe::new(22.0);
    let mut n = node(probe.clone(), 0);

    assert_eq!(ask(&mut n, 100, "hon"), ["OK heater=1 lockout=0"]);

    probe.temperature_c.set(42.0);
    let fields = record(&mut n, 200);
    assert_eq!(fields[7], "0", "heater forced off");
    assert_eq!(fields[8], "1", "lockout reported");
    assert!(!n.relays().is_on(Relay::Heater));

    assert_eq!(ask(&mut n, 300, "hon"), ["OK heater=0 lockout=1"]);

    // Cooling into the band does not clear it.
    probe.temperature_c.set(31.0);
    assert_eq!(record(&mut n, 400)[8], "1");

    probe.temperature_c.set(29.0);
    assert_eq!(record(&mut n, 500)[8], "0");
    assert_eq!(ask(&mut n, 600, "hon"), ["OK heater=1 lockout=0"]);
}

#[test]
fn bus_failure_goes_stale_then_recovers() {
    let probe = Probe::new(22.0);
    let mut n = node(probe.clone(), 0);
    ask(&mut n, 10, "hon");

    probe.healthy.set(false);
    // Within the window the cached reading is still trusted.
    assert_eq!(record(&mut n, 20_000)[13], "0");

    let fields = record(&mut n, 31_000);
    assert_eq!(fields[13], "1", "stale flag");
    assert_eq!(fields[7], "0", "heater forced off");
    assert_eq!(ask(&mut n, 31_100, "hon"), ["ERR heater refused: sensor data stale"]);
    assert_eq!(probe.restarts.get(), 1);

    // Mid-backoff: no second attempt.
    record(&mut n, 60_000);
    assert_eq!(probe.restarts.get(), 1);

    probe.healthy.set(true);
    assert_eq!(record(&mut n, 61_000)[13], "0");
    assert_eq!(ask(&mut n, 61_100, "hon"), ["OK heater=1 lockout=0"]);
}

#[test]
fn water_pulse_across_counter_rollover() {
    let start = u32::MAX - 2_000;
    let mut n = node(Probe::new(22.0), start);
    assert_eq!(ask(&mut n, start, "w_on,5"), ["OK water=1 sec=5"]);

    let fields = record(&mut n, start.wrapping_add(4_000));
    assert_eq!(fields[9], "1");
    assert_eq!(fields[11], "1");

    let fields = record(&mut n, start.wrapping_add(5_000));
    assert_eq!(fields[9], "0");
    assert_eq!(fields[11], "0");
    assert!(!n.relays().is_on(Relay::Water));
}

#[test]
fn mixed_input_in_one_chunk() {
    let mut n = node(Probe::new(22.0), 0);
    let mut out = Vec::new();
    n.step(5, b"lon\nbogus\r\nc_on 60\nt\n", &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines,
        [
            "OK light=1",
            "ERR unknown command: bogus",
            "OK circulation=1 sec=60",
            "water_rem=0,circ_rem=60",
            "OK",
        ]
    );
}

#[test]
fn lost_input_never_completes_a_command() {
    let mut n = node(Probe::new(22.0), 0);
    let mut out = Vec::new();

    // `w_on,30` with the `0` lost in transit must not run as `w_on,3`.
    n.step(10, b"w_on,3", &mut out).unwrap();
    n.step(20, &[INPUT_GAP], &mut out).unwrap();
    n.step(30, b"\n", &mut out).unwrap();
    assert!(out.is_empty());
    assert!(!n.relays().is_on(Relay::Water));
    assert!(!n.actuators().water);

    // The stream resynchronises on the next full line.
    assert_eq!(ask(&mut n, 40, "lon"), ["OK light=1"]);
}

#[cfg(feature = "sim")]
#[test]
fn simulated_hot_room_trips_lockout() {
    use plantops_node::sim::{Scenario, SimAnalog, SimClimate};

    let mut n = Controller::new(
        ControllerConfig::default(),
        SimClimate::new(Scenario::Hot, 1),
        SimAnalog::new(Scenario::Hot, 600.0),
        MockRelays::new(true),
        NoDelay,
        0,
    );
    let mut out = Vec::new();
    n.step(0, b"", &mut out).unwrap();
    n.step(20, b"hon\n", &mut out).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "OK heater=0 lockout=1\n");
}
