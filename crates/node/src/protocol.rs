//! Line-oriented command protocol spoken over the link.
//!
//! Requests are newline-terminated ASCII, at most [`LINE_CAPACITY`] bytes.
//! Every response ends with exactly one terminal line starting with `OK` or
//! `ERR`; anything before it is payload.

use std::fmt;
use std::io::{self, Write};

use heapless::Vec as BoundedVec;

pub const LINE_CAPACITY: usize = 64;

/// Marker the runtime puts into the input stream where bytes were lost.
/// Whatever line it lands in is thrown away up to the next newline, so a
/// command can never be completed by bytes that did not follow it.
pub const INPUT_GAP: u8 = 0x00;

// ---------------------------------------------------------------------------
// Line assembly
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Line(String),
    /// Line was complete but not valid UTF-8.
    Malformed,
}

/// Fixed-capacity line accumulator. An overlong line is thrown away in full,
/// up to and including its newline, and the buffer starts over.
#[derive(Debug, Default)]
pub struct LineReader<const N: usize = LINE_CAPACITY> {
    buf: BoundedVec<u8, N>,
    discarding: bool,
    overflows: u32,
}

impl<const N: usize> LineReader<N> {
    pub fn new() -> Self {
        Self {
            buf: BoundedVec::new(),
            discarding: false,
            overflows: 0,
        }
    }

    pub fn push(&mut self, byte: u8) -> Option<LineEvent> {
        match byte {
            b'\n' => {
                if std::mem::take(&mut self.discarding) {
                    self.buf.clear();
                    return None;
                }
                let event = match std::str::from_utf8(&self.buf) {
                    Ok(text) => LineEvent::Line(text.to_owned()),
                    Err(_) => LineEvent::Malformed,
                };
                self.buf.clear();
                Some(event)
            }
            b'\r' => None,
            INPUT_GAP => {
                self.buf.clear();
                self.discarding = true;
                None
            }
            _ if self.discarding => None,
            _ => {
                if self.buf.push(byte).is_err() {
                    self.buf.clear();
                    self.discarding = true;
                    self.overflows = self.overflows.wrapping_add(1);
                    tracing::warn!(kind = "ProtocolParseError", capacity = N, "line too long, discarded");
                }
                None
            }
        }
    }

    /// Lines dropped for exceeding the buffer since start-up.
    pub fn overflows(&self) -> u32 {
        self.overflows
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Read,
    Print,
    Light(bool),
    Heater(bool),
    WaterOn(u32),
    WaterOff,
    CirculationOn(u32),
    CirculationOff,
    Timers,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    Empty,
    UnknownVerb,
    MissingArgument,
    BadArgument,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProtocolError::Empty => "empty command",
            ProtocolError::UnknownVerb => "unknown command",
            ProtocolError::MissingArgument => "missing argument",
            ProtocolError::BadArgument => "bad argument",
        })
    }
}

/// Verb and arguments, split on commas and whitespace.
pub fn tokens(line: &str) -> impl Iterator<Item = &str> {
    line.split(|c: char| c == ',' || c.is_ascii_whitespace())
        .filter(|t| !t.is_empty())
}

impl Command {
    pub fn parse(line: &str) -> Result<Command, ProtocolError> {
        let mut toks = tokens(line);
        let verb = toks.next().ok_or(ProtocolError::Empty)?;
        let arg = toks.next();
        if toks.next().is_some() {
            return Err(ProtocolError::BadArgument);
        }

        let is = |name: &str| verb.eq_ignore_ascii_case(name);
        let bare = |cmd: Command| match arg {
            None => Ok(cmd),
            Some(_) => Err(ProtocolError::BadArgument),
        };
        let secs = || -> Result<u32, ProtocolError> {
            arg.ok_or(ProtocolError::MissingArgument)?
                .parse::<u32>()
                .map_err(|_| ProtocolError::BadArgument)
        };

        if is("r") {
            bare(Command::Read)
        } else if is("p") || is("status") {
            bare(Command::Print)
        } else if is("lon") {
            bare(Command::Light(true))
        } else if is("loff") {
            bare(Command::Light(false))
        } else if is("hon") {
            bare(Command::Heater(true))
        } else if is("hoff") {
            bare(Command::Heater(false))
        } else if is("w_on") {
            secs().map(Command::WaterOn)
        } else if is("w_off") {
            bare(Command::WaterOff)
        } else if is("c_on") {
            secs().map(Command::CirculationOn)
        } else if is("c_off") {
            bare(Command::CirculationOff)
        } else if is("t") || is("timers") {
            bare(Command::Timers)
        } else if is("help") || is("?") {
            bare(Command::Help)
        } else {
            Err(ProtocolError::UnknownVerb)
        }
    }
}

pub const HELP: &[&str] = &[
    "r            machine-readable status record",
    "p | status   human-readable status",
    "lon | loff   light relay",
    "hon | hoff   heater relay (subject to failsafes)",
    "w_on,N       water pump for N seconds",
    "w_off        water pump off",
    "c_on,N       circulation fan for N seconds",
    "c_off        circulation fan off",
    "t | timers   seconds left on timed relays",
];

// ---------------------------------------------------------------------------
// Status record
// ---------------------------------------------------------------------------

/// Everything `r` and `p` report, captured at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusRecord {
    pub co2_ppm: u16,
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub light_raw: u16,
    pub soil_raw: u16,
    pub water_ok: bool,
    pub light_on: bool,
    pub heater_on: bool,
    pub heater_lockout: bool,
    pub water_on: bool,
    pub circulation_on: bool,
    pub water_remaining_sec: u32,
    pub circulation_remaining_sec: u32,
    pub sensor_stale: bool,
    /// False until the climate sensor has reported at least once.
    pub has_climate: bool,
}

fn bit(b: bool) -> u8 {
    u8::from(b)
}

impl StatusRecord {
    /// One CSV line, fixed field order, no trailing newline.
    pub fn csv(&self) -> String {
        format!(
            "{},{:.2},{:.2},{},{},{},{},{},{},{},{},{},{},{}",
            self.co2_ppm,
            self.temperature_c,
            self.humidity_pct,
            self.light_raw,
            self.soil_raw,
            bit(self.water_ok),
            bit(self.light_on),
            bit(self.heater_on),
            bit(self.heater_lockout),
            bit(self.water_on),
            bit(self.circulation_on),
            self.water_remaining_sec,
            self.circulation_remaining_sec,
            bit(self.sensor_stale),
        )
    }

    pub fn write_human(&self, out: &mut impl Write) -> io::Result<()> {
        if self.has_climate {
            writeln!(
                out,
                "co2={}ppm temp={:.2}C rh={:.2}%",
                self.co2_ppm, self.temperature_c, self.humidity_pct
            )?;
        } else {
            writeln!(out, "climate: no reading yet")?;
        }
        writeln!(
            out,
            "light_raw={} soil_raw={} tank={}",
            self.light_raw,
            self.soil_raw,
            if self.water_ok { "ok" } else { "low" }
        )?;
        writeln!(
            out,
            "light={} heater={} water={} circulation={}",
            bit(self.light_on),
            bit(self.heater_on),
            bit(self.water_on),
            bit(self.circulation_on)
        )?;
        writeln!(
            out,
            "lockout={} stale={} water_rem={}s circ_rem={}s",
            bit(self.heater_lockout),
            bit(self.sensor_stale),
            self.water_remaining_sec,
            self.circulation_remaining_sec
        )
    }
}

// ===========================================================================
// Tests
// ===========================================================================
