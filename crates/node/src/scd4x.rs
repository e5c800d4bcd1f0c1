//! Sensirion SCD4x (CO2 / temperature / humidity) driver over any
//! `embedded-hal` 1.0 I2C bus.
//!
//! Commands are 16-bit big-endian words. Every 16-bit word the sensor returns
//! is followed by a CRC-8 byte (poly 0x31, init 0xFF).

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::{Error as _, ErrorKind, I2c, NoAcknowledgeSource};

use crate::sensors::{BusError, ClimateSample, ClimateSensor};

pub const DEFAULT_ADDRESS: u8 = 0x62;

const CMD_START_PERIODIC: u16 = 0x21b1;
const CMD_READ_MEASUREMENT: u16 = 0xec05;
const CMD_STOP_PERIODIC: u16 = 0x3f86;
const CMD_DATA_READY: u16 = 0xe4b8;
const CMD_REINIT: u16 = 0x3646;

/// Gap between sending a read command and fetching its reply.
const EXEC_WAIT_MS: u32 = 1;

const CRC_POLY: u8 = 0x31;
const CRC_INIT: u8 = 0xff;

pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = CRC_INIT;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ CRC_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

pub fn temperature_from_raw(raw: u16) -> f32 {
    -45.0 + 175.0 * f32::from(raw) / 65535.0
}

pub fn humidity_from_raw(raw: u16) -> f32 {
    100.0 * f32::from(raw) / 65535.0
}

/// An I2C bus that can also be torn down and reopened, the first step of
/// sensor recovery.
pub trait I2cBus: I2c {
    fn reopen(&mut self) -> Result<(), BusError>;
}

const ENXIO: i32 = 6;
const EREMOTEIO: i32 = 121;

/// Classify an errno from Linux i2c-dev. A missing acknowledge shows up as
/// `ENXIO` or `EREMOTEIO`; anything else is a bus fault.
pub fn kind_from_errno(errno: Option<i32>) -> ErrorKind {
    match errno {
        Some(ENXIO | EREMOTEIO) => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Unknown),
        Some(_) => ErrorKind::Bus,
        None => ErrorKind::Other,
    }
}

fn bus_error<E: embedded_hal::i2c::Error>(e: E) -> BusError {
    match e.kind() {
        ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address)
        | ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data)
        | ErrorKind::NoAcknowledge(NoAcknowledgeSource::Unknown) => BusError::Nack,
        _ => BusError::Io,
    }
}

pub struct Scd4x<B, D> {
    bus: B,
    delay: D,
    address: u8,
}

impl<B: I2cBus, D: DelayNs> Scd4x<B, D> {
    pub fn new(bus: B, delay: D) -> Self {
        Self::with_address(bus, delay, DEFAULT_ADDRESS)
    }

    pub fn with_address(bus: B, delay: D, address: u8) -> Self {
        Self { bus, delay, address }
    }

    fn command(&mut self, cmd: u16) -> Result<(), BusError> {
        self.bus.write(self.address, &cmd.to_be_bytes()).map_err(bus_error)
    }

    /// Send `cmd` and read back `N` checked words.
    fn read_words<const N: usize>(&mut self, cmd: u16) -> Result<[u16; N], BusError> {
        self.command(cmd)?;
        self.delay.delay_ms(EXEC_WAIT_MS);

        let mut raw = [0u8; 9];
        let buf = raw.get_mut(..N * 3).ok_or(BusError::Io)?;
        self.bus.read(self.address, buf).map_err(bus_error)?;

        let mut words = [0u16; N];
        for (word, chunk) in words.iter_mut().zip(buf.chunks_exact(3)) {
            if crc8(&chunk[..2]) != chunk[2] {
                return Err(BusError::Crc);
            }
            *word = u16::from_be_bytes([chunk[0], chunk[1]]);
        }
        Ok(words)
    }

    pub fn release(self) -> B {
        self.bus
    }
}

impl<B: I2cBus, D: DelayNs> ClimateSensor for Scd4x<B, D> {
    fn data_ready(&mut self) -> Result<bool, BusError> {
        let [status] = self.read_words::<1>(CMD_DATA_READY)?;
        // Lowest 11 bits all zero means no new sample.
        Ok(status & 0x07ff != 0)
    }

    fn read_measurement(&mut self) -> Result<ClimateSample, BusError> {
        let [co2, t, rh] = self.read_words::<3>(CMD_READ_MEASUREMENT)?;
        Ok(ClimateSample {
            co2_ppm: co2,
            temperature_c: temperature_from_raw(t),
            humidity_pct: humidity_from_raw(rh),
        })
    }

    fn restart_bus(&mut self) -> Result<(), BusError> {
        self.bus.reopen()
    }

    fn stop_periodic(&mut self) -> Result<(), BusError> {
        self.command(CMD_STOP_PERIODIC)
    }

    fn reinit(&mut self) -> Result<(), BusError> {
        self.command(CMD_REINIT)
    }

    fn start_periodic(&mut self) -> Result<(), BusError> {
        self.command(CMD_START_PERIODIC)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
