//! Raspberry Pi bindings (rppal): the I2C bus both sensors share, and the
//! analog front end built from the ADS1115 plus the tank level switch.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use embedded_hal::i2c::{ErrorKind, ErrorType, I2c as HalI2c, Operation};
use rppal::gpio::{Gpio, InputPin};
use rppal::i2c::I2c;

use crate::adc::{self, Ads1115};
use crate::scd4x::{self, I2cBus};
use crate::sensors::{AnalogFrontEnd, AnalogSample, BusError};
use crate::tick::StdDelay;

// ---------------------------------------------------------------------------
// I2C bus
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PiI2cError(rppal::i2c::Error);

impl embedded_hal::i2c::Error for PiI2cError {
    fn kind(&self) -> ErrorKind {
        match &self.0 {
            rppal::i2c::Error::Io(e) => scd4x::kind_from_errno(e.raw_os_error()),
            _ => ErrorKind::Other,
        }
    }
}

/// rppal I2C handle exposed through `embedded-hal` 1.0.
pub struct PiI2c {
    bus: u8,
    inner: I2c,
}

impl PiI2c {
    pub fn open(bus: u8) -> Result<Self> {
        let inner = I2c::with_bus(bus).with_context(|| format!("open i2c bus {bus}"))?;
        Ok(Self { bus, inner })
    }
}

impl ErrorType for PiI2c {
    type Error = PiI2cError;
}

impl HalI2c for PiI2c {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        self.inner
            .set_slave_address(u16::from(address))
            .map_err(PiI2cError)?;
        for op in operations {
            match op {
                Operation::Write(bytes) => {
                    self.inner.write(bytes).map_err(PiI2cError)?;
                }
                Operation::Read(buf) => {
                    self.inner.read(buf).map_err(PiI2cError)?;
                }
            }
        }
        Ok(())
    }
}

impl I2cBus for PiI2c {
    fn reopen(&mut self) -> Result<(), BusError> {
        match I2c::with_bus(self.bus) {
            Ok(fresh) => {
                self.inner = fresh;
                Ok(())
            }
            Err(e) => {
                tracing::error!(bus = self.bus, "i2c reopen failed: {e}");
                Err(BusError::Io)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Analog front end
// ---------------------------------------------------------------------------

/// Each ADS1115 conversion blocks ~9 ms, so the channels are refreshed at a
/// slower cadence than the control loop. The tank switch is read every call.
const ANALOG_REFRESH: Duration = Duration::from_millis(250);

pub struct PiAnalog {
    adc: Ads1115<PiI2c, StdDelay>,
    light_channel: usize,
    soil_channel: usize,
    level: InputPin,
    level_active_high: bool,
    last: AnalogSample,
    refreshed: Option<Instant>,
}

impl PiAnalog {
    pub fn new(
        bus: u8,
        adc_address: u16,
        light_channel: usize,
        soil_channel: usize,
        level_pin: u8,
        level_active_high: bool,
    ) -> Result<Self> {
        let address = u8::try_from(adc_address).context("ADS1115 address does not fit 7 bits")?;
        let adc = Ads1115::new(PiI2c::open(bus)?, StdDelay, address);
        let level = Gpio::new()?
            .get(level_pin)
            .with_context(|| format!("claim gpio {level_pin} for tank switch"))?
            .into_input_pullup();

        tracing::info!(
            addr = format_args!("0x{adc_address:02x}"),
            light_channel,
            soil_channel,
            level_pin,
            "analog front end initialised"
        );

        Ok(Self {
            adc,
            light_channel,
            soil_channel,
            level,
            level_active_high,
            last: AnalogSample::default(),
            refreshed: None,
        })
    }

    fn read(&mut self, channel: usize, fallback: u16) -> u16 {
        match self.adc.read_channel(channel) {
            Ok(raw) => adc::to_ten_bit(raw),
            Err(e) => {
                tracing::warn!(channel, "adc read failed: {:?}", e.0);
                fallback
            }
        }
    }
}

impl AnalogFrontEnd for PiAnalog {
    fn sample(&mut self) -> AnalogSample {
        if self.refreshed.map_or(true, |at| at.elapsed() >= ANALOG_REFRESH) {
            self.last.light_raw = self.read(self.light_channel, self.last.light_raw);
            self.last.soil_raw = self.read(self.soil_channel, self.last.soil_raw);
            self.refreshed = Some(Instant::now());
        }
        self.last.water_ok = self.level.is_high() == self.level_active_high;
        self.last
    }
}
