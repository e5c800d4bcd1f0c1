//! ADS1115 16-bit ADC driver for the light and soil channels.
//!
//! Reads single-ended channels at PGA ±4.096 V, 128 SPS, single-shot mode.
//! Results are scaled down to the 10-bit range the link record uses, so the
//! hub's soil calibration does not care which front end produced them.

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;

pub const DEFAULT_ADDRESS: u8 = 0x48;

// ── ADS1115 register addresses ──────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
const REG_CONFIG: u8 = 0x01;

// ── Config register bit fields ──────────────────────────────────────────────
//
// Layout (MSB first):
//   [15]    OS       — write 1 to start single-shot conversion
//   [14:12] MUX      — input multiplexer (channel selection)
//   [11:9]  PGA      — programmable gain amplifier
//   [8]     MODE     — 0 = continuous, 1 = single-shot
//   [7:5]   DR       — data rate
//   [1:0]   COMP_QUE — 11 = disable comparator (default)

/// OS=1, PGA=001 (±4.096 V), MODE=1, DR=100 (128 SPS), COMP_QUE=11.
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

pub const MAX_CHANNEL: usize = 3;

/// Conversion time at 128 SPS is ~7.8 ms.
const CONVERSION_WAIT_MS: u32 = 9;
const READY_RETRIES: usize = 3;

/// Bit 15 of the config register reads back 1 once the conversion is done.
const OS_READY_BIT: u16 = 1 << 15;

fn config_for_channel(channel: usize) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[channel] << MUX_SHIFT)
}

/// 15-bit single-ended result to the 10-bit link scale.
pub fn to_ten_bit(raw: i16) -> u16 {
    (raw.max(0) as u16) >> 5
}

pub struct Ads1115<I, D> {
    i2c: I,
    delay: D,
    address: u8,
}

impl<I: I2c, D: DelayNs> Ads1115<I, D> {
    pub fn new(i2c: I, delay: D, address: u8) -> Self {
        Self { i2c, delay, address }
    }

    /// Single-shot read on `channel`, raw signed result.
    pub fn read_channel(&mut self, channel: usize) -> Result<i16, I::Error> {
        let [hi, lo] = config_for_channel(channel.min(MAX_CHANNEL)).to_be_bytes();
        self.i2c.write(self.address, &[REG_CONFIG, hi, lo])?;

        self.delay.delay_ms(CONVERSION_WAIT_MS);

        // One wait is normally enough at 128 SPS; retry briefly if not.
        for _ in 0..READY_RETRIES {
            let mut buf = [0u8; 2];
            self.i2c.write_read(self.address, &[REG_CONFIG], &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            self.delay.delay_ms(2);
        }

        let mut buf = [0u8; 2];
        self.i2c.write_read(self.address, &[REG_CONVERSION], &mut buf)?;
        Ok(i16::from_be_bytes(buf))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::{ErrorKind, ErrorType, Operation};

    #[derive(Debug)]
    struct MockError;

    impl embedded_hal::i2c::Error for MockError {
        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
    }

    /// Serves a fixed conversion value and reports ready on first poll.
    #[derive(Default)]
    struct MockAds {
        conversion: i16,
        pointer: u8,
        config_writes: Vec<u16>,
    }

    impl ErrorType for MockAds {
        type Error = MockError;
    }

    impl I2c for MockAds {
        fn transaction(&mut self, _addr: u8, ops: &mut [Operation<'_>]) -> Result<(), MockError> {
            for op in ops {
                match op {
                    Operation::Write(bytes) => {
                        self.pointer = bytes[0];
                        if bytes.len() == 3 {
                            self.config_writes.push(u16::from_be_bytes([bytes[1], bytes[2]]));
                        }
                    }
                    Operation::Read(buf) => {
                        let value = if self.pointer == REG_CONFIG {
                            OS_READY_BIT
                        } else {
                            self.conversion as u16
                        };
                        buf.copy_from_slice(&value.to_be_bytes());
                    }
                }
            }
            Ok(())
        }
    }

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    // -- Config register construction -----------------------------------------

    #[test]
    fn config_register_channels() {
        assert_eq!(config_for_channel(0), 0xC383);
        assert_eq!(config_for_channel(1), 0xD383);
        assert_eq!(config_for_channel(2), 0xE383);
        assert_eq!(config_for_channel(3), 0xF383);
    }

    #[test]
    fn config_base_fields() {
        assert_eq!((CONFIG_BASE >> 9) & 0b111, 0b001, "PGA should be ±4.096 V");
        assert_eq!((CONFIG_BASE >> 8) & 1, 1, "MODE should be single-shot");
        assert_eq!((CONFIG_BASE >> 5) & 0b111, 0b100, "DR should be 128 SPS");
        assert_eq!((CONFIG_BASE >> 15) & 1, 1, "OS should start a conversion");
    }

    // -- Driver ---------------------------------------------------------------

    #[test]
    fn read_channel_returns_conversion() {
        let bus = MockAds {
            conversion: 20_000,
            ..MockAds::default()
        };
        let mut adc = Ads1115::new(bus, NoDelay, DEFAULT_ADDRESS);
        assert_eq!(adc.read_channel(1).unwrap(), 20_000);
        assert_eq!(adc.i2c.config_writes, [0xD383]);
    }

    // -- Scaling --------------------------------------------------------------

    #[test]
    fn ten_bit_scaling() {
        assert_eq!(to_ten_bit(0), 0);
        assert_eq!(to_ten_bit(32_767), 1023);
        assert_eq!(to_ten_bit(-12), 0, "negative noise clamps to zero");
        assert_eq!(to_ten_bit(16_384), 512);
    }
}
