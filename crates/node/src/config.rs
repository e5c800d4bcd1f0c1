//! Node configuration from environment variables, validated at start-up.

use std::collections::HashSet;
use std::str::FromStr;

use anyhow::{bail, Result};

use crate::controller::ControllerConfig;
use crate::tick;

/// BCM GPIO pins on the 40-pin header available for general use. GPIO 0-1
/// belong to the ID EEPROM.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub link_port: u16,
    pub loop_ms: u64,
    pub controller: ControllerConfig,
    /// BCM pins in light, heater, water, circulation order.
    pub relay_pins: [u8; 4],
    pub relay_active_low: bool,
    pub water_level_pin: u8,
    pub water_level_active_high: bool,
    pub adc_address: u16,
    pub light_channel: usize,
    pub soil_channel: usize,
    pub sim_scenario: String,
    pub tick_offset_ms: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            link_port: 7070,
            loop_ms: 20,
            controller: ControllerConfig::default(),
            relay_pins: [17, 27, 22, 23],
            relay_active_low: true,
            water_level_pin: 24,
            water_level_active_high: true,
            adc_address: 0x48,
            light_channel: 0,
            soil_channel: 1,
            sim_scenario: "nominal".to_string(),
            tick_offset_ms: 0,
        }
    }
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values are collected and
    /// reported together with the range checks.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        let mut errors: Vec<String> = Vec::new();

        {
            let mut set = |key: &str, slot: &mut dyn FnMut(&str) -> bool| {
                if let Some(raw) = lookup(key) {
                    let raw = raw.trim().to_string();
                    if !raw.is_empty() && !slot(&raw) {
                        errors.push(format!("{key}: cannot parse {raw:?}"));
                    }
                }
            };

            set("LINK_PORT", &mut |s| parse_into(s, &mut cfg.link_port));
            set("LOOP_MS", &mut |s| parse_into(s, &mut cfg.loop_ms));
            set("HEATER_TRIP_C", &mut |s| parse_into(s, &mut cfg.controller.heater_trip_c));
            set("HEATER_RESET_C", &mut |s| parse_into(s, &mut cfg.controller.heater_reset_c));
            set("STALE_MS", &mut |s| parse_into(s, &mut cfg.controller.stale_ms));
            set("RECOVERY_BACKOFF_MS", &mut |s| {
                parse_into(s, &mut cfg.controller.recovery_backoff_ms)
            });
            set("SETTLE_MS", &mut |s| parse_into(s, &mut cfg.controller.settle_ms));
            set("MAX_TIMED_SEC", &mut |s| parse_into(s, &mut cfg.controller.max_timed_sec));
            set("RELAY_PINS", &mut |s| match parse_pins(s) {
                Some(pins) => {
                    cfg.relay_pins = pins;
                    true
                }
                None => false,
            });
            set("RELAY_ACTIVE_LOW", &mut |s| parse_bool(s, &mut cfg.relay_active_low));
            set("WATER_LEVEL_PIN", &mut |s| parse_into(s, &mut cfg.water_level_pin));
            set("WATER_LEVEL_ACTIVE_HIGH", &mut |s| {
                parse_bool(s, &mut cfg.water_level_active_high)
            });
            set("ADC_ADDRESS", &mut |s| {
                match u16::from_str_radix(s.trim_start_matches("0x"), 16) {
                    Ok(v) => {
                        cfg.adc_address = v;
                        true
                    }
                    Err(_) => false,
                }
            });
            set("ADC_LIGHT_CHANNEL", &mut |s| parse_into(s, &mut cfg.light_channel));
            set("ADC_SOIL_CHANNEL", &mut |s| parse_into(s, &mut cfg.soil_channel));
            set("SIM_SCENARIO", &mut |s| {
                cfg.sim_scenario = s.to_string();
                true
            });
            set("TICK_OFFSET_MS", &mut |s| parse_into(s, &mut cfg.tick_offset_ms));
        }

        cfg.check(&mut errors);
        if errors.is_empty() {
            Ok(cfg)
        } else {
            bail!(
                "node config invalid ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn check(&self, errors: &mut Vec<String>) {
        let c = &self.controller;

        if c.heater_reset_c >= c.heater_trip_c {
            errors.push(format!(
                "HEATER_RESET_C ({}) must be below HEATER_TRIP_C ({})",
                c.heater_reset_c, c.heater_trip_c
            ));
        }
        if self.loop_ms == 0 {
            errors.push("LOOP_MS must be positive".to_string());
        }
        if c.stale_ms == 0 {
            errors.push("STALE_MS must be positive".to_string());
        }
        if c.recovery_backoff_ms == 0 {
            errors.push("RECOVERY_BACKOFF_MS must be positive".to_string());
        }
        if c.stale_ms >= tick::MAX_SPAN_MS || c.recovery_backoff_ms >= tick::MAX_SPAN_MS {
            errors.push("STALE_MS and RECOVERY_BACKOFF_MS must stay below 2^31 ms".to_string());
        }
        if c.max_timed_sec == 0 {
            errors.push("MAX_TIMED_SEC must be positive".to_string());
        } else if u64::from(c.max_timed_sec) * 1000 >= u64::from(tick::MAX_SPAN_MS) {
            errors.push(format!(
                "MAX_TIMED_SEC {} does not fit the wrapping tick window",
                c.max_timed_sec
            ));
        }
        if c.settle_ms > 10_000 {
            errors.push(format!("SETTLE_MS {} is longer than 10 s", c.settle_ms));
        }

        let mut seen: HashSet<u8> = HashSet::new();
        for pin in self.relay_pins.iter().chain(std::iter::once(&self.water_level_pin)) {
            if !VALID_GPIO_PINS.contains(pin) {
                errors.push(format!("gpio {pin} is not a usable BCM pin (allowed: 2-27)"));
            } else if !seen.insert(*pin) {
                errors.push(format!("gpio {pin} assigned twice"));
            }
        }

        for (name, ch) in [
            ("ADC_LIGHT_CHANNEL", self.light_channel),
            ("ADC_SOIL_CHANNEL", self.soil_channel),
        ] {
            if ch > 3 {
                errors.push(format!("{name} {ch} out of range (0-3)"));
            }
        }
        if self.light_channel == self.soil_channel {
            errors.push("ADC_LIGHT_CHANNEL and ADC_SOIL_CHANNEL must differ".to_string());
        }
    }
}

fn parse_into<T: FromStr>(raw: &str, slot: &mut T) -> bool {
    match raw.parse() {
        Ok(v) => {
            *slot = v;
            true
        }
        Err(_) => false,
    }
}

fn parse_bool(raw: &str, slot: &mut bool) -> bool {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => *slot = true,
        "0" | "false" | "no" | "off" => *slot = false,
        _ => return false,
    }
    true
}

fn parse_pins(raw: &str) -> Option<[u8; 4]> {
    let pins: Vec<u8> = raw
        .split(',')
        .map(|t| t.trim().parse().ok())
        .collect::<Option<_>>()?;
    pins.try_into().ok()
}

// ===========================================================================
// Tests
// ===========================================================================
