//! TOML config file loading and validation.
//!
//! Every section has defaults except `[soil]`, whose calibration is specific
//! to the probe in the pot. Connection endpoints can be overridden from the
//! environment after the file is read.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use time::{OffsetDateTime, UtcOffset};

use crate::decision::ActionKind;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub advisor: AdvisorConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    pub soil: SoilCalibration,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

fn default_device_id() -> String {
    "plant-01".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// `host:port` of the node's link listener.
    pub addr: String,
    pub timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:7070".into(),
            timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdvisorConfig {
    /// Program and arguments. Unset means the hub always runs on fallback.
    pub command: Option<Vec<String>>,
    pub timeout_sec: u64,
    pub input_usd_per_mtok: f64,
    pub output_usd_per_mtok: f64,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_sec: 60,
            input_usd_per_mtok: 3.0,
            output_usd_per_mtok: 15.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub emergency_stop_file: PathBuf,
    pub pause_file: PathBuf,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            emergency_stop_file: PathBuf::from("/tmp/plant-agent-stop"),
            pause_file: PathBuf::from("/tmp/plant-agent-pause"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub check_interval_min: u64,
    pub startup_delay_sec: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            check_interval_min: 30,
            startup_delay_sec: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_actions_per_hour: u32,
    /// Offset of the local calendar that days, hours and the light schedule
    /// are counted in, as `+HH:MM` / `-HH:MM`.
    pub utc_offset: String,
    pub water: WaterLimits,
    pub circulation: CirculationLimits,
    pub heater: HeaterLimits,
    pub light: LightLimits,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_actions_per_hour: 10,
            utc_offset: "+00:00".into(),
            water: WaterLimits::default(),
            circulation: CirculationLimits::default(),
            heater: HeaterLimits::default(),
            light: LightLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WaterLimits {
    pub max_duration_sec: u32,
    pub min_interval_min: u32,
    pub daily_max_count: u32,
}

impl Default for WaterLimits {
    fn default() -> Self {
        Self {
            max_duration_sec: 30,
            min_interval_min: 60,
            daily_max_count: 6,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CirculationLimits {
    pub max_duration_sec: u32,
    pub min_interval_min: u32,
    pub daily_max_count: Option<u32>,
}

impl Default for CirculationLimits {
    fn default() -> Self {
        Self {
            max_duration_sec: 3600,
            min_interval_min: 0,
            daily_max_count: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeaterLimits {
    /// `heater_on` is refused at or above this temperature.
    pub max_temp_c: f32,
    pub min_interval_min: u32,
    pub daily_max_count: Option<u32>,
}

impl Default for HeaterLimits {
    fn default() -> Self {
        Self {
            max_temp_c: 30.0,
            min_interval_min: 0,
            daily_max_count: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LightLimits {
    /// Local `HH:MM`; `light_on` is only allowed inside [on, off).
    pub schedule_on: String,
    /// Local `HH:MM`, `24:00` allowed. Earlier than `schedule_on` wraps
    /// past midnight.
    pub schedule_off: String,
    pub min_interval_min: u32,
    pub daily_max_count: Option<u32>,
}

impl Default for LightLimits {
    fn default() -> Self {
        Self {
            schedule_on: "06:00".into(),
            schedule_off: "24:00".into(),
            min_interval_min: 0,
            daily_max_count: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub daily_cap_usd: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self { daily_cap_usd: 1.0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub soil_floor_pct: f64,
    pub water_pulse_sec: u32,
    pub temp_floor_c: f32,
    pub temp_ceiling_c: f32,
    pub circulation_sec: u32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            soil_floor_pct: 25.0,
            water_pulse_sec: 5,
            temp_floor_c: 15.0,
            temp_ceiling_c: 32.0,
            circulation_sec: 600,
        }
    }
}

/// Exponential soil probe fit: `pct = exp(log_slope * raw + log_intercept)`.
#[derive(Debug, Clone, Deserialize)]
pub struct SoilCalibration {
    pub log_slope: f64,
    pub log_intercept: f64,
    /// Raw range the fit was measured over.
    pub adc_min: u16,
    pub adc_max: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub client_id: Option<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:plantops.db?mode=rwc".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Derived views
// ---------------------------------------------------------------------------

/// Limits that apply to one hardware action.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionPolicy {
    pub max_duration_sec: Option<u32>,
    pub min_interval_min: u32,
    pub daily_max_count: Option<u32>,
}

impl Limits {
    pub fn policy(&self, kind: ActionKind) -> ActionPolicy {
        let none = ActionPolicy {
            max_duration_sec: None,
            min_interval_min: 0,
            daily_max_count: None,
        };
        match kind {
            ActionKind::Water => ActionPolicy {
                max_duration_sec: Some(self.water.max_duration_sec),
                min_interval_min: self.water.min_interval_min,
                daily_max_count: Some(self.water.daily_max_count),
            },
            ActionKind::Circulation => ActionPolicy {
                max_duration_sec: Some(self.circulation.max_duration_sec),
                min_interval_min: self.circulation.min_interval_min,
                daily_max_count: self.circulation.daily_max_count,
            },
            ActionKind::HeaterOn => ActionPolicy {
                min_interval_min: self.heater.min_interval_min,
                daily_max_count: self.heater.daily_max_count,
                ..none
            },
            ActionKind::LightOn => ActionPolicy {
                min_interval_min: self.light.min_interval_min,
                daily_max_count: self.light.daily_max_count,
                ..none
            },
            _ => none,
        }
    }

    /// Falls back to UTC only for a string `validate` would have refused.
    pub fn offset(&self) -> UtcOffset {
        parse_utc_offset(&self.utc_offset).unwrap_or(UtcOffset::UTC)
    }

    pub fn local(&self, now: OffsetDateTime) -> OffsetDateTime {
        now.to_offset(self.offset())
    }

    /// Whether `now` falls inside the light schedule window.
    pub fn light_allowed(&self, now: OffsetDateTime) -> bool {
        let (Some(on), Some(off)) = (
            parse_hhmm(&self.light.schedule_on),
            parse_hhmm(&self.light.schedule_off),
        ) else {
            return false;
        };
        let local = self.local(now);
        let minute = u16::from(local.hour()) * 60 + u16::from(local.minute());
        if on <= off {
            (on..off).contains(&minute)
        } else {
            minute >= on || minute < off
        }
    }
}

/// `+HH:MM` / `-HH:MM` (or `Z`) to an offset within [-12:00, +14:00].
pub fn parse_utc_offset(s: &str) -> Option<UtcOffset> {
    let s = s.trim();
    if s == "Z" {
        return Some(UtcOffset::UTC);
    }
    let (negative, rest) = match s.as_bytes().first()? {
        b'+' => (false, &s[1..]),
        b'-' => (true, &s[1..]),
        _ => return None,
    };
    let (h, m) = rest.split_once(':')?;
    let digits = |t: &str| t.len() == 2 && t.bytes().all(|b| b.is_ascii_digit());
    if !digits(h) || !digits(m) {
        return None;
    }
    let h: i8 = h.parse().ok()?;
    let m: i8 = m.parse().ok()?;
    let limit = if negative { (12, 0) } else { (14, 0) };
    if m > 59 || (h, m) > limit {
        return None;
    }
    let sign = if negative { -1 } else { 1 };
    UtcOffset::from_hms(sign * h, sign * m, 0).ok()
}

/// `HH:MM` to minutes past midnight. `24:00` is accepted as end of day.
pub fn parse_hhmm(s: &str) -> Option<u16> {
    let (h, m) = s.trim().split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    let h: u16 = h.parse().ok()?;
    let m: u16 = m.parse().ok()?;
    match (h, m) {
        (24, 0) => Some(24 * 60),
        (0..=23, 0..=59) => Some(h * 60 + m),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_endpoints(&mut errors);
        self.validate_limits(&mut errors);
        self.validate_fallback(&mut errors);
        self.validate_soil(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_endpoints(&self, errors: &mut Vec<String>) {
        if self.device_id.trim().is_empty() {
            errors.push("device_id is empty".into());
        } else if self.device_id.contains(['/', '+', '#']) {
            errors.push(format!(
                "device_id '{}' must not contain MQTT topic characters",
                self.device_id
            ));
        }

        if self.link.addr.trim().is_empty() {
            errors.push("link.addr is empty".into());
        }
        if self.link.timeout_ms == 0 {
            errors.push("link.timeout_ms must be positive".into());
        }

        if let Some(cmd) = &self.advisor.command {
            if cmd.first().map_or(true, |p| p.trim().is_empty()) {
                errors.push("advisor.command must name a program".into());
            }
        }
        if self.advisor.timeout_sec == 0 {
            errors.push("advisor.timeout_sec must be positive".into());
        }
        if self.advisor.input_usd_per_mtok < 0.0 || self.advisor.output_usd_per_mtok < 0.0 {
            errors.push("advisor token prices must not be negative".into());
        }

        if self.schedule.check_interval_min == 0 {
            errors.push("schedule.check_interval_min must be positive".into());
        }

        if let Some(mqtt) = &self.mqtt {
            if mqtt.host.trim().is_empty() {
                errors.push("mqtt.host is empty".into());
            }
        }
        if self.web.port == 0 {
            errors.push("web.port must be non-zero".into());
        }
        if self.database.url.trim().is_empty() {
            errors.push("database.url is empty".into());
        }
    }

    fn validate_limits(&self, errors: &mut Vec<String>) {
        let l = &self.limits;

        if l.max_actions_per_hour == 0 {
            errors.push("limits.max_actions_per_hour must be positive".into());
        }
        if parse_utc_offset(&l.utc_offset).is_none() {
            errors.push(format!(
                "limits.utc_offset {:?} must be +HH:MM or -HH:MM within [-12:00, +14:00]",
                l.utc_offset
            ));
        }

        // ── Duration caps ───────────────────────────────────
        if l.water.max_duration_sec == 0 {
            errors.push("limits.water.max_duration_sec must be positive".into());
        }
        if l.water.daily_max_count == 0 {
            errors.push("limits.water.daily_max_count must be positive".into());
        }
        if l.circulation.max_duration_sec == 0 {
            errors.push("limits.circulation.max_duration_sec must be positive".into());
        }
        if l.circulation.daily_max_count == Some(0) {
            errors.push("limits.circulation.daily_max_count must be positive when set".into());
        }

        // ── Heater ──────────────────────────────────────────
        if !(0.0..=50.0).contains(&l.heater.max_temp_c) {
            errors.push(format!(
                "limits.heater.max_temp_c {} out of range [0, 50]",
                l.heater.max_temp_c
            ));
        }

        // ── Light schedule ──────────────────────────────────
        let on = parse_hhmm(&l.light.schedule_on);
        let off = parse_hhmm(&l.light.schedule_off);
        if on.is_none() {
            errors.push(format!(
                "limits.light.schedule_on '{}' is not HH:MM",
                l.light.schedule_on
            ));
        }
        if off.is_none() {
            errors.push(format!(
                "limits.light.schedule_off '{}' is not HH:MM",
                l.light.schedule_off
            ));
        }
        if let (Some(on), Some(off)) = (on, off) {
            if on == off {
                errors.push("limits.light schedule window is empty".into());
            }
        }

        if self.cost.daily_cap_usd < 0.0 || !self.cost.daily_cap_usd.is_finite() {
            errors.push(format!(
                "cost.daily_cap_usd {} must be a non-negative number",
                self.cost.daily_cap_usd
            ));
        }
    }

    fn validate_fallback(&self, errors: &mut Vec<String>) {
        let f = &self.fallback;

        if !(0.0..=100.0).contains(&f.soil_floor_pct) {
            errors.push(format!(
                "fallback.soil_floor_pct {} out of range [0, 100]",
                f.soil_floor_pct
            ));
        }
        if f.water_pulse_sec == 0 {
            errors.push("fallback.water_pulse_sec must be positive".into());
        } else if f.water_pulse_sec > self.limits.water.max_duration_sec {
            errors.push(format!(
                "fallback.water_pulse_sec ({}) exceeds limits.water.max_duration_sec ({})",
                f.water_pulse_sec, self.limits.water.max_duration_sec
            ));
        }
        if f.circulation_sec == 0 {
            errors.push("fallback.circulation_sec must be positive".into());
        }
        if f.temp_floor_c >= f.temp_ceiling_c {
            errors.push(format!(
                "fallback.temp_floor_c ({}) must be below temp_ceiling_c ({})",
                f.temp_floor_c, f.temp_ceiling_c
            ));
        }
    }

    fn validate_soil(&self, errors: &mut Vec<String>) {
        let s = &self.soil;

        if !s.log_slope.is_finite() || s.log_slope == 0.0 {
            errors.push(format!("soil.log_slope {} must be finite and non-zero", s.log_slope));
        }
        if !s.log_intercept.is_finite() {
            errors.push(format!("soil.log_intercept {} must be finite", s.log_intercept));
        }
        if s.adc_min >= s.adc_max {
            errors.push(format!(
                "soil.adc_min ({}) must be below adc_max ({})",
                s.adc_min, s.adc_max
            ));
        }
        if s.adc_max > 1023 {
            errors.push(format!("soil.adc_max {} exceeds the 10-bit link scale", s.adc_max));
        }
    }

    /// Environment overrides for connection endpoints.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("LINK_ADDR") {
            self.link.addr = addr;
        }
        if let Some(url) = lookup("DB_URL") {
            self.database.url = url;
        }
        if let Some(port) = lookup("WEB_PORT").and_then(|s| s.parse().ok()) {
            self.web.port = port;
        }
        if let Some(host) = lookup("MQTT_HOST") {
            let port = self.mqtt.as_ref().map_or(default_mqtt_port(), |m| m.port);
            let client_id = self.mqtt.as_ref().and_then(|m| m.client_id.clone());
            self.mqtt = Some(MqttConfig {
                host,
                port,
                client_id,
            });
        }
        if let (Some(mqtt), Some(port)) = (
            self.mqtt.as_mut(),
            lookup("MQTT_PORT").and_then(|s| s.parse().ok()),
        ) {
            mqtt.port = port;
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, apply environment overrides, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config.apply_env_overrides(|k| std::env::var(k).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use time::macros::datetime;

    // -- Helper: build a valid baseline config that passes validation ------

    pub(crate) fn valid_config() -> Config {
        toml::from_str(
            r#"
[soil]
log_slope = -0.00258653
log_intercept = 4.91733458
adc_min = 390
adc_max = 822
"#,
        )
        .unwrap()
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg = valid_config();
        assert_eq!(cfg.device_id, "plant-01");
        assert_eq!(cfg.limits.water.max_duration_sec, 30);
        assert_eq!(cfg.limits.water.min_interval_min, 60);
        assert_eq!(cfg.limits.water.daily_max_count, 6);
        assert_eq!(cfg.limits.circulation.max_duration_sec, 3600);
        assert_eq!(cfg.limits.max_actions_per_hour, 10);
        assert_eq!(cfg.limits.heater.max_temp_c, 30.0);
        assert_eq!(cfg.control.emergency_stop_file, PathBuf::from("/tmp/plant-agent-stop"));
        assert!(cfg.mqtt.is_none());
        assert!(cfg.advisor.command.is_none());
    }

    #[test]
    fn soil_section_is_required() {
        assert!(toml::from_str::<Config>("device_id = \"x\"").is_err());
    }

    #[test]
    fn example_file_parses_and_validates() {
        let cfg: Config = toml::from_str(include_str!("../config.example.toml")).unwrap();
        cfg.validate().unwrap();
        assert!(cfg.mqtt.is_some());
        assert!(cfg.advisor.command.is_some());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let cfg: Config = toml::from_str(
            r#"
[limits.water]
max_duration_sec = 20

[soil]
log_slope = -0.0025
log_intercept = 4.9
adc_min = 390
adc_max = 822
"#,
        )
        .unwrap();
        assert_eq!(cfg.limits.water.max_duration_sec, 20);
        assert_eq!(cfg.limits.water.daily_max_count, 6);
    }

    // -- Validation: valid configs pass -----------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    // -- Validation: violations -------------------------------------------

    #[test]
    fn empty_device_id_rejected() {
        let mut cfg = valid_config();
        cfg.device_id = " ".into();
        assert_validation_err(&cfg, "device_id is empty");
    }

    #[test]
    fn topic_characters_in_device_id_rejected() {
        let mut cfg = valid_config();
        cfg.device_id = "plant/+".into();
        assert_validation_err(&cfg, "MQTT topic characters");
    }

    #[test]
    fn zero_link_timeout_rejected() {
        let mut cfg = valid_config();
        cfg.link.timeout_ms = 0;
        assert_validation_err(&cfg, "link.timeout_ms");
    }

    #[test]
    fn empty_advisor_command_rejected() {
        let mut cfg = valid_config();
        cfg.advisor.command = Some(vec![]);
        assert_validation_err(&cfg, "advisor.command");
    }

    #[test]
    fn bad_light_schedule_rejected() {
        let mut cfg = valid_config();
        cfg.limits.light.schedule_on = "6am".into();
        assert_validation_err(&cfg, "schedule_on '6am' is not HH:MM");
    }

    #[test]
    fn empty_light_window_rejected() {
        let mut cfg = valid_config();
        cfg.limits.light.schedule_on = "08:00".into();
        cfg.limits.light.schedule_off = "08:00".into();
        assert_validation_err(&cfg, "window is empty");
    }

    #[test]
    fn fallback_pulse_above_cap_rejected() {
        let mut cfg = valid_config();
        cfg.fallback.water_pulse_sec = 45;
        assert_validation_err(&cfg, "exceeds limits.water.max_duration_sec (30)");
    }

    #[test]
    fn inverted_fallback_band_rejected() {
        let mut cfg = valid_config();
        cfg.fallback.temp_floor_c = 32.0;
        assert_validation_err(&cfg, "temp_floor_c (32) must be below temp_ceiling_c (32)");
    }

    #[test]
    fn soil_range_rejected() {
        let mut cfg = valid_config();
        cfg.soil.adc_min = 900;
        assert_validation_err(&cfg, "soil.adc_min (900) must be below adc_max (822)");
    }

    #[test]
    fn utc_offset_range() {
        let mut cfg = valid_config();
        cfg.limits.utc_offset = "+15:00".into();
        assert_validation_err(&cfg, "limits.utc_offset \"+15:00\"");
        cfg.limits.utc_offset = "5".into();
        assert_validation_err(&cfg, "limits.utc_offset \"5\"");
    }

    #[test]
    fn utc_offset_parsing() {
        assert_eq!(parse_utc_offset("+05:30"), UtcOffset::from_hms(5, 30, 0).ok());
        assert_eq!(parse_utc_offset("-03:30"), UtcOffset::from_hms(-3, -30, 0).ok());
        assert_eq!(parse_utc_offset("+14:00"), UtcOffset::from_hms(14, 0, 0).ok());
        assert_eq!(parse_utc_offset("-12:00"), UtcOffset::from_hms(-12, 0, 0).ok());
        assert_eq!(parse_utc_offset("Z"), Some(UtcOffset::UTC));
        for bad in ["", "05:30", "+5:30", "++5:30", "+05:60", "+14:30", "-12:30", "+05", "UTC"] {
            assert_eq!(parse_utc_offset(bad), None, "{bad:?}");
        }
    }

    #[test]
    fn half_hour_offset_moves_the_local_day() {
        let limits: Limits = toml::from_str(r#"utc_offset = "+05:30""#).unwrap();
        let local = limits.local(datetime!(2024-06-01 18:45 UTC));
        assert_eq!(local.date(), time::macros::date!(2024-06-02));
        assert_eq!((local.hour(), local.minute()), (0, 15));
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.link.addr = "".into();
        cfg.limits.water.max_duration_sec = 0;
        cfg.cost.daily_cap_usd = -1.0;

        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("(4 errors)"), "got: {msg}");
        assert!(msg.contains("link.addr is empty"));
        assert!(msg.contains("limits.water.max_duration_sec"));
        assert!(msg.contains("cost.daily_cap_usd"));
        // a zero cap also makes the fallback pulse exceed it
        assert!(msg.contains("fallback.water_pulse_sec"));
    }

    // -- Env overrides ----------------------------------------------------

    #[test]
    fn env_overrides_endpoints() {
        let mut cfg = valid_config();
        cfg.apply_env_overrides(|k| match k {
            "LINK_ADDR" => Some("10.0.0.5:7070".into()),
            "MQTT_HOST" => Some("broker.local".into()),
            "MQTT_PORT" => Some("1884".into()),
            "WEB_PORT" => Some("nope".into()),
            _ => None,
        });
        assert_eq!(cfg.link.addr, "10.0.0.5:7070");
        let mqtt = cfg.mqtt.unwrap();
        assert_eq!((mqtt.host.as_str(), mqtt.port), ("broker.local", 1884));
        assert_eq!(cfg.web.port, 8080, "unparseable override ignored");
    }

    // -- Time helpers -----------------------------------------------------

    #[test]
    fn hhmm_parsing() {
        assert_eq!(parse_hhmm("06:00"), Some(360));
        assert_eq!(parse_hhmm("6:30"), Some(390));
        assert_eq!(parse_hhmm("24:00"), Some(1440));
        assert_eq!(parse_hhmm("24:01"), None);
        assert_eq!(parse_hhmm("12:60"), None);
        assert_eq!(parse_hhmm("1200"), None);
    }

    #[test]
    fn light_window() {
        let mut limits = Limits::default();
        assert!(!limits.light_allowed(datetime!(2024-06-01 05:59 UTC)));
        assert!(limits.light_allowed(datetime!(2024-06-01 06:00 UTC)));
        assert!(limits.light_allowed(datetime!(2024-06-01 23:59 UTC)));

        // Wrapping window, evaluated in local time.
        limits.light.schedule_on = "20:00".into();
        limits.light.schedule_off = "04:00".into();
        limits.utc_offset = "+02:00".into();
        assert!(limits.light_allowed(datetime!(2024-06-01 19:00 UTC)), "21:00 local");
        assert!(!limits.light_allowed(datetime!(2024-06-01 03:00 UTC)), "05:00 local");
    }

    #[test]
    fn policies() {
        let limits = Limits::default();
        let water = limits.policy(ActionKind::Water);
        assert_eq!(water.max_duration_sec, Some(30));
        assert_eq!(water.min_interval_min, 60);
        assert_eq!(water.daily_max_count, Some(6));
        let off = limits.policy(ActionKind::HeaterOff);
        assert_eq!(off.max_duration_sec, None);
        assert_eq!(off.daily_max_count, None);
    }
}
