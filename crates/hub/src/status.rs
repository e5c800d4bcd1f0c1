//! The node's machine-readable status record, typed.

use serde::Serialize;
use tracing::warn;

use crate::config::SoilCalibration;
use crate::error::StatusParseError;

/// Fields every record carries; the trailing stale flag is optional.
const MIN_FIELDS: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub co2_ppm: u32,
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
}

impl DeviceStatus {
    /// Parse one CSV record line.
    pub fn parse(line: &str) -> Result<Self, StatusParseError> {
        let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        if fields.len() < MIN_FIELDS {
            return Err(StatusParseError::FieldCount(fields.len()));
        }

        fn num<T: std::str::FromStr>(fields: &[&str], index: usize) -> Result<T, StatusParseError> {
            fields[index].parse().map_err(|_| StatusParseError::Field {
                index,
                value: fields[index].to_string(),
            })
        }
        fn flag(fields: &[&str], index: usize) -> Result<bool, StatusParseError> {
            match fields[index] {
                "0" => Ok(false),
                "1" => Ok(true),
                other => Err(StatusParseError::Field {
                    index,
                    value: other.to_string(),
                }),
            }
        }

        Ok(Self {
            co2_ppm: num(&fields, 0)?,
            temperature_c: num(&fields, 1)?,
            humidity_pct: num(&fields, 2)?,
            light_raw: num(&fields, 3)?,
            soil_raw: num(&fields, 4)?,
            water_ok: flag(&fields, 5)?,
            light_on: flag(&fields, 6)?,
            heater_on: flag(&fields, 7)?,
            heater_lockout: flag(&fields, 8)?,
            water_on: flag(&fields, 9)?,
            circulation_on: flag(&fields, 10)?,
            water_remaining_sec: num(&fields, 11)?,
            circulation_remaining_sec: num(&fields, 12)?,
            sensor_stale: if fields.len() > MIN_FIELDS {
                flag(&fields, 13)?
            } else {
                false
            },
        })
    }

    /// Pick the record out of an `r` reply (record line, then `OK`).
    pub fn from_reply(lines: &[String]) -> Result<Self, StatusParseError> {
        let record = lines
            .iter()
            .find(|l| !is_terminal(l) && !l.trim().is_empty())
            .ok_or(StatusParseError::MissingRecord)?;
        Self::parse(record)
    }
}

/// `OK`/`ERR` line that ends every reply.
pub fn is_terminal(line: &str) -> bool {
    line.starts_with("OK") || line.starts_with("ERR")
}

impl SoilCalibration {
    /// Moisture percentage from a raw probe reading, clamped to [0, 100].
    pub fn moisture_pct(&self, raw: u16) -> f64 {
        if raw < self.adc_min || raw > self.adc_max {
            warn!(
                raw,
                adc_min = self.adc_min,
                adc_max = self.adc_max,
                "soil reading outside calibrated range"
            );
        }
        let pct = (self.log_slope * f64::from(raw) + self.log_intercept).exp();
        if pct >= 100.0 {
            warn!(raw, pct, "soil reading saturates calibration, clamped to 100%");
        }
        if pct.is_finite() {
            pct.clamp(0.0, 100.0)
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calibration() -> SoilCalibration {
        SoilCalibration {
            log_slope: -0.00258653,
            log_intercept: 4.91733458,
            adc_min: 390,
            adc_max: 822,
        }
    }

    #[test]
    fn parses_fourteen_fields() {
        let s = DeviceStatus::parse("612,21.46,48.20,512,600,1,1,0,0,1,0,4,0,1").unwrap();
        assert_eq!(s.co2_ppm, 612);
        assert!((s.temperature_c - 21.46).abs() < 1e-4);
        assert_eq!(s.soil_raw, 600);
        assert!(s.water_ok && s.light_on && s.water_on);
        assert!(!s.heater_on && !s.heater_lockout && !s.circulation_on);
        assert_eq!(s.water_remaining_sec, 4);
        assert!(s.sensor_stale);
    }

    #[test]
    fn missing_stale_field_means_fresh() {
        let s = DeviceStatus::parse("612,21.46,48.20,512,600,1,1,0,0,1,0,4,0").unwrap();
        assert!(!s.sensor_stale);
    }

    #[test]
    fn short_record_rejected() {
        assert_eq!(
            DeviceStatus::parse("612,21.46,48.20"),
            Err(StatusParseError::FieldCount(3))
        );
    }

    #[test]
    fn bad_field_named() {
        assert_eq!(
            DeviceStatus::parse("612,hot,48.20,512,600,1,1,0,0,1,0,4,0,0"),
            Err(StatusParseError::Field {
                index: 1,
                value: "hot".into()
            })
        );
        assert!(matches!(
            DeviceStatus::parse("612,21.0,48.20,512,600,2,1,0,0,1,0,4,0,0"),
            Err(StatusParseError::Field { index: 5, .. })
        ));
    }

    #[test]
    fn reply_framing() {
        let reply = vec!["700,22.00,45.00,410,780,1,0,0,0,0,0,0,0,0".to_string(), "OK".to_string()];
        assert_eq!(DeviceStatus::from_reply(&reply).unwrap().soil_raw, 780);
        assert_eq!(
            DeviceStatus::from_reply(&["OK".to_string()]),
            Err(StatusParseError::MissingRecord)
        );
    }

    #[test]
    fn soil_curve() {
        let cal = calibration();
        let dry = cal.moisture_pct(822);
        let wet = cal.moisture_pct(390);
        assert!(dry < wet);
        assert!((cal.moisture_pct(900) - 13.3).abs() < 0.1);
        assert!((wet - 49.9).abs() < 0.2);
    }

    #[test]
    fn soil_clamps() {
        let cal = calibration();
        // exp(intercept) alone is ~137%
        assert_eq!(cal.moisture_pct(0), 100.0);
        let steep = SoilCalibration {
            log_slope: -0.01,
            log_intercept: 6.0,
            ..calibration()
        };
        assert_eq!(steep.moisture_pct(10), 100.0);
        assert!(steep.moisture_pct(1023) >= 0.0);
    }
}
