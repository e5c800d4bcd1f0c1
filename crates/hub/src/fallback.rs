//! Conservative rules used when the advisor cannot be reached.

use tracing::info;

use crate::config::FallbackConfig;
use crate::decision::{ActionKind, Decision, ProposedAction, Urgency};
use crate::status::DeviceStatus;

/// Every rule that matches contributes its actions. The result always asks
/// for a human; `cause` says why the advisor was not used.
pub fn decide(status: &DeviceStatus, soil_pct: f64, cfg: &FallbackConfig, cause: &str) -> Decision {
    let mut actions = Vec::new();
    let mut rules = Vec::new();

    if soil_pct < cfg.soil_floor_pct {
        actions.push(ProposedAction::timed(
            ActionKind::Water,
            i64::from(cfg.water_pulse_sec),
            format!("offline fallback: soil {soil_pct:.0}% below {:.0}%", cfg.soil_floor_pct),
        ));
        rules.push("soil_dry");
    }

    // A stale temperature is not evidence of anything.
    if !status.sensor_stale {
        if status.temperature_c < cfg.temp_floor_c {
            actions.push(ProposedAction::new(
                ActionKind::HeaterOn,
                format!(
                    "offline fallback: {:.1}C below {:.1}C",
                    status.temperature_c, cfg.temp_floor_c
                ),
            ));
            rules.push("too_cold");
        } else if status.temperature_c > cfg.temp_ceiling_c {
            let why = format!(
                "offline fallback: {:.1}C above {:.1}C",
                status.temperature_c, cfg.temp_ceiling_c
            );
            actions.push(ProposedAction::new(ActionKind::HeaterOff, why.clone()));
            actions.push(ProposedAction::timed(
                ActionKind::Circulation,
                i64::from(cfg.circulation_sec),
                why,
            ));
            rules.push("too_hot");
        }
    }

    let reason = if rules.is_empty() {
        actions.push(ProposedAction::new(
            ActionKind::DoNothing,
            format!("advisor unavailable, no fallback rule matched: {cause}"),
        ));
        format!("advisor unavailable ({cause}), no fallback rule matched")
    } else {
        format!("advisor unavailable ({cause}), fallback rules: {}", rules.join(", "))
    };
    actions.push(ProposedAction::new(ActionKind::NotifyHuman, reason.clone()));

    info!(rules = ?rules, stale = status.sensor_stale, "fallback decision");

    Decision {
        actions,
        reason,
        urgency: Urgency::Attention,
        notify_human: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(temp: f32) -> DeviceStatus {
        DeviceStatus {
            co2_ppm: 700,
            temperature_c: temp,
            humidity_pct: 45.0,
            light_raw: 400,
            soil_raw: 500,
            water_ok: true,
            light_on: false,
            heater_on: false,
            heater_lockout: false,
            water_on: false,
            circulation_on: false,
            water_remaining_sec: 0,
            circulation_remaining_sec: 0,
            sensor_stale: false,
        }
    }

    fn names(d: &Decision) -> Vec<&str> {
        d.actions.iter().map(|a| a.action.as_str()).collect()
    }

    #[test]
    fn dry_soil_waters() {
        let d = decide(&status(22.0), 13.0, &FallbackConfig::default(), "timeout");
        assert_eq!(names(&d), ["water", "notify_human"]);
        assert_eq!(d.actions[0].duration(), Some(5));
        assert_eq!(d.urgency, Urgency::Attention);
        assert!(d.notify_human);
    }

    #[test]
    fn rules_combine() {
        let d = decide(&status(35.0), 10.0, &FallbackConfig::default(), "timeout");
        assert_eq!(names(&d), ["water", "heater_off", "circulation", "notify_human"]);
        assert_eq!(d.actions[2].duration(), Some(600));
    }

    #[test]
    fn cold_heats() {
        let d = decide(&status(12.0), 40.0, &FallbackConfig::default(), "timeout");
        assert_eq!(names(&d), ["heater_on", "notify_human"]);
    }

    #[test]
    fn nothing_matches() {
        let d = decide(&status(22.0), 40.0, &FallbackConfig::default(), "connection refused");
        assert_eq!(names(&d), ["do_nothing", "notify_human"]);
        assert!(d.reason.contains("connection refused"));
        assert!(d.notify_human);
    }

    #[test]
    fn stale_data_skips_temperature_rules() {
        let mut s = status(5.0);
        s.sensor_stale = true;
        let d = decide(&s, 40.0, &FallbackConfig::default(), "timeout");
        assert_eq!(names(&d), ["do_nothing", "notify_human"]);

        let d = decide(&s, 10.0, &FallbackConfig::default(), "timeout");
        assert_eq!(names(&d), ["water", "notify_human"]);
    }

    #[test]
    fn thresholds_are_strict() {
        let cfg = FallbackConfig::default();
        assert_eq!(names(&decide(&status(15.0), 25.0, &cfg, "x")), ["do_nothing", "notify_human"]);
        assert_eq!(names(&decide(&status(32.0), 25.0, &cfg, "x")), ["do_nothing", "notify_human"]);
    }
}
