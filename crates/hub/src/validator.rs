//! Policy gate between a proposed action and the hardware.
//!
//! Checks run in a fixed order and stop at the first rejection:
//!
//! ```text
//! emergency stop / pause ─▶ allowlist ─▶ duration clamp ─▶ min interval
//!   ─▶ daily cap ─▶ hourly cap ─▶ hardware guard ─▶ cost cap ─▶ approved
//! ```
//!
//! `do_nothing` and `notify_human` pass once they clear the allowlist.
//! `light_off` and `heater_off` skip the interval and cap checks.
//! An approval is written into the [`RateLimitState`] before the next action
//! is looked at, so a batch cannot spend the same allowance twice.

use std::fmt;

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::config::Limits;
use crate::control::ControlFlags;
use crate::decision::{ActionKind, Decision, Origin, ProposedAction};
use crate::error::ErrorKind;
use crate::rate_limit::RateLimitState;
use crate::status::DeviceStatus;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// What the validator needs to know about the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorContext {
    pub temperature_c: f32,
    pub heater_lockout: bool,
    pub sensor_stale: bool,
    pub water_ok: bool,
}

impl From<&DeviceStatus> for SensorContext {
    fn from(s: &DeviceStatus) -> Self {
        Self {
            temperature_c: s.temperature_c,
            heater_lockout: s.heater_lockout,
            sensor_stale: s.sensor_stale,
            water_ok: s.water_ok,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    EmergencyStop,
    Paused,
    NotAllowlisted,
    DegenerateParameter,
    MinInterval { remaining_min: i64 },
    DailyCap { count: u32, max: u32 },
    HourlyCap { count: u32, max: u32 },
    HardwareGuard(String),
    CostCap { spent_usd: f64, cap_usd: f64 },
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmergencyStop => "emergency_stop",
            Self::Paused => "paused",
            Self::NotAllowlisted => "not_allowlisted",
            Self::DegenerateParameter => "degenerate_parameter",
            Self::MinInterval { .. } => "min_interval",
            Self::DailyCap { .. } => "daily_cap",
            Self::HourlyCap { .. } => "hourly_cap",
            Self::HardwareGuard(_) => "hardware_guard",
            Self::CostCap { .. } => "cost_cap",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmergencyStop | Self::Paused => ErrorKind::EmergencyStopActive,
            Self::NotAllowlisted => ErrorKind::ActionRejectedAllowlist,
            Self::DegenerateParameter
            | Self::MinInterval { .. }
            | Self::DailyCap { .. }
            | Self::HourlyCap { .. } => ErrorKind::ActionRejectedLimit,
            Self::HardwareGuard(_) => ErrorKind::ActionRejectedHardwareGuard,
            Self::CostCap { .. } => ErrorKind::ActionRejectedCostCap,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmergencyStop => f.write_str("emergency stop active"),
            Self::Paused => f.write_str("actuation paused"),
            Self::NotAllowlisted => f.write_str("action not in allowlist"),
            Self::DegenerateParameter => f.write_str("duration missing or not positive"),
            Self::MinInterval { remaining_min } => {
                write!(f, "too soon after last run, {remaining_min} min remaining")
            }
            Self::DailyCap { count, max } => write!(f, "daily limit reached ({count}/{max})"),
            Self::HourlyCap { count, max } => write!(f, "hourly limit reached ({count}/{max})"),
            Self::HardwareGuard(why) => f.write_str(why),
            Self::CostCap { spent_usd, cap_usd } => {
                write!(f, "daily cost cap reached (${spent_usd:.2}/${cap_usd:.2})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Approved {
        /// Duration to send, after clamping.
        duration_sec: Option<u32>,
        clamped: bool,
    },
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    /// Identifier exactly as proposed.
    pub action: String,
    pub kind: Option<ActionKind>,
    pub verdict: Verdict,
}

impl ValidationResult {
    pub fn is_approved(&self) -> bool {
        matches!(self.verdict, Verdict::Approved { .. })
    }

    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match &self.verdict {
            Verdict::Rejected(r) => Some(r),
            Verdict::Approved { .. } => None,
        }
    }

    pub fn duration_sec(&self) -> Option<u32> {
        match self.verdict {
            Verdict::Approved { duration_sec, .. } => duration_sec,
            Verdict::Rejected(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

pub struct Validator<'a> {
    limits: &'a Limits,
    daily_cost_cap_usd: f64,
}

impl<'a> Validator<'a> {
    pub fn new(limits: &'a Limits, daily_cost_cap_usd: f64) -> Self {
        Self {
            limits,
            daily_cost_cap_usd,
        }
    }

    /// Judge one action. An approval is recorded in `limits_state` at once.
    pub fn validate(
        &self,
        action: &ProposedAction,
        origin: Origin,
        ctx: &SensorContext,
        limits_state: &mut RateLimitState,
        flags: ControlFlags,
        now: OffsetDateTime,
    ) -> ValidationResult {
        let kind = ActionKind::parse(&action.action);
        let verdict = match self.check(action, kind, origin, ctx, limits_state, flags, now) {
            Ok((kind, duration_sec, clamped)) => {
                if !kind.is_passthrough() {
                    limits_state.record_approval(
                        kind,
                        self.limits.local(now),
                        !kind.is_safe_direction(),
                    );
                }
                Verdict::Approved {
                    duration_sec,
                    clamped,
                }
            }
            Err(reason) => Verdict::Rejected(reason),
        };
        ValidationResult {
            action: action.action.clone(),
            kind,
            verdict,
        }
    }

    /// Judge every action of a decision in the order proposed.
    pub fn validate_batch(
        &self,
        decision: &Decision,
        origin: Origin,
        ctx: &SensorContext,
        limits_state: &mut RateLimitState,
        flags: ControlFlags,
        now: OffsetDateTime,
    ) -> Vec<ValidationResult> {
        decision
            .actions
            .iter()
            .map(|a| self.validate(a, origin, ctx, limits_state, flags, now))
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn check(
        &self,
        action: &ProposedAction,
        kind: Option<ActionKind>,
        origin: Origin,
        ctx: &SensorContext,
        state: &mut RateLimitState,
        flags: ControlFlags,
        now: OffsetDateTime,
    ) -> Result<(ActionKind, Option<u32>, bool), RejectReason> {
        let passthrough = kind.is_some_and(ActionKind::is_passthrough);

        // ── Operator halt ───────────────────────────────────
        if !passthrough {
            if flags.emergency_stop {
                return Err(RejectReason::EmergencyStop);
            }
            if flags.paused {
                return Err(RejectReason::Paused);
            }
        }

        let kind = kind.ok_or(RejectReason::NotAllowlisted)?;
        if passthrough {
            return Ok((kind, None, false));
        }

        let local = self.limits.local(now);
        state.roll(local);
        let policy = self.limits.policy(kind);

        // ── Duration clamp ──────────────────────────────────
        let (duration_sec, clamped) = match (kind.takes_duration(), policy.max_duration_sec) {
            (true, Some(max)) => {
                let requested = action.duration().filter(|d| *d > 0);
                let requested = requested.ok_or(RejectReason::DegenerateParameter)?;
                let applied = requested.min(i64::from(max));
                if applied <= 0 {
                    return Err(RejectReason::DegenerateParameter);
                }
                // applied <= max, which is a u32
                (Some(applied as u32), requested > applied)
            }
            (true, None) => return Err(RejectReason::DegenerateParameter),
            (false, _) => (None, false),
        };

        // ── Interval and caps ───────────────────────────────
        if !kind.is_safe_direction() {
            if policy.min_interval_min > 0 {
                if let Some(last) = state.last_trigger(kind) {
                    let interval = Duration::minutes(i64::from(policy.min_interval_min));
                    let since = local - last;
                    if since < interval {
                        let remaining = interval - since;
                        return Err(RejectReason::MinInterval {
                            remaining_min: remaining.whole_seconds().div_euclid(60)
                                + i64::from(remaining.whole_seconds() % 60 != 0),
                        });
                    }
                }
            }

            if let Some(max) = policy.daily_max_count {
                let count = state.daily_count(kind);
                if count >= max {
                    return Err(RejectReason::DailyCap { count, max });
                }
            }

            let max = self.limits.max_actions_per_hour;
            if state.hourly_count() >= max {
                return Err(RejectReason::HourlyCap {
                    count: state.hourly_count(),
                    max,
                });
            }
        }

        // ── Hardware context ────────────────────────────────
        self.hardware_guard(kind, ctx, now)
            .map_err(RejectReason::HardwareGuard)?;

        // ── Spend ───────────────────────────────────────────
        if origin == Origin::Advisor && state.cost_today_usd() >= self.daily_cost_cap_usd {
            return Err(RejectReason::CostCap {
                spent_usd: state.cost_today_usd(),
                cap_usd: self.daily_cost_cap_usd,
            });
        }

        Ok((kind, duration_sec, clamped))
    }

    fn hardware_guard(
        &self,
        kind: ActionKind,
        ctx: &SensorContext,
        now: OffsetDateTime,
    ) -> Result<(), String> {
        match kind {
            ActionKind::HeaterOn => {
                if ctx.sensor_stale {
                    return Err("sensor data stale".into());
                }
                if ctx.heater_lockout {
                    return Err("controller heater lockout active".into());
                }
                let ceiling = self.limits.heater.max_temp_c;
                if ctx.temperature_c >= ceiling {
                    return Err(format!(
                        "temperature {:.1}C at or above heater ceiling {:.1}C",
                        ctx.temperature_c, ceiling
                    ));
                }
                Ok(())
            }
            ActionKind::LightOn if !self.limits.light_allowed(now) => {
                Err(format!(
                    "outside light schedule {}-{}",
                    self.limits.light.schedule_on, self.limits.light.schedule_off
                ))
            }
            ActionKind::Water if !ctx.water_ok => Err("water tank low".into()),
            _ => Ok(()),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
