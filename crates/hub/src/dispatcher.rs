//! Turns a decision into link commands, one caller at a time.
//!
//! The link and the rate-limit counters sit behind one mutex. A batch takes
//! it once: re-read device status, validate every action, then send the
//! approved ones in the fixed order light, heater, water, circulation. The
//! first link error or `ERR` reply abandons whatever is left.

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::config::Limits;
use crate::control::ControlFlags;
use crate::decision::{Decision, Origin};
use crate::error::{DispatchError, ErrorKind};
use crate::link::Link;
use crate::rate_limit::{RateLimitState, RateLimitSummary};
use crate::status::DeviceStatus;
use crate::validator::{SensorContext, ValidationResult, Validator, Verdict};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    /// Sent and acknowledged, or approved with nothing to send.
    Executed,
    Rejected,
    /// Sent, and the link or the node failed it.
    Failed,
    /// Approved but not sent because an earlier command failed.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionOutcome {
    pub action: String,
    pub outcome: OutcomeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub clamped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchFailure {
    pub command: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// Device status the batch was validated against.
    pub status: DeviceStatus,
    /// One entry per proposed action, in the order proposed.
    pub outcomes: Vec<ActionOutcome>,
    pub failure: Option<DispatchFailure>,
}

impl BatchReport {
    pub fn executed(&self) -> impl Iterator<Item = &ActionOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.outcome == OutcomeKind::Executed)
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct Inner<L> {
    link: L,
    rate: RateLimitState,
}

pub struct Dispatcher<L> {
    inner: Mutex<Inner<L>>,
    limits: Limits,
    daily_cost_cap_usd: f64,
}

impl<L: Link> Dispatcher<L> {
    pub fn new(link: L, limits: Limits, daily_cost_cap_usd: f64, rate: RateLimitState) -> Self {
        Self {
            inner: Mutex::new(Inner { link, rate }),
            limits,
            daily_cost_cap_usd,
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Current device status, taken under the same lock as dispatch.
    pub async fn read_status(&self) -> Result<DeviceStatus, DispatchError> {
        let mut inner = self.inner.lock().await;
        read_status(&mut inner.link).await
    }

    /// Validate and dispatch, queueing behind any batch in flight.
    pub async fn execute(
        &self,
        decision: &Decision,
        origin: Origin,
        flags: ControlFlags,
        now: OffsetDateTime,
    ) -> Result<BatchReport, DispatchError> {
        let inner = self.inner.lock().await;
        self.run(inner, decision, origin, flags, now).await
    }

    /// Like [`execute`](Self::execute) but fails with `Busy` instead of waiting.
    pub async fn try_execute(
        &self,
        decision: &Decision,
        origin: Origin,
        flags: ControlFlags,
        now: OffsetDateTime,
    ) -> Result<BatchReport, DispatchError> {
        let inner = self.inner.try_lock().map_err(|_| DispatchError::Busy)?;
        self.run(inner, decision, origin, flags, now).await
    }

    pub async fn record_cost(&self, usd: f64, now: OffsetDateTime) {
        let mut inner = self.inner.lock().await;
        inner.rate.record_cost(usd, self.limits.local(now));
    }

    pub async fn rate_limits(&self, now: OffsetDateTime) -> RateLimitSummary {
        let mut inner = self.inner.lock().await;
        inner.rate.roll(self.limits.local(now));
        inner.rate.summary()
    }

    pub async fn cost_cap_reached(&self, now: OffsetDateTime) -> bool {
        let mut inner = self.inner.lock().await;
        inner.rate.roll(self.limits.local(now));
        inner.rate.cost_today_usd() >= self.daily_cost_cap_usd
    }

    async fn run(
        &self,
        mut inner: MutexGuard<'_, Inner<L>>,
        decision: &Decision,
        origin: Origin,
        flags: ControlFlags,
        now: OffsetDateTime,
    ) -> Result<BatchReport, DispatchError> {
        let inner = &mut *inner;
        let status = read_status(&mut inner.link).await?;
        let ctx = SensorContext::from(&status);

        let validator = Validator::new(&self.limits, self.daily_cost_cap_usd);
        let results = validator.validate_batch(decision, origin, &ctx, &mut inner.rate, flags, now);

        let mut outcomes: Vec<ActionOutcome> = results.iter().map(initial_outcome).collect();
        for (result, outcome) in results.iter().zip(&outcomes) {
            if let Verdict::Rejected(reason) = &result.verdict {
                warn!(
                    action = %result.action,
                    %origin,
                    code = reason.code(),
                    kind = %reason.kind(),
                    "action rejected: {reason}"
                );
            } else if outcome.clamped {
                info!(action = %result.action, duration_sec = ?outcome.duration_sec, "duration clamped");
            }
        }

        let mut order: Vec<usize> = (0..results.len())
            .filter(|&i| results[i].is_approved())
            .collect();
        order.sort_by_key(|&i| results[i].kind.map_or(u8::MAX, |k| k.dispatch_rank()));

        let mut failure: Option<DispatchFailure> = None;
        for i in order {
            let outcome = &mut outcomes[i];
            if failure.is_some() {
                outcome.outcome = OutcomeKind::Abandoned;
                continue;
            }
            let Some(command) = results[i].kind.and_then(|k| k.command(results[i].duration_sec()))
            else {
                outcome.outcome = OutcomeKind::Executed;
                continue;
            };

            let err = match inner.link.transact(&command).await {
                Ok(lines) => {
                    let last = lines.last().cloned().unwrap_or_default();
                    if last.starts_with("OK") {
                        info!(%origin, %command, reply = %last, "dispatched");
                        outcome.outcome = OutcomeKind::Executed;
                        outcome.reply = Some(last);
                        continue;
                    }
                    outcome.reply = Some(last.clone());
                    DispatchError::Device {
                        command: command.clone(),
                        reply: last,
                    }
                }
                Err(source) => DispatchError::Link {
                    command: command.clone(),
                    source,
                },
            };

            error!(%origin, %command, kind = %err.kind(), "dispatch failed, abandoning batch: {err}");
            outcome.outcome = OutcomeKind::Failed;
            outcome.detail = Some(err.to_string());
            failure = Some(DispatchFailure {
                command,
                kind: err.kind(),
                message: err.to_string(),
            });
        }

        Ok(BatchReport {
            status,
            outcomes,
            failure,
        })
    }
}

async fn read_status<L: Link>(link: &mut L) -> Result<DeviceStatus, DispatchError> {
    let lines = link
        .transact("r")
        .await
        .map_err(|source| DispatchError::Link {
            command: "r".into(),
            source,
        })?;
    if let Some(last) = lines.last().filter(|l| l.starts_with("ERR")) {
        return Err(DispatchError::Device {
            command: "r".into(),
            reply: last.clone(),
        });
    }
    Ok(DeviceStatus::from_reply(&lines)?)
}

fn initial_outcome(r: &ValidationResult) -> ActionOutcome {
    let (outcome, duration_sec, clamped, code, detail) = match &r.verdict {
        Verdict::Approved {
            duration_sec,
            clamped,
        } => (OutcomeKind::Executed, *duration_sec, *clamped, None, None),
        Verdict::Rejected(reason) => (
            OutcomeKind::Rejected,
            None,
            false,
            Some(reason.code()),
            Some(reason.to_string()),
        ),
    };
    ActionOutcome {
        action: r.action.clone(),
        outcome,
        duration_sec,
        clamped,
        code,
        detail,
        reply: None,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
