//! One pass of the control loop: sense, decide, validate and dispatch, then
//! log and report.
//!
//! The advisor is asked unless today's spend has already hit the cap; any
//! advisor failure drops to the offline rules. Either way the decision goes
//! through the dispatcher's full validation.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::advisor::{Advisor, AdvisorContext};
use crate::config::Config;
use crate::control::ControlFlags;
use crate::db::Db;
use crate::decision::{Decision, Origin, Urgency};
use crate::dispatcher::{ActionOutcome, BatchReport, DispatchFailure, Dispatcher, OutcomeKind};
use crate::error::ErrorKind;
use crate::fallback;
use crate::link::Link;
use crate::notify::Notifier;
use crate::state::SharedState;
use crate::status::DeviceStatus;

/// How many logged actions the advisor sees.
const RECENT_ACTIONS: i64 = 20;

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub origin: Origin,
    pub reason: String,
    pub urgency: Urgency,
    pub notify_human: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advisor_error: Option<String>,
    pub cost_usd: f64,
    pub soil_moisture_pct: f64,
    pub control: ControlFlags,
    pub status: DeviceStatus,
    pub outcomes: Vec<ActionOutcome>,
    pub failure: Option<DispatchFailure>,
}

pub struct CheckCycle<L, A> {
    pub cfg: Arc<Config>,
    pub dispatcher: Arc<Dispatcher<L>>,
    pub advisor: A,
    pub db: Db,
    pub shared: SharedState,
    pub notifier: Notifier,
}

impl<L: Link, A: Advisor> CheckCycle<L, A> {
    pub async fn run_once(&self, now: OffsetDateTime) -> Result<CycleReport> {
        // ── Sense ───────────────────────────────────────────
        let status = match self.dispatcher.read_status().await {
            Ok(s) => s,
            Err(e) => {
                error!(kind = %e.kind(), "status read failed, cycle skipped: {e}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("status read failed: {e}"));
                return Err(e).context("read device status");
            }
        };
        let soil_pct = self.cfg.soil.moisture_pct(status.soil_raw);
        if status.sensor_stale {
            warn!(kind = %ErrorKind::SensorStale, "node reports stale climate data");
        }
        if let Err(e) = self.db.insert_status(now, &status, soil_pct).await {
            error!("db: {e:#}");
        }
        self.shared.write().await.record_status(now, status, soil_pct);

        let flags = ControlFlags::read(&self.cfg.control);
        if flags.halted() {
            warn!(kind = %ErrorKind::EmergencyStopActive, ?flags, "actuation halted by operator");
        }

        // ── Decide ──────────────────────────────────────────
        let (decision, origin, cost_usd, advisor_error) =
            self.decide(&status, soil_pct, flags, now).await;

        // ── Validate + dispatch ─────────────────────────────
        let report = match self.dispatcher.execute(&decision, origin, flags, now).await {
            Ok(r) => r,
            Err(e) => {
                error!(kind = %e.kind(), "dispatch aborted: {e}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("dispatch aborted: {e}"));
                return Err(e).context("dispatch decision");
            }
        };

        // Spend is counted after the decision it paid for was judged.
        if cost_usd > 0.0 {
            self.dispatcher.record_cost(cost_usd, now).await;
            if let Err(e) = self.db.insert_cost(now, cost_usd).await {
                error!("db: {e:#}");
            }
        }

        // ── Log + report ────────────────────────────────────
        log_batch(&self.db, &self.shared, origin, &decision, &report, now).await;

        let cycle = CycleReport {
            ts: now,
            origin,
            reason: decision.reason.clone(),
            urgency: decision.urgency,
            notify_human: decision.notify_human,
            advisor_error,
            cost_usd,
            soil_moisture_pct: soil_pct,
            control: flags,
            status: report.status,
            outcomes: report.outcomes,
            failure: report.failure,
        };
        info!(
            %origin,
            actions = cycle.outcomes.len(),
            executed = cycle.outcomes.iter().filter(|o| o.outcome == OutcomeKind::Executed).count(),
            soil_pct = format_args!("{soil_pct:.1}"),
            temperature_c = cycle.status.temperature_c,
            "check cycle complete"
        );

        self.notifier.publish_cycle(&cycle).await;
        self.shared.write().await.record_cycle(cycle.clone());
        Ok(cycle)
    }

    async fn decide(
        &self,
        status: &DeviceStatus,
        soil_pct: f64,
        flags: ControlFlags,
        now: OffsetDateTime,
    ) -> (Decision, Origin, f64, Option<String>) {
        if self.dispatcher.cost_cap_reached(now).await {
            let cause = "daily advisor cost cap reached";
            warn!(kind = %ErrorKind::ActionRejectedCostCap, "{cause}, using fallback rules");
            let d = fallback::decide(status, soil_pct, &self.cfg.fallback, cause);
            return (d, Origin::Fallback, 0.0, Some(cause.to_string()));
        }

        let recent_actions = match self.db.recent_actions(RECENT_ACTIONS).await {
            Ok(rows) => rows,
            Err(e) => {
                error!("db: {e:#}");
                Vec::new()
            }
        };
        let ctx = AdvisorContext {
            device_id: self.cfg.device_id.clone(),
            timestamp: now,
            status: *status,
            soil_moisture_pct: soil_pct,
            control: flags,
            limits: self.dispatcher.rate_limits(now).await,
            recent_actions,
        };

        match self.advisor.advise(&ctx).await {
            Ok(advice) => {
                info!(
                    actions = advice.decision.actions.len(),
                    cost_usd = advice.cost_usd,
                    urgency = ?advice.decision.urgency,
                    "advisor decision received"
                );
                (advice.decision, Origin::Advisor, advice.cost_usd, None)
            }
            Err(e) => {
                warn!("advisor failed, using fallback rules: {e}");
                let cause = e.to_string();
                let d = fallback::decide(status, soil_pct, &self.cfg.fallback, &cause);
                (d, Origin::Fallback, 0.0, Some(cause))
            }
        }
    }
}

/// Persist and surface every outcome of a dispatched batch.
pub async fn log_batch(
    db: &Db,
    shared: &SharedState,
    origin: Origin,
    decision: &Decision,
    report: &BatchReport,
    now: OffsetDateTime,
) {
    for (i, outcome) in report.outcomes.iter().enumerate() {
        let reason = decision
            .actions
            .get(i)
            .map(|a| a.reason.as_str())
            .unwrap_or_default();
        if let Err(e) = db.insert_action(now, origin, outcome, reason).await {
            error!("db: {e:#}");
        }
    }

    let mut st = shared.write().await;
    for outcome in &report.outcomes {
        st.record_outcome(origin, outcome);
    }
    if let Some(f) = &report.failure {
        st.record_error(format!("dispatch failed at `{}`: {}", f.command, f.message));
    }
}
