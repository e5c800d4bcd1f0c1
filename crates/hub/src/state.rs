use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::control::ControlFlags;
use crate::cycle::CycleReport;
use crate::decision::Origin;
use crate::dispatcher::{ActionOutcome, OutcomeKind};
use crate::rate_limit::RateLimitSummary;
use crate::status::DeviceStatus;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub device_id: String,
    pub mqtt_connected: bool,
    pub control: ControlFlags,
    pub last_status: Option<StatusView>,
    pub last_cycle: Option<CycleReport>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct StatusView {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub soil_moisture_pct: f64,
    #[serde(flatten)]
    pub status: DeviceStatus,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Cycle,
    Action,
    Rejection,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub device_id: String,
    pub mqtt_connected: bool,
    pub control: ControlFlags,
    pub last_status: Option<StatusView>,
    pub last_cycle: Option<CycleReport>,
    pub rate_limits: RateLimitSummary,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            started_at: Instant::now(),
            device_id: device_id.into(),
            mqtt_connected: false,
            control: ControlFlags::default(),
            last_status: None,
            last_cycle: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(device_id: impl Into<String>) -> SharedState {
        Arc::new(RwLock::new(Self::new(device_id)))
    }

    /// Record a device status read.
    pub fn record_status(&mut self, ts: OffsetDateTime, status: DeviceStatus, soil_moisture_pct: f64) {
        self.last_status = Some(StatusView {
            ts,
            soil_moisture_pct,
            status,
        });
    }

    /// Record what became of one proposed action.
    pub fn record_outcome(&mut self, origin: Origin, o: &ActionOutcome) {
        let (kind, detail) = match o.outcome {
            OutcomeKind::Rejected => (
                EventKind::Rejection,
                format!(
                    "{origin} {} rejected ({}): {}",
                    o.action,
                    o.code.unwrap_or("?"),
                    o.detail.as_deref().unwrap_or("")
                ),
            ),
            OutcomeKind::Executed => (
                EventKind::Action,
                match o.duration_sec {
                    Some(secs) => format!("{origin} {} {secs}s", o.action),
                    None => format!("{origin} {}", o.action),
                },
            ),
            OutcomeKind::Failed => (
                EventKind::Error,
                format!(
                    "{origin} {} failed: {}",
                    o.action,
                    o.detail.as_deref().unwrap_or("")
                ),
            ),
            OutcomeKind::Abandoned => (
                EventKind::Error,
                format!("{origin} {} abandoned after earlier failure", o.action),
            ),
        };
        self.push_event(kind, detail);
    }

    /// Record a completed check cycle.
    pub fn record_cycle(&mut self, report: CycleReport) {
        self.control = report.control;
        let detail = format!(
            "{} cycle: {} action(s), {}",
            report.origin,
            report.outcomes.len(),
            if report.failure.is_some() {
                "dispatch failed"
            } else {
                "ok"
            }
        );
        self.last_cycle = Some(report);
        self.push_event(EventKind::Cycle, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, rate_limits: RateLimitSummary) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            device_id: self.device_id.clone(),
            mqtt_connected: self.mqtt_connected,
            control: self.control,
            last_status: self.last_status.clone(),
            last_cycle: self.last_cycle.clone(),
            rate_limits,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_is_bounded_and_newest_first() {
        let mut st = SystemState::new("plant-01");
        for i in 0..(MAX_EVENTS + 5) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);

        let status = st.to_status(RateLimitSummary {
            hourly_count: 0,
            cost_today_usd: 0.0,
            daily_counts: Default::default(),
        });
        assert_eq!(status.events[0].detail, format!("event {}", MAX_EVENTS + 4));
        assert_eq!(status.events.last().unwrap().detail, "event 5");
    }

    #[test]
    fn outcomes_become_events() {
        let mut st = SystemState::new("plant-01");
        st.record_outcome(
            Origin::Advisor,
            &ActionOutcome {
                action: "water".into(),
                outcome: OutcomeKind::Rejected,
                duration_sec: None,
                clamped: false,
                code: Some("min_interval"),
                detail: Some("too soon after last run, 12 min remaining".into()),
                reply: None,
            },
        );
        let ev = st.events.back().unwrap();
        assert_eq!(ev.kind, EventKind::Rejection);
        assert_eq!(
            ev.detail,
            "advisor water rejected (min_interval): too soon after last run, 12 min remaining"
        );
    }
}
