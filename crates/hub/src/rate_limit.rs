//! Counters the validator consults and advances.
//!
//! Day and hour boundaries are calendar boundaries in the configured local
//! offset. The state is owned by the dispatcher and handed to the validator
//! explicitly; nothing else mutates it except cost recording.

use std::collections::HashMap;

use serde::Serialize;
use time::{Date, OffsetDateTime};

use crate::decision::ActionKind;

#[derive(Debug, Clone, Default)]
pub struct RateLimitState {
    last_trigger: HashMap<ActionKind, OffsetDateTime>,
    daily_counts: HashMap<ActionKind, u32>,
    hourly_count: u32,
    cost_today_usd: f64,
    day: Option<Date>,
    hour: Option<(Date, u8)>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RateLimitSummary {
    pub hourly_count: u32,
    pub cost_today_usd: f64,
    pub daily_counts: HashMap<String, u32>,
}

impl RateLimitState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear whatever the passage of time has expired. `now` must already be
    /// in local time.
    pub fn roll(&mut self, now: OffsetDateTime) {
        let day = now.date();
        if self.day != Some(day) {
            if self.day.is_some() {
                tracing::info!(%day, "day rolled over, daily counters and cost reset");
            }
            self.daily_counts.clear();
            self.cost_today_usd = 0.0;
            self.day = Some(day);
        }
        let hour = (day, now.hour());
        if self.hour != Some(hour) {
            self.hourly_count = 0;
            self.hour = Some(hour);
        }
    }

    pub fn last_trigger(&self, kind: ActionKind) -> Option<OffsetDateTime> {
        self.last_trigger.get(&kind).copied()
    }

    pub fn daily_count(&self, kind: ActionKind) -> u32 {
        self.daily_counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn hourly_count(&self) -> u32 {
        self.hourly_count
    }

    pub fn cost_today_usd(&self) -> f64 {
        self.cost_today_usd
    }

    /// Account one approval of `kind` at `now`.
    pub fn record_approval(&mut self, kind: ActionKind, now: OffsetDateTime, counts_hourly: bool) {
        self.roll(now);
        self.last_trigger.insert(kind, now);
        *self.daily_counts.entry(kind).or_insert(0) += 1;
        if counts_hourly {
            self.hourly_count += 1;
        }
    }

    pub fn record_cost(&mut self, usd: f64, now: OffsetDateTime) {
        self.roll(now);
        if usd.is_finite() && usd > 0.0 {
            self.cost_today_usd += usd;
        }
    }

    pub fn summary(&self) -> RateLimitSummary {
        RateLimitSummary {
            hourly_count: self.hourly_count,
            cost_today_usd: self.cost_today_usd,
            daily_counts: self
                .daily_counts
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), *v))
                .collect(),
        }
    }
}
