//! SQLite decision log: status snapshots, action outcomes, advisor spend.

use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use time::{Duration, OffsetDateTime};

use crate::config::Limits;
use crate::decision::{ActionKind, Origin};
use crate::dispatcher::{ActionOutcome, OutcomeKind};
use crate::rate_limit::RateLimitState;
use crate::status::DeviceStatus;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LoggedAction {
    pub ts: i64,
    pub origin: String,
    pub action: String,
    pub duration_sec: Option<i64>,
    pub outcome: String,
    pub code: Option<String>,
    pub detail: Option<String>,
}

fn outcome_str(o: OutcomeKind) -> &'static str {
    match o {
        OutcomeKind::Executed => "executed",
        OutcomeKind::Rejected => "rejected",
        OutcomeKind::Failed => "failed",
        OutcomeKind::Abandoned => "abandoned",
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/plantops/plantops.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to :memory: is its own database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Writes
    // ----------------------------

    pub async fn insert_status(
        &self,
        ts: OffsetDateTime,
        s: &DeviceStatus,
        soil_pct: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO status_snapshots (
              ts, co2_ppm, temperature_c, humidity_pct, light_raw, soil_raw, soil_pct,
              water_ok, light_on, heater_on, heater_lockout, water_on, circulation_on,
              sensor_stale
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts.unix_timestamp())
        .bind(i64::from(s.co2_ppm))
        .bind(f64::from(s.temperature_c))
        .bind(f64::from(s.humidity_pct))
        .bind(i64::from(s.light_raw))
        .bind(i64::from(s.soil_raw))
        .bind(soil_pct)
        .bind(s.water_ok)
        .bind(s.light_on)
        .bind(s.heater_on)
        .bind(s.heater_lockout)
        .bind(s.water_on)
        .bind(s.circulation_on)
        .bind(s.sensor_stale)
        .execute(&self.pool)
        .await
        .context("insert_status failed")?;
        Ok(())
    }

    pub async fn insert_action(
        &self,
        ts: OffsetDateTime,
        origin: Origin,
        o: &ActionOutcome,
        reason: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO action_log (ts, origin, action, duration_sec, outcome, code, detail, reply, reason)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts.unix_timestamp())
        .bind(origin.as_str())
        .bind(&o.action)
        .bind(o.duration_sec.map(i64::from))
        .bind(outcome_str(o.outcome))
        .bind(o.code)
        .bind(o.detail.as_deref())
        .bind(o.reply.as_deref())
        .bind(reason)
        .execute(&self.pool)
        .await
        .context("insert_action failed")?;
        Ok(())
    }

    pub async fn insert_cost(&self, ts: OffsetDateTime, cost_usd: f64) -> Result<()> {
        sqlx::query("INSERT INTO advisory_usage (ts, cost_usd) VALUES (?, ?)")
            .bind(ts.unix_timestamp())
            .bind(cost_usd)
            .execute(&self.pool)
            .await
            .context("insert_cost failed")?;
        Ok(())
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn recent_actions(&self, limit: i64) -> Result<Vec<LoggedAction>> {
        let rows = sqlx::query_as::<_, LoggedAction>(
            r#"
            SELECT ts, origin, action, duration_sec, outcome, code, detail
            FROM action_log
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_actions failed")?;
        Ok(rows)
    }

    /// Approved actions (whatever happened after approval) since `since`,
    /// oldest first.
    pub async fn approvals_since(&self, since: OffsetDateTime) -> Result<Vec<(i64, String)>> {
        let rows = sqlx::query_as::<_, (i64, String)>(
            r#"
            SELECT ts, action
            FROM action_log
            WHERE ts >= ? AND outcome <> 'rejected'
            ORDER BY ts ASC, id ASC
            "#,
        )
        .bind(since.unix_timestamp())
        .fetch_all(&self.pool)
        .await
        .context("approvals_since failed")?;
        Ok(rows)
    }

    pub async fn costs_since(&self, since: OffsetDateTime) -> Result<Vec<(i64, f64)>> {
        let rows = sqlx::query_as::<_, (i64, f64)>(
            "SELECT ts, cost_usd FROM advisory_usage WHERE ts >= ? ORDER BY ts ASC, id ASC",
        )
        .bind(since.unix_timestamp())
        .fetch_all(&self.pool)
        .await
        .context("costs_since failed")?;
        Ok(rows)
    }

    /// Rebuild rate-limit counters from the last day of the log so a restart
    /// does not hand out a fresh allowance.
    pub async fn replay_rate_limits(
        &self,
        limits: &Limits,
        now: OffsetDateTime,
    ) -> Result<RateLimitState> {
        enum Entry {
            Approval(ActionKind),
            Cost(f64),
        }

        let since = now - Duration::days(1);
        let mut entries: Vec<(i64, Entry)> = Vec::new();
        for (ts, action) in self.approvals_since(since).await? {
            match ActionKind::parse(&action) {
                Some(kind) if !kind.is_passthrough() => entries.push((ts, Entry::Approval(kind))),
                _ => {}
            }
        }
        for (ts, usd) in self.costs_since(since).await? {
            entries.push((ts, Entry::Cost(usd)));
        }
        // Counters only roll forward, so apply in time order.
        entries.sort_by_key(|(ts, _)| *ts);

        let mut state = RateLimitState::new();
        let mut replayed = 0usize;
        for (ts, entry) in entries {
            let Ok(at) = OffsetDateTime::from_unix_timestamp(ts) else {
                continue;
            };
            let at = limits.local(at);
            match entry {
                Entry::Approval(kind) => {
                    state.record_approval(kind, at, !kind.is_safe_direction());
                    replayed += 1;
                }
                Entry::Cost(usd) => state.record_cost(usd, at),
            }
        }
        state.roll(limits.local(now));

        tracing::info!(
            approvals = replayed,
            cost_today_usd = state.cost_today_usd(),
            "rate limits restored from log"
        );
        Ok(state)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    async fn db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn outcome(action: &str, outcome: OutcomeKind) -> ActionOutcome {
        ActionOutcome {
            action: action.into(),
            outcome,
            duration_sec: None,
            clamped: false,
            code: None,
            detail: None,
            reply: None,
        }
    }

    #[tokio::test]
    async fn action_log_round_trip() {
        let db = db().await;
        let t = datetime!(2024-06-01 12:00 UTC);
        let mut water = outcome("water", OutcomeKind::Executed);
        water.duration_sec = Some(5);
        water.reply = Some("OK water=1 sec=5".into());
        db.insert_action(t, Origin::Fallback, &water, "soil dry").await.unwrap();

        let mut bad = outcome("open_window", OutcomeKind::Rejected);
        bad.code = Some("not_allowlisted");
        db.insert_action(t + Duration::seconds(1), Origin::Advisor, &bad, "").await.unwrap();

        let recent = db.recent_actions(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].action, "open_window");
        assert_eq!(recent[0].code.as_deref(), Some("not_allowlisted"));
        assert_eq!(recent[1].origin, "fallback");
        assert_eq!(recent[1].duration_sec, Some(5));
    }

    #[tokio::test]
    async fn status_snapshot_insert() {
        let db = db().await;
        let s = DeviceStatus::parse("700,22.00,45.00,410,600,1,0,0,0,0,0,0,0,1").unwrap();
        db.insert_status(datetime!(2024-06-01 12:00 UTC), &s, 31.5).await.unwrap();

        let (count, stale): (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), MAX(sensor_stale) FROM status_snapshots")
                .fetch_one(&db.pool)
                .await
                .unwrap();
        assert_eq!(count, 1);
        assert_eq!(stale, 1);
    }

    #[tokio::test]
    async fn replay_restores_todays_counters() {
        let db = db().await;
        let limits = Limits::default();
        let now = datetime!(2024-06-01 12:30 UTC);

        // Yesterday, today, and a rejection that must not count.
        db.insert_action(datetime!(2024-05-31 23:50 UTC), Origin::Advisor, &outcome("water", OutcomeKind::Executed), "")
            .await
            .unwrap();
        db.insert_action(datetime!(2024-06-01 12:10 UTC), Origin::Advisor, &outcome("water", OutcomeKind::Executed), "")
            .await
            .unwrap();
        db.insert_action(datetime!(2024-06-01 12:15 UTC), Origin::Advisor, &outcome("light_on", OutcomeKind::Abandoned), "")
            .await
            .unwrap();
        db.insert_action(datetime!(2024-06-01 12:20 UTC), Origin::Advisor, &outcome("water", OutcomeKind::Rejected), "")
            .await
            .unwrap();
        db.insert_action(datetime!(2024-06-01 12:21 UTC), Origin::Manual, &outcome("notify_human", OutcomeKind::Executed), "")
            .await
            .unwrap();
        db.insert_cost(datetime!(2024-05-31 22:00 UTC), 0.9).await.unwrap();
        db.insert_cost(datetime!(2024-06-01 09:00 UTC), 0.25).await.unwrap();

        let state = db.replay_rate_limits(&limits, now).await.unwrap();
        assert_eq!(state.daily_count(ActionKind::Water), 1);
        assert_eq!(state.daily_count(ActionKind::LightOn), 1);
        assert_eq!(state.hourly_count(), 2);
        assert_eq!(state.last_trigger(ActionKind::Water), Some(datetime!(2024-06-01 12:10 UTC)));
        assert!((state.cost_today_usd() - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn replay_keeps_interval_across_midnight() {
        let db = db().await;
        let limits = Limits::default();
        db.insert_action(datetime!(2024-05-31 23:50 UTC), Origin::Advisor, &outcome("water", OutcomeKind::Executed), "")
            .await
            .unwrap();

        let state = db
            .replay_rate_limits(&limits, datetime!(2024-06-01 00:10 UTC))
            .await
            .unwrap();
        assert_eq!(state.daily_count(ActionKind::Water), 0);
        assert_eq!(state.last_trigger(ActionKind::Water), Some(datetime!(2024-05-31 23:50 UTC)));
    }
}
