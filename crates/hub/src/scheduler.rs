//! Fixed-interval driver for the check cycle.

use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::advisor::Advisor;
use crate::cycle::CheckCycle;
use crate::link::Link;

/// Run the check cycle forever.  Intended to be `tokio::spawn`-ed from main.
pub async fn run<L: Link, A: Advisor>(
    cycle: CheckCycle<L, A>,
    interval: Duration,
    startup_delay: Duration,
) {
    // Give the node a moment after a joint power-up before the first read.
    tokio::time::sleep(startup_delay).await;

    let mut ticker = tokio::time::interval(interval);
    // A cycle that overruns (slow advisor) must not trigger a burst after it.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval_sec = interval.as_secs(), "scheduler started");
    cycle
        .shared
        .write()
        .await
        .record_system(format!("scheduler started (every {} min)", interval.as_secs() / 60));

    loop {
        ticker.tick().await;
        if let Err(e) = cycle.run_once(OffsetDateTime::now_utc()).await {
            error!("check cycle failed: {e:#}");
        }
    }
}
