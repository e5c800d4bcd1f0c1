use std::{env, sync::Arc, time::Duration};

use anyhow::Result;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use plantops_hub::advisor::AnyAdvisor;
use plantops_hub::config;
use plantops_hub::cycle::CheckCycle;
use plantops_hub::db::Db;
use plantops_hub::dispatcher::Dispatcher;
use plantops_hub::link::TcpLink;
use plantops_hub::notify::Notifier;
use plantops_hub::scheduler;
use plantops_hub::state::SystemState;
use plantops_hub::web::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = Arc::new(config::load(&config_path)?);
    info!(path = %config_path, device_id = %cfg.device_id, "config loaded");

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.database.url).await?;
    db.migrate().await?;
    let rate = db
        .replay_rate_limits(&cfg.limits, OffsetDateTime::now_utc())
        .await?;

    // ── Node link + dispatcher ──────────────────────────────────────
    let link = TcpLink::new(
        cfg.link.addr.clone(),
        Duration::from_millis(cfg.link.timeout_ms),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        link,
        cfg.limits.clone(),
        cfg.cost.daily_cap_usd,
        rate,
    ));

    // ── Shared state (ephemeral, for the status api) ────────────────
    let shared = SystemState::shared(cfg.device_id.clone());
    shared.write().await.record_system("hub started".to_string());

    // ── Notifications ───────────────────────────────────────────────
    let notifier = match &cfg.mqtt {
        Some(mqtt) => {
            let (notifier, _handle) = Notifier::connect(mqtt, &cfg.device_id, Arc::clone(&shared));
            notifier
        }
        None => {
            info!("no [mqtt] section, cycle reports stay local");
            Notifier::disabled(cfg.device_id.clone())
        }
    };

    // ── Advisor ─────────────────────────────────────────────────────
    let advisor = AnyAdvisor::from_config(&cfg.advisor);
    if matches!(advisor, AnyAdvisor::Offline(_)) {
        warn!("no advisor command configured, every cycle uses fallback rules");
    }

    // ── Web server ──────────────────────────────────────────────────
    let web_state = AppState {
        shared: Arc::clone(&shared),
        dispatcher: Arc::clone(&dispatcher),
        db: db.clone(),
        control: cfg.control.clone(),
    };
    let port = cfg.web.port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, port).await {
            error!("web server stopped: {e:#}");
        }
    });

    // ── Scheduler ───────────────────────────────────────────────────
    let interval = Duration::from_secs(cfg.schedule.check_interval_min * 60);
    let startup_delay = Duration::from_secs(cfg.schedule.startup_delay_sec);
    let cycle = CheckCycle {
        cfg: Arc::clone(&cfg),
        dispatcher,
        advisor,
        db,
        shared,
        notifier,
    };

    tokio::select! {
        _ = scheduler::run(cycle, interval, startup_delay) => {}
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("shutdown requested");
        }
    }
    Ok(())
}
