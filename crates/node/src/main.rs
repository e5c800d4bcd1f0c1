use std::time::Duration;

use anyhow::{Context, Result};
use embedded_hal::delay::DelayNs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use plantops_node::config::NodeConfig;
use plantops_node::protocol::INPUT_GAP;
use plantops_node::sensors::{AnalogFrontEnd, ClimateSensor};
use plantops_node::relay::RelayDriver;
use plantops_node::tick::{Clock, SystemClock};
use plantops_node::Controller;

#[cfg(not(any(feature = "sim", feature = "hw")))]
compile_error!("enable at least one of the `sim` or `hw` features");

/// Bytes buffered from the link between two loop iterations. The line reader
/// caps individual lines; this only bounds a flood.
const INBOX_CAP: usize = 4096;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = NodeConfig::from_env()?;
    let clock = SystemClock::with_offset(cfg.tick_offset_ms);

    let listener = TcpListener::bind(("0.0.0.0", cfg.link_port))
        .await
        .with_context(|| format!("bind link port {}", cfg.link_port))?;
    info!(port = cfg.link_port, loop_ms = cfg.loop_ms, "node listening for hub link");

    run(listener, &cfg, clock).await
}

#[cfg(feature = "hw")]
async fn run(listener: TcpListener, cfg: &NodeConfig, clock: SystemClock) -> Result<()> {
    use plantops_node::hw::{PiAnalog, PiI2c};
    use plantops_node::relay::GpioRelays;
    use plantops_node::scd4x::Scd4x;
    use plantops_node::tick::StdDelay;

    const I2C_BUS: u8 = 1;

    let mut climate = Scd4x::new(PiI2c::open(I2C_BUS)?, StdDelay);
    // The sensor may still be measuring from a previous run.
    let _ = climate.stop_periodic();
    StdDelay.delay_ms(cfg.controller.settle_ms);
    climate
        .start_periodic()
        .map_err(|e| anyhow::anyhow!("scd4x start failed: {e}"))?;

    let analog = PiAnalog::new(
        I2C_BUS,
        cfg.adc_address,
        cfg.light_channel,
        cfg.soil_channel,
        cfg.water_level_pin,
        cfg.water_level_active_high,
    )?;
    let relays = GpioRelays::new(cfg.relay_pins, cfg.relay_active_low)?;

    let ctrl = Controller::new(cfg.controller, climate, analog, relays, StdDelay, clock.now());
    serve(listener, ctrl, clock, cfg.loop_ms, |_| {}).await
}

#[cfg(all(feature = "sim", not(feature = "hw")))]
async fn run(listener: TcpListener, cfg: &NodeConfig, clock: SystemClock) -> Result<()> {
    use plantops_node::relay::MockRelays;
    use plantops_node::sim::{Scenario, SimAnalog, SimClimate};
    use plantops_node::tick::StdDelay;

    const MEASUREMENT_PERIOD_MS: u64 = 5_000;

    let scenario = Scenario::from_str_lossy(&cfg.sim_scenario);
    info!(%scenario, "simulation mode, no hardware");

    let polls = (MEASUREMENT_PERIOD_MS / cfg.loop_ms).max(1) as u32;
    let climate = SimClimate::new(scenario, polls);
    let analog = SimAnalog::new(scenario, 600.0);
    let relays = MockRelays::new(cfg.relay_active_low);

    let ctrl = Controller::new(cfg.controller, climate, analog, relays, StdDelay, clock.now());
    serve(listener, ctrl, clock, cfg.loop_ms, |ctrl| {
        let state = ctrl.actuators();
        ctrl.climate_mut().set_heater(state.heater);
        ctrl.climate_mut().set_circulation(state.circulation);
        ctrl.analog_mut().set_pumping(state.water);
    })
    .await
}

/// Drive the controller at a fixed cadence and shuttle bytes to and from the
/// single link client. A new connection replaces the old one.
async fn serve<C, A, R, D>(
    listener: TcpListener,
    mut ctrl: Controller<C, A, R, D>,
    clock: SystemClock,
    loop_ms: u64,
    mut after_step: impl FnMut(&mut Controller<C, A, R, D>),
) -> Result<()>
where
    C: ClimateSensor,
    A: AnalogFrontEnd,
    R: RelayDriver,
    D: DelayNs,
{
    let mut ticker = tokio::time::interval(Duration::from_millis(loop_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut client: Option<TcpStream> = None;
    let mut inbox: Vec<u8> = Vec::with_capacity(INBOX_CAP);
    let mut outbox: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 256];

    // Created once so a signal arriving mid-iteration is not lost.
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                outbox.clear();
                ctrl.step(clock.now(), &inbox, &mut outbox)?;
                inbox.clear();
                after_step(&mut ctrl);

                if !outbox.is_empty() {
                    if let Some(stream) = client.as_mut() {
                        if let Err(e) = stream.write_all(&outbox).await {
                            warn!("link write failed, dropping client: {e}");
                            client = None;
                        }
                    }
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if client.is_some() {
                        info!(%peer, "link client replaced");
                    } else {
                        info!(%peer, "link client connected");
                    }
                    let _ = stream.set_nodelay(true);
                    client = Some(stream);
                    inbox.clear();
                }
                Err(e) => warn!("accept failed: {e}"),
            },
            read = read_some(&mut client, &mut chunk) => match read {
                Ok(0) => {
                    info!("link client disconnected");
                    client = None;
                }
                Ok(n) => {
                    if inbox.len() + n > INBOX_CAP {
                        warn!(kind = "ProtocolParseError", "link inbox full, input dropped");
                        if inbox.last() != Some(&INPUT_GAP) {
                            inbox.push(INPUT_GAP);
                        }
                    } else {
                        inbox.extend_from_slice(&chunk[..n]);
                    }
                }
                Err(e) => {
                    warn!("link read failed, dropping client: {e}");
                    client = None;
                }
            },
            res = &mut shutdown => {
                if let Err(e) = res {
                    warn!("signal handler failed, shutting down: {e}");
                }
                info!("shutdown requested");
                ctrl.shutdown();
                return Ok(());
            }
        }
    }
}

async fn read_some(client: &mut Option<TcpStream>, buf: &mut [u8]) -> std::io::Result<usize> {
    match client {
        Some(stream) => stream.read(buf).await,
        None => std::future::pending().await,
    }
}
