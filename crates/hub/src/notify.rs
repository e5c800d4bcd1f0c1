//! Cycle reports out over MQTT. Without a broker configured, publishing is a
//! no-op and the hub runs the same.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::MqttConfig;
use crate::cycle::CycleReport;
use crate::decision::Urgency;
use crate::state::SharedState;

pub fn cycle_topic(device_id: &str) -> String {
    format!("plantops/{device_id}/cycle")
}

pub fn alert_topic(device_id: &str) -> String {
    format!("plantops/{device_id}/alert")
}

/// Whether a report also goes to the alert topic.
pub fn needs_alert(report: &CycleReport) -> bool {
    report.notify_human || report.urgency >= Urgency::Attention || report.failure.is_some()
}

#[derive(Clone)]
pub struct Notifier {
    client: Option<AsyncClient>,
    device_id: String,
}

impl Notifier {
    pub fn disabled(device_id: impl Into<String>) -> Self {
        Self {
            client: None,
            device_id: device_id.into(),
        }
    }

    /// Connect and spawn the event loop that keeps the session alive.
    pub fn connect(cfg: &MqttConfig, device_id: &str, shared: SharedState) -> (Self, JoinHandle<()>) {
        let client_id = cfg
            .client_id
            .clone()
            .unwrap_or_else(|| format!("plantops-hub-{device_id}"));
        let mut options = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 20);
        let host = cfg.host.clone();

        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(%host, "mqtt connected");
                        let mut st = shared.write().await;
                        st.mqtt_connected = true;
                        st.record_system("mqtt connected".to_string());
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("mqtt disconnected");
                        let mut st = shared.write().await;
                        st.mqtt_connected = false;
                        st.record_system("mqtt disconnected".to_string());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("mqtt error: {e}. reconnecting...");
                        let mut st = shared.write().await;
                        st.mqtt_connected = false;
                        st.record_error(format!("mqtt error: {e}"));
                        drop(st);

                        sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        (
            Self {
                client: Some(client),
                device_id: device_id.to_string(),
            },
            handle,
        )
    }

    /// Best effort: a broker outage never fails a cycle.
    pub async fn publish_cycle(&self, report: &CycleReport) {
        let Some(client) = &self.client else {
            return;
        };
        let payload = match serde_json::to_vec(report) {
            Ok(p) => p,
            Err(e) => {
                error!("cycle report serialization failed: {e}");
                return;
            }
        };

        if needs_alert(report) {
            if let Err(e) = client
                .publish(alert_topic(&self.device_id), QoS::AtLeastOnce, false, payload.clone())
                .await
            {
                warn!("alert publish failed: {e}");
            }
        }
        if let Err(e) = client
            .publish(cycle_topic(&self.device_id), QoS::AtLeastOnce, false, payload)
            .await
        {
            warn!("cycle publish failed: {e}");
        }
    }
}
