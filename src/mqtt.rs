use crate::errors::{Result, EdgeError};
use crate::events::{EdgeEvent, EventBus};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;

#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamStatus {
    pub camera_id: i64,
    pub endpoint: String,
    pub mode: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EdgeStatus {
    pub uptime_secs: u64,
    pub connected_cameras: Vec<String>,
    pub detected_cameras: usize,
    pub streams: Vec<StreamStatus>,
    pub pending_recognitions: usize,
}

/// Administrative request received on `{base_topic}/commands`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum AdminCommand {
    AttachLane { camera_id: i64, lane_name: String },
    AttachKiosk { camera_id: i64, kiosk_id: i64 },
    Detach { camera_id: i64 },
    DeleteClient { client_id: i64 },
    SetConfig { key: String, value: String },
    Probe,
    Snapshot,
}

fn qos_from(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
    eventloop: EventLoop,
    config: MqttConfig,
    status: Arc<RwLock<EdgeStatus>>,
    start_time: std::time::Instant,
}

impl MqttPublisher {
    pub async fn new(config: MqttConfig) -> Result<Self> {
        let url = url::Url::parse(&config.broker_url)
            .map_err(|e| EdgeError::config(format!("Invalid MQTT broker URL '{}': {}", config.broker_url, e)))?;

        let host = url.host_str()
            .ok_or_else(|| EdgeError::config(format!("No host found in MQTT broker URL: {}", config.broker_url)))?;

        let port = url.port().unwrap_or(1883);

        info!("Connecting to MQTT broker at {}:{}", host, port);

        let mut mqtt_options = MqttOptions::new(
            &config.client_id,
            host,
            port,
        );

        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));

        let max_packet_size = config.max_packet_size.unwrap_or(1024 * 1024);
        mqtt_options.set_max_packet_size(max_packet_size, max_packet_size);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);

        Ok(Self {
            client,
            eventloop,
            config,
            status: Arc::new(RwLock::new(EdgeStatus::default())),
            start_time: std::time::Instant::now(),
        })
    }

    /// Spawns the broker event loop, the event bridge and the periodic status
    /// publisher. Commands arriving on `{base_topic}/commands` come out of the
    /// returned receiver.
    pub async fn start(mut self, bus: &EventBus) -> Result<(MqttHandle, mpsc::Receiver<AdminCommand>)> {
        let client = self.client.clone();
        let config = self.config.clone();
        let status = self.status.clone();
        let start_time = self.start_time;

        let command_topic = format!("{}/commands", config.base_topic);
        let (command_tx, command_rx) = mpsc::channel(32);
        let loop_client = client.clone();
        let loop_qos = qos_from(config.qos);

        tokio::spawn(async move {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                        // the session is not persistent, subscribe on every connect
                        if let Err(e) = loop_client.try_subscribe(command_topic.as_str(), loop_qos) {
                            error!("Failed to subscribe to {}: {}", command_topic, e);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == command_topic => {
                        match serde_json::from_slice::<AdminCommand>(&publish.payload) {
                            Ok(command) => {
                                debug!("MQTT command received: {:?}", command);
                                if command_tx.try_send(command).is_err() {
                                    warn!("Command queue full, MQTT command dropped");
                                }
                            }
                            Err(e) => warn!("Ignoring malformed MQTT command: {}", e),
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("Disconnected from MQTT broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        let bridge_client = client.clone();
        let bridge_config = config.clone();
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => publish_event(&bridge_client, &bridge_config, &event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("MQTT bridge lagged, {} events dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Event bus closed, stopping MQTT bridge");
                        break;
                    }
                }
            }
        });

        let status_client = client.clone();
        let status_config = config.clone();
        let status_clone = status.clone();
        tokio::spawn(async move {
            let mut publish_interval = interval(Duration::from_secs(status_config.publish_interval_secs.max(1)));

            loop {
                publish_interval.tick().await;

                let mut snapshot = status_clone.read().await.clone();
                snapshot.uptime_secs = start_time.elapsed().as_secs();

                if let Ok(payload) = serde_json::to_string(&snapshot) {
                    let topic = format!("{}/status", status_config.base_topic);
                    if let Err(e) = status_client.publish(
                        topic,
                        qos_from(status_config.qos),
                        false,
                        payload.as_bytes(),
                    ).await {
                        error!("Failed to publish edge status: {}", e);
                    }
                }
            }
        });

        let handle = MqttHandle {
            status,
            client,
            reply_topic: format!("{}/commands/result", config.base_topic),
            qos: qos_from(config.qos),
        };
        Ok((handle, command_rx))
    }
}

async fn publish_event(client: &AsyncClient, config: &MqttConfig, event: &EdgeEvent) {
    let topic = format!("{}/events/{}", config.base_topic, event.topic());
    match serde_json::to_string(event) {
        Ok(payload) => {
            // Events are never retained
            if let Err(e) = client.publish(topic, qos_from(config.qos), false, payload.as_bytes()).await {
                error!("Failed to publish {} event: {}", event.topic(), e);
            }
        }
        Err(e) => error!("Failed to serialize {} event: {}", event.topic(), e),
    }
}

#[derive(Clone)]
pub struct MqttHandle {
    status: Arc<RwLock<EdgeStatus>>,
    client: AsyncClient,
    reply_topic: String,
    qos: QoS,
}

impl MqttHandle {
    /// Stores the snapshot; publishing happens on the configured interval
    pub async fn update_status(&self, status: EdgeStatus) {
        *self.status.write().await = status;
    }

    pub async fn publish_reply(&self, reply: &serde_json::Value) {
        let payload = reply.to_string();
        if let Err(e) = self.client.publish(self.reply_topic.as_str(), self.qos, false, payload.as_bytes()).await {
            error!("Failed to publish command result: {}", e);
        }
    }
}
