use anyhow::Result;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rumqttc::{Client, Event, LastWill, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("MQTT client error: {0}")]
    Client(String),
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outbound side of the broker connection.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError>;

    /// Best-effort JSON publish for diagnostics.
    fn publish_json(&self, topic: &str, value: &serde_json::Value) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(value)?;
        self.publish(topic, payload, QoS::AtMostOnce)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Voltage,
    Current,
}

impl ResetKind {
    /// Command word written to the meter's reset register.
    pub fn command_word(self) -> u16 {
        match self {
            ResetKind::Voltage => 0x14,
            ResetKind::Current => 0x0A,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ResetKind::Voltage => "voltage",
            ResetKind::Current => "current",
        }
    }
}

/// Commands received on the gateway's inbound topics.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Clear the meter's own min/max registers.
    Reset(ResetKind),
    /// New publish period for every polling loop.
    SendInterval(Duration),
    /// A payload on a command topic that could not be understood.
    Invalid(String),
}

#[derive(Deserialize)]
struct RemoteConfig {
    #[serde(rename = "sendInterval")]
    send_interval: u64,
}

#[derive(Debug, Clone)]
pub struct CommandTopics {
    pub reset: String,
    pub config: String,
}

impl CommandTopics {
    pub fn all(&self) -> [&str; 2] {
        [&self.reset, &self.config]
    }

    /// Interpret an inbound publish. Messages on other topics yield `None`.
    pub fn parse(&self, topic: &str, payload: &[u8]) -> Option<Command> {
        let text = String::from_utf8_lossy(payload);
        if topic == self.reset {
            Some(match text.trim() {
                "voltage" => Command::Reset(ResetKind::Voltage),
                "current" => Command::Reset(ResetKind::Current),
                other => Command::Invalid(format!("Unknown reset target `{}`", other)),
            })
        } else if topic == self.config {
            Some(match serde_json::from_str::<RemoteConfig>(&text) {
                Ok(cfg) if cfg.send_interval > 0 => {
                    Command::SendInterval(Duration::from_secs(cfg.send_interval))
                }
                Ok(_) => Command::Invalid("Received config with a zero sendInterval".into()),
                Err(e) => Command::Invalid(format!("Received invalid config message: {}", e)),
            })
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub log_topic: String,
    pub commands: CommandTopics,
    pub reconnect_delay: Duration,
}

/// Long-lived broker connection. A background thread drives the rumqttc
/// event loop, resubscribes after every (re)connect and forwards commands.
pub struct MqttPublisher {
    client: Client,
}

impl MqttPublisher {
    pub fn connect(settings: MqttSettings, commands: Sender<Command>) -> Result<Self> {
        let mut opts = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        opts.set_keep_alive(Duration::from_secs(60));
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            opts.set_credentials(user, pass);
        }
        opts.set_last_will(LastWill::new(
            &settings.log_topic,
            "Disconnected",
            QoS::AtMostOnce,
            true,
        ));

        let (client, mut connection) = Client::new(opts, 64);
        let events = client.clone();

        thread::Builder::new()
            .name("mqtt-events".into())
            .spawn(move || {
                for event in connection.iter() {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("Connected to {}:{}", settings.host, settings.port);
                            for topic in settings.commands.all() {
                                if let Err(e) = events.try_subscribe(topic, QoS::AtMostOnce) {
                                    warn!("Failed to subscribe to {}: {}", topic, e);
                                }
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(p))) => {
                            if let Some(cmd) = settings.commands.parse(&p.topic, &p.payload) {
                                if commands.send(cmd).is_err() {
                                    debug!("Command receiver gone, dropping message");
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("MQTT connection error: {}", e);
                            thread::sleep(settings.reconnect_delay);
                        }
                    }
                }
            })?;

        Ok(Self { client })
    }
}

impl Publisher for MqttPublisher {
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
        self.client
            .try_publish(topic, qos, false, payload)
            .map_err(|e| PublishError::Client(e.to_string()))
    }
}

#[derive(Serialize)]
struct LogMessage<'a> {
    timestamp: f64,
    log: &'a str,
}

/// Operator-facing messages, mirrored to the log topic. A message equal to
/// the previous one is not repeated.
pub struct LogChannel {
    publisher: Arc<dyn Publisher>,
    topic: String,
    last: Mutex<Option<String>>,
}

impl LogChannel {
    pub fn new(publisher: Arc<dyn Publisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            last: Mutex::new(None),
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        {
            let mut last = self.last.lock();
            if last.as_deref() == Some(message.as_str()) {
                return;
            }
            *last = Some(message.clone());
        }
        info!("{}", message);

        let timestamp = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let body = LogMessage {
            timestamp,
            log: &message,
        };
        let sent = serde_json::to_value(&body)
            .map_err(PublishError::from)
            .and_then(|value| self.publisher.publish_json(&self.topic, &value));
        if let Err(e) = sent {
            warn!("Failed to send log message to {}: {}", self.topic, e);
        }
    }
}
