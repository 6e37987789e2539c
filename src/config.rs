use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::meter::DeviceFamily;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FamilyArg {
    /// Detect the family at the probe registers
    Auto,
    /// Compact meter with fixed-point registers
    Fixed,
    /// Meter with IEEE-754 float registers
    Float,
}

impl FamilyArg {
    pub fn forced(self) -> Option<DeviceFamily> {
        match self {
            FamilyArg::Auto => None,
            FamilyArg::Fixed => Some(DeviceFamily::Fixed),
            FamilyArg::Float => Some(DeviceFamily::Float),
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "powerlogger",
    about = "Modbus power meter poller publishing aggregated frames over MQTT"
)]
pub struct Config {
    /// MQTT broker hostname
    #[arg(long, default_value = "127.0.0.1")]
    pub mqtt_host: String,

    /// MQTT broker port
    #[arg(long, default_value_t = 1883)]
    pub mqtt_port: u16,

    /// MQTT client ID
    #[arg(long, default_value = "powerlogger")]
    pub mqtt_client_id: String,

    #[arg(long)]
    pub mqtt_username: Option<String>,

    #[arg(long)]
    pub mqtt_password: Option<String>,

    /// JSON file with broker, port, username and password; overrides the
    /// MQTT options above
    #[arg(long)]
    pub credentials: Option<PathBuf>,

    /// Topic for binary data frames
    #[arg(long, default_value = "ET/powerlogger/data")]
    pub data_topic: String,

    /// Topic for JSON log messages
    #[arg(long, default_value = "ET/powerlogger/log")]
    pub log_topic: String,

    /// Topic accepting `voltage` / `current` min/max reset commands
    #[arg(long, default_value = "ET/powerlogger/reset")]
    pub reset_topic: String,

    /// Topic accepting `{"sendInterval": <secs>}` config messages
    #[arg(long, default_value = "ET/powerlogger/config")]
    pub config_topic: String,

    /// Serial port path for Modbus RTU (if neither this nor --tcp is given,
    /// probes all /dev/ttyUSB* ports)
    #[arg(long, conflicts_with = "tcp")]
    pub port: Option<String>,

    /// Serial baud rate
    #[arg(long, default_value_t = 19200)]
    pub baud: u32,

    /// Modbus TCP endpoint, host:port
    #[arg(long)]
    pub tcp: Option<SocketAddr>,

    /// Modbus unit IDs to poll (repeatable)
    #[arg(long = "unit", default_values_t = vec![1u8])]
    pub units: Vec<u8>,

    /// Meter register map
    #[arg(long, value_enum, default_value_t = FamilyArg::Auto)]
    pub family: FamilyArg,

    /// Interval between samples in milliseconds
    #[arg(long, default_value_t = 200)]
    pub sample_interval_ms: u64,

    /// Interval between published frames in seconds
    #[arg(long, default_value_t = 10)]
    pub publish_interval_secs: u64,

    /// Modbus response timeout in milliseconds
    #[arg(long, default_value_t = 300)]
    pub timeout_ms: u64,

    /// Delay between reconnect attempts in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub reconnect_delay_ms: u64,

    /// Interval between status reports in seconds
    #[arg(long, default_value_t = 30)]
    pub status_interval_secs: u64,
}

impl Config {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    /// Reject settings the polling loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sample_interval_ms == 0 || self.publish_interval_secs == 0 {
            bail!("Sample and publish intervals must be non-zero");
        }
        if self.units.is_empty() {
            bail!("At least one --unit is required");
        }
        Ok(())
    }

    /// Fold a credentials file into the MQTT settings.
    pub fn apply_credentials(&mut self, creds: Credentials) {
        self.mqtt_host = creds.broker;
        self.mqtt_port = creds.port;
        self.mqtt_username = creds.username;
        self.mqtt_password = creds.password;
    }
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct Credentials {
    pub broker: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid credentials file {}", path.display()))
    }
}
