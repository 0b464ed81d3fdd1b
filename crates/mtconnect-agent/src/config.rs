//! Agent configuration.

use anyhow::{Context, Result};
use mtconnect_core::asset::DEFAULT_ASSET_CAPACITY;
use mtconnect_core::buffer::DEFAULT_BUFFER_CAPACITY;
use mtconnect_core::identity::IDENTITY_FILENAME;
use mtconnect_mqtt::MqttClientConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Observation buffer capacity
    pub buffer_size: usize,

    /// Asset store capacity
    pub asset_buffer_size: usize,

    /// Identity file path
    pub identity_path: PathBuf,

    /// Asset archive configuration
    pub archive: ArchiveConfig,

    /// MQTT transport, if a broker is configured
    pub mqtt: Option<MqttClientConfig>,

    /// Interval between router statistics log lines
    pub stats_interval: Duration,
}

/// Asset archive configuration.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// `SQLite` database path; `None` keeps assets in memory only
    pub path: Option<PathBuf>,

    /// Interval between drains of the asset store
    pub interval: Duration,

    /// Maximum assets moved per drain
    pub batch: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_CAPACITY,
            asset_buffer_size: DEFAULT_ASSET_CAPACITY,
            identity_path: PathBuf::from(IDENTITY_FILENAME),
            archive: ArchiveConfig {
                path: None,
                interval: Duration::from_secs(60),
                batch: 256,
            },
            mqtt: None,
            stats_interval: Duration::from_secs(60),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MTCONNECT_BUFFER_SIZE`: Observation buffer capacity
    /// - `MTCONNECT_ASSET_BUFFER_SIZE`: Asset store capacity
    /// - `MTCONNECT_IDENTITY_PATH`: Identity file path
    /// - `MTCONNECT_ARCHIVE_PATH`: `SQLite` asset archive path
    /// - `MTCONNECT_ARCHIVE_INTERVAL_SECS`: Asset drain interval
    /// - `MTCONNECT_ARCHIVE_BATCH`: Assets moved per drain
    /// - `MTCONNECT_MQTT_BROKER`: MQTT broker URL (enables the transport)
    /// - `MTCONNECT_MQTT_CLIENT_ID`, `MTCONNECT_MQTT_USERNAME`,
    ///   `MTCONNECT_MQTT_PASSWORD`: Session identity and credentials
    /// - `MTCONNECT_MQTT_TOPICS`: Comma-separated topic filters
    /// - `MTCONNECT_MQTT_CA_CERT`, `MTCONNECT_MQTT_CLIENT_CERT`,
    ///   `MTCONNECT_MQTT_CLIENT_KEY`: PEM files
    /// - `MTCONNECT_MQTT_TLS`: Force TLS
    /// - `MTCONNECT_MQTT_FORMAT`: `json` or `cbor`
    /// - `MTCONNECT_STATS_INTERVAL_SECS`: Statistics log interval
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(size) = parse_var(&lookup, "MTCONNECT_BUFFER_SIZE")? {
            config.buffer_size = size;
        }

        if let Some(size) = parse_var(&lookup, "MTCONNECT_ASSET_BUFFER_SIZE")? {
            config.asset_buffer_size = size;
        }

        if let Some(path) = lookup("MTCONNECT_IDENTITY_PATH") {
            config.identity_path = PathBuf::from(path);
        }

        if let Some(path) = lookup("MTCONNECT_ARCHIVE_PATH") {
            config.archive.path = Some(PathBuf::from(path));
        }

        if let Some(secs) = parse_var(&lookup, "MTCONNECT_ARCHIVE_INTERVAL_SECS")? {
            config.archive.interval = Duration::from_secs(secs);
        }

        if let Some(batch) = parse_var(&lookup, "MTCONNECT_ARCHIVE_BATCH")? {
            config.archive.batch = batch;
        }

        if let Some(secs) = parse_var(&lookup, "MTCONNECT_STATS_INTERVAL_SECS")? {
            config.stats_interval = Duration::from_secs(secs);
        }

        if let Some(broker) = lookup("MTCONNECT_MQTT_BROKER") {
            let mut mqtt = MqttClientConfig {
                broker,
                ..MqttClientConfig::default()
            };

            if let Some(client_id) = lookup("MTCONNECT_MQTT_CLIENT_ID") {
                mqtt.client_id = client_id;
            }
            mqtt.username = lookup("MTCONNECT_MQTT_USERNAME");
            mqtt.password = lookup("MTCONNECT_MQTT_PASSWORD");
            mqtt.ca_cert = lookup("MTCONNECT_MQTT_CA_CERT").map(PathBuf::from);
            mqtt.client_cert = lookup("MTCONNECT_MQTT_CLIENT_CERT").map(PathBuf::from);
            mqtt.client_key = lookup("MTCONNECT_MQTT_CLIENT_KEY").map(PathBuf::from);

            if let Some(topics) = lookup("MTCONNECT_MQTT_TOPICS") {
                mqtt.topics = topics
                    .split(',')
                    .map(str::trim)
                    .filter(|topic| !topic.is_empty())
                    .map(str::to_string)
                    .collect();
            }

            if let Some(tls) = lookup("MTCONNECT_MQTT_TLS") {
                mqtt.use_tls = parse_flag(&tls).context("Invalid MTCONNECT_MQTT_TLS")?;
            }

            if let Some(format) = parse_var(&lookup, "MTCONNECT_MQTT_FORMAT")? {
                mqtt.format = format;
            }

            config.mqtt = Some(mqtt);
        }

        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, name: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid {name}: {e}"))
        })
        .transpose()
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got '{other}'"),
    }
}
