//! MQTT transport client.

use crate::router::{ConnectionEvent, MessageRouter};
use mtconnect_core::{Asset, Device, Observation};
use mtconnect_proto::messages::{AssetPayload, DevicePayload, ObservationPayload};
use mtconnect_proto::{MessageError, PayloadFormat, TopicScheme};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use url::Url;

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

/// Configuration for the MQTT client.
#[derive(Debug, Clone)]
pub struct MqttClientConfig {
    /// Broker URL (e.g., <tcp://localhost:1883>, <mqtts://broker:8883>)
    pub broker: String,
    /// Client ID for the MQTT session
    pub client_id: String,
    /// Username
    pub username: Option<String>,
    /// Password (used with `username`)
    pub password: Option<String>,
    /// PEM CA bundle
    pub ca_cert: Option<PathBuf>,
    /// PEM client certificate
    pub client_cert: Option<PathBuf>,
    /// PEM client private key
    pub client_key: Option<PathBuf>,
    /// Force TLS even for a `tcp://` broker URL
    pub use_tls: bool,
    /// Topic filters to subscribe to
    pub topics: Vec<String>,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// Bound on the CONNACK wait plus queuing the subscriptions
    pub connect_timeout: Duration,
    /// Payload encoding for publishes
    pub format: PayloadFormat,
    /// Topic scheme for publishes
    pub scheme: TopicScheme,
}

impl Default for MqttClientConfig {
    fn default() -> Self {
        let scheme = TopicScheme::default();
        Self {
            broker: "tcp://localhost:1883".to_string(),
            client_id: "mtconnect-agent".to_string(),
            username: None,
            password: None,
            ca_cert: None,
            client_cert: None,
            client_key: None,
            use_tls: false,
            topics: vec![scheme.wildcard()],
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            format: PayloadFormat::default(),
            scheme,
        }
    }
}

/// Broker host, port, and whether the URL scheme asked for TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// `ssl://` or `mqtts://`
    pub tls: bool,
}

/// Parse a broker URL or `host[:port]`.
///
/// # Errors
///
/// Returns error for unsupported schemes, missing hosts, or bad ports.
pub fn parse_mqtt_url(input: &str) -> Result<BrokerAddress, ClientError> {
    if input.contains("://") {
        let url = Url::parse(input).map_err(|e| ClientError::InvalidUrl(format!("{input}: {e}")))?;

        let tls = match url.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "mqtts" => true,
            scheme => {
                return Err(ClientError::InvalidUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| ClientError::InvalidUrl(format!("{input}: missing host")))?;
        let port = url
            .port()
            .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });

        return Ok(BrokerAddress {
            host: host.to_string(),
            port,
            tls,
        });
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ClientError::InvalidUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => DEFAULT_PORT,
        Some(port) => port
            .parse()
            .map_err(|_| ClientError::InvalidUrl(format!("{input}: invalid port '{port}'")))?,
    };
    if parts.next().is_some() {
        return Err(ClientError::InvalidUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok(BrokerAddress {
        host: host.to_string(),
        port,
        tls: false,
    })
}

async fn read_pem(path: &PathBuf, what: &str) -> Result<Vec<u8>, ClientError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| ClientError::Tls(format!("{what} {}: {e}", path.display())))
}

/// Build the TLS transport, if any.
///
/// Certificates are always PEM files read from disk.
async fn transport(
    config: &MqttClientConfig,
    address: &BrokerAddress,
) -> Result<Option<Transport>, ClientError> {
    let tls = config.use_tls || address.tls || config.ca_cert.is_some();
    if !tls {
        return Ok(None);
    }

    let client_auth = match (&config.client_cert, &config.client_key) {
        (Some(cert), Some(key)) => Some((
            read_pem(cert, "client certificate").await?,
            read_pem(key, "client key").await?,
        )),
        (None, None) => None,
        _ => {
            return Err(ClientError::Tls(
                "client certificate and client key must be configured together".to_string(),
            ))
        }
    };

    match &config.ca_cert {
        Some(ca) => Ok(Some(Transport::tls_with_config(TlsConfiguration::Simple {
            ca: read_pem(ca, "CA bundle").await?,
            alpn: None,
            client_auth,
        }))),
        None if client_auth.is_some() => Err(ClientError::Tls(
            "client certificate requires a CA bundle".to_string(),
        )),
        None => Ok(Some(Transport::tls_with_default_config())),
    }
}

async fn mqtt_options(config: &MqttClientConfig) -> Result<MqttOptions, ClientError> {
    let address = parse_mqtt_url(&config.broker)?;

    let transport = transport(config, &address).await?;
    let mut options = MqttOptions::new(&config.client_id, address.host, address.port);
    options.set_keep_alive(config.keep_alive);
    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.clone().unwrap_or_default());
    }
    if let Some(transport) = transport {
        options.set_transport(transport);
    }
    Ok(options)
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), ClientError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(ClientError::Connection(e.to_string())),
        }
    }
}

/// Error for a SUBACK that refused any of its topic filters.
fn refused_subscription(ack: &SubAck) -> Option<ClientError> {
    let refused = ack
        .return_codes
        .iter()
        .filter(|code| matches!(code, SubscribeReasonCode::Failure))
        .count();

    (refused > 0).then(|| {
        ClientError::Subscribe(format!(
            "broker refused {refused} of {} topic filters (packet {})",
            ack.return_codes.len(),
            ack.pkid
        ))
    })
}

/// Connected MQTT session feeding a [`MessageRouter`].
pub struct MqttClient {
    client: AsyncClient,
    config: MqttClientConfig,
    router: Arc<MessageRouter>,
    connected: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("broker", &self.config.broker)
            .field("client_id", &self.config.client_id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl MqttClient {
    /// Connect, subscribe, and start routing inbound messages.
    ///
    /// Waits for the broker's CONNACK and queues the subscriptions within
    /// `connect_timeout`. Failures
    /// are returned and also reported to the router's connection listeners.
    /// There is no automatic retry.
    ///
    /// # Errors
    ///
    /// Returns error if the URL or TLS material is invalid, or the broker
    /// does not accept the session in time.
    pub async fn connect(
        config: MqttClientConfig,
        router: Arc<MessageRouter>,
    ) -> Result<Self, ClientError> {
        match Self::establish(config, Arc::clone(&router)).await {
            Ok(client) => {
                router.notify(&ConnectionEvent::Connected);
                Ok(client)
            }
            Err(e) => {
                tracing::error!(error = %e, "MQTT connect failed");
                router.notify(&ConnectionEvent::Error(e.clone()));
                Err(e)
            }
        }
    }

    async fn establish(
        config: MqttClientConfig,
        router: Arc<MessageRouter>,
    ) -> Result<Self, ClientError> {
        let options = mqtt_options(&config).await?;
        let (client, mut eventloop) = AsyncClient::new(options, 100);
        let deadline = tokio::time::Instant::now() + config.connect_timeout;
        let timeout = config.connect_timeout;

        tokio::time::timeout_at(deadline, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| ClientError::Timeout(timeout))??;

        tracing::info!(broker = %config.broker, client_id = %config.client_id, "Connected to MQTT broker");

        let connected = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(run_eventloop(
            eventloop,
            Arc::clone(&router),
            Arc::clone(&connected),
        ));

        // Dropping on failure aborts the event loop task.
        let session = Self {
            client,
            config,
            router,
            connected,
            task: Mutex::new(Some(task)),
        };

        tokio::time::timeout_at(deadline, session.subscribe_all())
            .await
            .map_err(|_| ClientError::Timeout(timeout))??;

        Ok(session)
    }

    /// Queue a subscription per configured topic filter.
    ///
    /// The event loop must already be running to drain the request queue.
    async fn subscribe_all(&self) -> Result<(), ClientError> {
        for topic in &self.config.topics {
            tracing::info!(topic, "Subscribing to MTConnect topics");
            self.client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| ClientError::Subscribe(e.to_string()))?;
        }
        Ok(())
    }

    /// Whether the session is believed to be up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Router fed by this client.
    #[must_use]
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Unsubscribe, close the session, and stop the event loop.
    ///
    /// Idempotent: calling it on a closed client does nothing.
    pub async fn disconnect(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if self.connected.swap(false, Ordering::SeqCst) {
            for topic in &self.config.topics {
                if let Err(e) = self.client.unsubscribe(topic).await {
                    tracing::debug!(topic, error = %e, "Unsubscribe not sent");
                }
            }
            if let Err(e) = self.client.disconnect().await {
                tracing::debug!(error = %e, "Disconnect not sent");
            }
            tracing::info!(broker = %self.config.broker, "Disconnected from MQTT broker");
            self.router.notify(&ConnectionEvent::Disconnected);
        }

        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.config.connect_timeout, task)
                .await
                .is_err()
            {
                abort.abort();
            }
        }
    }

    async fn publish(&self, topic: String, payload: Vec<u8>) -> Result<(), ClientError> {
        tracing::debug!(topic, payload_len = payload.len(), "Publishing");
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| ClientError::Publish(e.to_string()))
    }

    /// Publish a device definition.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or publishing fails.
    pub async fn publish_device(&self, device: &Device) -> Result<(), ClientError> {
        let payload = self.config.format.encode(&DevicePayload::from(device))?;
        self.publish(self.config.scheme.device(&device.uuid), payload)
            .await
    }

    /// Publish an observation; conditions go to their data item's
    /// conditions topic.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or publishing fails.
    pub async fn publish_observation(&self, observation: &Observation) -> Result<(), ClientError> {
        let topic = if observation.is_condition() {
            self.config
                .scheme
                .conditions(&observation.device_uuid, &observation.data_item_id)
        } else {
            self.config.scheme.observations(&observation.device_uuid)
        };
        let payload = self
            .config
            .format
            .encode(&ObservationPayload::from(observation))?;
        self.publish(topic, payload).await
    }

    /// Publish an asset on its owning device's topic.
    ///
    /// # Errors
    ///
    /// Returns error if the asset has no device, or encoding or publishing
    /// fails.
    pub async fn publish_asset(&self, asset: &Asset) -> Result<(), ClientError> {
        let device_uuid = asset
            .device_uuid
            .as_deref()
            .ok_or_else(|| ClientError::MissingDevice(asset.asset_id.clone()))?;
        let payload = self.config.format.encode(&AssetPayload::from(asset))?;
        self.publish(self.config.scheme.assets(device_uuid), payload)
            .await
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(task) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

async fn run_eventloop(
    mut eventloop: EventLoop,
    router: Arc<MessageRouter>,
    connected: Arc<AtomicBool>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let topic = publish.topic.clone();
                tracing::debug!(topic, payload_len = publish.payload.len(), "Received MQTT message");
                // Drops are counted and logged by the router.
                let _ = router.dispatch(&topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => match refused_subscription(&ack) {
                Some(e) => {
                    tracing::error!(error = %e, "Subscription refused");
                    router.notify(&ConnectionEvent::Error(e));
                }
                None => tracing::info!(pkid = ack.pkid, "Subscription acknowledged"),
            },
            Ok(Event::Incoming(Packet::Disconnect) | Event::Outgoing(Outgoing::Disconnect)) => {
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if connected.swap(false, Ordering::SeqCst) {
                    tracing::error!(error = %e, "MQTT session lost");
                    router.notify(&ConnectionEvent::Error(ClientError::Connection(
                        e.to_string(),
                    )));
                    router.notify(&ConnectionEvent::Disconnected);
                }
                break;
            }
        }
    }

    if connected.swap(false, Ordering::SeqCst) {
        router.notify(&ConnectionEvent::Disconnected);
    }
}

/// Errors that can occur with the MQTT client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// Invalid broker URL
    #[error("invalid MQTT URL: {0}")]
    InvalidUrl(String),
    /// TLS material missing or unreadable
    #[error("TLS configuration error: {0}")]
    Tls(String),
    /// Connection error
    #[error("connection error: {0}")]
    Connection(String),
    /// No CONNACK, or subscriptions not queued, within the connect timeout
    #[error("MQTT session not established within {0:?}")]
    Timeout(Duration),
    /// Subscription failed
    #[error("subscription error: {0}")]
    Subscribe(String),
    /// Publish failed
    #[error("publish error: {0}")]
    Publish(String),
    /// Payload encoding failed
    #[error(transparent)]
    Encode(#[from] MessageError),
    /// Asset has no owning device to derive a topic from
    #[error("asset {0} has no device uuid")]
    MissingDevice(String),
}
