//! Agent runtime orchestration.

use crate::config::AgentConfig;
use crate::persistence::AssetArchive;
use anyhow::{Context, Result};
use mtconnect_core::{
    AgentIdentity, Asset, AssetStore, DataItem, DataItemCategory, Device, DeviceRegistry,
    Observation, ObservationBuffer,
};
use mtconnect_mqtt::{ConnectionEvent, HandlerGuard, MessageRouter, MqttClient};
use mtconnect_proto::{PayloadFormat, TopicScheme};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

const AVAILABLE: &str = "AVAILABLE";
const UNAVAILABLE: &str = "UNAVAILABLE";
const OVERFLOW_QUEUE: usize = 1024;

/// Shared state written by the transport handlers.
struct Sinks {
    buffer: Arc<ObservationBuffer>,
    assets: AssetStore,
    devices: DeviceRegistry,
    archive: Option<Mutex<AssetArchive>>,
    batch: usize,
    agent_uuid: String,
    component_id: String,
    dropped_assets: AtomicU64,
}

impl Sinks {
    fn data_item_id(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.component_id)
    }

    /// The agent's own device definition.
    fn agent_device(&self) -> Device {
        let mut device = Device::new(&self.agent_uuid, &self.component_id, "Agent");
        device.data_items = vec![
            DataItem::new(
                self.data_item_id("avail"),
                DataItemCategory::Event,
                "AVAILABILITY",
            ),
            DataItem::new(
                self.data_item_id("device_added"),
                DataItemCategory::Event,
                "DEVICE_ADDED",
            ),
            DataItem::new(
                self.data_item_id("device_changed"),
                DataItemCategory::Event,
                "DEVICE_CHANGED",
            ),
        ];
        device
    }

    fn set_availability(&self, value: &str) -> Observation {
        let observation = Observation::new(
            &self.agent_uuid,
            self.data_item_id("avail"),
            DataItemCategory::Event,
            "AVAILABILITY",
        )
        .with_result(value);
        let sequence = self.buffer.insert(observation.clone());
        tracing::info!(availability = value, sequence, "Agent availability");
        Observation {
            sequence,
            ..observation
        }
    }

    fn register_device(&self, device: Device) {
        let uuid = device.uuid.clone();
        let replaced = self.devices.upsert(device);
        if uuid == self.agent_uuid {
            return;
        }

        let (suffix, data_item_type) = if replaced {
            ("device_changed", "DEVICE_CHANGED")
        } else {
            ("device_added", "DEVICE_ADDED")
        };
        self.buffer.insert(
            Observation::new(
                &self.agent_uuid,
                self.data_item_id(suffix),
                DataItemCategory::Event,
                data_item_type,
            )
            .with_result(&uuid),
        );
        tracing::info!(device_uuid = %uuid, replaced, "Registered device");
    }

    /// Store an asset.
    ///
    /// A full store hands the asset back when an archive can make room for
    /// it; without an archive the asset is dropped.
    fn store_asset(&self, asset: Asset) -> Option<Asset> {
        if self.assets.add(asset.clone()) {
            return None;
        }
        if self.archive.is_none() {
            self.drop_asset(&asset.asset_id);
            return None;
        }
        Some(asset)
    }

    /// Drain one batch to the archive, then retry an asset the full store
    /// rejected.
    fn store_after_drain(&self, asset: Asset) {
        if self.assets.add(asset.clone()) {
            return;
        }

        let asset_id = asset.asset_id.clone();
        if self.drain_assets() == 0 || !self.assets.add(asset) {
            self.drop_asset(&asset_id);
        }
    }

    fn drop_asset(&self, asset_id: &str) {
        self.dropped_assets.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            asset_id,
            capacity = self.assets.capacity(),
            "Asset store full, dropping asset"
        );
    }

    /// Move up to one batch of assets into the archive.
    ///
    /// Returns the number of assets archived. Without an archive nothing is
    /// drained. A failed write puts the batch back at the front of the store.
    fn drain_assets(&self) -> usize {
        let Some(archive) = &self.archive else {
            return 0;
        };

        let drained = self.assets.take(self.batch);
        if drained.is_empty() {
            return 0;
        }

        let saved = archive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .save_assets(&drained);
        match saved {
            Ok(count) => {
                tracing::debug!(count, remaining = self.assets.count(), "Archived assets");
                count
            }
            Err(e) => {
                tracing::error!(error = %e, count = drained.len(), "Failed to archive assets");
                for asset in self.assets.restore(drained) {
                    self.drop_asset(&asset.asset_id);
                }
                0
            }
        }
    }

    fn drain_all(&self) -> usize {
        let mut total = 0;
        loop {
            let archived = self.drain_assets();
            if archived == 0 {
                return total;
            }
            total += archived;
        }
    }

    /// Register the transport handlers that feed this state.
    ///
    /// Assets the full store rejects go to `overflow` for the archive loop.
    fn attach(
        self: &Arc<Self>,
        router: &MessageRouter,
        overflow: mpsc::Sender<Asset>,
    ) -> Vec<HandlerGuard> {
        let devices = Arc::clone(self);
        let observations = Arc::clone(self);
        let conditions = Arc::clone(self);
        let assets = Arc::clone(self);

        vec![
            router.on_device(move |_, device| devices.register_device(device.clone())),
            router.on_observation(move |_, observation| {
                observations.buffer.insert(observation.clone());
            }),
            router.on_condition(move |_, condition| {
                conditions.buffer.insert(condition.clone());
            }),
            router.on_asset(move |_, asset| {
                if let Some(asset) = assets.store_asset(asset.clone()) {
                    if let Err(e) = overflow.try_send(asset) {
                        assets.drop_asset(&e.into_inner().asset_id);
                    }
                }
            }),
            router.on_connection(|event| match event {
                ConnectionEvent::Connected => tracing::info!("MQTT session established"),
                ConnectionEvent::Disconnected => tracing::warn!("MQTT session closed"),
                ConnectionEvent::Error(e) => tracing::error!(error = %e, "MQTT transport error"),
            }),
        ]
    }

    fn log_stats(&self, router: &MessageRouter) {
        let stats = router.stats().snapshot();
        let window = self.buffer.window();
        let archived = self
            .archive
            .as_ref()
            .and_then(|archive| {
                archive
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .count()
                    .ok()
            })
            .unwrap_or_default();

        tracing::info!(
            received = stats.received,
            delivered = stats.delivered,
            unmatched_topics = stats.unmatched_topics,
            empty_payloads = stats.empty_payloads,
            decode_failures = stats.decode_failures,
            first_sequence = window.first,
            last_sequence = window.last,
            observations = self.buffer.len(),
            assets = self.assets.count(),
            dropped_assets = self.dropped_assets.load(Ordering::Relaxed),
            archived,
            devices = self.devices.len(),
            "Agent statistics"
        );
    }
}

/// Run archive work off the async workers.
async fn archive_task<T, F>(work: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::error!(error = %e, "Archive task failed");
            None
        }
    }
}

/// The main agent runtime.
pub struct Agent {
    config: AgentConfig,
    sinks: Arc<Sinks>,
}

impl Agent {
    /// Create a new agent.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer size is invalid or the archive cannot be
    /// opened.
    pub fn new(config: AgentConfig, identity: &AgentIdentity) -> Result<Self> {
        let buffer = ObservationBuffer::new(config.buffer_size)
            .context("Invalid observation buffer size")?;

        let archive = match &config.archive.path {
            Some(path) => Some(Mutex::new(
                AssetArchive::open(path).context("Failed to open asset archive")?,
            )),
            None => None,
        };

        let sinks = Sinks {
            buffer: Arc::new(buffer),
            assets: AssetStore::new(config.asset_buffer_size),
            devices: DeviceRegistry::new(),
            archive,
            batch: config.archive.batch.max(1),
            agent_uuid: identity.uuid.clone(),
            component_id: identity.component_id(),
            dropped_assets: AtomicU64::new(0),
        };

        Ok(Self {
            config,
            sinks: Arc::new(sinks),
        })
    }

    /// Shared observation buffer.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn buffer(&self) -> &Arc<ObservationBuffer> {
        &self.sinks.buffer
    }

    /// Run until Ctrl+C.
    ///
    /// # Errors
    ///
    /// Returns error if any component fails.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Starting agent runtime");

        let agent_device = self.sinks.agent_device();
        self.sinks.register_device(agent_device.clone());
        let available = self.sinks.set_availability(AVAILABLE);

        let (scheme, format) = self.config.mqtt.as_ref().map_or_else(
            || (TopicScheme::default(), PayloadFormat::default()),
            |mqtt| (mqtt.scheme.clone(), mqtt.format),
        );
        let router = Arc::new(MessageRouter::new(scheme, format));
        let (overflow_tx, mut overflow_rx) = mpsc::channel(OVERFLOW_QUEUE);
        let guards = self.sinks.attach(&router, overflow_tx);

        let client = match &self.config.mqtt {
            Some(mqtt) => match MqttClient::connect(mqtt.clone(), Arc::clone(&router)).await {
                Ok(client) => {
                    for result in [
                        client.publish_device(&agent_device).await,
                        client.publish_observation(&available).await,
                    ] {
                        if let Err(e) = result {
                            tracing::warn!(error = %e, "Failed to publish agent device");
                        }
                    }
                    Some(client)
                }
                Err(e) => {
                    tracing::error!(error = %e, broker = %mqtt.broker, "Running without MQTT transport");
                    None
                }
            },
            None => {
                tracing::info!("No MQTT broker configured");
                None
            }
        };

        let mut archive_tick =
            tokio::time::interval(self.config.archive.interval.max(Duration::from_secs(1)));
        let mut stats_tick =
            tokio::time::interval(self.config.stats_interval.max(Duration::from_secs(1)));
        archive_tick.tick().await;
        stats_tick.tick().await;

        tracing::info!("Agent running, press Ctrl+C to stop");

        loop {
            tokio::select! {
                Some(asset) = overflow_rx.recv() => {
                    let sinks = Arc::clone(&self.sinks);
                    archive_task(move || sinks.store_after_drain(asset)).await;
                }

                _ = archive_tick.tick() => {
                    let sinks = Arc::clone(&self.sinks);
                    let archived = archive_task(move || sinks.drain_all()).await;
                    if let Some(archived) = archived.filter(|archived| *archived > 0) {
                        tracing::info!(archived, "Archived assets");
                    }
                }

                _ = stats_tick.tick() => {
                    self.sinks.log_stats(&router);
                }

                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Failed to listen for shutdown signal");
                    }
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        if let Some(client) = client {
            let unavailable = self.sinks.set_availability(UNAVAILABLE);
            if let Err(e) = client.publish_observation(&unavailable).await {
                tracing::warn!(error = %e, "Failed to publish agent availability");
            }
            client.disconnect().await;
        } else {
            self.sinks.set_availability(UNAVAILABLE);
        }
        drop(guards);

        overflow_rx.close();
        let mut pending = Vec::new();
        while let Ok(asset) = overflow_rx.try_recv() {
            pending.push(asset);
        }
        let sinks = Arc::clone(&self.sinks);
        archive_task(move || {
            for asset in pending {
                sinks.store_after_drain(asset);
            }
            sinks.drain_all()
        })
        .await;
        self.sinks.log_stats(&router);

        tracing::info!("Agent stopped");
        Ok(())
    }
}
