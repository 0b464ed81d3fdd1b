//! Asset records and the bounded asset store.
//!
//! Assets are keyed by a stable hash of their `assetId`. Receiving an asset
//! whose key is already stored replaces the record in place; a new key is
//! rejected once the store is full. Stored assets leave the store only through
//! [`AssetStore::take`], which drains them in first-insertion order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default number of assets held before new keys are rejected.
pub const DEFAULT_ASSET_CAPACITY: usize = 1024;

/// Storage key of an asset: hex SHA-256 of the normalized asset id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetKey(String);

impl AssetKey {
    /// Derive the key for `asset_id`.
    ///
    /// Surrounding whitespace and letter case do not affect the key.
    #[must_use]
    pub fn from_asset_id(asset_id: &str) -> Self {
        let normalized = asset_id.trim().to_lowercase();
        Self(format!("{:x}", Sha256::digest(normalized.as_bytes())))
    }

    /// Hex form of the key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A discrete, updatable artifact such as a cutting tool or part program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    /// External asset identity
    pub asset_id: String,
    /// Asset type (e.g. `CuttingTool`, `File`)
    pub asset_type: String,
    /// Device the asset is associated with, if any
    pub device_uuid: Option<String>,
    /// Time of the last change
    pub timestamp: DateTime<Utc>,
    /// Logical tombstone
    pub removed: bool,
    /// Type-specific structure
    pub content: serde_json::Value,
}

impl Asset {
    /// Create an asset with empty content, timestamped now.
    #[must_use]
    pub fn new(asset_id: impl Into<String>, asset_type: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            asset_type: asset_type.into(),
            device_uuid: None,
            timestamp: Utc::now(),
            removed: false,
            content: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Storage key of this asset.
    #[must_use]
    pub fn key(&self) -> AssetKey {
        AssetKey::from_asset_id(&self.asset_id)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    items: HashMap<AssetKey, Asset>,
    /// Keys in first-insertion order
    order: VecDeque<AssetKey>,
}

/// Bounded key to latest-value asset store.
#[derive(Debug)]
pub struct AssetStore {
    capacity: usize,
    state: Mutex<StoreState>,
}

impl Default for AssetStore {
    fn default() -> Self {
        Self::new(DEFAULT_ASSET_CAPACITY)
    }
}

impl AssetStore {
    /// Create a store holding at most `capacity` distinct assets.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(StoreState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Maximum number of distinct assets.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stored assets.
    #[must_use]
    pub fn count(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether the store accepts no further new keys.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.count() >= self.capacity
    }

    /// Store `asset`.
    ///
    /// Returns `true` when the asset replaced an existing record or was
    /// inserted, and `false` when its key is new and the store is full.
    pub fn add(&self, asset: Asset) -> bool {
        let key = asset.key();
        let mut state = self.lock();

        if let Some(existing) = state.items.get_mut(&key) {
            *existing = asset;
            return true;
        }

        if state.items.len() >= self.capacity {
            tracing::debug!(asset_id = %asset.asset_id, capacity = self.capacity, "Asset store full");
            return false;
        }

        state.order.push_back(key.clone());
        state.items.insert(key, asset);
        true
    }

    /// Remove and return up to `n` assets, oldest first-insertion first.
    pub fn take(&self, n: usize) -> Vec<Asset> {
        let mut state = self.lock();
        let n = n.min(state.order.len());

        let keys: Vec<AssetKey> = state.order.drain(..n).collect();
        keys.iter()
            .filter_map(|key| state.items.remove(key))
            .collect()
    }

    /// Put previously taken assets back at the front of the drain order.
    ///
    /// Keys stored since the take keep their newer record and position.
    /// Returns the assets that did not fit, oldest first.
    pub fn restore(&self, assets: Vec<Asset>) -> Vec<Asset> {
        let mut state = self.lock();
        let mut free = self.capacity.saturating_sub(state.items.len());
        let mut restored = Vec::new();
        let mut rejected = Vec::new();

        for asset in assets {
            let key = asset.key();
            if state.items.contains_key(&key) || restored.contains(&key) {
                continue;
            }
            if free == 0 {
                rejected.push(asset);
                continue;
            }
            free -= 1;
            state.items.insert(key.clone(), asset);
            restored.push(key);
        }

        for key in restored.into_iter().rev() {
            state.order.push_front(key);
        }
        rejected
    }

    /// Copy of the stored asset with `asset_id`, if any.
    #[must_use]
    pub fn get(&self, asset_id: &str) -> Option<Asset> {
        self.lock()
            .items
            .get(&AssetKey::from_asset_id(asset_id))
            .cloned()
    }
}
