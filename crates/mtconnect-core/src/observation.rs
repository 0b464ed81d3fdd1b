//! Observation records.
//!
//! An observation is a single timestamped reading, event, or condition for one
//! data item of one device. The ring buffer owns observations once inserted and
//! hands out shared, immutable snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Well-known keys of [`Observation::values`].
pub mod value_keys {
    /// Primary value of a sample or event.
    pub const RESULT: &str = "Result";
    /// Condition level (`NORMAL`, `WARNING`, `FAULT`, `UNAVAILABLE`).
    pub const LEVEL: &str = "Level";
    /// Native code reported by the controller for a condition.
    pub const NATIVE_CODE: &str = "NativeCode";
    /// Native severity reported by the controller for a condition.
    pub const NATIVE_SEVERITY: &str = "NativeSeverity";
    /// Condition qualifier (`HIGH`, `LOW`, ...).
    pub const QUALIFIER: &str = "Qualifier";
}

/// Category of the data item an observation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataItemCategory {
    /// Continuously varying, numeric value
    Sample,
    /// Discrete state or message
    Event,
    /// Health / alarm state
    Condition,
}

impl DataItemCategory {
    /// The MTConnect spelling of the category.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sample => "SAMPLE",
            Self::Event => "EVENT",
            Self::Condition => "CONDITION",
        }
    }
}

impl fmt::Display for DataItemCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataItemCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SAMPLE" => Ok(Self::Sample),
            "EVENT" => Ok(Self::Event),
            "CONDITION" => Ok(Self::Condition),
            _ => Err(UnknownCategory(s.to_string())),
        }
    }
}

/// A category string that is not SAMPLE, EVENT, or CONDITION.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown data item category: {0}")]
pub struct UnknownCategory(pub String);

/// A single timestamped value for one data item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// UUID of the owning device
    pub device_uuid: String,
    /// Data item identifier, unique within the device
    pub data_item_id: String,
    /// Data item category
    pub category: DataItemCategory,
    /// Optional data item name
    pub name: Option<String>,
    /// Data item type (e.g. `AVAILABILITY`, `POSITION`)
    pub data_item_type: String,
    /// Optional data item sub type (e.g. `ACTUAL`)
    pub sub_type: Option<String>,
    /// Buffer sequence number. Assigned by the ring buffer on insert; any
    /// value set by the producer is overwritten.
    pub sequence: u64,
    /// Time the value was observed
    pub timestamp: DateTime<Utc>,
    /// Optional composition the data item belongs to
    pub composition_id: Option<String>,
    /// Value payload keyed by [`value_keys`]
    pub values: BTreeMap<String, String>,
}

impl Observation {
    /// Create an observation with no values, timestamped now.
    #[must_use]
    pub fn new(
        device_uuid: impl Into<String>,
        data_item_id: impl Into<String>,
        category: DataItemCategory,
        data_item_type: impl Into<String>,
    ) -> Self {
        Self {
            device_uuid: device_uuid.into(),
            data_item_id: data_item_id.into(),
            category,
            name: None,
            data_item_type: data_item_type.into(),
            sub_type: None,
            sequence: 0,
            timestamp: Utc::now(),
            composition_id: None,
            values: BTreeMap::new(),
        }
    }

    /// Set the `Result` value.
    #[must_use]
    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.values
            .insert(value_keys::RESULT.to_string(), result.into());
        self
    }

    /// Set an arbitrary value key.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Set the observation timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The `Result` value, if any.
    #[must_use]
    pub fn result(&self) -> Option<&str> {
        self.values.get(value_keys::RESULT).map(String::as_str)
    }

    /// Whether this observation is a condition.
    #[must_use]
    pub fn is_condition(&self) -> bool {
        self.category == DataItemCategory::Condition
    }
}
