//! Wire payloads for devices, observations, and assets.
//!
//! Payloads are field-named and order-independent. JSON is the MTConnect
//! convention; CBOR carries the same field names in a compact encoding.

use crate::topics::TopicKind;
use chrono::{DateTime, Utc};
use mtconnect_core::{
    value_keys, Asset, Component, DataItem, DataItemCategory, Device, Observation,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Payload encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// UTF-8 JSON
    #[default]
    Json,
    /// CBOR
    Cbor,
}

impl PayloadFormat {
    /// Serialize `value`.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, MessageError> {
        match self {
            Self::Json => {
                serde_json::to_vec(value).map_err(|e| MessageError::Serialize(e.to_string()))
            }
            Self::Cbor => {
                let mut bytes = Vec::new();
                ciborium::into_writer(value, &mut bytes)
                    .map_err(|e| MessageError::Serialize(e.to_string()))?;
                Ok(bytes)
            }
        }
    }

    /// Deserialize a `T`.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, MessageError> {
        match self {
            Self::Json => {
                serde_json::from_slice(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
            }
            Self::Cbor => {
                ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
            }
        }
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::Cbor => f.write_str("cbor"),
        }
    }
}

impl FromStr for PayloadFormat {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "cbor" => Ok(Self::Cbor),
            other => Err(MessageError::InvalidField {
                field: "format",
                value: other.to_string(),
            }),
        }
    }
}

/// A single value or a list of values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(item) => vec![item],
            Self::Many(items) => items,
        }
    }
}

/// Wire form of an observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationPayload {
    /// Data item identifier
    pub data_item_id: String,
    /// `SAMPLE`, `EVENT`, or `CONDITION` (any case)
    pub category: String,
    /// Data item name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Data item type
    #[serde(rename = "type")]
    pub data_item_type: String,
    /// Data item sub type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    /// Sequence assigned by the publishing agent (informational)
    #[serde(default)]
    pub sequence: u64,
    /// Observation time
    pub timestamp: DateTime<Utc>,
    /// Composition identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composition_id: Option<String>,
    /// Value (string, number, or bool)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Condition level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// Condition native code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_code: Option<String>,
    /// Condition native severity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_severity: Option<String>,
    /// Condition qualifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualifier: Option<String>,
}

impl ObservationPayload {
    /// Convert into a domain observation owned by `device_uuid`.
    ///
    /// # Errors
    ///
    /// Returns error if the category is unknown.
    pub fn into_observation(self, device_uuid: &str) -> Result<Observation, MessageError> {
        let category =
            DataItemCategory::from_str(&self.category).map_err(|_| MessageError::InvalidField {
                field: "category",
                value: self.category.clone(),
            })?;

        let mut observation =
            Observation::new(device_uuid, self.data_item_id, category, self.data_item_type)
                .with_timestamp(self.timestamp);
        observation.name = self.name;
        observation.sub_type = self.sub_type;
        observation.sequence = self.sequence;
        observation.composition_id = self.composition_id;

        if let Some(result) = self.result {
            let result = match result {
                Value::String(s) => s,
                other => other.to_string(),
            };
            observation = observation.with_result(result);
        }
        for (key, value) in [
            (value_keys::LEVEL, self.level),
            (value_keys::NATIVE_CODE, self.native_code),
            (value_keys::NATIVE_SEVERITY, self.native_severity),
            (value_keys::QUALIFIER, self.qualifier),
        ] {
            if let Some(value) = value {
                observation = observation.with_value(key, value);
            }
        }

        Ok(observation)
    }
}

impl From<&Observation> for ObservationPayload {
    fn from(observation: &Observation) -> Self {
        let value = |key: &str| observation.values.get(key).cloned();
        Self {
            data_item_id: observation.data_item_id.clone(),
            category: observation.category.as_str().to_string(),
            name: observation.name.clone(),
            data_item_type: observation.data_item_type.clone(),
            sub_type: observation.sub_type.clone(),
            sequence: observation.sequence,
            timestamp: observation.timestamp,
            composition_id: observation.composition_id.clone(),
            result: value(value_keys::RESULT).map(Value::String),
            level: value(value_keys::LEVEL),
            native_code: value(value_keys::NATIVE_CODE),
            native_severity: value(value_keys::NATIVE_SEVERITY),
            qualifier: value(value_keys::QUALIFIER),
        }
    }
}

/// Wire form of an asset.
///
/// Fields other than the ones below are kept as the asset content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetPayload {
    /// Asset identifier
    pub asset_id: String,
    /// Asset type
    #[serde(rename = "type")]
    pub asset_type: String,
    /// Owning device (defaults to the topic's device)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_uuid: Option<String>,
    /// Last change time (defaults to receipt time)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Logical tombstone
    #[serde(default)]
    pub removed: bool,
    /// Type-specific structure
    #[serde(flatten)]
    pub content: serde_json::Map<String, Value>,
}

impl AssetPayload {
    /// Convert into a domain asset received on `device_uuid`'s topic.
    #[must_use]
    pub fn into_asset(self, device_uuid: &str) -> Asset {
        let mut asset = Asset::new(self.asset_id, self.asset_type);
        asset.device_uuid = Some(self.device_uuid.unwrap_or_else(|| device_uuid.to_string()));
        if let Some(timestamp) = self.timestamp {
            asset.timestamp = timestamp;
        }
        asset.removed = self.removed;
        asset.content = Value::Object(self.content);
        asset
    }
}

impl From<&Asset> for AssetPayload {
    fn from(asset: &Asset) -> Self {
        let content = match &asset.content {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("content".to_string(), other.clone());
                map
            }
        };
        Self {
            asset_id: asset.asset_id.clone(),
            asset_type: asset.asset_type.clone(),
            device_uuid: asset.device_uuid.clone(),
            timestamp: Some(asset.timestamp),
            removed: asset.removed,
            content,
        }
    }
}

/// Wire form of a data item declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataItemPayload {
    /// Identifier
    pub id: String,
    /// Name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Category (any case)
    pub category: String,
    /// Type
    #[serde(rename = "type")]
    pub data_item_type: String,
    /// Sub type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    /// Native units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

/// Wire form of a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentPayload {
    /// Identifier
    pub id: String,
    /// Component type
    #[serde(rename = "type")]
    pub component_type: String,
    /// Name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Nested components
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentPayload>,
    /// Declared data items
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_items: Vec<DataItemPayload>,
}

/// Wire form of a device definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePayload {
    /// Device uuid (defaults to the topic's device)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Identifier
    pub id: String,
    /// Name
    pub name: String,
    /// Top-level components
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentPayload>,
    /// Data items declared on the device itself
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_items: Vec<DataItemPayload>,
}

impl DataItemPayload {
    fn into_data_item(self) -> Result<DataItem, MessageError> {
        let category =
            DataItemCategory::from_str(&self.category).map_err(|_| MessageError::InvalidField {
                field: "category",
                value: self.category.clone(),
            })?;
        Ok(DataItem {
            id: self.id,
            name: self.name,
            category,
            data_item_type: self.data_item_type,
            sub_type: self.sub_type,
            units: self.units,
        })
    }
}

impl ComponentPayload {
    fn into_component(self) -> Result<Component, MessageError> {
        Ok(Component {
            id: self.id,
            component_type: self.component_type,
            name: self.name,
            components: self
                .components
                .into_iter()
                .map(Self::into_component)
                .collect::<Result<_, _>>()?,
            data_items: self
                .data_items
                .into_iter()
                .map(DataItemPayload::into_data_item)
                .collect::<Result<_, _>>()?,
        })
    }
}

impl DevicePayload {
    /// Convert into a domain device received on `device_uuid`'s topic.
    ///
    /// # Errors
    ///
    /// Returns error if any data item has an unknown category.
    pub fn into_device(self, device_uuid: &str) -> Result<Device, MessageError> {
        let mut device = Device::new(
            self.uuid.unwrap_or_else(|| device_uuid.to_string()),
            self.id,
            self.name,
        );
        device.components = self
            .components
            .into_iter()
            .map(ComponentPayload::into_component)
            .collect::<Result<_, _>>()?;
        device.data_items = self
            .data_items
            .into_iter()
            .map(DataItemPayload::into_data_item)
            .collect::<Result<_, _>>()?;
        Ok(device)
    }
}

impl From<&DataItem> for DataItemPayload {
    fn from(item: &DataItem) -> Self {
        Self {
            id: item.id.clone(),
            name: item.name.clone(),
            category: item.category.as_str().to_string(),
            data_item_type: item.data_item_type.clone(),
            sub_type: item.sub_type.clone(),
            units: item.units.clone(),
        }
    }
}

impl From<&Component> for ComponentPayload {
    fn from(component: &Component) -> Self {
        Self {
            id: component.id.clone(),
            component_type: component.component_type.clone(),
            name: component.name.clone(),
            components: component.components.iter().map(Self::from).collect(),
            data_items: component.data_items.iter().map(DataItemPayload::from).collect(),
        }
    }
}

impl From<&Device> for DevicePayload {
    fn from(device: &Device) -> Self {
        Self {
            uuid: Some(device.uuid.clone()),
            id: device.id.clone(),
            name: device.name.clone(),
            components: device.components.iter().map(ComponentPayload::from).collect(),
            data_items: device.data_items.iter().map(DataItemPayload::from).collect(),
        }
    }
}

/// A decoded inbound record.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Device definition
    Device(Device),
    /// Samples / events
    Observations(Vec<Observation>),
    /// Conditions
    Conditions(Vec<Observation>),
    /// Asset
    Asset(Asset),
}

/// Decode the payload of a classified topic.
///
/// Observation and condition topics accept a single object or an array.
///
/// # Errors
///
/// Returns error if the payload does not decode into the record kind.
pub fn decode_record(
    kind: TopicKind,
    format: PayloadFormat,
    device_uuid: &str,
    payload: &[u8],
) -> Result<Record, MessageError> {
    let observations = |payload: &[u8]| -> Result<Vec<Observation>, MessageError> {
        format
            .decode::<OneOrMany<ObservationPayload>>(payload)?
            .into_vec()
            .into_iter()
            .map(|item| item.into_observation(device_uuid))
            .collect()
    };

    match kind {
        TopicKind::Device => Ok(Record::Device(
            format
                .decode::<DevicePayload>(payload)?
                .into_device(device_uuid)?,
        )),
        TopicKind::Observations => Ok(Record::Observations(observations(payload)?)),
        TopicKind::Conditions => Ok(Record::Conditions(observations(payload)?)),
        TopicKind::Asset => Ok(Record::Asset(
            format
                .decode::<AssetPayload>(payload)?
                .into_asset(device_uuid),
        )),
    }
}

/// Errors for payload serialization/deserialization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// A field carried an unsupported value
    #[error("invalid {field}: {value}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// Rejected value
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn observation_payload_decodes_camel_case() {
        let payload = json!({
            "timestamp": "2024-01-01T00:00:00Z",
            "type": "POSITION",
            "dataItemId": "xpos",
            "category": "Sample",
            "subType": "ACTUAL",
            "sequence": 77,
            "compositionId": "motor",
            "result": 12.5
        });
        let bytes = serde_json::to_vec(&payload).unwrap();

        let Record::Observations(observations) =
            decode_record(TopicKind::Observations, PayloadFormat::Json, "mill", &bytes).unwrap()
        else {
            panic!("expected observations");
        };

        let obs = &observations[0];
        assert_eq!(obs.device_uuid, "mill");
        assert_eq!(obs.data_item_id, "xpos");
        assert_eq!(obs.category, DataItemCategory::Sample);
        assert_eq!(obs.sub_type.as_deref(), Some("ACTUAL"));
        assert_eq!(obs.composition_id.as_deref(), Some("motor"));
        assert_eq!(obs.result(), Some("12.5"));
    }

    #[test]
    fn condition_array_decodes_levels() {
        let payload = br#"[
            {"dataItemId": "logic", "category": "CONDITION", "type": "LOGIC_PROGRAM",
             "timestamp": "2024-01-01T00:00:00Z", "level": "FAULT", "nativeCode": "E42",
             "result": "Program error"},
            {"dataItemId": "logic", "category": "CONDITION", "type": "LOGIC_PROGRAM",
             "timestamp": "2024-01-01T00:00:01Z", "level": "NORMAL"}
        ]"#;

        let Record::Conditions(conditions) =
            decode_record(TopicKind::Conditions, PayloadFormat::Json, "mill", payload).unwrap()
        else {
            panic!("expected conditions");
        };

        assert_eq!(conditions.len(), 2);
        assert!(conditions.iter().all(Observation::is_condition));
        assert_eq!(
            conditions[0].values.get(value_keys::LEVEL).map(String::as_str),
            Some("FAULT")
        );
        assert_eq!(
            conditions[0].values.get(value_keys::NATIVE_CODE).map(String::as_str),
            Some("E42")
        );
        assert!(conditions[1].result().is_none());
    }

    #[test]
    fn unknown_category_is_rejected() {
        let payload = br#"{"dataItemId": "x", "category": "ALARM", "type": "T",
                           "timestamp": "2024-01-01T00:00:00Z"}"#;

        assert_eq!(
            decode_record(TopicKind::Observations, PayloadFormat::Json, "d", payload),
            Err(MessageError::InvalidField {
                field: "category",
                value: "ALARM".to_string(),
            })
        );
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        assert!(matches!(
            decode_record(TopicKind::Asset, PayloadFormat::Json, "d", b"not json"),
            Err(MessageError::Deserialize(_))
        ));
        assert!(matches!(
            decode_record(TopicKind::Device, PayloadFormat::Json, "d", br#"{"id": 1}"#),
            Err(MessageError::Deserialize(_))
        ));
    }

    #[test]
    fn asset_payload_keeps_content_and_defaults_device() {
        let payload = br#"{"assetId": "tool-7", "type": "CuttingTool",
                           "serialNumber": "SN-1", "life": {"value": 300}}"#;

        let Record::Asset(asset) =
            decode_record(TopicKind::Asset, PayloadFormat::Json, "mill", payload).unwrap()
        else {
            panic!("expected asset");
        };

        assert_eq!(asset.asset_id, "tool-7");
        assert_eq!(asset.asset_type, "CuttingTool");
        assert_eq!(asset.device_uuid.as_deref(), Some("mill"));
        assert!(!asset.removed);
        assert_eq!(asset.content["serialNumber"], json!("SN-1"));
        assert_eq!(asset.content["life"]["value"], json!(300));
    }

    #[test]
    fn device_payload_builds_tree() {
        let payload = br#"{
            "id": "mill", "name": "Mill",
            "dataItems": [{"id": "avail", "category": "EVENT", "type": "AVAILABILITY"}],
            "components": [{"id": "x", "type": "Linear",
                "dataItems": [{"id": "xpos", "category": "SAMPLE", "type": "POSITION", "units": "MILLIMETER"}]}]
        }"#;

        let Record::Device(device) =
            decode_record(TopicKind::Device, PayloadFormat::Json, "mill-uuid", payload).unwrap()
        else {
            panic!("expected device");
        };

        assert_eq!(device.uuid, "mill-uuid");
        assert_eq!(device.all_data_items().len(), 2);
        assert_eq!(
            device.data_item("xpos").and_then(|d| d.units.as_deref()),
            Some("MILLIMETER")
        );
    }

    #[test]
    fn cbor_observation_matches_json_fields() {
        let observation = Observation::new("mill", "exec", DataItemCategory::Event, "EXECUTION")
            .with_result("ACTIVE");
        let payload = ObservationPayload::from(&observation);

        let bytes = PayloadFormat::Cbor.encode(&payload).unwrap();
        let Record::Observations(decoded) =
            decode_record(TopicKind::Observations, PayloadFormat::Cbor, "mill", &bytes).unwrap()
        else {
            panic!("expected observations");
        };

        assert_eq!(decoded[0].result(), Some("ACTIVE"));
        assert_eq!(decoded[0].timestamp, observation.timestamp);

        let json = PayloadFormat::Json.encode(&payload).unwrap();
        let value: Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["dataItemId"], json!("exec"));
        assert_eq!(value["type"], json!("EXECUTION"));
        assert_eq!(value["category"], json!("EVENT"));
    }

    #[test]
    fn format_parsing() {
        assert_eq!("JSON".parse::<PayloadFormat>(), Ok(PayloadFormat::Json));
        assert_eq!("cbor".parse::<PayloadFormat>(), Ok(PayloadFormat::Cbor));
        assert!("xml".parse::<PayloadFormat>().is_err());
    }
}
