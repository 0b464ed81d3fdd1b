//! MTConnect MQTT topic scheme.
//!
//! Topic structure: `{prefix}/Devices/{uuid}/{kind}`
//!
//! - `MTConnect/Devices/{uuid}/Device`
//! - `MTConnect/Devices/{uuid}/Observations`
//! - `MTConnect/Devices/{uuid}/Observations/{dataItemId}/Conditions`
//! - `MTConnect/Devices/{uuid}/Assets`
//!
//! Classification is a single structural pass over the topic segments.

use serde::{Deserialize, Serialize};

/// Default topic prefix.
pub const DEFAULT_PREFIX: &str = "MTConnect";

const DEVICES_SEGMENT: &str = "Devices";

/// Kind of record carried on a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// Device definition
    Device,
    /// One or more samples / events
    Observations,
    /// One or more conditions
    Conditions,
    /// Asset
    Asset,
}

/// Topic scheme configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicScheme {
    /// Topic prefix (default: "MTConnect")
    pub prefix: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl TopicScheme {
    /// Create a topic scheme with a custom prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn base(&self, device_uuid: &str) -> String {
        format!("{}/{DEVICES_SEGMENT}/{device_uuid}", self.prefix)
    }

    /// Topic for a device definition.
    #[must_use]
    pub fn device(&self, device_uuid: &str) -> String {
        format!("{}/Device", self.base(device_uuid))
    }

    /// Topic for samples and events of a device.
    #[must_use]
    pub fn observations(&self, device_uuid: &str) -> String {
        format!("{}/Observations", self.base(device_uuid))
    }

    /// Topic for the conditions of one data item.
    #[must_use]
    pub fn conditions(&self, device_uuid: &str, data_item_id: &str) -> String {
        format!("{}/Observations/{data_item_id}/Conditions", self.base(device_uuid))
    }

    /// Topic for assets of a device.
    #[must_use]
    pub fn assets(&self, device_uuid: &str) -> String {
        format!("{}/Assets", self.base(device_uuid))
    }

    /// Wildcard subscription for one device.
    #[must_use]
    pub fn device_wildcard(&self, device_uuid: &str) -> String {
        format!("{}/#", self.base(device_uuid))
    }

    /// Wildcard subscription for the whole namespace.
    #[must_use]
    pub fn wildcard(&self) -> String {
        format!("{}/#", self.prefix)
    }

    /// Classify a topic.
    ///
    /// Returns `(device_uuid, kind)` if the topic belongs to this scheme.
    /// A conditions topic is never reported as plain observations.
    #[must_use]
    pub fn classify(&self, topic: &str) -> Option<(String, TopicKind)> {
        let remainder = topic
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('/')?
            .strip_prefix(DEVICES_SEGMENT)?
            .strip_prefix('/')?;

        let mut segments = remainder.split('/');
        let device_uuid = segments.next().filter(|uuid| !uuid.is_empty())?;
        let rest: Vec<&str> = segments.collect();

        let kind = match rest.as_slice() {
            ["Device"] => TopicKind::Device,
            ["Observations", middle @ .., "Conditions"] if !middle.is_empty() => {
                TopicKind::Conditions
            }
            ["Observations", ..] => TopicKind::Observations,
            ["Assets", ..] => TopicKind::Asset,
            _ => return None,
        };

        Some((device_uuid.to_string(), kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_generation() {
        let scheme = TopicScheme::default();

        assert_eq!(scheme.device("123"), "MTConnect/Devices/123/Device");
        assert_eq!(
            scheme.observations("123"),
            "MTConnect/Devices/123/Observations"
        );
        assert_eq!(
            scheme.conditions("123", "X"),
            "MTConnect/Devices/123/Observations/X/Conditions"
        );
        assert_eq!(scheme.assets("123"), "MTConnect/Devices/123/Assets");
    }

    #[test]
    fn wildcard_topics() {
        let scheme = TopicScheme::default();

        assert_eq!(scheme.wildcard(), "MTConnect/#");
        assert_eq!(scheme.device_wildcard("abc"), "MTConnect/Devices/abc/#");
    }

    #[test]
    fn conditions_take_precedence_over_observations() {
        let scheme = TopicScheme::default();

        let (uuid, kind) = scheme
            .classify("MTConnect/Devices/123/Observations/X/Conditions")
            .unwrap();
        assert_eq!(uuid, "123");
        assert_eq!(kind, TopicKind::Conditions);

        let (_, kind) = scheme
            .classify("MTConnect/Devices/123/Observations/path/to/X/Conditions")
            .unwrap();
        assert_eq!(kind, TopicKind::Conditions);
    }

    #[test]
    fn topic_classification() {
        let scheme = TopicScheme::default();

        assert_eq!(
            scheme.classify("MTConnect/Devices/mill-1/Device"),
            Some(("mill-1".to_string(), TopicKind::Device))
        );
        assert_eq!(
            scheme.classify("MTConnect/Devices/mill-1/Observations"),
            Some(("mill-1".to_string(), TopicKind::Observations))
        );
        assert_eq!(
            scheme.classify("MTConnect/Devices/mill-1/Observations/xpos"),
            Some(("mill-1".to_string(), TopicKind::Observations))
        );
        assert_eq!(
            scheme.classify("MTConnect/Devices/mill-1/Assets"),
            Some(("mill-1".to_string(), TopicKind::Asset))
        );
        assert_eq!(
            scheme.classify("MTConnect/Devices/mill-1/Assets/tool-7"),
            Some(("mill-1".to_string(), TopicKind::Asset))
        );
    }

    #[test]
    fn unmatched_topics() {
        let scheme = TopicScheme::default();

        for topic in [
            "MTConnect",
            "MTConnect/Devices",
            "MTConnect/Devices//Device",
            "MTConnect/Devices/123",
            "MTConnect/Devices/123/Unknown",
            "MTConnect/Devices/123/Device/extra",
            "MTConnect/Devices/123/Observations/Conditions",
            "Other/Devices/123/Device",
            "MTConnectX/Devices/123/Device",
        ] {
            let parsed = scheme.classify(topic);
            if topic.ends_with("Observations/Conditions") {
                // A data item literally named "Conditions" is plain observations.
                assert_eq!(parsed.map(|(_, k)| k), Some(TopicKind::Observations));
            } else {
                assert!(parsed.is_none(), "{topic} should not match");
            }
        }
    }

    #[test]
    fn custom_prefix() {
        let scheme = TopicScheme::new("plant-a/MTConnect");

        assert_eq!(
            scheme.classify("plant-a/MTConnect/Devices/9/Assets"),
            Some(("9".to_string(), TopicKind::Asset))
        );
        assert!(scheme.classify("MTConnect/Devices/9/Assets").is_none());
    }
}
