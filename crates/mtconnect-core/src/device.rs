//! Device descriptions and the device registry.
//!
//! A device definition is replaced wholesale whenever a new version arrives;
//! it is never patched.

use crate::observation::DataItemCategory;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A declared point of measurement or event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataItem {
    /// Identifier, unique within the device
    pub id: String,
    /// Optional name
    pub name: Option<String>,
    /// Category
    pub category: DataItemCategory,
    /// Type (e.g. `AVAILABILITY`)
    pub data_item_type: String,
    /// Optional sub type
    pub sub_type: Option<String>,
    /// Optional native units
    pub units: Option<String>,
}

impl DataItem {
    /// Create a data item declaration.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        category: DataItemCategory,
        data_item_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: None,
            category,
            data_item_type: data_item_type.into(),
            sub_type: None,
            units: None,
        }
    }
}

/// A structural component of a device (axes, controller, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    /// Identifier
    pub id: String,
    /// Component type (e.g. `Axes`, `Controller`)
    pub component_type: String,
    /// Optional name
    pub name: Option<String>,
    /// Nested components
    pub components: Vec<Component>,
    /// Data items declared on this component
    pub data_items: Vec<DataItem>,
}

/// A device and its structural description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Globally unique device identity
    pub uuid: String,
    /// Document-local identifier
    pub id: String,
    /// Device name
    pub name: String,
    /// Top-level components
    pub components: Vec<Component>,
    /// Data items declared directly on the device
    pub data_items: Vec<DataItem>,
}

impl Device {
    /// Create a device with no components or data items.
    #[must_use]
    pub fn new(uuid: impl Into<String>, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            id: id.into(),
            name: name.into(),
            components: Vec::new(),
            data_items: Vec::new(),
        }
    }

    /// All data items of the device, depth first.
    #[must_use]
    pub fn all_data_items(&self) -> Vec<&DataItem> {
        fn walk<'a>(component: &'a Component, out: &mut Vec<&'a DataItem>) {
            out.extend(component.data_items.iter());
            for child in &component.components {
                walk(child, out);
            }
        }

        let mut out: Vec<&DataItem> = self.data_items.iter().collect();
        for component in &self.components {
            walk(component, &mut out);
        }
        out
    }

    /// Look up a data item declaration by id.
    #[must_use]
    pub fn data_item(&self, id: &str) -> Option<&DataItem> {
        self.all_data_items().into_iter().find(|item| item.id == id)
    }
}

/// Latest definition of every known device, keyed by uuid.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, Arc<Device>>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Device>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `device`, replacing any prior definition with the same uuid.
    ///
    /// Returns `true` if a prior definition was replaced.
    pub fn upsert(&self, device: Device) -> bool {
        let uuid = device.uuid.clone();
        self.lock().insert(uuid, Arc::new(device)).is_some()
    }

    /// Current definition of `uuid`.
    #[must_use]
    pub fn get(&self, uuid: &str) -> Option<Arc<Device>> {
        self.lock().get(uuid).cloned()
    }

    /// All devices, ordered by uuid.
    #[must_use]
    pub fn devices(&self) -> Vec<Arc<Device>> {
        let mut devices: Vec<_> = self.lock().values().cloned().collect();
        devices.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        devices
    }

    /// Number of known devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no device is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
