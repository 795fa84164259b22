//! Device directory: the snapshot of devices and their properties built from
//! one directory response.
//!
//! A [`Directory`] is never edited in place. Each bootstrap builds a fresh
//! one and the broker swaps it in whole, so readers see either the old or
//! the new listing and never a mix.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, warn};

use super::error::BrokerError;
use crate::api::{Node, Value, ValueId};

/// Addresses a device by name or by numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceSelector {
    Name(String),
    Id(u32),
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Name(name) => write!(f, "{:?}", name),
            DeviceSelector::Id(id) => write!(f, "node:{}", id),
        }
    }
}

impl From<&str> for DeviceSelector {
    fn from(name: &str) -> Self {
        DeviceSelector::Name(name.to_string())
    }
}

impl From<String> for DeviceSelector {
    fn from(name: String) -> Self {
        DeviceSelector::Name(name)
    }
}

impl From<&String> for DeviceSelector {
    fn from(name: &String) -> Self {
        DeviceSelector::Name(name.clone())
    }
}

impl From<u32> for DeviceSelector {
    fn from(id: u32) -> Self {
        DeviceSelector::Id(id)
    }
}

/// A device and its properties, indexed by property name and by opaque id.
#[derive(Debug, Clone)]
pub struct Device {
    info: Node,
    properties: Vec<Value>,
    by_property: HashMap<String, usize>,
    by_value_id: HashMap<String, usize>,
}

impl Device {
    /// Takes ownership of a directory entry. Properties end up ordered by
    /// their opaque id; on a property-name collision the first one wins.
    pub fn from_node(mut info: Node) -> Self {
        let properties: Vec<Value> = std::mem::take(&mut info.values).into_values().collect();

        let mut by_property = HashMap::with_capacity(properties.len());
        let mut by_value_id = HashMap::with_capacity(properties.len());
        for (idx, value) in properties.iter().enumerate() {
            if by_property.contains_key(&value.property) {
                debug!(
                    "Node {} has several values for property {:?}; keeping the first",
                    info.id, value.property
                );
            } else {
                by_property.insert(value.property.clone(), idx);
            }
            by_value_id.insert(value.id.clone(), idx);
        }

        Device {
            info,
            properties,
            by_property,
            by_value_id,
        }
    }

    pub fn id(&self) -> u32 {
        self.info.id
    }

    /// `None` for devices the gateway reports without a name.
    pub fn name(&self) -> Option<&str> {
        Some(self.info.name.as_str()).filter(|name| !name.is_empty())
    }

    /// Device metadata as reported by the gateway (its `values` are moved
    /// into [`Device::properties`]).
    pub fn info(&self) -> &Node {
        &self.info
    }

    pub fn properties(&self) -> &[Value] {
        &self.properties
    }

    /// Looks a property up by its property-name key (`"currentValue"`).
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.by_property.get(name).map(|&idx| &self.properties[idx])
    }

    /// Looks a property up by its opaque id (`"38-0-currentValue"`).
    pub fn property_by_id(&self, id: &str) -> Option<&Value> {
        self.by_value_id.get(id).map(|&idx| &self.properties[idx])
    }

    /// Composite identifier of one of this device's properties.
    pub fn value_id(&self, value: &Value) -> ValueId {
        value.value_id(self.id())
    }

    fn has_value_id(&self, key: &ValueId) -> bool {
        key.node_id == self.id()
            && self.properties.iter().any(|value| {
                value.command_class == key.command_class
                    && value.endpoint == key.endpoint
                    && value.property == key.property
            })
    }
}

#[derive(Debug, Default, Clone)]
pub struct Directory {
    by_id: HashMap<u32, Device>,
    by_name: HashMap<String, u32>,
}

impl Directory {
    /// Builds a directory from a directory response.
    ///
    /// Failed devices are skipped. Two entries sharing a non-empty name fail
    /// the whole build.
    pub fn build(nodes: Vec<Node>) -> Result<Self, BrokerError> {
        let mut directory = Directory::default();

        for node in nodes {
            if node.failed {
                debug!("Skipping failed node {}", node.id);
                continue;
            }

            let device = Device::from_node(node);
            let id = device.id();
            let name = device.name().map(str::to_string);
            if let Some(name) = &name {
                if directory.by_name.contains_key(name) {
                    return Err(BrokerError::DuplicateName(name.clone()));
                }
                directory.by_name.insert(name.clone(), id);
            }

            if let Some(previous) = directory.by_id.insert(id, device) {
                warn!("Node {} listed twice; keeping the later entry", id);
                if let Some(stale) = previous.name() {
                    directory.by_name.remove(stale);
                }
            }
        }

        Ok(directory)
    }

    pub fn get(&self, selector: &DeviceSelector) -> Option<&Device> {
        match selector {
            DeviceSelector::Name(name) => self.by_name(name),
            DeviceSelector::Id(id) => self.by_id(*id),
        }
    }

    pub fn by_id(&self, id: u32) -> Option<&Device> {
        self.by_id.get(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Device> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Devices ordered by id.
    pub fn devices(&self) -> Vec<&Device> {
        let mut devices: Vec<&Device> = self.by_id.values().collect();
        devices.sort_by_key(|device| device.id());
        devices
    }

    /// Whether `key` addresses a property of a device in this directory.
    pub fn contains_value(&self, key: &ValueId) -> bool {
        self.by_id
            .get(&key.node_id)
            .is_some_and(|device| device.has_value_id(key))
    }
}
