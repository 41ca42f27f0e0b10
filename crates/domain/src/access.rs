//! Access snapshot — the host's authoritative roster for one invocation.

use serde::{Deserialize, Serialize};

use crate::device::Coordinates;
use crate::id::{DeviceId, LocationId};
use crate::time::Timestamp;

/// The ordered list of grants delivered with an invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessSnapshot {
    pub entries: Vec<AccessEntry>,
}

impl AccessSnapshot {
    /// Snapshot from an ordered list of entries.
    #[must_use]
    pub fn new(entries: Vec<AccessEntry>) -> Self {
        Self { entries }
    }

    /// Iterate the device grants in snapshot order.
    pub fn device_grants(&self) -> impl Iterator<Item = &DeviceGrant> {
        self.entries.iter().filter_map(|entry| match entry {
            AccessEntry::Device(grant) => Some(grant),
            AccessEntry::Mode(_) => None,
        })
    }
}

/// One grant entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccessEntry {
    /// Grants mode control over a location.
    Mode(ModeGrant),
    /// Grants access to a device within a location.
    Device(DeviceGrant),
}

/// Mode-control grant for one location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeGrant {
    pub location_id: LocationId,
}

/// Device grant with the mutable metadata applied during reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceGrant {
    pub device_id: DeviceId,
    pub location_id: LocationId,
    pub device_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub read_allowed: bool,
    #[serde(default)]
    pub control_allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_id: Option<DeviceId>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub born_on: Option<Timestamp>,
}

impl DeviceGrant {
    /// Create a builder for constructing a [`DeviceGrant`].
    #[must_use]
    pub fn builder() -> DeviceGrantBuilder {
        DeviceGrantBuilder::default()
    }
}

/// Step-by-step builder for [`DeviceGrant`].
#[derive(Debug, Default)]
pub struct DeviceGrantBuilder {
    device_id: Option<DeviceId>,
    location_id: Option<LocationId>,
    device_type: Option<String>,
    description: Option<String>,
    connected: Option<bool>,
    read_allowed: Option<bool>,
    control_allowed: Option<bool>,
    coordinates: Option<Coordinates>,
    goal_id: Option<String>,
    proxy_id: Option<DeviceId>,
    born_on: Option<Timestamp>,
}

impl DeviceGrantBuilder {
    #[must_use]
    pub fn device_id(mut self, device_id: impl Into<DeviceId>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    #[must_use]
    pub fn location_id(mut self, location_id: impl Into<LocationId>) -> Self {
        self.location_id = Some(location_id.into());
        self
    }

    #[must_use]
    pub fn device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn connected(mut self, connected: bool) -> Self {
        self.connected = Some(connected);
        self
    }

    #[must_use]
    pub fn read_allowed(mut self, read_allowed: bool) -> Self {
        self.read_allowed = Some(read_allowed);
        self
    }

    #[must_use]
    pub fn control_allowed(mut self, control_allowed: bool) -> Self {
        self.control_allowed = Some(control_allowed);
        self
    }

    #[must_use]
    pub fn coordinates(mut self, coordinates: Coordinates) -> Self {
        self.coordinates = Some(coordinates);
        self
    }

    #[must_use]
    pub fn goal_id(mut self, goal_id: impl Into<String>) -> Self {
        self.goal_id = Some(goal_id.into());
        self
    }

    #[must_use]
    pub fn proxy_id(mut self, proxy_id: impl Into<DeviceId>) -> Self {
        self.proxy_id = Some(proxy_id.into());
        self
    }

    #[must_use]
    pub fn born_on(mut self, born_on: Timestamp) -> Self {
        self.born_on = Some(born_on);
        self
    }

    /// Consume the builder and return a [`DeviceGrant`].
    #[must_use]
    pub fn build(self) -> DeviceGrant {
        DeviceGrant {
            device_id: self.device_id.unwrap_or_default(),
            location_id: self.location_id.unwrap_or_default(),
            device_type: self.device_type.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            connected: self.connected.unwrap_or(true),
            read_allowed: self.read_allowed.unwrap_or(true),
            control_allowed: self.control_allowed.unwrap_or(false),
            coordinates: self.coordinates,
            goal_id: self.goal_id,
            proxy_id: self.proxy_id,
            born_on: self.born_on,
        }
    }
}
