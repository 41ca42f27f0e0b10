//! Device — per-device measurement cache, health counters, and metadata.
//!
//! Behavior is supplied by a device class resolved from the registry each
//! invocation; this struct is the serializable half that survives between
//! invocations. The proxy/gateway relationship and the owning location are
//! stored as plain identifiers resolved through the controller maps on
//! demand, never as object references.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CareHubError, ValidationError};
use crate::id::{DeviceId, LocationId, ModuleName, ParamName};
use crate::measurement::MeasurementSeries;
use crate::time::Timestamp;

/// Geographic position reported by the access platform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Ingestion counters kept per device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCounters {
    /// Measurement batches routed to this device.
    pub batches: u64,
    /// Samples merged into the cache.
    pub samples: u64,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_seen: Option<Timestamp>,
}

/// Serializable state of one device in the controller graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub id: DeviceId,
    pub device_type: String,
    #[serde(default)]
    pub description: String,
    /// Owning location, kept as a plain id back-reference.
    pub location_id: LocationId,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub read_allowed: bool,
    #[serde(default)]
    pub control_allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    /// Gateway this device's traffic passes through, as a plain id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_id: Option<DeviceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    #[serde(default)]
    pub goal_changed: bool,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub born_on: Option<Timestamp>,
    #[serde(default)]
    pub enforce_cache_size: bool,
    #[serde(default)]
    pub measurements: BTreeMap<ParamName, MeasurementSeries>,
    /// Parameters that changed during the most recent update pass.
    #[serde(default)]
    pub last_updated_params: Vec<ParamName>,
    #[serde(default)]
    pub health: HealthCounters,
    /// Persisted microservice state, keyed by stable module name.
    #[serde(default)]
    pub modules: BTreeMap<ModuleName, serde_json::Value>,
}

impl DeviceState {
    /// Create a builder for constructing a [`DeviceState`].
    #[must_use]
    pub fn builder() -> DeviceStateBuilder {
        DeviceStateBuilder::default()
    }

    /// Check domain invariants.
    ///
    /// # Errors
    ///
    /// Returns [`CareHubError::Validation`] when the id or location id is
    /// empty, or the device type is empty.
    pub fn validate(&self) -> Result<(), CareHubError> {
        if self.id.is_empty() || self.location_id.is_empty() {
            return Err(ValidationError::EmptyId.into());
        }
        if self.device_type.is_empty() {
            return Err(ValidationError::EmptyDeviceType.into());
        }
        Ok(())
    }

    /// The history series for `param`, created empty on first touch.
    pub fn series_mut(&mut self, param: &ParamName) -> &mut MeasurementSeries {
        self.measurements.entry(param.clone()).or_default()
    }

    /// The latest value of `param`, if any history exists.
    #[must_use]
    pub fn latest(&self, param: &ParamName) -> Option<&crate::measurement::Sample> {
        self.measurements.get(param).and_then(MeasurementSeries::latest)
    }

    /// Apply a new goal id, flagging a change only when a previous
    /// non-null goal differs from the new value.
    pub fn apply_goal(&mut self, goal_id: Option<String>) {
        if let Some(previous) = &self.goal_id
            && goal_id.as_ref() != Some(previous)
        {
            self.goal_changed = true;
        }
        self.goal_id = goal_id;
    }
}

/// Step-by-step builder for [`DeviceState`].
#[derive(Debug, Default)]
pub struct DeviceStateBuilder {
    id: Option<DeviceId>,
    device_type: Option<String>,
    description: Option<String>,
    location_id: Option<LocationId>,
    connected: Option<bool>,
    read_allowed: Option<bool>,
    control_allowed: Option<bool>,
    coordinates: Option<Coordinates>,
    proxy_id: Option<DeviceId>,
    goal_id: Option<String>,
    born_on: Option<Timestamp>,
    enforce_cache_size: Option<bool>,
}

impl DeviceStateBuilder {
    #[must_use]
    pub fn id(mut self, id: impl Into<DeviceId>) -> Self {
        self.id = Some(id.into());
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
    pub fn location_id(mut self, location_id: impl Into<LocationId>) -> Self {
        self.location_id = Some(location_id.into());
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
    pub fn proxy_id(mut self, proxy_id: impl Into<DeviceId>) -> Self {
        self.proxy_id = Some(proxy_id.into());
        self
    }

    #[must_use]
    pub fn goal_id(mut self, goal_id: impl Into<String>) -> Self {
        self.goal_id = Some(goal_id.into());
        self
    }

    #[must_use]
    pub fn born_on(mut self, born_on: Timestamp) -> Self {
        self.born_on = Some(born_on);
        self
    }

    #[must_use]
    pub fn enforce_cache_size(mut self, enforce: bool) -> Self {
        self.enforce_cache_size = Some(enforce);
        self
    }

    /// Consume the builder, validate, and return a [`DeviceState`].
    ///
    /// # Errors
    ///
    /// Returns [`CareHubError::Validation`] if required identifiers are
    /// missing or empty.
    pub fn build(self) -> Result<DeviceState, CareHubError> {
        let device = DeviceState {
            id: self.id.unwrap_or_default(),
            device_type: self.device_type.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            location_id: self.location_id.unwrap_or_default(),
            connected: self.connected.unwrap_or(false),
            read_allowed: self.read_allowed.unwrap_or(true),
            control_allowed: self.control_allowed.unwrap_or(false),
            coordinates: self.coordinates,
            proxy_id: self.proxy_id,
            goal_id: self.goal_id,
            goal_changed: false,
            born_on: self.born_on,
            enforce_cache_size: self.enforce_cache_size.unwrap_or(true),
            measurements: BTreeMap::new(),
            last_updated_params: Vec::new(),
            health: HealthCounters::default(),
            modules: BTreeMap::new(),
        };
        device.validate()?;
        Ok(device)
    }
}
