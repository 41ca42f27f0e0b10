//! Location — a monitored home owning devices, modules, and mode state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::device::DeviceState;
use crate::id::{DeviceId, LocationId, ModuleName};

/// Operating mode of a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Home,
    Away,
    Sleep,
    Vacation,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Home => f.write_str("home"),
            Self::Away => f.write_str("away"),
            Self::Sleep => f.write_str("sleep"),
            Self::Vacation => f.write_str("vacation"),
        }
    }
}

/// Occupancy estimate for a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OccupancyStatus {
    #[default]
    Unknown,
    Occupied,
    Vacant,
}

/// Serializable state of one location in the controller graph.
///
/// Locations are created lazily on the first reference to an unseen id and
/// deleted only through the controller's explicit delete operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationState {
    pub id: LocationId,
    #[serde(default)]
    pub devices: BTreeMap<DeviceId, DeviceState>,
    /// Persisted microservice state, keyed by stable module name.
    #[serde(default)]
    pub modules: BTreeMap<ModuleName, serde_json::Value>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub occupancy: OccupancyStatus,
}

impl LocationState {
    /// A fresh location with no devices or modules.
    #[must_use]
    pub fn new(id: impl Into<LocationId>) -> Self {
        Self {
            id: id.into(),
            devices: BTreeMap::new(),
            modules: BTreeMap::new(),
            mode: Mode::default(),
            occupancy: OccupancyStatus::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_start_empty_in_home_mode() {
        let location = LocationState::new("loc-1");
        assert_eq!(location.id.as_str(), "loc-1");
        assert!(location.devices.is_empty());
        assert!(location.modules.is_empty());
        assert_eq!(location.mode, Mode::Home);
        assert_eq!(location.occupancy, OccupancyStatus::Unknown);
    }

    #[test]
    fn should_display_lowercase_mode_names() {
        assert_eq!(Mode::Home.to_string(), "home");
        assert_eq!(Mode::Vacation.to_string(), "vacation");
    }

    #[test]
    fn should_roundtrip_through_serde_json() {
        let mut location = LocationState::new("loc-1");
        location.mode = Mode::Away;
        location.occupancy = OccupancyStatus::Vacant;

        let json = serde_json::to_string(&location).unwrap();
        let parsed: LocationState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, location);
    }
}
