//! Controller — the root of the persisted graph.
//!
//! The whole mutable world is serialized as one `ControllerState` blob and
//! reloaded on every invocation. The `location_devices` index exists so a
//! device can be resolved without scanning every location; it must stay
//! consistent with the location maps in both directions.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::id::{DeviceId, LocationId};
use crate::location::LocationState;
use crate::time::Timestamp;
use crate::trigger::Trigger;

/// Version of the persisted controller structure.
///
/// The version routes which migration functions still have to run over a
/// rehydrated blob; a blob at an older version keeps the engine in
/// [`Readiness::Preparing`] until migration completes.
pub const CONTROLLER_VERSION: u32 = 3;

/// Readiness of a rehydrated controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A one-time version migration is still pending; triggers queue.
    Preparing,
    /// Migrations are complete; triggers dispatch.
    Ready,
}

/// A trigger parked in the readiness queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTrigger {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub received_at: Timestamp,
    pub trigger: Trigger,
}

/// Serializable root of the controller graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    pub version: u32,
    #[serde(default)]
    pub locations: BTreeMap<LocationId, LocationState>,
    /// Device → owning location index; mirrors the location maps.
    #[serde(default)]
    pub location_devices: BTreeMap<DeviceId, LocationId>,
    /// FIFO queue of triggers received while preparing.
    #[serde(default)]
    pub pending: VecDeque<QueuedTrigger>,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            version: CONTROLLER_VERSION,
            locations: BTreeMap::new(),
            location_devices: BTreeMap::new(),
            pending: VecDeque::new(),
        }
    }
}

impl ControllerState {
    /// Readiness derived from the structure version.
    #[must_use]
    pub fn readiness(&self) -> Readiness {
        if self.version < CONTROLLER_VERSION {
            Readiness::Preparing
        } else {
            Readiness::Ready
        }
    }

    /// Check the two-way consistency of the device index.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::BrokenIndex`] naming the first offending
    /// device id.
    pub fn check_index(&self) -> Result<(), ValidationError> {
        for (device_id, location_id) in &self.location_devices {
            let held = self
                .locations
                .get(location_id)
                .is_some_and(|location| location.devices.contains_key(device_id));
            if !held {
                return Err(ValidationError::BrokenIndex(format!(
                    "{device_id} indexed under {location_id} but not held there"
                )));
            }
        }
        for location in self.locations.values() {
            for device_id in location.devices.keys() {
                if self.location_devices.get(device_id) != Some(&location.id) {
                    return Err(ValidationError::BrokenIndex(format!(
                        "{device_id} held by {} but not indexed there",
                        location.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Total number of tracked devices.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.location_devices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceState;

    fn device(id: &str, location: &str) -> DeviceState {
        DeviceState::builder()
            .id(id)
            .device_type("radar")
            .location_id(location)
            .build()
            .unwrap()
    }

    #[test]
    fn should_default_to_current_version_and_ready() {
        let state = ControllerState::default();
        assert_eq!(state.version, CONTROLLER_VERSION);
        assert_eq!(state.readiness(), Readiness::Ready);
    }

    #[test]
    fn should_report_preparing_for_older_version() {
        let state = ControllerState {
            version: CONTROLLER_VERSION - 1,
            ..ControllerState::default()
        };
        assert_eq!(state.readiness(), Readiness::Preparing);
    }

    #[test]
    fn should_accept_consistent_index() {
        let mut state = ControllerState::default();
        let mut location = LocationState::new("loc-1");
        location
            .devices
            .insert(DeviceId::new("d1"), device("d1", "loc-1"));
        state.locations.insert(LocationId::new("loc-1"), location);
        state
            .location_devices
            .insert(DeviceId::new("d1"), LocationId::new("loc-1"));

        assert!(state.check_index().is_ok());
    }

    #[test]
    fn should_reject_index_entry_without_device() {
        let mut state = ControllerState::default();
        state
            .locations
            .insert(LocationId::new("loc-1"), LocationState::new("loc-1"));
        state
            .location_devices
            .insert(DeviceId::new("ghost"), LocationId::new("loc-1"));

        assert!(matches!(
            state.check_index(),
            Err(ValidationError::BrokenIndex(_))
        ));
    }

    #[test]
    fn should_reject_device_missing_from_index() {
        let mut state = ControllerState::default();
        let mut location = LocationState::new("loc-1");
        location
            .devices
            .insert(DeviceId::new("d1"), device("d1", "loc-1"));
        state.locations.insert(LocationId::new("loc-1"), location);

        assert!(matches!(
            state.check_index(),
            Err(ValidationError::BrokenIndex(_))
        ));
    }

    #[test]
    fn should_roundtrip_through_serde_json() {
        let mut state = ControllerState::default();
        let mut location = LocationState::new("loc-1");
        location
            .devices
            .insert(DeviceId::new("d1"), device("d1", "loc-1"));
        state.locations.insert(LocationId::new("loc-1"), location);
        state
            .location_devices
            .insert(DeviceId::new("d1"), LocationId::new("loc-1"));

        let json = serde_json::to_string(&state).unwrap();
        let parsed: ControllerState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }
}
