//! Versioned controller migrations.
//!
//! Each migration takes a structure at version `n - 1` and produces a
//! fully-populated structure at version `n`; the persisted version number
//! routes which ones still have to run. Migrations replace the scattered
//! "does this attribute exist yet" backfilling the blob model would
//! otherwise need.

use tracing::info;

use carehub_domain::controller::{CONTROLLER_VERSION, ControllerState};

type Migration = fn(&mut ControllerState);

/// (target version, name, migration) — applied in ascending order.
const MIGRATIONS: &[(u32, &str, Migration)] = &[
    (2, "rebuild device index", rebuild_device_index),
    (3, "normalize measurement series", normalize_measurement_series),
];

/// Run every pending migration, returning how many were applied.
///
/// A structure already at [`CONTROLLER_VERSION`] is untouched.
pub fn migrate(state: &mut ControllerState) -> usize {
    let mut applied = 0;
    for (version, name, run) in MIGRATIONS {
        if state.version < *version {
            info!(from = state.version, to = version, name, "applying controller migration");
            run(state);
            state.version = *version;
            applied += 1;
        }
    }
    debug_assert_eq!(state.version.max(CONTROLLER_VERSION), CONTROLLER_VERSION);
    applied
}

/// v1 → v2: the device index and the device back-references are derived
/// data; rebuild both from the location maps, which are authoritative.
fn rebuild_device_index(state: &mut ControllerState) {
    state.location_devices.clear();
    for location in state.locations.values_mut() {
        let location_id = location.id.clone();
        for (device_id, device) in &mut location.devices {
            device.location_id = location_id.clone();
            state
                .location_devices
                .insert(device_id.clone(), location_id.clone());
        }
    }
}

/// v2 → v3: blobs written before ordering was enforced may hold unsorted
/// or duplicate-timestamp samples; re-establish the series invariant.
fn normalize_measurement_series(state: &mut ControllerState) {
    for location in state.locations.values_mut() {
        for device in location.devices.values_mut() {
            for series in device.measurements.values_mut() {
                series.normalize();
            }
        }
    }
}
