//! Runtime controller — the rehydrated graph plus its behavior objects.
//!
//! [`Controller`] pairs the serializable [`ControllerState`] with the
//! per-invocation runtime side: driver instances and live microservice
//! maps, both rebuilt from the registry every invocation. All structural
//! operations (reconciliation, membership sync, deletion) go through this
//! type so the device index and the location maps never diverge.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, info, warn};

use carehub_domain::access::{AccessEntry, AccessSnapshot, DeviceGrant};
use carehub_domain::controller::ControllerState;
use carehub_domain::device::DeviceState;
use carehub_domain::error::{CareHubError, DriverError, ModuleError, NotFoundError};
use carehub_domain::id::{DeviceId, LocationId, ParamName};
use carehub_domain::location::LocationState;
use carehub_domain::measurement::{MeasurementRecord, retention_window};
use carehub_domain::time::{Clock, Timestamp};

use crate::lifecycle::{self, ModuleMap, error_chain};
use crate::ports::{CommandSink, DeviceClass, EventCx, Microservice, Owner};
use crate::registry::Registry;

/// Counters describing one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub retyped: usize,
    pub deleted: usize,
    pub skipped: usize,
}

/// Devices touched by one measurement pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Devices where at least one parameter changed.
    pub updated: BTreeSet<DeviceId>,
    /// Devices that only received a metadata sync.
    pub metadata: BTreeSet<DeviceId>,
}

/// The rehydrated controller graph with its runtime behavior objects.
pub struct Controller {
    pub state: ControllerState,
    drivers: HashMap<DeviceId, Box<dyn DeviceClass>>,
    device_modules: HashMap<DeviceId, ModuleMap>,
    location_modules: HashMap<LocationId, ModuleMap>,
}

impl Controller {
    /// Wrap a deserialized (or fresh) state; behavior objects are attached
    /// later by [`sync_lifecycle`](Self::sync_lifecycle).
    #[must_use]
    pub fn hydrate(state: ControllerState) -> Self {
        Self {
            state,
            drivers: HashMap::new(),
            device_modules: HashMap::new(),
            location_modules: HashMap::new(),
        }
    }

    /// Create the location if this is the first reference to its id.
    pub fn ensure_location(&mut self, location_id: &LocationId) {
        self.state
            .locations
            .entry(location_id.clone())
            .or_insert_with(|| {
                debug!(location = %location_id, "creating location on first reference");
                LocationState::new(location_id.clone())
            });
    }

    /// Resolve a device through the index.
    #[must_use]
    pub fn device(&self, device_id: &DeviceId) -> Option<&DeviceState> {
        let location_id = self.state.location_devices.get(device_id)?;
        self.state.locations.get(location_id)?.devices.get(device_id)
    }

    /// Resolve a device mutably through the index.
    pub fn device_mut(&mut self, device_id: &DeviceId) -> Option<&mut DeviceState> {
        let location_id = self.state.location_devices.get(device_id)?.clone();
        self.state
            .locations
            .get_mut(&location_id)?
            .devices
            .get_mut(device_id)
    }

    /// Ids of all locations, in map order.
    #[must_use]
    pub fn location_ids(&self) -> Vec<LocationId> {
        self.state.locations.keys().cloned().collect()
    }

    /// Ids of the devices held by one location, in map order.
    #[must_use]
    pub fn device_ids(&self, location_id: &LocationId) -> Vec<DeviceId> {
        self.state
            .locations
            .get(location_id)
            .map(|location| location.devices.keys().cloned().collect())
            .unwrap_or_default()
    }

    // ── Roster reconciliation ──────────────────────────────────────

    /// Reconcile the graph against the host's access snapshot.
    ///
    /// Entries are applied in snapshot order; afterwards every previously
    /// tracked device id is visited once and pruned when absent from the
    /// snapshot or of a deprecated class. Idempotent.
    #[tracing::instrument(skip_all, fields(entries = snapshot.entries.len()))]
    pub fn reconcile(
        &mut self,
        snapshot: &AccessSnapshot,
        registry: &Registry,
        commands: &mut dyn CommandSink,
        clock: Clock,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for entry in &snapshot.entries {
            match entry {
                AccessEntry::Mode(grant) => {
                    if grant.location_id.is_empty() {
                        warn!("mode grant with empty location id skipped");
                        report.skipped += 1;
                    } else {
                        self.ensure_location(&grant.location_id);
                    }
                }
                AccessEntry::Device(grant) => {
                    self.reconcile_device(grant, registry, commands, clock, &mut report);
                }
            }
        }

        let granted: BTreeSet<DeviceId> =
            snapshot.device_grants().map(|g| g.device_id.clone()).collect();
        let tracked: Vec<DeviceId> = self.state.location_devices.keys().cloned().collect();
        for device_id in tracked {
            let deprecated = self
                .device(&device_id)
                .is_some_and(|d| registry.is_deprecated(&d.device_type));
            if (!granted.contains(&device_id) || deprecated)
                && self.delete_device(&device_id, registry, commands, clock)
            {
                report.deleted += 1;
            }
        }

        debug!(?report, devices = self.state.device_count(), "reconciliation complete");
        report
    }

    fn reconcile_device(
        &mut self,
        grant: &DeviceGrant,
        registry: &Registry,
        commands: &mut dyn CommandSink,
        clock: Clock,
        report: &mut ReconcileReport,
    ) {
        if grant.device_id.is_empty() || grant.location_id.is_empty() {
            warn!("device grant with empty identifiers skipped");
            report.skipped += 1;
            return;
        }

        let existing_type = self.device(&grant.device_id).map(|d| d.device_type.clone());
        let retype = existing_type
            .as_ref()
            .is_some_and(|device_type| *device_type != grant.device_type);
        if existing_type.is_none() || retype {
            if retype {
                self.delete_device(&grant.device_id, registry, commands, clock);
            }
            let Some(spec) = registry.resolve_class(&grant.device_type) else {
                warn!(
                    device = %grant.device_id,
                    device_type = %grant.device_type,
                    "no device class registered; grant skipped"
                );
                report.skipped += 1;
                return;
            };
            let device = match DeviceState::builder()
                .id(grant.device_id.clone())
                .device_type(grant.device_type.clone())
                .location_id(grant.location_id.clone())
                .build()
            {
                Ok(device) => device,
                Err(err) => {
                    warn!(device = %grant.device_id, error = %err, "invalid device grant skipped");
                    report.skipped += 1;
                    return;
                }
            };
            self.sync_membership(&grant.location_id, &grant.device_id, Some(device));
            self.drivers
                .insert(grant.device_id.clone(), (spec.build)(&grant.device_type));
            if retype {
                report.retyped += 1;
            } else {
                report.created += 1;
            }
            if grant.read_allowed {
                // A backfill failure degrades to an empty cache.
                self.driver_call(&grant.device_id, commands, clock, |driver, state, cx| {
                    driver.backfill(state, cx)
                });
            } else {
                debug!(
                    device = %grant.device_id,
                    "no read permission for history backfill; starting with empty cache"
                );
            }
        }

        let coordinates_changed;
        {
            let Some(device) = self.device_mut(&grant.device_id) else {
                return;
            };
            device.connected = grant.connected;
            device.read_allowed = grant.read_allowed;
            device.control_allowed = grant.control_allowed;
            device.description = grant.description.clone();
            device.proxy_id = grant.proxy_id.clone();
            device.born_on = grant.born_on;
            device.apply_goal(grant.goal_id.clone());
            coordinates_changed = device.coordinates != grant.coordinates;
            device.coordinates = grant.coordinates;
        }
        if coordinates_changed {
            self.notify_coordinates_changed(&grant.device_id, commands, clock);
        }
        self.sync_membership(&grant.location_id, &grant.device_id, None);
    }

    // ── Membership ─────────────────────────────────────────────────

    /// Synchronize one device's location membership.
    ///
    /// Creates the location lazily, attaches a fresh device object when
    /// given one, and moves a device tracked under a different location.
    /// Re-running with identical inputs leaves the roster unchanged.
    pub fn sync_membership(
        &mut self,
        location_id: &LocationId,
        device_id: &DeviceId,
        fresh: Option<DeviceState>,
    ) {
        self.ensure_location(location_id);
        match self.state.location_devices.get(device_id).cloned() {
            None => {
                if let Some(mut device) = fresh {
                    device.location_id = location_id.clone();
                    if let Some(location) = self.state.locations.get_mut(location_id) {
                        location.devices.insert(device_id.clone(), device);
                    }
                    self.state
                        .location_devices
                        .insert(device_id.clone(), location_id.clone());
                }
            }
            Some(current) if current == *location_id => {
                if let Some(mut device) = fresh {
                    device.location_id = location_id.clone();
                    if let Some(location) = self.state.locations.get_mut(location_id) {
                        location.devices.insert(device_id.clone(), device);
                    }
                }
            }
            Some(previous) => {
                let moved = self
                    .state
                    .locations
                    .get_mut(&previous)
                    .and_then(|location| location.devices.remove(device_id));
                if let Some(mut device) = fresh.or(moved) {
                    debug!(device = %device_id, from = %previous, to = %location_id, "device moved");
                    device.location_id = location_id.clone();
                    if let Some(location) = self.state.locations.get_mut(location_id) {
                        location.devices.insert(device_id.clone(), device);
                    }
                    self.state
                        .location_devices
                        .insert(device_id.clone(), location_id.clone());
                }
            }
        }
    }

    // ── Deletion ───────────────────────────────────────────────────

    /// Delete a device, destroying its microservices first.
    ///
    /// Returns `false` when the id was not tracked.
    pub fn delete_device(
        &mut self,
        device_id: &DeviceId,
        registry: &Registry,
        commands: &mut dyn CommandSink,
        clock: Clock,
    ) -> bool {
        let Some(location_id) = self.state.location_devices.get(device_id).cloned() else {
            return false;
        };
        let live = self.device_modules.remove(device_id).unwrap_or_default();
        let persisted = self
            .state
            .locations
            .get(&location_id)
            .and_then(|location| location.devices.get(device_id))
            .map(|device| device.modules.clone())
            .unwrap_or_default();
        let mut cx = EventCx::new(clock, commands);
        lifecycle::destroy_modules(live, &persisted, registry, &mut cx);
        self.drivers.remove(device_id);
        if let Some(location) = self.state.locations.get_mut(&location_id) {
            location.devices.remove(device_id);
        }
        self.state.location_devices.remove(device_id);
        debug!(device = %device_id, location = %location_id, "device deleted");
        true
    }

    /// Delete a location, deleting all member devices first.
    ///
    /// # Errors
    ///
    /// Returns [`CareHubError::NotFound`] when the location does not exist.
    pub fn delete_location(
        &mut self,
        location_id: &LocationId,
        registry: &Registry,
        commands: &mut dyn CommandSink,
        clock: Clock,
    ) -> Result<(), CareHubError> {
        if !self.state.locations.contains_key(location_id) {
            return Err(NotFoundError {
                entity: "Location",
                id: location_id.to_string(),
            }
            .into());
        }
        let member_ids: Vec<DeviceId> = self.device_ids(location_id);
        for device_id in member_ids {
            self.delete_device(&device_id, registry, commands, clock);
        }
        let live = self.location_modules.remove(location_id).unwrap_or_default();
        let persisted = self
            .state
            .locations
            .get(location_id)
            .map(|location| location.modules.clone())
            .unwrap_or_default();
        let mut cx = EventCx::new(clock, commands);
        lifecycle::destroy_modules(live, &persisted, registry, &mut cx);
        self.state.locations.remove(location_id);
        info!(location = %location_id, "location deleted");
        Ok(())
    }

    // ── Callback plumbing ──────────────────────────────────────────

    /// Run a fault-isolated callback against a device's driver and state.
    pub fn driver_call(
        &mut self,
        device_id: &DeviceId,
        commands: &mut dyn CommandSink,
        clock: Clock,
        f: impl FnOnce(
            &mut dyn DeviceClass,
            &mut DeviceState,
            &mut EventCx<'_>,
        ) -> Result<(), DriverError>,
    ) {
        let Some(location_id) = self.state.location_devices.get(device_id).cloned() else {
            return;
        };
        let Some(driver) = self.drivers.get_mut(device_id) else {
            return;
        };
        let Some(device) = self
            .state
            .locations
            .get_mut(&location_id)
            .and_then(|location| location.devices.get_mut(device_id))
        else {
            return;
        };
        let mut cx = EventCx::new(clock, commands);
        if let Err(err) = f(driver.as_mut(), device, &mut cx) {
            warn!(device = %device_id, error = error_chain(&err), "device class callback failed");
        }
    }

    /// Run a fault-isolated callback against each of a device's modules.
    pub fn for_each_device_module(
        &mut self,
        device_id: &DeviceId,
        commands: &mut dyn CommandSink,
        clock: Clock,
        mut f: impl FnMut(
            &mut dyn Microservice,
            &DeviceState,
            &mut EventCx<'_>,
        ) -> Result<(), ModuleError>,
    ) {
        let Some(location_id) = self.state.location_devices.get(device_id) else {
            return;
        };
        let Some(device) = self
            .state
            .locations
            .get(location_id)
            .and_then(|location| location.devices.get(device_id))
        else {
            return;
        };
        let Some(modules) = self.device_modules.get_mut(device_id) else {
            return;
        };
        let mut cx = EventCx::new(clock, commands);
        for (name, module) in modules.iter_mut() {
            if let Err(err) = f(module.as_mut(), device, &mut cx) {
                warn!(module = %name, device = %device_id, error = error_chain(&err), "module callback failed");
            }
        }
    }

    /// Run a fault-isolated callback against each of a location's modules.
    pub fn for_each_location_module(
        &mut self,
        location_id: &LocationId,
        commands: &mut dyn CommandSink,
        clock: Clock,
        mut f: impl FnMut(&mut dyn Microservice, &mut EventCx<'_>) -> Result<(), ModuleError>,
    ) {
        let Some(modules) = self.location_modules.get_mut(location_id) else {
            return;
        };
        let mut cx = EventCx::new(clock, commands);
        for (name, module) in modules.iter_mut() {
            if let Err(err) = f(module.as_mut(), &mut cx) {
                warn!(module = %name, location = %location_id, error = error_chain(&err), "module callback failed");
            }
        }
    }

    fn notify_coordinates_changed(
        &mut self,
        device_id: &DeviceId,
        commands: &mut dyn CommandSink,
        clock: Clock,
    ) {
        self.driver_call(device_id, commands, clock, |driver, state, cx| {
            driver.coordinates_updated(state, cx)
        });
        self.for_each_device_module(device_id, commands, clock, |module, device, cx| {
            module.coordinates_updated(device, cx)
        });
        // Devices proxied through this one observe the move as well.
        let children: Vec<DeviceId> = self
            .state
            .locations
            .values()
            .flat_map(|location| location.devices.values())
            .filter(|device| device.proxy_id.as_ref() == Some(device_id))
            .map(|device| device.id.clone())
            .collect();
        for child in children {
            self.driver_call(&child, commands, clock, |driver, state, cx| {
                driver.coordinates_updated(state, cx)
            });
            self.for_each_device_module(&child, commands, clock, |module, device, cx| {
                module.coordinates_updated(device, cx)
            });
        }
    }

    // ── Measurement ingestion ──────────────────────────────────────

    /// Route a flat measurement batch to every addressed device, in
    /// first-appearance order, cascading through proxy devices.
    #[tracing::instrument(skip_all, fields(records = records.len()))]
    pub fn ingest_measurements(
        &mut self,
        records: &[MeasurementRecord],
        commands: &mut dyn CommandSink,
        clock: Clock,
    ) -> UpdateOutcome {
        let mut outcome = UpdateOutcome::default();
        let mut order: Vec<DeviceId> = Vec::new();
        for record in records {
            if !order.contains(&record.device_id) {
                order.push(record.device_id.clone());
            }
        }
        for device_id in &order {
            if !self.state.location_devices.contains_key(device_id) {
                debug!(device = %device_id, "measurements for untracked device skipped");
                continue;
            }
            let mut visited = BTreeSet::new();
            self.update_device_chain(device_id, records, commands, clock, &mut visited, &mut outcome);
        }
        outcome
    }

    fn update_device_chain(
        &mut self,
        device_id: &DeviceId,
        records: &[MeasurementRecord],
        commands: &mut dyn CommandSink,
        clock: Clock,
        visited: &mut BTreeSet<DeviceId>,
        outcome: &mut UpdateOutcome,
    ) {
        if !visited.insert(device_id.clone()) {
            return;
        }
        let Some(location_id) = self.state.location_devices.get(device_id).cloned() else {
            return;
        };
        let statics: Vec<MeasurementRecord> = records
            .iter()
            .filter(|r| r.device_id == *device_id && !r.updated)
            .cloned()
            .collect();
        let updated: Vec<MeasurementRecord> = records
            .iter()
            .filter(|r| r.device_id == *device_id && r.updated)
            .cloned()
            .collect();
        let had_records = !statics.is_empty() || !updated.is_empty();

        // Bucket updated records by exact timestamp, preserving list order
        // within a bucket.
        let mut buckets: BTreeMap<Timestamp, Vec<MeasurementRecord>> = BTreeMap::new();
        for record in updated {
            buckets.entry(record.time).or_default().push(record);
        }

        let proxy_id = self.device(device_id).and_then(|d| d.proxy_id.clone());
        let mut device_changed = false;
        let mut pass_changed: Vec<ParamName> = Vec::new();
        let mut seen: BTreeSet<(ParamName, Timestamp)> = BTreeSet::new();

        for (bucket_time, bucket) in buckets {
            // Steps inside a bucket observe the bucket's timestamp as
            // "now"; the caller's clock is untouched afterwards.
            let bucket_clock = Clock::at(bucket_time);
            let mut merged = bucket;
            // Same-parameter duplicates: the later-seen record is bumped
            // by +1 ms until unique, so histories stay strictly ordered.
            // The record stays in its original bucket.
            for record in &mut merged {
                let param = record.param();
                while !seen.insert((param.clone(), record.time)) {
                    record.time += chrono::Duration::milliseconds(1);
                }
            }
            merged.extend(statics.iter().cloned());

            {
                let driver = self.drivers.get_mut(device_id);
                let device = self
                    .state
                    .locations
                    .get(&location_id)
                    .and_then(|location| location.devices.get(device_id));
                if let (Some(driver), Some(device)) = (driver, device) {
                    let mut cx = EventCx::new(bucket_clock, commands);
                    if let Err(err) = driver.filter_measurements(device, &mut merged, &mut cx) {
                        warn!(
                            device = %device_id,
                            error = error_chain(&err),
                            "measurement filter failed; applying bucket unfiltered"
                        );
                    }
                }
            }

            let mut changed: Vec<ParamName> = Vec::new();
            {
                let Some(device) = self
                    .state
                    .locations
                    .get_mut(&location_id)
                    .and_then(|location| location.devices.get_mut(device_id))
                else {
                    return;
                };
                let enforce = device.enforce_cache_size;
                for record in &merged {
                    let param = record.param();
                    let series = device.series_mut(&param);
                    let value_changed = series.insert(record.value.clone(), record.time);
                    if enforce {
                        series.evict(retention_window(), bucket_clock);
                    }
                    if value_changed && !changed.contains(&param) {
                        changed.push(param);
                    }
                    device.health.samples += 1;
                }
                device.health.batches += 1;
                device.health.last_seen = Some(bucket_clock.now());
            }

            if changed.is_empty() {
                continue;
            }
            device_changed = true;
            for param in &changed {
                if !pass_changed.contains(param) {
                    pass_changed.push(param.clone());
                }
            }
            self.notify_measurement_observers(
                device_id,
                &changed,
                proxy_id.as_ref(),
                outcome,
                commands,
                bucket_clock,
            );
        }

        if device_changed {
            if let Some(device) = self.device_mut(device_id) {
                device.last_updated_params = pass_changed;
            }
            outcome.metadata.remove(device_id);
            outcome.updated.insert(device_id.clone());
        } else if had_records && !outcome.updated.contains(device_id) {
            outcome.metadata.insert(device_id.clone());
        }

        // Cascade the same batch into the proxy device, merging its
        // results into this pass's outcome.
        if let Some(proxy_id) = proxy_id
            && self.state.location_devices.contains_key(&proxy_id)
        {
            self.update_device_chain(&proxy_id, records, commands, clock, visited, outcome);
        }
    }

    fn notify_measurement_observers(
        &mut self,
        device_id: &DeviceId,
        changed: &[ParamName],
        proxy_id: Option<&DeviceId>,
        outcome: &UpdateOutcome,
        commands: &mut dyn CommandSink,
        clock: Clock,
    ) {
        self.for_each_device_module(device_id, commands, clock, |module, device, cx| {
            module.device_measurements_updated(device, changed, cx)
        });

        let location_id = self.state.location_devices.get(device_id).cloned();
        if let Some(location_id) = &location_id {
            let device = self
                .state
                .locations
                .get(location_id)
                .and_then(|location| location.devices.get(device_id));
            let modules = self.location_modules.get_mut(location_id);
            if let (Some(device), Some(modules)) = (device, modules) {
                let mut cx = EventCx::new(clock, commands);
                for (name, module) in modules.iter_mut() {
                    if let Err(err) = module.device_measurements_updated(device, changed, &mut cx) {
                        warn!(module = %name, error = error_chain(&err), "location module callback failed");
                    }
                }
            }
        }

        // The gateway still observes traffic for devices behind it, unless
        // it was itself updated in this pass.
        if let Some(proxy_id) = proxy_id
            && !outcome.updated.contains(proxy_id)
            && let Some(location_id) = &location_id
        {
            let device = self
                .state
                .locations
                .get(location_id)
                .and_then(|location| location.devices.get(device_id));
            let modules = self.device_modules.get_mut(proxy_id);
            if let (Some(device), Some(modules)) = (device, modules) {
                let mut cx = EventCx::new(clock, commands);
                for (name, module) in modules.iter_mut() {
                    if let Err(err) = module.device_measurements_updated(device, changed, &mut cx) {
                        warn!(module = %name, proxy = %proxy_id, error = error_chain(&err), "proxy module callback failed");
                    }
                }
            }
        }
    }

    // ── Lifecycle & persistence ────────────────────────────────────

    /// Rebuild drivers and synchronize every owner's modules against the
    /// registry's desired lists. Runs once per invocation, after any
    /// migration completes.
    #[tracing::instrument(skip_all)]
    pub fn sync_lifecycle(
        &mut self,
        registry: &Registry,
        commands: &mut dyn CommandSink,
        clock: Clock,
    ) {
        for location_id in self.location_ids() {
            {
                let Some(location) = self.state.locations.get_mut(&location_id) else {
                    continue;
                };
                let live = self.location_modules.entry(location_id.clone()).or_default();
                let owner = Owner::Location {
                    location_id: location_id.clone(),
                };
                let mut cx = EventCx::new(clock, commands);
                lifecycle::sync_owner_modules(
                    registry.location_modules(),
                    registry,
                    &mut location.modules,
                    live,
                    &owner,
                    &mut cx,
                );
            }

            for device_id in self.device_ids(&location_id) {
                let Some(device_type) = self.device(&device_id).map(|d| d.device_type.clone())
                else {
                    continue;
                };
                match registry.resolve_class(&device_type) {
                    Some(spec) => {
                        self.drivers
                            .entry(device_id.clone())
                            .or_insert_with(|| (spec.build)(&device_type));
                    }
                    None => {
                        warn!(device = %device_id, device_type = %device_type, "no device class registered");
                        continue;
                    }
                }
                self.driver_call(&device_id, commands, clock, |driver, state, cx| {
                    driver.initialize(state, cx)
                });

                let Some(device) = self
                    .state
                    .locations
                    .get_mut(&location_id)
                    .and_then(|location| location.devices.get_mut(&device_id))
                else {
                    continue;
                };
                let live = self.device_modules.entry(device_id.clone()).or_default();
                let owner = Owner::Device {
                    location_id: location_id.clone(),
                    device_id: device_id.clone(),
                };
                let mut cx = EventCx::new(clock, commands);
                lifecycle::sync_owner_modules(
                    registry.device_modules(&device_type),
                    registry,
                    &mut device.modules,
                    live,
                    &owner,
                    &mut cx,
                );
            }
        }
    }

    /// Serialize every live module's state back into the graph before the
    /// blob is persisted.
    pub fn snapshot_modules(&mut self) {
        for (location_id, live) in &self.location_modules {
            if let Some(location) = self.state.locations.get_mut(location_id) {
                for (name, module) in live {
                    location.modules.insert(name.clone(), module.snapshot());
                }
            }
        }
        let ControllerState {
            locations,
            location_devices,
            ..
        } = &mut self.state;
        for (device_id, live) in &self.device_modules {
            let Some(location_id) = location_devices.get(device_id) else {
                continue;
            };
            let Some(device) = locations
                .get_mut(location_id)
                .and_then(|location| location.devices.get_mut(device_id))
            else {
                continue;
            };
            for (name, module) in live {
                device.modules.insert(name.clone(), module.snapshot());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use carehub_domain::access::{DeviceGrant, ModeGrant};
    use carehub_domain::device::Coordinates;
    use carehub_domain::error::CommandError;
    use carehub_domain::measurement::MeasurementValue;
    use carehub_domain::time::from_millis;

    use crate::ports::{Command, CommandSink};
    use crate::registry::{DeviceClassSpec, ModuleSpec};

    thread_local! {
        static EVENTS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    }

    fn record(event: impl Into<String>) {
        EVENTS.with_borrow_mut(|events| events.push(event.into()));
    }

    fn take_events() -> Vec<String> {
        EVENTS.with_borrow_mut(std::mem::take)
    }

    struct NullSink;

    impl CommandSink for NullSink {
        fn send_command(
            &mut self,
            _device_id: &DeviceId,
            _command: Command,
        ) -> Result<(), CommandError> {
            Ok(())
        }

        fn flush(&mut self) -> Result<(), CommandError> {
            Ok(())
        }
    }

    struct ProbeClass;

    impl DeviceClass for ProbeClass {
        fn backfill(
            &mut self,
            state: &mut DeviceState,
            _cx: &mut EventCx<'_>,
        ) -> Result<(), DriverError> {
            record(format!("backfill:{}", state.id));
            Ok(())
        }

        fn coordinates_updated(
            &mut self,
            state: &mut DeviceState,
            _cx: &mut EventCx<'_>,
        ) -> Result<(), DriverError> {
            record(format!("driver-coords:{}", state.id));
            Ok(())
        }
    }

    fn build_probe_class(_device_type: &str) -> Box<dyn DeviceClass> {
        record("class-built");
        Box::new(ProbeClass)
    }

    struct ProbeModule;

    impl Microservice for ProbeModule {
        fn set_parent(&mut self, _owner: Owner) {}

        fn initialize(&mut self, _cx: &mut EventCx<'_>) -> Result<(), ModuleError> {
            Ok(())
        }

        fn destroy(&mut self, _cx: &mut EventCx<'_>) -> Result<(), ModuleError> {
            record("module-destroyed");
            Ok(())
        }

        fn device_measurements_updated(
            &mut self,
            device: &DeviceState,
            changed: &[ParamName],
            cx: &mut EventCx<'_>,
        ) -> Result<(), ModuleError> {
            let params: Vec<&str> = changed.iter().map(ParamName::as_str).collect();
            record(format!(
                "measurements:{}:{}:{}",
                device.id,
                params.join(","),
                cx.clock.now().timestamp_millis()
            ));
            Ok(())
        }

        fn coordinates_updated(
            &mut self,
            device: &DeviceState,
            _cx: &mut EventCx<'_>,
        ) -> Result<(), ModuleError> {
            record(format!("module-coords:{}", device.id));
            Ok(())
        }
    }

    fn build_probe_module(
        _state: Option<&serde_json::Value>,
    ) -> Result<Box<dyn Microservice>, ModuleError> {
        Ok(Box::new(ProbeModule))
    }

    const PROBE_MODULE: ModuleSpec = ModuleSpec {
        name: "probe",
        build: build_probe_module,
    };

    fn registry() -> Registry {
        Registry::builder()
            .device_class(DeviceClassSpec {
                device_types: &["radar", "thermostat", "gateway"],
                build: build_probe_class,
            })
            .device_module("radar", PROBE_MODULE)
            .device_module("gateway", PROBE_MODULE)
            .build()
    }

    fn grant(device_id: &str, location_id: &str, device_type: &str) -> DeviceGrant {
        DeviceGrant::builder()
            .device_id(device_id)
            .location_id(location_id)
            .device_type(device_type)
            .build()
    }

    fn snapshot(grants: Vec<DeviceGrant>) -> AccessSnapshot {
        AccessSnapshot::new(grants.into_iter().map(AccessEntry::Device).collect())
    }

    fn clock() -> Clock {
        Clock::at(from_millis(1_000_000).unwrap())
    }

    fn reconciled(grants: Vec<DeviceGrant>) -> Controller {
        let mut controller = Controller::hydrate(ControllerState::default());
        let registry = registry();
        let mut sink = NullSink;
        controller.reconcile(&snapshot(grants), &registry, &mut sink, clock());
        controller
    }

    fn record_at(device: &str, name: &str, millis: i64, value: i64, updated: bool) -> MeasurementRecord {
        MeasurementRecord {
            device_id: DeviceId::new(device),
            name: name.to_string(),
            index: None,
            value: MeasurementValue::Int(value),
            time: from_millis(millis).unwrap(),
            updated,
        }
    }

    // ── Reconciliation ─────────────────────────────────────────────

    #[test]
    fn should_create_device_and_location_from_grant() {
        let controller = reconciled(vec![grant("d1", "loc-1", "radar")]);
        assert!(controller.state.locations.contains_key(&LocationId::new("loc-1")));
        let device = controller.device(&DeviceId::new("d1")).unwrap();
        assert_eq!(device.device_type, "radar");
        assert_eq!(device.location_id.as_str(), "loc-1");
        assert!(controller.state.check_index().is_ok());
    }

    #[test]
    fn should_create_location_from_mode_grant() {
        let mut controller = Controller::hydrate(ControllerState::default());
        let registry = registry();
        let mut sink = NullSink;
        let snapshot = AccessSnapshot::new(vec![AccessEntry::Mode(ModeGrant {
            location_id: LocationId::new("loc-9"),
        })]);
        controller.reconcile(&snapshot, &registry, &mut sink, clock());
        assert!(controller.state.locations.contains_key(&LocationId::new("loc-9")));
    }

    #[test]
    fn should_be_idempotent_across_identical_snapshots() {
        let grants = vec![grant("d1", "loc-1", "radar"), grant("d2", "loc-1", "thermostat")];
        let mut controller = reconciled(grants.clone());
        let first = controller.state.clone();

        let registry = registry();
        let mut sink = NullSink;
        controller.reconcile(&snapshot(grants), &registry, &mut sink, clock());
        assert_eq!(controller.state, first);
    }

    #[test]
    fn should_skip_grant_for_unknown_device_type() {
        let controller = reconciled(vec![grant("d1", "loc-1", "hoverboard")]);
        assert!(controller.device(&DeviceId::new("d1")).is_none());
        assert_eq!(controller.state.device_count(), 0);
    }

    #[test]
    fn should_apply_mutable_fields_from_grant() {
        let controller = reconciled(vec![DeviceGrant::builder()
            .device_id("d1")
            .location_id("loc-1")
            .device_type("radar")
            .description("bedroom radar")
            .connected(false)
            .control_allowed(true)
            .proxy_id("gw-1")
            .build()]);

        let device = controller.device(&DeviceId::new("d1")).unwrap();
        assert_eq!(device.description, "bedroom radar");
        assert!(!device.connected);
        assert!(device.control_allowed);
        assert_eq!(device.proxy_id.as_ref().unwrap().as_str(), "gw-1");
    }

    #[test]
    fn should_delete_device_absent_from_snapshot() {
        let mut controller = reconciled(vec![grant("d1", "loc-1", "radar"), grant("d2", "loc-1", "radar")]);
        let registry = registry();
        let mut sink = NullSink;
        controller.sync_lifecycle(&registry, &mut sink, clock());
        take_events();

        let report =
            controller.reconcile(&snapshot(vec![grant("d2", "loc-1", "radar")]), &registry, &mut sink, clock());

        assert_eq!(report.deleted, 1);
        assert!(controller.device(&DeviceId::new("d1")).is_none());
        assert!(!controller.state.location_devices.contains_key(&DeviceId::new("d1")));
        assert!(controller.state.check_index().is_ok());
        // Modules were destroyed before removal.
        assert!(take_events().contains(&"module-destroyed".to_string()));
    }

    #[test]
    fn should_force_delete_deprecated_class_still_in_snapshot() {
        let mut controller = reconciled(vec![grant("d1", "loc-1", "radar")]);

        let deprecating = Registry::builder()
            .device_class(DeviceClassSpec {
                device_types: &["radar"],
                build: build_probe_class,
            })
            .deprecate("radar")
            .build();
        let mut sink = NullSink;
        let report = controller.reconcile(
            &snapshot(vec![grant("d1", "loc-1", "radar")]),
            &deprecating,
            &mut sink,
            clock(),
        );

        assert!(controller.device(&DeviceId::new("d1")).is_none());
        assert!(report.deleted >= 1);
    }

    #[test]
    fn should_move_device_between_locations() {
        let mut controller = reconciled(vec![grant("d1", "loc-1", "radar")]);

        let registry = registry();
        let mut sink = NullSink;
        controller.reconcile(&snapshot(vec![grant("d1", "loc-2", "radar")]), &registry, &mut sink, clock());

        let device = controller.device(&DeviceId::new("d1")).unwrap();
        assert_eq!(device.location_id.as_str(), "loc-2");
        assert!(
            !controller.state.locations[&LocationId::new("loc-1")]
                .devices
                .contains_key(&DeviceId::new("d1"))
        );
        assert!(
            controller.state.locations[&LocationId::new("loc-2")]
                .devices
                .contains_key(&DeviceId::new("d1"))
        );
        assert!(controller.state.check_index().is_ok());
    }

    #[test]
    fn should_preserve_measurements_across_move() {
        let mut controller = reconciled(vec![grant("d1", "loc-1", "radar")]);
        controller
            .device_mut(&DeviceId::new("d1"))
            .unwrap()
            .series_mut(&ParamName::new("x"))
            .insert(MeasurementValue::Int(5), from_millis(1_000).unwrap());

        let registry = registry();
        let mut sink = NullSink;
        controller.reconcile(&snapshot(vec![grant("d1", "loc-2", "radar")]), &registry, &mut sink, clock());

        let device = controller.device(&DeviceId::new("d1")).unwrap();
        assert_eq!(device.measurements[&ParamName::new("x")].len(), 1);
    }

    #[test]
    fn should_recreate_exactly_once_when_device_type_changes_twice_in_snapshot() {
        let mut controller = reconciled(vec![grant("d1", "loc-1", "radar")]);
        take_events();

        // Two entries for the same id with the same new type: one
        // delete+recreate cycle, the second entry matches the fresh object.
        let registry = registry();
        let mut sink = NullSink;
        let report = controller.reconcile(
            &snapshot(vec![grant("d1", "loc-1", "thermostat"), grant("d1", "loc-1", "thermostat")]),
            &registry,
            &mut sink,
            clock(),
        );

        assert_eq!(report.retyped, 1);
        let builds = take_events()
            .iter()
            .filter(|e| *e == "class-built")
            .count();
        assert_eq!(builds, 1);
        assert_eq!(
            controller.device(&DeviceId::new("d1")).unwrap().device_type,
            "thermostat"
        );
    }

    #[test]
    fn should_drop_measurements_on_retype() {
        let mut controller = reconciled(vec![grant("d1", "loc-1", "radar")]);
        controller
            .device_mut(&DeviceId::new("d1"))
            .unwrap()
            .series_mut(&ParamName::new("x"))
            .insert(MeasurementValue::Int(5), from_millis(1_000).unwrap());

        let registry = registry();
        let mut sink = NullSink;
        controller.reconcile(&snapshot(vec![grant("d1", "loc-1", "thermostat")]), &registry, &mut sink, clock());

        assert!(controller.device(&DeviceId::new("d1")).unwrap().measurements.is_empty());
    }

    #[test]
    fn should_flag_goal_change_only_for_previous_non_null_goal() {
        let mut controller = reconciled(vec![DeviceGrant::builder()
            .device_id("d1")
            .location_id("loc-1")
            .device_type("radar")
            .goal_id("goal-a")
            .build()]);
        assert!(!controller.device(&DeviceId::new("d1")).unwrap().goal_changed);

        let registry = registry();
        let mut sink = NullSink;
        controller.reconcile(
            &snapshot(vec![DeviceGrant::builder()
                .device_id("d1")
                .location_id("loc-1")
                .device_type("radar")
                .goal_id("goal-b")
                .build()]),
            &registry,
            &mut sink,
            clock(),
        );
        assert!(controller.device(&DeviceId::new("d1")).unwrap().goal_changed);
    }

    #[test]
    fn should_fan_out_coordinate_change_to_device_and_proxied_children() {
        let mut controller = reconciled(vec![
            grant("gw-1", "loc-1", "gateway"),
            DeviceGrant::builder()
                .device_id("d1")
                .location_id("loc-1")
                .device_type("radar")
                .proxy_id("gw-1")
                .build(),
        ]);
        let registry = registry();
        let mut sink = NullSink;
        controller.sync_lifecycle(&registry, &mut sink, clock());
        take_events();

        controller.reconcile(
            &snapshot(vec![
                DeviceGrant::builder()
                    .device_id("gw-1")
                    .location_id("loc-1")
                    .device_type("gateway")
                    .coordinates(Coordinates {
                        latitude: 52.1,
                        longitude: 5.1,
                    })
                    .build(),
                DeviceGrant::builder()
                    .device_id("d1")
                    .location_id("loc-1")
                    .device_type("radar")
                    .proxy_id("gw-1")
                    .build(),
            ]),
            &registry,
            &mut sink,
            clock(),
        );

        let events = take_events();
        assert!(events.contains(&"driver-coords:gw-1".to_string()));
        assert!(events.contains(&"module-coords:gw-1".to_string()));
        assert!(events.contains(&"driver-coords:d1".to_string()));
        assert!(events.contains(&"module-coords:d1".to_string()));
    }

    #[test]
    fn should_skip_backfill_when_read_permission_missing() {
        take_events();
        let _controller = reconciled(vec![DeviceGrant::builder()
            .device_id("d1")
            .location_id("loc-1")
            .device_type("radar")
            .read_allowed(false)
            .build()]);
        let events = take_events();
        assert!(!events.iter().any(|e| e.starts_with("backfill:")));
    }

    #[test]
    fn should_backfill_when_read_permission_present() {
        take_events();
        let _controller = reconciled(vec![grant("d1", "loc-1", "radar")]);
        assert!(take_events().contains(&"backfill:d1".to_string()));
    }

    // ── Membership sync ────────────────────────────────────────────

    #[test]
    fn should_keep_roster_unchanged_when_membership_sync_repeats() {
        let mut controller = reconciled(vec![grant("d1", "loc-1", "radar")]);
        let before = controller.state.clone();
        controller.sync_membership(&LocationId::new("loc-1"), &DeviceId::new("d1"), None);
        assert_eq!(controller.state, before);
    }

    // ── Deletion ───────────────────────────────────────────────────

    #[test]
    fn should_delete_location_with_member_devices() {
        let mut controller = reconciled(vec![grant("d1", "loc-1", "radar")]);
        let registry = registry();
        let mut sink = NullSink;

        controller
            .delete_location(&LocationId::new("loc-1"), &registry, &mut sink, clock())
            .unwrap();

        assert!(controller.state.locations.is_empty());
        assert!(controller.state.location_devices.is_empty());
    }

    #[test]
    fn should_return_not_found_when_deleting_missing_location() {
        let mut controller = Controller::hydrate(ControllerState::default());
        let registry = registry();
        let mut sink = NullSink;
        let result =
            controller.delete_location(&LocationId::new("ghost"), &registry, &mut sink, clock());
        assert!(matches!(result, Err(CareHubError::NotFound(_))));
    }

    // ── Measurement ingestion ──────────────────────────────────────

    fn measured_controller() -> Controller {
        let mut controller = reconciled(vec![grant("d1", "loc-1", "radar")]);
        let registry = registry();
        let mut sink = NullSink;
        controller.sync_lifecycle(&registry, &mut sink, clock());
        take_events();
        controller
    }

    #[test]
    fn should_process_duplicate_timestamps_as_two_buckets_with_one_notification_each() {
        let mut controller = measured_controller();
        let mut sink = NullSink;

        let records = vec![
            record_at("d1", "x", 1_000, 1, true),
            record_at("d1", "x", 1_000, 2, true),
            record_at("d1", "x", 2_000, 3, true),
        ];
        let outcome = controller.ingest_measurements(&records, &mut sink, clock());

        assert!(outcome.updated.contains(&DeviceId::new("d1")));

        // Two buckets: the second record is re-timestamped to 1001 but
        // stays in the t=1000 bucket, so exactly one notification fires
        // per bucket.
        let notifications: Vec<String> = take_events()
            .into_iter()
            .filter(|e| e.starts_with("measurements:d1"))
            .collect();
        assert_eq!(
            notifications,
            vec![
                "measurements:d1:x:1000".to_string(),
                "measurements:d1:x:2000".to_string(),
            ]
        );

        // Histories stay strictly descending with unique timestamps.
        let device = controller.device(&DeviceId::new("d1")).unwrap();
        let times: Vec<i64> = device.measurements[&ParamName::new("x")]
            .samples()
            .iter()
            .map(|s| s.time.timestamp_millis())
            .collect();
        assert_eq!(times, vec![2_000, 1_001, 1_000]);
    }

    #[test]
    fn should_fire_exactly_one_notification_per_changed_bucket() {
        let mut controller = measured_controller();
        let mut sink = NullSink;

        let records = vec![
            record_at("d1", "x", 1_000, 1, true),
            record_at("d1", "x", 2_000, 2, true),
        ];
        controller.ingest_measurements(&records, &mut sink, clock());

        let notifications = take_events()
            .into_iter()
            .filter(|e| e.starts_with("measurements:d1"))
            .count();
        assert_eq!(notifications, 2);
    }

    #[test]
    fn should_classify_unchanged_device_as_metadata_only() {
        let mut controller = measured_controller();
        let mut sink = NullSink;

        let records = vec![record_at("d1", "x", 1_000, 1, true)];
        controller.ingest_measurements(&records, &mut sink, clock());
        take_events();

        // Same value at a later time: nothing changes, metadata only.
        let records = vec![record_at("d1", "x", 2_000, 1, true)];
        let outcome = controller.ingest_measurements(&records, &mut sink, clock());

        assert!(outcome.updated.is_empty());
        assert!(outcome.metadata.contains(&DeviceId::new("d1")));
        assert!(take_events().iter().all(|e| !e.starts_with("measurements:")));
    }

    #[test]
    fn should_cascade_batch_into_proxy_and_ping_its_modules() {
        let mut controller = reconciled(vec![
            grant("gw-1", "loc-1", "gateway"),
            DeviceGrant::builder()
                .device_id("d1")
                .location_id("loc-1")
                .device_type("radar")
                .proxy_id("gw-1")
                .build(),
        ]);
        let registry = registry();
        let mut sink = NullSink;
        controller.sync_lifecycle(&registry, &mut sink, clock());
        take_events();

        let records = vec![record_at("d1", "x", 1_000, 1, true)];
        let outcome = controller.ingest_measurements(&records, &mut sink, clock());

        assert!(outcome.updated.contains(&DeviceId::new("d1")));
        // The gateway saw no records of its own: metadata-only, but its
        // modules were pinged with the child's activity.
        assert!(!outcome.updated.contains(&DeviceId::new("gw-1")));
        let events = take_events();
        let proxy_pings = events
            .iter()
            .filter(|e| e.starts_with("measurements:d1"))
            .count();
        // Device modules + proxy ping observe the same change.
        assert_eq!(proxy_pings, 2);
    }

    #[test]
    fn should_not_recurse_forever_on_proxy_cycle() {
        let mut controller = reconciled(vec![
            DeviceGrant::builder()
                .device_id("a")
                .location_id("loc-1")
                .device_type("gateway")
                .proxy_id("b")
                .build(),
            DeviceGrant::builder()
                .device_id("b")
                .location_id("loc-1")
                .device_type("gateway")
                .proxy_id("a")
                .build(),
        ]);
        let mut sink = NullSink;

        let records = vec![record_at("a", "x", 1_000, 1, true)];
        let outcome = controller.ingest_measurements(&records, &mut sink, clock());
        assert!(outcome.updated.contains(&DeviceId::new("a")));
    }

    #[test]
    fn should_track_health_counters_and_last_updated_params() {
        let mut controller = measured_controller();
        let mut sink = NullSink;

        let records = vec![
            record_at("d1", "x", 1_000, 1, true),
            record_at("d1", "y", 1_000, 2, true),
        ];
        controller.ingest_measurements(&records, &mut sink, clock());

        let device = controller.device(&DeviceId::new("d1")).unwrap();
        assert_eq!(device.health.batches, 1);
        assert_eq!(device.health.samples, 2);
        assert_eq!(
            device.last_updated_params,
            vec![ParamName::new("x"), ParamName::new("y")]
        );
    }

    #[test]
    fn should_skip_records_for_untracked_devices() {
        let mut controller = measured_controller();
        let mut sink = NullSink;

        let records = vec![record_at("ghost", "x", 1_000, 1, true)];
        let outcome = controller.ingest_measurements(&records, &mut sink, clock());
        assert!(outcome.updated.is_empty());
        assert!(outcome.metadata.is_empty());
    }

    // ── Module snapshot write-back ─────────────────────────────────

    #[test]
    fn should_write_module_snapshots_back_into_graph() {
        let mut controller = measured_controller();
        controller.snapshot_modules();

        let device = controller.device(&DeviceId::new("d1")).unwrap();
        assert!(device.modules.contains_key(&carehub_domain::id::ModuleName::new("probe")));
    }
}
