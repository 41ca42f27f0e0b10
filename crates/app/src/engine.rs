//! The invocation engine.
//!
//! One call to [`Engine::handle`] is one host invocation: load the
//! persisted controller (or construct a fresh default), reconcile against
//! the access snapshot, run pending migrations behind the readiness gate,
//! synchronize microservice lifecycles, replay queued triggers, dispatch
//! the live trigger, and persist the graph. Data-request work is split off
//! and handled standalone — it bypasses the queue and never causes a
//! core-state write.

use tracing::{info, warn};

use carehub_domain::controller::{
    CONTROLLER_VERSION, ControllerState, QueuedTrigger, Readiness,
};
use carehub_domain::error::{CareHubError, StorageError};
use carehub_domain::time::Clock;
use carehub_domain::trigger::Trigger;

use crate::controller::Controller;
use crate::dispatcher;
use crate::migrations;
use crate::ports::{CommandSink, ExportSink, StateStore};
use crate::registry::Registry;

/// Storage key of the serialized controller graph.
pub const CONTROLLER_KEY: &str = "controller";

/// What one invocation did.
#[derive(Debug, Clone)]
pub struct InvocationReport {
    pub invocation_id: uuid::Uuid,
    /// Branch names executed across replayed and live dispatches.
    pub branches: Vec<&'static str>,
    /// Queued triggers replayed this invocation.
    pub replayed: usize,
    /// Migrations applied this invocation.
    pub migrated: usize,
    /// Whether the controller graph was persisted.
    pub persisted: bool,
    pub updated_devices: usize,
}

/// The rehydration–reconciliation–dispatch kernel.
pub struct Engine<S, C, E> {
    store: S,
    commands: C,
    exports: E,
    registry: Registry,
}

impl<S: StateStore, C: CommandSink, E: ExportSink> Engine<S, C, E> {
    /// Wire an engine from its collaborators and behavior tables.
    pub fn new(store: S, commands: C, exports: E, registry: Registry) -> Self {
        Self {
            store,
            commands,
            exports,
            registry,
        }
    }

    /// The behavior tables this engine consults.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The persistence collaborator (for inspection in tests and tools).
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The command collaborator (for inspection in tests and tools).
    #[must_use]
    pub fn commands(&self) -> &C {
        &self.commands
    }

    /// Handle one invocation at the current wall-clock time.
    ///
    /// # Errors
    ///
    /// Returns [`CareHubError`] only for persistence or command-flush
    /// failures; everything else degrades into logged, incomplete state.
    pub fn handle(&mut self, trigger: Trigger) -> Result<InvocationReport, CareHubError> {
        self.handle_at(trigger, Clock::system())
    }

    /// Handle one invocation under an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns [`CareHubError`] only for persistence or command-flush
    /// failures; everything else degrades into logged, incomplete state.
    pub fn handle_at(
        &mut self,
        trigger: Trigger,
        clock: Clock,
    ) -> Result<InvocationReport, CareHubError> {
        let invocation_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("invocation", id = %invocation_id, kinds = %trigger.kinds);
        let _guard = span.enter();

        let (core, data_requests) = trigger.split_data_requests();
        let run_core = core.is_core_work();
        let mut controller = Controller::hydrate(self.load_state());
        let mut report = InvocationReport {
            invocation_id,
            branches: Vec::new(),
            replayed: 0,
            migrated: 0,
            persisted: false,
            updated_devices: 0,
        };

        if run_core {
            if let Some(snapshot) = &core.access {
                controller.reconcile(snapshot, &self.registry, &mut self.commands, clock);
            }

            let mut live = Some(core);
            if controller.state.readiness() == Readiness::Preparing {
                // Park the trigger; it replays once migration completes,
                // here or in a later invocation.
                if let Some(parked) = live.take_if(|t| !t.kinds.is_empty()) {
                    controller.state.pending.push_back(QueuedTrigger {
                        received_at: clock.now(),
                        trigger: parked,
                    });
                }
                report.migrated = migrations::migrate(&mut controller.state);
            }

            if controller.state.readiness() == Readiness::Ready {
                controller.sync_lifecycle(&self.registry, &mut self.commands, clock);

                let queued: Vec<QueuedTrigger> = controller.state.pending.drain(..).collect();
                for entry in queued {
                    let dispatched = dispatcher::dispatch(
                        &mut controller,
                        &entry.trigger,
                        &self.registry,
                        &mut self.commands,
                        clock,
                    );
                    report.branches.extend(dispatched.branches);
                    report.updated_devices += dispatched.updated_devices;
                    report.replayed += 1;
                }

                if let Some(live) = live
                    && !live.kinds.is_empty()
                {
                    let dispatched = dispatcher::dispatch(
                        &mut controller,
                        &live,
                        &self.registry,
                        &mut self.commands,
                        clock,
                    );
                    report.branches.extend(dispatched.branches);
                    report.updated_devices += dispatched.updated_devices;
                }
            }
        }

        if !data_requests.is_empty() {
            dispatcher::run_data_requests(&controller, &data_requests, &mut self.exports, clock);
        }

        if run_core {
            controller.snapshot_modules();
            let bytes = serde_json::to_vec(&controller.state)
                .map_err(|err| StorageError::new("serialize", err))?;
            self.store.save(CONTROLLER_KEY, &bytes, true)?;
            self.store.flush()?;
            report.persisted = true;
        }

        self.commands.flush()?;
        info!(
            branches = ?report.branches,
            replayed = report.replayed,
            migrated = report.migrated,
            persisted = report.persisted,
            "invocation complete"
        );
        Ok(report)
    }

    /// Recreate the controller wholesale, discarding everything persisted.
    ///
    /// # Errors
    ///
    /// Returns [`CareHubError::Storage`] when the fresh state cannot be
    /// written.
    pub fn reset(&mut self) -> Result<(), CareHubError> {
        info!("recreating controller state wholesale");
        let bytes = serde_json::to_vec(&ControllerState::default())
            .map_err(|err| StorageError::new("serialize", err))?;
        self.store.save(CONTROLLER_KEY, &bytes, true)?;
        self.store.flush()?;
        Ok(())
    }

    /// Load the controller blob, degrading every failure to a fresh
    /// default.
    fn load_state(&self) -> ControllerState {
        match self.store.load(CONTROLLER_KEY) {
            None => ControllerState::default(),
            Some(bytes) => match serde_json::from_slice::<ControllerState>(&bytes) {
                Ok(state) if state.version <= CONTROLLER_VERSION => state,
                Ok(state) => {
                    warn!(
                        version = state.version,
                        "controller blob from a newer version; starting fresh"
                    );
                    ControllerState::default()
                }
                Err(err) => {
                    warn!(error = %err, "discarding unreadable controller blob");
                    ControllerState::default()
                }
            },
        }
    }
}
