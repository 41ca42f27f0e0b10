//! Trigger dispatcher — demultiplexes one invocation's trigger bitmask.
//!
//! All selected branches execute, non-exclusively, in the fixed order of
//! [`TriggerKinds::DISPATCH_ORDER`]. Every per-device and per-module
//! callback is fault-isolated: a failure is logged and siblings still run.

use std::io::Read as _;

use base64::Engine as _;
use flate2::read::GzDecoder;
use tracing::{debug, error, warn};

use carehub_domain::error::ExportError;
use carehub_domain::id::DeviceId;
use carehub_domain::time::Clock;
use carehub_domain::trigger::{
    DataRequest, EncodedPayload, PayloadEncoding, SCHEDULE_ADDRESS, Trigger, TriggerKinds,
};

use crate::controller::Controller;
use crate::lifecycle::error_chain;
use crate::ports::{CommandSink, ExportSink};
use crate::registry::Registry;

/// What one dispatch pass did, for the invocation report.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Branch names that executed, in order.
    pub branches: Vec<&'static str>,
    pub updated_devices: usize,
    pub metadata_devices: usize,
}

/// Execute every branch selected by the trigger, in the fixed order.
///
/// The data-request branch is handled standalone by the engine and is
/// skipped here.
#[tracing::instrument(skip_all, fields(kinds = %trigger.kinds))]
pub fn dispatch(
    controller: &mut Controller,
    trigger: &Trigger,
    registry: &Registry,
    commands: &mut dyn CommandSink,
    clock: Clock,
) -> DispatchReport {
    let mut report = DispatchReport::default();
    for kind in trigger.kinds.iter() {
        match kind {
            TriggerKinds::SCHEDULE => run_schedules(controller, commands, clock),
            TriggerKinds::MODE => run_mode_changes(controller, trigger, commands, clock),
            TriggerKinds::MEASUREMENT => {
                let outcome = controller.ingest_measurements(&trigger.measurements, commands, clock);
                report.updated_devices += outcome.updated.len();
                report.metadata_devices += outcome.metadata.len();
            }
            TriggerKinds::DEVICE_ALERT => run_alerts(controller, trigger, commands, clock),
            TriggerKinds::FILE_UPLOAD => run_files(controller, trigger, commands, clock),
            TriggerKinds::QUESTION_ANSWERED => run_questions(controller, trigger, commands, clock),
            TriggerKinds::DATASTREAM => run_datastream(controller, trigger, commands, clock),
            TriggerKinds::COMMAND_RESPONSE => {
                run_command_responses(controller, trigger, commands, clock);
            }
            TriggerKinds::METADATA => run_goal_changes(controller, commands, clock),
            TriggerKinds::LOCATION_CONFIG => {
                run_location_config(controller, trigger, registry, commands, clock);
            }
            _ => {}
        }
        report.branches.push(kind.name());
    }
    report
}

/// Run every location's schedule: location modules first, then the
/// device-scope timers.
fn run_schedules(controller: &mut Controller, commands: &mut dyn CommandSink, clock: Clock) {
    for location_id in controller.location_ids() {
        controller.for_each_location_module(&location_id, commands, clock, |module, cx| {
            module.schedule_fired(cx)
        });
        for device_id in controller.device_ids(&location_id) {
            controller.for_each_device_module(&device_id, commands, clock, |module, _device, cx| {
                module.timer_fired(cx)
            });
        }
    }
}

fn run_mode_changes(
    controller: &mut Controller,
    trigger: &Trigger,
    commands: &mut dyn CommandSink,
    clock: Clock,
) {
    for change in &trigger.mode_changes {
        controller.ensure_location(&change.location_id);
        if let Some(location) = controller.state.locations.get_mut(&change.location_id) {
            location.mode = change.mode;
        }
        controller.for_each_location_module(&change.location_id, commands, clock, |module, cx| {
            module.mode_updated(change.mode, cx)
        });
        for device_id in controller.device_ids(&change.location_id) {
            controller.for_each_device_module(&device_id, commands, clock, |module, _device, cx| {
                module.mode_updated(change.mode, cx)
            });
        }
    }
}

fn run_alerts(
    controller: &mut Controller,
    trigger: &Trigger,
    commands: &mut dyn CommandSink,
    clock: Clock,
) {
    for alert in &trigger.alerts {
        if controller.device(&alert.device_id).is_none() {
            debug!(device = %alert.device_id, "alert for untracked device skipped");
            continue;
        }
        controller.driver_call(&alert.device_id, commands, clock, |driver, state, cx| {
            driver.device_alert(state, alert, cx)
        });
        controller.for_each_device_module(
            &alert.device_id,
            commands,
            clock,
            |module, _device, cx| module.device_alert(alert, cx),
        );
    }
}

fn run_files(
    controller: &mut Controller,
    trigger: &Trigger,
    commands: &mut dyn CommandSink,
    clock: Clock,
) {
    for file in &trigger.files {
        controller.driver_call(&file.device_id, commands, clock, |driver, state, cx| {
            driver.file_uploaded(state, file, cx)
        });
    }
}

fn run_questions(
    controller: &mut Controller,
    trigger: &Trigger,
    commands: &mut dyn CommandSink,
    clock: Clock,
) {
    for answer in &trigger.questions {
        controller.ensure_location(&answer.location_id);
        controller.for_each_location_module(&answer.location_id, commands, clock, |module, cx| {
            module.question_answered(answer, cx)
        });
    }
}

fn run_datastream(
    controller: &mut Controller,
    trigger: &Trigger,
    commands: &mut dyn CommandSink,
    clock: Clock,
) {
    for message in &trigger.datastream {
        if message.address == SCHEDULE_ADDRESS {
            // Addressed "schedule" means: run all location schedules.
            run_schedules(controller, commands, clock);
            continue;
        }
        for location_id in controller.location_ids() {
            controller.for_each_location_module(&location_id, commands, clock, |module, cx| {
                module.datastream_updated(message, cx)
            });
        }
    }
}

fn run_command_responses(
    controller: &mut Controller,
    trigger: &Trigger,
    commands: &mut dyn CommandSink,
    clock: Clock,
) {
    for response in &trigger.command_responses {
        controller.driver_call(&response.device_id, commands, clock, |driver, state, cx| {
            driver.command_response(state, response, cx)
        });
    }
}

/// Notify `goal_updated` for every device flagged during reconciliation,
/// then clear the flags.
fn run_goal_changes(controller: &mut Controller, commands: &mut dyn CommandSink, clock: Clock) {
    let flagged: Vec<DeviceId> = controller
        .state
        .locations
        .values()
        .flat_map(|location| location.devices.values())
        .filter(|device| device.goal_changed)
        .map(|device| device.id.clone())
        .collect();
    for device_id in flagged {
        controller.for_each_device_module(&device_id, commands, clock, |module, device, cx| {
            module.goal_updated(device, cx)
        });
        if let Some(device) = controller.device_mut(&device_id) {
            device.goal_changed = false;
        }
    }
}

fn run_location_config(
    controller: &mut Controller,
    trigger: &Trigger,
    registry: &Registry,
    commands: &mut dyn CommandSink,
    clock: Clock,
) {
    for change in &trigger.config_changes {
        let deleted = change
            .settings
            .get("deleted")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if deleted {
            if let Err(err) =
                controller.delete_location(&change.location_id, registry, commands, clock)
            {
                warn!(location = %change.location_id, error = %err, "location deletion skipped");
            }
            continue;
        }
        controller.ensure_location(&change.location_id);
        controller.for_each_location_module(&change.location_id, commands, clock, |module, cx| {
            module.configuration_updated(change, cx)
        });
    }
    for change in &trigger.role_changes {
        controller.ensure_location(&change.location_id);
        controller.for_each_location_module(&change.location_id, commands, clock, |module, cx| {
            module.users_updated(change, cx)
        });
    }
}

// ── Data export ────────────────────────────────────────────────────

/// Handle the standalone data-request branch against the read-only graph.
///
/// A payload that cannot be decoded aborts the whole branch with a logged
/// error; other branches of the invocation are unaffected. Nothing here
/// ever writes core state.
#[tracing::instrument(skip_all, fields(requests = requests.len()))]
pub fn run_data_requests(
    controller: &Controller,
    requests: &[DataRequest],
    exports: &mut dyn ExportSink,
    clock: Clock,
) {
    for request in requests {
        match build_export(controller, request, clock) {
            Ok(body) => {
                if let Err(err) =
                    exports.deliver(&request.request_id, request.location_id.as_ref(), body)
                {
                    error!(request = %request.request_id, error = error_chain(&err), "export delivery failed");
                }
            }
            Err(err) => {
                error!(request = %request.request_id, error = error_chain(&err), "data-request branch aborted");
                return;
            }
        }
    }
}

fn build_export(
    controller: &Controller,
    request: &DataRequest,
    clock: Clock,
) -> Result<Vec<u8>, ExportError> {
    let mut parameters: Vec<String> = request.parameters.clone();
    if let Some(payload) = &request.payload {
        let decoded = decode_payload(payload, &request.request_id)?;
        let selection: serde_json::Value = serde_json::from_slice(&decoded)
            .map_err(|err| ExportError::new(&request.request_id, err))?;
        if let Some(extra) = selection.get("parameters").and_then(serde_json::Value::as_array) {
            parameters.extend(
                extra
                    .iter()
                    .filter_map(serde_json::Value::as_str)
                    .map(String::from),
            );
        }
    }

    let mut locations = serde_json::Map::new();
    for (location_id, location) in &controller.state.locations {
        if request.location_id.as_ref().is_some_and(|id| id != location_id) {
            continue;
        }
        let mut devices = serde_json::Map::new();
        for (device_id, device) in &location.devices {
            let mut measurements = serde_json::Map::new();
            for (param, series) in &device.measurements {
                if !parameters.is_empty() && !parameters.iter().any(|p| p == param.as_str()) {
                    continue;
                }
                let samples: Vec<serde_json::Value> = series
                    .samples()
                    .iter()
                    .map(|sample| {
                        serde_json::json!({
                            "value": sample.value,
                            "time": sample.time.timestamp_millis(),
                        })
                    })
                    .collect();
                measurements.insert(param.to_string(), serde_json::Value::Array(samples));
            }
            devices.insert(
                device_id.to_string(),
                serde_json::json!({
                    "deviceType": device.device_type,
                    "measurements": serde_json::Value::Object(measurements),
                }),
            );
        }
        locations.insert(
            location_id.to_string(),
            serde_json::json!({
                "mode": location.mode,
                "devices": serde_json::Value::Object(devices),
            }),
        );
    }

    let body = serde_json::json!({
        "requestId": request.request_id,
        "generatedAt": clock.now().timestamp_millis(),
        "locations": serde_json::Value::Object(locations),
    });
    serde_json::to_vec_pretty(&body).map_err(|err| ExportError::new(&request.request_id, err))
}

fn decode_payload(payload: &EncodedPayload, request_id: &str) -> Result<Vec<u8>, ExportError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(&payload.data)
        .map_err(|err| ExportError::new(request_id, err))?;
    match payload.encoding {
        PayloadEncoding::None => Ok(raw),
        PayloadEncoding::Gzip => {
            let mut decoder = GzDecoder::new(raw.as_slice());
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|err| ExportError::new(request_id, err))?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io::Write as _;

    use base64::Engine as _;

    use carehub_domain::access::{AccessEntry, AccessSnapshot, DeviceGrant};
    use carehub_domain::controller::ControllerState;
    use carehub_domain::device::DeviceState;
    use carehub_domain::error::{CommandError, ModuleError};
    use carehub_domain::id::{LocationId, ParamName};
    use carehub_domain::location::Mode;
    use carehub_domain::measurement::MeasurementValue;
    use carehub_domain::time::from_millis;
    use carehub_domain::trigger::{
        DatastreamMessage, LocationConfigChange, ModeChange, QuestionAnswer, RoleChange,
    };

    use crate::ports::{Command, EventCx, Microservice, Owner};
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

    #[derive(Default)]
    struct CollectingExport {
        deliveries: Vec<(String, Vec<u8>)>,
    }

    impl ExportSink for CollectingExport {
        fn deliver(
            &mut self,
            request_id: &str,
            _location_id: Option<&LocationId>,
            body: Vec<u8>,
        ) -> Result<(), ExportError> {
            self.deliveries.push((request_id.to_string(), body));
            Ok(())
        }
    }

    struct NullClass;

    impl crate::ports::DeviceClass for NullClass {}

    fn build_null_class(_device_type: &str) -> Box<dyn crate::ports::DeviceClass> {
        Box::new(NullClass)
    }

    struct ProbeModule;

    impl Microservice for ProbeModule {
        fn set_parent(&mut self, _owner: Owner) {}

        fn initialize(&mut self, _cx: &mut EventCx<'_>) -> Result<(), ModuleError> {
            Ok(())
        }

        fn schedule_fired(&mut self, _cx: &mut EventCx<'_>) -> Result<(), ModuleError> {
            record("schedule");
            Ok(())
        }

        fn timer_fired(&mut self, _cx: &mut EventCx<'_>) -> Result<(), ModuleError> {
            record("timer");
            Ok(())
        }

        fn mode_updated(&mut self, mode: Mode, _cx: &mut EventCx<'_>) -> Result<(), ModuleError> {
            record(format!("mode:{mode}"));
            Ok(())
        }

        fn datastream_updated(
            &mut self,
            message: &DatastreamMessage,
            _cx: &mut EventCx<'_>,
        ) -> Result<(), ModuleError> {
            record(format!("datastream:{}", message.address));
            Ok(())
        }

        fn question_answered(
            &mut self,
            answer: &QuestionAnswer,
            _cx: &mut EventCx<'_>,
        ) -> Result<(), ModuleError> {
            record(format!("question:{}", answer.question_id));
            Ok(())
        }

        fn goal_updated(
            &mut self,
            device: &DeviceState,
            _cx: &mut EventCx<'_>,
        ) -> Result<(), ModuleError> {
            record(format!("goal:{}", device.id));
            Ok(())
        }

        fn configuration_updated(
            &mut self,
            change: &LocationConfigChange,
            _cx: &mut EventCx<'_>,
        ) -> Result<(), ModuleError> {
            record(format!("config:{}", change.location_id));
            Ok(())
        }

        fn users_updated(
            &mut self,
            change: &RoleChange,
            _cx: &mut EventCx<'_>,
        ) -> Result<(), ModuleError> {
            record(format!("role:{}:{}", change.user_id, change.role));
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
                device_types: &["radar"],
                build: build_null_class,
            })
            .device_module("radar", PROBE_MODULE)
            .location_module(PROBE_MODULE)
            .build()
    }

    fn clock() -> Clock {
        Clock::at(from_millis(5_000_000).unwrap())
    }

    fn controller_with_device() -> Controller {
        let mut controller = Controller::hydrate(ControllerState::default());
        let registry = registry();
        let mut sink = NullSink;
        let snapshot = AccessSnapshot::new(vec![AccessEntry::Device(
            DeviceGrant::builder()
                .device_id("d1")
                .location_id("loc-1")
                .device_type("radar")
                .build(),
        )]);
        controller.reconcile(&snapshot, &registry, &mut sink, clock());
        controller.sync_lifecycle(&registry, &mut sink, clock());
        take_events();
        controller
    }

    #[test]
    fn should_run_schedule_branch_fully_before_mode_branch() {
        let mut controller = controller_with_device();
        let registry = registry();
        let mut sink = NullSink;

        // MODE payload added before SCHEDULE bit: payload order must not
        // affect branch order.
        let trigger = Trigger::builder()
            .mode_change(ModeChange {
                location_id: LocationId::new("loc-1"),
                mode: Mode::Away,
            })
            .kind(TriggerKinds::SCHEDULE)
            .build();

        let report = dispatch(&mut controller, &trigger, &registry, &mut sink, clock());
        assert_eq!(report.branches, vec!["schedule", "mode"]);

        let events = take_events();
        let last_schedule = events
            .iter()
            .rposition(|e| e == "schedule" || e == "timer")
            .unwrap();
        let first_mode = events.iter().position(|e| e.starts_with("mode:")).unwrap();
        assert!(last_schedule < first_mode);
        assert_eq!(
            controller.state.locations[&LocationId::new("loc-1")].mode,
            Mode::Away
        );
    }

    #[test]
    fn should_treat_schedule_address_as_run_all_schedules() {
        let mut controller = controller_with_device();
        let registry = registry();
        let mut sink = NullSink;

        let trigger = Trigger::builder()
            .datastream(DatastreamMessage {
                address: SCHEDULE_ADDRESS.to_string(),
                payload: serde_json::Value::Null,
            })
            .build();
        dispatch(&mut controller, &trigger, &registry, &mut sink, clock());

        let events = take_events();
        assert!(events.contains(&"schedule".to_string()));
        assert!(!events.iter().any(|e| e.starts_with("datastream:")));
    }

    #[test]
    fn should_deliver_ordinary_datastream_messages_to_location_modules() {
        let mut controller = controller_with_device();
        let registry = registry();
        let mut sink = NullSink;

        let trigger = Trigger::builder()
            .datastream(DatastreamMessage {
                address: "alerts".to_string(),
                payload: serde_json::json!({"level": 2}),
            })
            .build();
        dispatch(&mut controller, &trigger, &registry, &mut sink, clock());

        assert!(take_events().contains(&"datastream:alerts".to_string()));
    }

    #[test]
    fn should_notify_goal_updates_and_clear_flags() {
        let mut controller = controller_with_device();
        controller
            .device_mut(&DeviceId::new("d1"))
            .unwrap()
            .goal_changed = true;
        let registry = registry();
        let mut sink = NullSink;

        let trigger = Trigger::builder().kind(TriggerKinds::METADATA).build();
        dispatch(&mut controller, &trigger, &registry, &mut sink, clock());

        assert!(take_events().contains(&"goal:d1".to_string()));
        assert!(!controller.device(&DeviceId::new("d1")).unwrap().goal_changed);
    }

    #[test]
    fn should_create_location_lazily_for_question_answers() {
        let mut controller = controller_with_device();
        let registry = registry();
        let mut sink = NullSink;

        let trigger = Trigger::builder()
            .question(QuestionAnswer {
                location_id: LocationId::new("loc-new"),
                question_id: "q-7".to_string(),
                answer: serde_json::json!(true),
            })
            .build();
        dispatch(&mut controller, &trigger, &registry, &mut sink, clock());

        assert!(controller.state.locations.contains_key(&LocationId::new("loc-new")));
    }

    #[test]
    fn should_delete_location_when_config_change_says_deleted() {
        let mut controller = controller_with_device();
        let registry = registry();
        let mut sink = NullSink;

        let trigger = Trigger::builder()
            .config_change(LocationConfigChange {
                location_id: LocationId::new("loc-1"),
                settings: serde_json::json!({"deleted": true}),
            })
            .build();
        dispatch(&mut controller, &trigger, &registry, &mut sink, clock());

        assert!(controller.state.locations.is_empty());
        assert!(controller.state.location_devices.is_empty());
    }

    #[test]
    fn should_deliver_role_changes_in_location_config_branch() {
        let mut controller = controller_with_device();
        let registry = registry();
        let mut sink = NullSink;

        let trigger = Trigger::builder()
            .role_change(RoleChange {
                location_id: LocationId::new("loc-1"),
                user_id: "u-1".to_string(),
                role: "call-center".to_string(),
            })
            .build();
        dispatch(&mut controller, &trigger, &registry, &mut sink, clock());

        assert!(take_events().contains(&"role:u-1:call-center".to_string()));
    }

    // ── Data export ────────────────────────────────────────────────

    fn with_measurement(mut controller: Controller) -> Controller {
        controller
            .device_mut(&DeviceId::new("d1"))
            .unwrap()
            .series_mut(&ParamName::new("temperature"))
            .insert(MeasurementValue::Float(21.5), from_millis(1_000).unwrap());
        controller
    }

    #[test]
    fn should_export_measurement_histories() {
        let controller = with_measurement(controller_with_device());
        let mut exports = CollectingExport::default();

        let request = DataRequest {
            request_id: "req-1".to_string(),
            location_id: None,
            parameters: Vec::new(),
            payload: None,
        };
        run_data_requests(&controller, &[request], &mut exports, clock());

        assert_eq!(exports.deliveries.len(), 1);
        let body: serde_json::Value = serde_json::from_slice(&exports.deliveries[0].1).unwrap();
        assert_eq!(body["requestId"], "req-1");
        assert_eq!(
            body["locations"]["loc-1"]["devices"]["d1"]["measurements"]["temperature"][0]["time"],
            serde_json::json!(1_000)
        );
    }

    #[test]
    fn should_filter_export_by_parameters_from_gzip_payload() {
        let mut controller = with_measurement(controller_with_device());
        controller
            .device_mut(&DeviceId::new("d1"))
            .unwrap()
            .series_mut(&ParamName::new("humidity"))
            .insert(MeasurementValue::Int(60), from_millis(1_000).unwrap());
        let mut exports = CollectingExport::default();

        let selection = serde_json::json!({"parameters": ["temperature"]}).to_string();
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(selection.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let request = DataRequest {
            request_id: "req-2".to_string(),
            location_id: None,
            parameters: Vec::new(),
            payload: Some(EncodedPayload {
                encoding: PayloadEncoding::Gzip,
                data: base64::engine::general_purpose::STANDARD.encode(compressed),
            }),
        };
        run_data_requests(&controller, &[request], &mut exports, clock());

        let body: serde_json::Value = serde_json::from_slice(&exports.deliveries[0].1).unwrap();
        let measurements = &body["locations"]["loc-1"]["devices"]["d1"]["measurements"];
        assert!(measurements.get("temperature").is_some());
        assert!(measurements.get("humidity").is_none());
    }

    #[test]
    fn should_abort_branch_on_corrupt_gzip_payload() {
        let controller = with_measurement(controller_with_device());
        let mut exports = CollectingExport::default();

        let requests = vec![
            DataRequest {
                request_id: "req-bad".to_string(),
                location_id: None,
                parameters: Vec::new(),
                payload: Some(EncodedPayload {
                    encoding: PayloadEncoding::Gzip,
                    data: base64::engine::general_purpose::STANDARD.encode(b"not gzip"),
                }),
            },
            DataRequest {
                request_id: "req-after".to_string(),
                location_id: None,
                parameters: Vec::new(),
                payload: None,
            },
        ];
        run_data_requests(&controller, &requests, &mut exports, clock());

        // The corrupt request aborts the whole branch; nothing delivered.
        assert!(exports.deliveries.is_empty());
    }

    #[test]
    fn should_limit_export_to_requested_location() {
        let mut controller = with_measurement(controller_with_device());
        controller.ensure_location(&LocationId::new("loc-2"));
        let mut exports = CollectingExport::default();

        let request = DataRequest {
            request_id: "req-3".to_string(),
            location_id: Some(LocationId::new("loc-2")),
            parameters: Vec::new(),
            payload: None,
        };
        run_data_requests(&controller, &[request], &mut exports, clock());

        let body: serde_json::Value = serde_json::from_slice(&exports.deliveries[0].1).unwrap();
        assert!(body["locations"].get("loc-1").is_none());
        assert!(body["locations"].get("loc-2").is_some());
    }
}
