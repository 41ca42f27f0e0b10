//! Virtual thermostat — temperature readings and command recovery.

use carehub_app::ports::{Command, DeviceClass, EventCx};
use carehub_domain::device::DeviceState;
use carehub_domain::error::DriverError;
use carehub_domain::measurement::{MeasurementRecord, MeasurementValue};
use carehub_domain::trigger::CommandResponse;
use tracing::warn;

/// A simulated thermostat reporting `temperature` and `setpoint`.
pub struct Thermostat;

impl DeviceClass for Thermostat {
    fn filter_measurements(
        &mut self,
        _state: &DeviceState,
        bucket: &mut Vec<MeasurementRecord>,
        _cx: &mut EventCx<'_>,
    ) -> Result<(), DriverError> {
        bucket.retain(|record| match (&record.name[..], &record.value) {
            ("temperature" | "setpoint", MeasurementValue::Float(celsius)) => {
                celsius.is_finite() && (-50.0..=100.0).contains(celsius)
            }
            _ => true,
        });
        for record in bucket.iter_mut() {
            if record.name == "temperature"
                && let MeasurementValue::Float(celsius) = record.value
            {
                // Sensor resolution is a tenth of a degree.
                record.value = MeasurementValue::Float((celsius * 10.0).round() / 10.0);
            }
        }
        Ok(())
    }

    fn command_response(
        &mut self,
        state: &mut DeviceState,
        response: &CommandResponse,
        cx: &mut EventCx<'_>,
    ) -> Result<(), DriverError> {
        if response.success {
            return Ok(());
        }
        // A failed command leaves the reported state unknown: ask the
        // device for a fresh report.
        warn!(device = %state.id, command = %response.name, "command failed; requesting status");
        cx.commands
            .send_command(
                &state.id,
                Command::new("statusRequest", serde_json::Value::Null),
            )
            .map_err(|err| DriverError::new(state.id.clone(), err))
    }
}
