//! Virtual motion sensor — activity readings with plausibility filtering.

use carehub_app::ports::{DeviceClass, EventCx};
use carehub_domain::device::DeviceState;
use carehub_domain::error::DriverError;
use carehub_domain::id::ParamName;
use carehub_domain::measurement::{MeasurementRecord, MeasurementValue};

/// How much activity history inactivity detection needs.
const ACTIVITY_HISTORY_MIN: usize = 10;

/// A simulated PIR/radar motion sensor.
///
/// Reports `motionActivity` (counts per interval) and `battery` (percent).
pub struct MotionSensor;

impl DeviceClass for MotionSensor {
    fn initialize(
        &mut self,
        state: &mut DeviceState,
        _cx: &mut EventCx<'_>,
    ) -> Result<(), DriverError> {
        // Inactivity detection looks back over recent activity samples, so
        // the eviction floor is raised above the default.
        state
            .series_mut(&ParamName::new("motionActivity"))
            .retain_at_least(ACTIVITY_HISTORY_MIN);
        Ok(())
    }

    fn filter_measurements(
        &mut self,
        _state: &DeviceState,
        bucket: &mut Vec<MeasurementRecord>,
        _cx: &mut EventCx<'_>,
    ) -> Result<(), DriverError> {
        bucket.retain(|record| match (&record.name[..], &record.value) {
            (_, MeasurementValue::Float(value)) if !value.is_finite() => false,
            ("battery", MeasurementValue::Int(percent)) => (0..=100).contains(percent),
            ("motionActivity", MeasurementValue::Int(count)) => *count >= 0,
            _ => true,
        });
        Ok(())
    }

    fn device_alert(
        &mut self,
        state: &mut DeviceState,
        alert: &carehub_domain::trigger::AlertRecord,
        cx: &mut EventCx<'_>,
    ) -> Result<(), DriverError> {
        state.series_mut(&ParamName::new("alarmState")).insert(
            MeasurementValue::String(alert.alert_type.clone()),
            cx.clock.now(),
        );
        Ok(())
    }
}
