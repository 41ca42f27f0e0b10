//! Device-class port — the driver contract.
//!
//! A device class supplies the behavior for one or more device types.
//! Instances are stateless between invocations; everything that must
//! survive lives in the [`DeviceState`] they are handed. Hook failures are
//! caught at the dispatch boundary and never abort sibling devices.

use carehub_domain::device::DeviceState;
use carehub_domain::error::DriverError;
use carehub_domain::measurement::MeasurementRecord;
use carehub_domain::trigger::{AlertRecord, CommandResponse, FileRecord};

use crate::ports::EventCx;

/// Behavior attached to a device via the device-class registry.
pub trait DeviceClass {
    /// Idempotent initialization, called every invocation during lifecycle
    /// sync.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`]; logged by the caller, siblings unaffected.
    fn initialize(
        &mut self,
        _state: &mut DeviceState,
        _cx: &mut EventCx<'_>,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    /// Seed the measurement cache of a freshly created device from
    /// historical data. Only invoked when the grant carries read
    /// permission; failures are swallowed and the device starts empty.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`]; logged and swallowed by the caller.
    fn backfill(
        &mut self,
        _state: &mut DeviceState,
        _cx: &mut EventCx<'_>,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    /// Adjust one merged measurement bucket before it is applied to the
    /// device state. Runs under the bucket's clock.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`]; logged by the caller, the unfiltered
    /// bucket is applied as-is.
    fn filter_measurements(
        &mut self,
        _state: &DeviceState,
        _bucket: &mut Vec<MeasurementRecord>,
        _cx: &mut EventCx<'_>,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    /// The device raised an alert.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`]; logged by the caller, siblings unaffected.
    fn device_alert(
        &mut self,
        _state: &mut DeviceState,
        _alert: &AlertRecord,
        _cx: &mut EventCx<'_>,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    /// A file was uploaded on behalf of the device.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`]; logged by the caller, siblings unaffected.
    fn file_uploaded(
        &mut self,
        _state: &mut DeviceState,
        _file: &FileRecord,
        _cx: &mut EventCx<'_>,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    /// A previously queued command completed.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`]; logged by the caller, siblings unaffected.
    fn command_response(
        &mut self,
        _state: &mut DeviceState,
        _response: &CommandResponse,
        _cx: &mut EventCx<'_>,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    /// The device's coordinates changed (directly or via its gateway).
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`]; logged by the caller, siblings unaffected.
    fn coordinates_updated(
        &mut self,
        _state: &mut DeviceState,
        _cx: &mut EventCx<'_>,
    ) -> Result<(), DriverError> {
        Ok(())
    }
}
