//! Microservice port — the pluggable behavior contract.
//!
//! A microservice (intelligence module) is attached to exactly one device
//! or one location. Instances are rehydrated from their persisted state
//! value every invocation, re-attached via [`Microservice::set_parent`],
//! and initialized unconditionally. Hook failures are caught at the
//! dispatch boundary — returning an error never aborts sibling callbacks.

use carehub_domain::device::DeviceState;
use carehub_domain::error::ModuleError;
use carehub_domain::id::{DeviceId, LocationId, ParamName};
use carehub_domain::location::Mode;
use carehub_domain::time::Clock;
use carehub_domain::trigger::{
    AlertRecord, DatastreamMessage, LocationConfigChange, QuestionAnswer, RoleChange,
};

use crate::ports::CommandSink;

/// The owner a microservice is attached to, as plain identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    Device {
        location_id: LocationId,
        device_id: DeviceId,
    },
    Location {
        location_id: LocationId,
    },
}

impl Owner {
    /// The location this owner belongs to.
    #[must_use]
    pub fn location_id(&self) -> &LocationId {
        match self {
            Self::Device { location_id, .. } | Self::Location { location_id } => location_id,
        }
    }

    /// The device id, when the owner is a device.
    #[must_use]
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            Self::Device { device_id, .. } => Some(device_id),
            Self::Location { .. } => None,
        }
    }
}

/// Context handed into every callback.
///
/// Carries the explicit clock — during measurement replay it reads the
/// bucket's timestamp, not the wall clock — and the queued command channel.
pub struct EventCx<'a> {
    pub clock: Clock,
    pub commands: &'a mut dyn CommandSink,
}

impl<'a> EventCx<'a> {
    /// Build a context for one callback round.
    pub fn new(clock: Clock, commands: &'a mut dyn CommandSink) -> Self {
        Self { clock, commands }
    }
}

/// A pluggable behavior unit with lifecycle and per-event hooks.
///
/// All hooks default to no-ops so implementations only spell out the
/// events they care about.
pub trait Microservice {
    /// Refresh the back-reference to the owner. Called every invocation,
    /// not only at creation.
    fn set_parent(&mut self, owner: Owner);

    /// Idempotent initialization, called unconditionally every invocation.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError`]; logged by the caller, siblings unaffected.
    fn initialize(&mut self, cx: &mut EventCx<'_>) -> Result<(), ModuleError>;

    /// Called once when the module stops being desired, before its state
    /// is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError`]; logged by the caller.
    fn destroy(&mut self, _cx: &mut EventCx<'_>) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Serialize the state to carry into the next invocation.
    fn snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// One measurement bucket changed parameters on the owning (or
    /// proxied) device.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError`]; logged by the caller, siblings unaffected.
    fn device_measurements_updated(
        &mut self,
        _device: &DeviceState,
        _changed: &[ParamName],
        _cx: &mut EventCx<'_>,
    ) -> Result<(), ModuleError> {
        Ok(())
    }

    /// The owning location's mode changed.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError`]; logged by the caller, siblings unaffected.
    fn mode_updated(&mut self, _mode: Mode, _cx: &mut EventCx<'_>) -> Result<(), ModuleError> {
        Ok(())
    }

    /// The location schedule ran.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError`]; logged by the caller, siblings unaffected.
    fn schedule_fired(&mut self, _cx: &mut EventCx<'_>) -> Result<(), ModuleError> {
        Ok(())
    }

    /// The periodic device-scope timer ran.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError`]; logged by the caller, siblings unaffected.
    fn timer_fired(&mut self, _cx: &mut EventCx<'_>) -> Result<(), ModuleError> {
        Ok(())
    }

    /// An addressed datastream message arrived.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError`]; logged by the caller, siblings unaffected.
    fn datastream_updated(
        &mut self,
        _message: &DatastreamMessage,
        _cx: &mut EventCx<'_>,
    ) -> Result<(), ModuleError> {
        Ok(())
    }

    /// A resident answered a question.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError`]; logged by the caller, siblings unaffected.
    fn question_answered(
        &mut self,
        _answer: &QuestionAnswer,
        _cx: &mut EventCx<'_>,
    ) -> Result<(), ModuleError> {
        Ok(())
    }

    /// The owning device raised an alert.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError`]; logged by the caller, siblings unaffected.
    fn device_alert(
        &mut self,
        _alert: &AlertRecord,
        _cx: &mut EventCx<'_>,
    ) -> Result<(), ModuleError> {
        Ok(())
    }

    /// The owning device's goal changed.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError`]; logged by the caller, siblings unaffected.
    fn goal_updated(
        &mut self,
        _device: &DeviceState,
        _cx: &mut EventCx<'_>,
    ) -> Result<(), ModuleError> {
        Ok(())
    }

    /// The owning (or proxied) device moved.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError`]; logged by the caller, siblings unaffected.
    fn coordinates_updated(
        &mut self,
        _device: &DeviceState,
        _cx: &mut EventCx<'_>,
    ) -> Result<(), ModuleError> {
        Ok(())
    }

    /// The owning location's configuration changed.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError`]; logged by the caller, siblings unaffected.
    fn configuration_updated(
        &mut self,
        _change: &LocationConfigChange,
        _cx: &mut EventCx<'_>,
    ) -> Result<(), ModuleError> {
        Ok(())
    }

    /// A user or call-center role changed for the owning location.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError`]; logged by the caller, siblings unaffected.
    fn users_updated(
        &mut self,
        _change: &RoleChange,
        _cx: &mut EventCx<'_>,
    ) -> Result<(), ModuleError> {
        Ok(())
    }
}
