//! Activity digest — counts location activity between schedule runs.

use serde::{Deserialize, Serialize};
use tracing::info;

use carehub_app::ports::{EventCx, Microservice, Owner};
use carehub_domain::device::DeviceState;
use carehub_domain::error::ModuleError;
use carehub_domain::id::ParamName;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct DigestState {
    #[serde(default)]
    updates: u64,
    #[serde(default)]
    last_digest_ms: Option<i64>,
}

/// Location-scope module summarizing activity once per schedule run.
pub struct ActivityDigest {
    state: DigestState,
    owner: Option<Owner>,
}

pub(crate) fn build_activity_digest(
    state: Option<&serde_json::Value>,
) -> Result<Box<dyn Microservice>, ModuleError> {
    let state = match state {
        Some(value) if !value.is_null() => serde_json::from_value(value.clone())
            .map_err(|err| ModuleError::new("activity-digest", err))?,
        _ => DigestState::default(),
    };
    Ok(Box::new(ActivityDigest { state, owner: None }))
}

impl Microservice for ActivityDigest {
    fn set_parent(&mut self, owner: Owner) {
        self.owner = Some(owner);
    }

    fn initialize(&mut self, _cx: &mut EventCx<'_>) -> Result<(), ModuleError> {
        Ok(())
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(&self.state).unwrap_or(serde_json::Value::Null)
    }

    fn device_measurements_updated(
        &mut self,
        _device: &DeviceState,
        _changed: &[ParamName],
        _cx: &mut EventCx<'_>,
    ) -> Result<(), ModuleError> {
        self.state.updates += 1;
        Ok(())
    }

    fn schedule_fired(&mut self, cx: &mut EventCx<'_>) -> Result<(), ModuleError> {
        let location = self
            .owner
            .as_ref()
            .map(|owner| owner.location_id().to_string())
            .unwrap_or_default();
        info!(location = %location, updates = self.state.updates, "activity digest");
        self.state.updates = 0;
        self.state.last_digest_ms = Some(cx.clock.now().timestamp_millis());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carehub_app::ports::{Command, CommandSink};
    use carehub_domain::error::CommandError;
    use carehub_domain::id::{DeviceId, LocationId};
    use carehub_domain::time::{Clock, from_millis};

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

    fn device() -> DeviceState {
        DeviceState::builder()
            .id("m1")
            .device_type("virtual-motion")
            .location_id("loc-1")
            .build()
            .unwrap()
    }

    fn digest() -> ActivityDigest {
        let mut digest = ActivityDigest {
            state: DigestState::default(),
            owner: None,
        };
        digest.set_parent(Owner::Location {
            location_id: LocationId::new("loc-1"),
        });
        digest
    }

    #[test]
    fn should_count_updates_until_schedule_runs() {
        let mut digest = digest();
        let mut sink = NullSink;
        let clock = Clock::at(from_millis(1_000).unwrap());

        let mut cx = EventCx::new(clock, &mut sink);
        digest.device_measurements_updated(&device(), &[], &mut cx).unwrap();
        digest.device_measurements_updated(&device(), &[], &mut cx).unwrap();
        assert_eq!(digest.state.updates, 2);

        digest.schedule_fired(&mut cx).unwrap();
        assert_eq!(digest.state.updates, 0);
        assert_eq!(digest.state.last_digest_ms, Some(1_000));
    }

    #[test]
    fn should_roundtrip_state_through_snapshot() {
        let mut digest = digest();
        let mut sink = NullSink;
        let mut cx = EventCx::new(Clock::at(from_millis(1_000).unwrap()), &mut sink);
        digest.device_measurements_updated(&device(), &[], &mut cx).unwrap();

        let snapshot = digest.snapshot();
        let restored = build_activity_digest(Some(&snapshot)).unwrap();
        assert_eq!(restored.snapshot(), snapshot);
    }
}
