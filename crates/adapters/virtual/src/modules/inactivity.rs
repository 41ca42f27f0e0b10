//! Inactivity monitor — flags motion sensors that fall silent.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::warn;

use carehub_app::ports::{Command, EventCx, Microservice, Owner};
use carehub_domain::device::DeviceState;
use carehub_domain::error::ModuleError;
use carehub_domain::id::ParamName;
use carehub_domain::time::from_millis;

/// How long a sensor may stay silent before attention is raised.
fn inactivity_window() -> Duration {
    Duration::hours(12)
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct InactivityState {
    #[serde(default)]
    last_activity_ms: Option<i64>,
    #[serde(default)]
    notified: bool,
}

/// Device-scope module that watches for prolonged silence.
///
/// Every measurement update refreshes the activity marker; the periodic
/// timer raises attention once per silence window by blinking the owning
/// device's status LED.
pub struct InactivityMonitor {
    state: InactivityState,
    owner: Option<Owner>,
}

pub(crate) fn build_inactivity_monitor(
    state: Option<&serde_json::Value>,
) -> Result<Box<dyn Microservice>, ModuleError> {
    let state = match state {
        Some(value) if !value.is_null() => serde_json::from_value(value.clone())
            .map_err(|err| ModuleError::new("inactivity-monitor", err))?,
        _ => InactivityState::default(),
    };
    Ok(Box::new(InactivityMonitor { state, owner: None }))
}

impl Microservice for InactivityMonitor {
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
        cx: &mut EventCx<'_>,
    ) -> Result<(), ModuleError> {
        self.state.last_activity_ms = Some(cx.clock.now().timestamp_millis());
        self.state.notified = false;
        Ok(())
    }

    fn timer_fired(&mut self, cx: &mut EventCx<'_>) -> Result<(), ModuleError> {
        let Some(Owner::Device { device_id, .. }) = self.owner.clone() else {
            return Ok(());
        };
        let Some(last_ms) = self.state.last_activity_ms else {
            // First observation: start the window now.
            self.state.last_activity_ms = Some(cx.clock.now().timestamp_millis());
            return Ok(());
        };
        let silent_since = from_millis(last_ms)
            .ok_or_else(|| ModuleError::message("inactivity-monitor", "activity marker out of range"))?;
        if self.state.notified || cx.clock.now() - silent_since < inactivity_window() {
            return Ok(());
        }
        warn!(device = %device_id, since = %silent_since, "no activity within the silence window");
        cx.commands
            .send_command(&device_id, Command::new("statusLed", serde_json::json!("blink")))
            .map_err(|err| ModuleError::new("inactivity-monitor", err))?;
        self.state.notified = true;
        Ok(())
    }
}
