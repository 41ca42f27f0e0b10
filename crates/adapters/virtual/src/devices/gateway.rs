//! Virtual gateway — the proxy target other virtual devices route through.

use carehub_app::ports::{Command, DeviceClass, EventCx};
use carehub_domain::device::DeviceState;
use carehub_domain::error::DriverError;
use carehub_domain::id::ParamName;

/// A simulated gateway reporting `linkQuality` for its radio network.
pub struct Gateway;

impl DeviceClass for Gateway {
    fn initialize(
        &mut self,
        state: &mut DeviceState,
        _cx: &mut EventCx<'_>,
    ) -> Result<(), DriverError> {
        state
            .series_mut(&ParamName::new("linkQuality"))
            .retain_at_least(5);
        Ok(())
    }

    fn coordinates_updated(
        &mut self,
        state: &mut DeviceState,
        cx: &mut EventCx<'_>,
    ) -> Result<(), DriverError> {
        // The radio network derives region settings from the gateway's
        // position; push the change down.
        let Some(coordinates) = state.coordinates else {
            return Ok(());
        };
        cx.commands
            .send_command(
                &state.id,
                Command::new(
                    "syncLocation",
                    serde_json::json!({
                        "latitude": coordinates.latitude,
                        "longitude": coordinates.longitude,
                    }),
                ),
            )
            .map_err(|err| DriverError::new(state.id.clone(), err))
    }
}
