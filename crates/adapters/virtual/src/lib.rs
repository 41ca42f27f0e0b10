//! # carehub-adapter-virtual
//!
//! Virtual/demo adapter that provides simulated device classes and
//! microservices for testing and demonstration purposes.
//!
//! ## Provided device classes
//!
//! | Class | Device types | Behaviour |
//! |-------|--------------|-----------|
//! | Motion sensor | `virtual-motion` | Filters implausible readings, keeps activity history |
//! | Thermostat | `virtual-thermostat` | Rounds temperatures, recovers from failed commands |
//! | Gateway | `virtual-gateway` | Proxy target; pushes coordinate changes to its network |
//!
//! `virtual-hub-v1` is registered as deprecated: existing instances are
//! pruned during reconciliation and new ones are never created.
//!
//! ## Provided microservices
//!
//! | Module | Scope | Behaviour |
//! |--------|-------|-----------|
//! | `inactivity-monitor` | device (`virtual-motion`) | Flags devices silent for 12 h |
//! | `activity-digest` | location | Counts activity between schedule runs |
//!
//! ## Dependency rule
//!
//! Depends on `carehub-app` (port traits) and `carehub-domain` only.

mod devices;
mod modules;

pub use devices::{Gateway, MotionSensor, Thermostat};
pub use modules::{ActivityDigest, InactivityMonitor};

use carehub_app::registry::{DeviceClassSpec, ModuleSpec, Registry};

/// The registry wiring every virtual class and module.
#[must_use]
pub fn default_registry() -> Registry {
    Registry::builder()
        .device_class(DeviceClassSpec {
            device_types: &["virtual-motion"],
            build: devices::build_motion,
        })
        .device_class(DeviceClassSpec {
            device_types: &["virtual-thermostat"],
            build: devices::build_thermostat,
        })
        .device_class(DeviceClassSpec {
            device_types: &["virtual-gateway"],
            build: devices::build_gateway,
        })
        .deprecate("virtual-hub-v1")
        .device_module(
            "virtual-motion",
            ModuleSpec {
                name: "inactivity-monitor",
                build: modules::build_inactivity_monitor,
            },
        )
        .location_module(ModuleSpec {
            name: "activity-digest",
            build: modules::build_activity_digest,
        })
        .build()
}
