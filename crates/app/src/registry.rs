//! Static registry — compile-time tables for pluggable behavior.
//!
//! Replaces filesystem/reflection discovery with two explicit tables: one
//! mapping a device-type identifier to a device-class factory (first
//! matching entry wins), and one mapping a device type or the location
//! scope to an ordered list of microservice descriptors.

use carehub_domain::error::ModuleError;

use crate::ports::{DeviceClass, Microservice};

/// Factory entry for a device class.
#[derive(Clone, Copy)]
pub struct DeviceClassSpec {
    /// Device-type identifiers this class supports.
    pub device_types: &'static [&'static str],
    /// Build a driver instance for the given device type.
    pub build: fn(&str) -> Box<dyn DeviceClass>,
}

impl std::fmt::Debug for DeviceClassSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClassSpec")
            .field("device_types", &self.device_types)
            .finish_non_exhaustive()
    }
}

/// Descriptor for one desired microservice.
#[derive(Clone, Copy)]
pub struct ModuleSpec {
    /// Stable name keying the module within its owner's map.
    pub name: &'static str,
    /// Build an instance, restoring from prior persisted state when given.
    pub build: fn(Option<&serde_json::Value>) -> Result<Box<dyn Microservice>, ModuleError>,
}

impl std::fmt::Debug for ModuleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSpec")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The static behavior tables consulted every invocation.
#[derive(Debug, Default)]
pub struct Registry {
    device_classes: Vec<DeviceClassSpec>,
    deprecated_types: Vec<&'static str>,
    device_modules: Vec<(&'static str, Vec<ModuleSpec>)>,
    location_modules: Vec<ModuleSpec>,
}

impl Registry {
    /// Create a builder for constructing a [`Registry`].
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// The first registered class supporting `device_type`.
    ///
    /// Deprecated types never resolve, so stale instances can only be
    /// pruned, never recreated.
    #[must_use]
    pub fn resolve_class(&self, device_type: &str) -> Option<&DeviceClassSpec> {
        if self.is_deprecated(device_type) {
            return None;
        }
        self.device_classes
            .iter()
            .find(|spec| spec.device_types.contains(&device_type))
    }

    /// Whether `device_type` has been explicitly deprecated.
    #[must_use]
    pub fn is_deprecated(&self, device_type: &str) -> bool {
        self.deprecated_types.contains(&device_type)
    }

    /// The ordered desired-module list for devices of `device_type`.
    #[must_use]
    pub fn device_modules(&self, device_type: &str) -> &[ModuleSpec] {
        self.device_modules
            .iter()
            .find(|(dt, _)| *dt == device_type)
            .map_or(&[], |(_, specs)| specs.as_slice())
    }

    /// The ordered desired-module list for every location.
    #[must_use]
    pub fn location_modules(&self) -> &[ModuleSpec] {
        &self.location_modules
    }

    /// Look up any registered module descriptor by name, regardless of
    /// which owner type desires it. Used to restore an instance long
    /// enough to run its destroy hook.
    #[must_use]
    pub fn module_spec(&self, name: &str) -> Option<&ModuleSpec> {
        self.device_modules
            .iter()
            .flat_map(|(_, specs)| specs.iter())
            .chain(self.location_modules.iter())
            .find(|spec| spec.name == name)
    }
}

/// Step-by-step builder for [`Registry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    registry: Registry,
}

impl RegistryBuilder {
    /// Register a device class. Earlier registrations win on overlap.
    #[must_use]
    pub fn device_class(mut self, spec: DeviceClassSpec) -> Self {
        self.registry.device_classes.push(spec);
        self
    }

    /// Mark a device type as deprecated: existing instances are
    /// force-deleted during reconciliation and new ones never created.
    #[must_use]
    pub fn deprecate(mut self, device_type: &'static str) -> Self {
        self.registry.deprecated_types.push(device_type);
        self
    }

    /// Append a desired module for devices of `device_type`, in order.
    #[must_use]
    pub fn device_module(mut self, device_type: &'static str, spec: ModuleSpec) -> Self {
        if let Some((_, specs)) = self
            .registry
            .device_modules
            .iter_mut()
            .find(|(dt, _)| *dt == device_type)
        {
            specs.push(spec);
        } else {
            self.registry.device_modules.push((device_type, vec![spec]));
        }
        self
    }

    /// Append a desired module for every location, in order.
    #[must_use]
    pub fn location_module(mut self, spec: ModuleSpec) -> Self {
        self.registry.location_modules.push(spec);
        self
    }

    /// Consume the builder and return the [`Registry`].
    #[must_use]
    pub fn build(self) -> Registry {
        self.registry
    }
}
