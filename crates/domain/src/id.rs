//! Typed identifier newtypes backed by host-assigned strings.
//!
//! Device and location identifiers come from the access platform and are
//! opaque strings; wrapping them keeps the maps in the controller graph
//! from mixing id spaces.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[doc = $doc:expr])* $name:ident) => {
        $(#[doc = $doc])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a host-assigned identifier.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Access the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the identifier is empty (invalid in every context).
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_string()))
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

define_id!(
    /// Unique identifier for a [`DeviceState`](crate::device::DeviceState).
    DeviceId
);

define_id!(
    /// Unique identifier for a [`LocationState`](crate::location::LocationState).
    LocationId
);

define_id!(
    /// Stable name keying a microservice within its owner's module map.
    ModuleName
);

define_id!(
    /// Name of a measured parameter, optionally index-suffixed (`buttonStatus.1`).
    ParamName
);

impl ParamName {
    /// Build a parameter name from a base name and an optional index.
    ///
    /// The index disambiguates multi-channel parameters and is appended
    /// dot-separated, matching the wire convention.
    #[must_use]
    pub fn indexed(name: &str, index: Option<u32>) -> Self {
        match index {
            Some(index) => Self(format!("{name}.{index}")),
            None => Self(name.to_string()),
        }
    }
}
