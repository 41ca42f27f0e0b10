//! Common error types used across the workspace.
//!
//! Each layer defines its own typed errors and converts into
//! [`CareHubError`] via `#[from]`. Callback-boundary errors
//! ([`ModuleError`], [`DriverError`]) are logged at the dispatch layer and
//! deliberately do not convert — a failing microservice or driver must
//! never abort the invocation.

use std::fmt;

/// Umbrella error for the carehub workspace.
#[derive(Debug, thiserror::Error)]
pub enum CareHubError {
    /// A domain invariant was violated.
    #[error("validation error")]
    Validation(#[from] ValidationError),

    /// A referenced aggregate does not exist.
    #[error("not found")]
    NotFound(#[from] NotFoundError),

    /// The persistence collaborator failed.
    #[error("storage error")]
    Storage(#[from] StorageError),

    /// The command collaborator failed.
    #[error("command dispatch error")]
    Command(#[from] CommandError),

    /// The data-export collaborator failed.
    #[error("export error")]
    Export(#[from] ExportError),
}

/// Domain invariant violations.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// An identifier required to be non-empty was empty.
    #[error("identifier must not be empty")]
    EmptyId,

    /// A device was declared without a device type.
    #[error("device type must not be empty")]
    EmptyDeviceType,

    /// The controller's device index disagrees with the location maps.
    #[error("device index out of sync: {0}")]
    BrokenIndex(String),
}

/// A referenced aggregate does not exist.
#[derive(Debug, thiserror::Error)]
#[error("{entity} not found: {id}")]
pub struct NotFoundError {
    pub entity: &'static str,
    pub id: String,
}

/// Failure inside the persistence collaborator.
#[derive(Debug, thiserror::Error)]
#[error("storage {operation} failed")]
pub struct StorageError {
    pub operation: &'static str,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl StorageError {
    /// Wrap an adapter-level failure with the operation it interrupted.
    #[must_use]
    pub fn new(
        operation: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            operation,
            source: Box::new(source),
        }
    }
}

/// Failure inside the command collaborator.
#[derive(Debug, thiserror::Error)]
#[error("command dispatch to {device} failed: {reason}")]
pub struct CommandError {
    pub device: String,
    pub reason: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl CommandError {
    /// A dispatch failure with an underlying cause.
    #[must_use]
    pub fn new(
        device: impl fmt::Display,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            device: device.to_string(),
            reason: source.to_string(),
            source: Some(Box::new(source)),
        }
    }
}

/// Failure inside the data-export collaborator.
#[derive(Debug, thiserror::Error)]
#[error("export of request {request} failed: {reason}")]
pub struct ExportError {
    pub request: String,
    pub reason: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ExportError {
    /// An export failure described by a message alone.
    #[must_use]
    pub fn message(request: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self {
            request: request.to_string(),
            reason: reason.into(),
            source: None,
        }
    }

    /// An export failure with an underlying cause.
    #[must_use]
    pub fn new(
        request: impl fmt::Display,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            request: request.to_string(),
            reason: source.to_string(),
            source: Some(Box::new(source)),
        }
    }
}

/// Failure raised by a microservice callback or constructor.
///
/// Caught at the dispatch boundary; sibling modules still run.
#[derive(Debug, thiserror::Error)]
#[error("module {module}: {reason}")]
pub struct ModuleError {
    pub module: String,
    pub reason: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ModuleError {
    /// A module failure described by a message alone.
    #[must_use]
    pub fn message(module: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self {
            module: module.to_string(),
            reason: reason.into(),
            source: None,
        }
    }

    /// A module failure with an underlying cause.
    #[must_use]
    pub fn new(
        module: impl fmt::Display,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            module: module.to_string(),
            reason: source.to_string(),
            source: Some(Box::new(source)),
        }
    }
}

/// Failure raised by a device-class callback.
///
/// Caught at the dispatch boundary; sibling devices still run.
#[derive(Debug, thiserror::Error)]
#[error("device {device}: {reason}")]
pub struct DriverError {
    pub device: String,
    pub reason: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DriverError {
    /// A driver failure described by a message alone.
    #[must_use]
    pub fn message(device: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self {
            device: device.to_string(),
            reason: reason.into(),
            source: None,
        }
    }

    /// A driver failure with an underlying cause.
    #[must_use]
    pub fn new(
        device: impl fmt::Display,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            device: device.to_string(),
            reason: source.to_string(),
            source: Some(Box::new(source)),
        }
    }
}
