//! Command port — queued device command dispatch.

use std::time::Duration;

use carehub_domain::error::CommandError;
use carehub_domain::id::DeviceId;

/// A command addressed to one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub value: serde_json::Value,
    pub timeout: Option<Duration>,
}

impl Command {
    /// A command without an explicit timeout.
    #[must_use]
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            value,
            timeout: None,
        }
    }

    /// The same command with a delivery timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outbound command channel to the device platform.
///
/// Implementations queue commands; nothing leaves the process until
/// [`flush`](Self::flush), which the engine calls once per invocation.
pub trait CommandSink {
    /// Queue a single command for `device_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when the command cannot be queued.
    fn send_command(&mut self, device_id: &DeviceId, command: Command) -> Result<(), CommandError>;

    /// Queue several commands for `device_id`, preserving order.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when any command cannot be queued.
    fn send_commands(
        &mut self,
        device_id: &DeviceId,
        commands: Vec<Command>,
    ) -> Result<(), CommandError> {
        for command in commands {
            self.send_command(device_id, command)?;
        }
        Ok(())
    }

    /// Deliver everything queued since the last flush.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when delivery fails.
    fn flush(&mut self) -> Result<(), CommandError>;
}
