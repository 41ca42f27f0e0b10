//! Command outbox — queued commands flushed to JSON files.

use std::fs::File;
use std::io::Write as _;
use std::path::PathBuf;

use tracing::debug;

use carehub_app::ports::{Command, CommandSink};
use carehub_domain::error::CommandError;
use carehub_domain::id::DeviceId;

/// Queues commands in memory and writes one JSON batch file per flush.
///
/// The host platform tails the outbox directory and forwards batches to
/// the device network. Nothing leaves the process between flushes, which
/// matches the engine's once-per-invocation flush cadence.
pub struct CommandOutbox {
    root: PathBuf,
    queued: Vec<(DeviceId, Command)>,
    sequence: u64,
}

impl CommandOutbox {
    /// Open (creating if needed) an outbox rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when the directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CommandError> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|err| CommandError::new(root.display().to_string(), err))?;
        let sequence = std::fs::read_dir(&root)
            .map(|entries| entries.count() as u64)
            .unwrap_or(0);
        Ok(Self {
            root,
            queued: Vec::new(),
            sequence,
        })
    }

    /// Commands queued but not yet flushed.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }
}

impl CommandSink for CommandOutbox {
    fn send_command(&mut self, device_id: &DeviceId, command: Command) -> Result<(), CommandError> {
        self.queued.push((device_id.clone(), command));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CommandError> {
        if self.queued.is_empty() {
            return Ok(());
        }
        let batch: Vec<serde_json::Value> = self
            .queued
            .drain(..)
            .map(|(device_id, command)| {
                serde_json::json!({
                    "deviceId": device_id,
                    "name": command.name,
                    "value": command.value,
                    "timeoutMs": command.timeout.map(|t| t.as_millis() as u64),
                })
            })
            .collect();
        self.sequence += 1;
        let path = self.root.join(format!("batch-{:06}.json", self.sequence));
        let body = serde_json::to_vec_pretty(&batch)
            .map_err(|err| CommandError::new(path.display().to_string(), err))?;
        let mut file =
            File::create(&path).map_err(|err| CommandError::new(path.display().to_string(), err))?;
        file.write_all(&body)
            .map_err(|err| CommandError::new(path.display().to_string(), err))?;
        debug!(batch = %path.display(), commands = batch.len(), "command batch flushed");
        Ok(())
    }
}
