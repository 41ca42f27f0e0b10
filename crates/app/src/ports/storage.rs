//! Storage port — blob persistence for the controller graph.

use carehub_domain::error::StorageError;

/// Key/value blob store the host provides for cross-invocation state.
///
/// The whole controller graph is one value; there are no transactions. A
/// `load` that cannot produce a readable value reports "absent" instead of
/// failing — the adapter logs and the caller constructs a fresh default.
pub trait StateStore {
    /// Load the bytes stored under `key`, or `None` when absent or
    /// unreadable.
    fn load(&self, key: &str) -> Option<Vec<u8>>;

    /// Store `value` under `key`.
    ///
    /// `required_for_each_execution` marks writes that must not be skipped
    /// even under resource pressure; such writes are made durable before
    /// the call returns.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the value cannot be written.
    fn save(
        &mut self,
        key: &str,
        value: &[u8],
        required_for_each_execution: bool,
    ) -> Result<(), StorageError>;

    /// Make every earlier `save` durable before returning.
    ///
    /// Called before control returns to the host for invocations that
    /// cannot safely straddle two save points.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when durability cannot be guaranteed.
    fn flush(&mut self) -> Result<(), StorageError>;
}
