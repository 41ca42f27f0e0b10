//! Export port — delivery channel for asynchronous data-export results.

use carehub_domain::error::ExportError;
use carehub_domain::id::LocationId;

/// Receives the body produced for a data-export request.
///
/// Export bodies can be large and are never interleaved with core-state
/// persistence; implementations deliver them out of band.
pub trait ExportSink {
    /// Deliver `body` for the given request.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError`] when delivery fails.
    fn deliver(
        &mut self,
        request_id: &str,
        location_id: Option<&LocationId>,
        body: Vec<u8>,
    ) -> Result<(), ExportError>;
}
