//! Export directory sink — delivered export bodies land as files.

use std::fs::File;
use std::io::Write as _;
use std::path::PathBuf;

use tracing::debug;

use carehub_app::ports::ExportSink;
use carehub_domain::error::ExportError;
use carehub_domain::id::LocationId;

/// Writes each delivered export body to `<root>/<request_id>.json`.
///
/// Export bodies can be large; they are written out of band and never
/// touch the state store.
pub struct ExportDir {
    root: PathBuf,
}

impl ExportDir {
    /// Open (creating if needed) an export directory at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError`] when the directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ExportError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|err| ExportError::new("init", err))?;
        Ok(Self { root })
    }

    fn file_name(request_id: &str) -> String {
        let safe: String = request_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{safe}.json")
    }
}

impl ExportSink for ExportDir {
    fn deliver(
        &mut self,
        request_id: &str,
        location_id: Option<&LocationId>,
        body: Vec<u8>,
    ) -> Result<(), ExportError> {
        let path = self.root.join(Self::file_name(request_id));
        let mut file = File::create(&path).map_err(|err| ExportError::new(request_id, err))?;
        file.write_all(&body)
            .map_err(|err| ExportError::new(request_id, err))?;
        debug!(
            request = request_id,
            location = location_id.map(LocationId::as_str),
            bytes = body.len(),
            "export delivered"
        );
        Ok(())
    }
}
