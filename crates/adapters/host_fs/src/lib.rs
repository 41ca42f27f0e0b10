//! # carehub-adapter-host-fs
//!
//! File-backed implementations of the host-facing ports: the state blob
//! store, the queued command outbox, and the export sink. One exchange
//! directory per concern; every write is atomic (tmp file, then rename)
//! so a crashed invocation never leaves a half-written blob behind.
//!
//! ## Dependency rule
//!
//! Depends on `carehub-app` (port traits) and `carehub-domain` only.

mod command_outbox;
mod export_dir;
mod state_store;

pub use command_outbox::CommandOutbox;
pub use export_dir::ExportDir;
pub use state_store::FileStateStore;
