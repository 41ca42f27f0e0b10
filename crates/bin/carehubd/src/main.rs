//! # carehubd — carehub daemon
//!
//! Composition root that wires the invocation engine to its file-backed
//! host bridge and drains the trigger spool.
//!
//! ## Responsibilities
//! - Parse configuration (config file, env vars)
//! - Construct the port implementations (state store, outbox, export dir)
//! - Construct the engine, injecting the virtual registry
//! - Run one engine invocation per spooled trigger file, in name order
//! - `--reset` recreates the controller wholesale and exits
//!
//! ## Dependency rule
//! This is the **only** crate that depends on all other crates.
//! It is the wiring layer — no domain logic belongs here.

mod config;

use std::path::PathBuf;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use carehub_adapter_host_fs::{CommandOutbox, ExportDir, FileStateStore};
use carehub_adapter_virtual::default_registry;
use carehub_app::engine::Engine;
use carehub_domain::trigger::Trigger;

use config::Config;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.logging.filter))
        .init();

    let store = FileStateStore::new(&config.storage.root)?;
    let commands = CommandOutbox::new(&config.outbox.root)?;
    let exports = ExportDir::new(&config.exports.root)?;
    let mut engine = Engine::new(store, commands, exports, default_registry());

    if std::env::args().any(|arg| arg == "--reset") {
        engine.reset()?;
        info!("controller state reset");
        return Ok(());
    }

    std::fs::create_dir_all(&config.spool.root)?;
    for path in spooled_triggers(&config.spool.root)? {
        let bytes = std::fs::read(&path)?;
        match serde_json::from_slice::<Trigger>(&bytes) {
            Ok(trigger) => {
                let report = engine.handle(trigger)?;
                info!(
                    file = %path.display(),
                    branches = ?report.branches,
                    replayed = report.replayed,
                    persisted = report.persisted,
                    "trigger handled"
                );
                std::fs::remove_file(&path)?;
            }
            Err(err) => {
                // Move the file aside so one bad trigger cannot wedge the
                // spool.
                error!(file = %path.display(), error = %err, "unreadable trigger moved aside");
                std::fs::rename(&path, path.with_extension("bad"))?;
            }
        }
    }

    Ok(())
}

/// Trigger files in the spool, in name order (the host names them by
/// delivery sequence).
fn spooled_triggers(root: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(root)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();
    Ok(paths)
}
