//! Demo microservices.

mod digest;
mod inactivity;

pub use digest::ActivityDigest;
pub use inactivity::InactivityMonitor;

pub(crate) use digest::build_activity_digest;
pub(crate) use inactivity::build_inactivity_monitor;
