//! # carehub-app
//!
//! Application layer — the invocation kernel and **port definitions**.
//!
//! ## Responsibilities
//! - Define **port traits** that adapters must implement (driven/outbound
//!   ports): [`StateStore`](ports::StateStore), [`CommandSink`](ports::CommandSink),
//!   [`ExportSink`](ports::ExportSink), plus the pluggable behavior
//!   contracts [`DeviceClass`](ports::DeviceClass) and
//!   [`Microservice`](ports::Microservice)
//! - Hold the static [`Registry`](registry::Registry) mapping device types
//!   to classes and owners to desired microservice lists
//! - Reconcile the rehydrated controller graph against the access snapshot
//! - Dispatch triggers through the fixed branch order
//! - Run versioned migrations and the readiness queue
//! - Orchestrate domain objects without knowing *how* persistence or IO
//!   works
//!
//! ## Dependency rule
//! Depends on `carehub-domain` only. Never imports adapter crates.
//! Adapters depend on *this* crate, not the reverse.

pub mod controller;
pub mod dispatcher;
pub mod engine;
pub mod lifecycle;
pub mod migrations;
pub mod ports;
pub mod registry;
