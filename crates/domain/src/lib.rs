//! # carehub-domain
//!
//! Pure domain model for the carehub care-monitoring engine.
//!
//! ## Responsibilities
//! - Foundational types: typed identifiers, error conventions, timestamps,
//!   and the explicit [`Clock`](time::Clock) value
//! - Define **Devices** (per-device measurement cache, health counters,
//!   permissions, proxy/goal metadata)
//! - Define **Locations** (device maps, mode and occupancy state)
//! - Define the **Controller** graph (locations, device index, readiness
//!   queue) that is serialized wholesale between invocations
//! - Define **Triggers** (bitmask-typed host events with their payloads)
//! - Define **Access snapshots** (the host's authoritative roster)
//! - Contain all invariant enforcement and domain logic
//!
//! ## Dependency rule
//! This crate has **no internal dependencies**.
//! It must never import anything from `app`, adapters, or external IO crates.
//! All IO boundaries are expressed as traits in the `app` crate (ports).

pub mod error;
pub mod id;
pub mod time;

pub mod access;
pub mod controller;
pub mod device;
pub mod location;
pub mod measurement;
pub mod trigger;
