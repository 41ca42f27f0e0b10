//! Port definitions — traits that adapters implement.
//!
//! Ports are the boundaries between the application core and the outside
//! world. They are defined here (in `app`) so that both the use-case layer
//! and the adapter layer can depend on them without creating circular
//! dependencies. All ports are synchronous: the invocation model is
//! single-threaded and every external call blocks.

pub mod command;
pub mod device_class;
pub mod export;
pub mod microservice;
pub mod storage;

pub use command::{Command, CommandSink};
pub use device_class::DeviceClass;
pub use export::ExportSink;
pub use microservice::{EventCx, Microservice, Owner};
pub use storage::StateStore;
