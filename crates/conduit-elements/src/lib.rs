//! # Conduit Elements
//!
//! The built-in `conduit.*` element library (spec §4.9): sources,
//! transforms, flow control, buffered data stages, filesystem/subprocess
//! sinks, SFTP, and numeric helpers. [`register_builtins`] wires every
//! factory here into a fresh [`conduit_core::Registry`]; `Fork` itself
//! lives in `conduit_core::fork` since the executor's builder downcasts it
//! directly during sub-pipeline validation.

pub mod data;
pub mod flow;
pub mod numerics;
pub mod register;
pub mod sftp;
pub mod sinks;
pub mod sources;
pub mod transforms;

pub use register::register_builtins;
