//! # Conduit Core
//!
//! The pipeline runtime underneath Conduit: the element registry and
//! schema-driven construction layer (C4, C6), the configuration resolver
//! (C3's env/arg substitution and C1/C2's per-item templating and
//! expressions), the streaming executor with fork/join fan-out (C7, C8),
//! the element lifecycle and defaults-merge discipline (C5), and the
//! error/metrics model (§7, §3).
//!
//! This crate has no built-in elements beyond `Fork`, which is load-bearing
//! for the executor itself. The standard library of sources, transforms,
//! flow, and sink elements lives in `conduit-elements`.

pub mod context;
pub mod defaults;
pub mod env;
pub mod error;
pub mod executor;
pub mod expr;
pub mod fork;
pub mod item;
pub mod metrics;
pub mod registry;
pub mod schema;
pub mod spec;
pub mod template;

pub use context::RunContext;
pub use error::{ConduitError, ErrorKind, Result};
pub use executor::{Builder, BuiltPipeline, BuiltStage, Executor, RunOutcome, StageInput, StageOutput};
pub use item::Item;
pub use metrics::{ElementMetrics, RunStats};
pub use registry::{Element, ElementFactory, Registry};
pub use schema::{CtorParamSpec, ElementDescriptor, FieldSpec, FieldType};
pub use spec::{parse_pipeline, PipelineDescriptor, StageDescriptor};
