//! Typed error model shared across the builder, executor, and elements.
//!
//! Mirrors the kind taxonomy a run reports to its caller (CLI exit code or
//! HTTP error body) rather than a Rust-level error hierarchy: several kinds
//! here would be a single `anyhow::Error` in leaf code and get classified
//! into one of these at the executor boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ParseError,
    UnknownElement,
    SchemaMismatch,
    TemplateError,
    ExpressionError,
    ElementInitError,
    /// Raised from within an element's `process` body for a single item.
    ItemError,
    /// I/O or other external-system failure.
    ResourceError,
    Cancelled,
    InternalError,
}

impl ErrorKind {
    /// `stop_on_error = false` only ever continues past these kinds; every
    /// other kind aborts the run regardless of policy (§7). `ExpressionError`
    /// is included because §4.2 states plainly that evaluation failures
    /// "count as per-item errors" — by the time one reaches a running
    /// element it's always a runtime evaluation failure against one item's
    /// data, never a compile-time mistake (expressions are compiled once at
    /// construction, where factories remap a bad one to `ElementInitError`).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorKind::ItemError | ErrorKind::ResourceError | ErrorKind::ExpressionError)
    }

    /// Process exit code per the CLI surface in spec §6.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::UnknownElement => 3,
            ErrorKind::SchemaMismatch => 4,
            _ => 1,
        }
    }
}

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct ConduitError {
    pub kind: ErrorKind,
    pub message: String,
    pub stage_index: Option<usize>,
    pub stage_id: Option<String>,
    pub item_index: Option<usize>,
}

impl ConduitError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ConduitError {
            kind,
            message: message.into(),
            stage_index: None,
            stage_id: None,
            item_index: None,
        }
    }

    pub fn with_stage(mut self, index: usize, id: impl Into<String>) -> Self {
        self.stage_index = Some(index);
        self.stage_id = Some(id.into());
        self
    }

    pub fn with_item_index(mut self, index: usize) -> Self {
        self.item_index = Some(index);
        self
    }

    pub fn unknown_element(id: impl Into<String>) -> Self {
        let id = id.into();
        ConduitError::new(ErrorKind::UnknownElement, format!("unknown element id: {id}"))
    }

    pub fn cancelled() -> Self {
        ConduitError::new(ErrorKind::Cancelled, "run was cancelled")
    }
}

impl From<anyhow::Error> for ConduitError {
    fn from(err: anyhow::Error) -> Self {
        ConduitError::new(ErrorKind::ItemError, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConduitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_kinds() {
        assert!(ErrorKind::ItemError.is_recoverable());
        assert!(ErrorKind::ResourceError.is_recoverable());
        assert!(ErrorKind::ExpressionError.is_recoverable());
        assert!(!ErrorKind::ParseError.is_recoverable());
        assert!(!ErrorKind::Cancelled.is_recoverable());
        assert!(!ErrorKind::ElementInitError.is_recoverable());
    }

    #[test]
    fn exit_codes_match_spec() {
        assert_eq!(ErrorKind::UnknownElement.exit_code(), 3);
        assert_eq!(ErrorKind::SchemaMismatch.exit_code(), 4);
        assert_eq!(ErrorKind::ItemError.exit_code(), 1);
    }

    #[test]
    fn builder_chains_context() {
        let err = ConduitError::new(ErrorKind::ItemError, "boom")
            .with_stage(2, "conduit.Filter")
            .with_item_index(5);
        assert_eq!(err.stage_index, Some(2));
        assert_eq!(err.stage_id.as_deref(), Some("conduit.Filter"));
        assert_eq!(err.item_index, Some(5));
    }
}
