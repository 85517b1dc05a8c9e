//! Per-run shared state: cancellation, argument scope, and the stdout/
//! stderr capture buffers the HTTP driver (C10) surfaces back to callers.
//!
//! Registry, env, and args are read-only after build (spec §5); the
//! capture buffers are the only per-run state written from multiple
//! places (linear executor, and possibly-parallel Fork paths), so writes
//! go through a `tokio::sync::Mutex` to serialize them as §5 requires.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::env::RunArgs;
use crate::error::{ConduitError, Result};
use crate::registry::Registry;

/// Shared, cloneable handle threaded through every element and sub-pipeline
/// for one run. Sub-pipelines spawned by Fork clone this directly, so they
/// inherit the parent's registry, args, and capture buffers (spec §4.8).
#[derive(Clone)]
pub struct RunContext {
    pub registry: Arc<Registry>,
    pub args: Arc<RunArgs>,
    pub cancel: CancellationToken,
    /// `stop_on_error` policy knob (spec §7, default `true`). Consulted by
    /// elements that handle per-item errors internally; non-recoverable
    /// error kinds (parse/schema/init) always abort regardless.
    pub stop_on_error: bool,
    stdout: Arc<Mutex<Vec<String>>>,
    stderr: Arc<Mutex<Vec<String>>>,
}

impl RunContext {
    pub fn new(registry: Arc<Registry>, args: RunArgs) -> Self {
        RunContext {
            registry,
            args: Arc::new(args),
            cancel: CancellationToken::new(),
            stop_on_error: true,
            stdout: Arc::new(Mutex::new(Vec::new())),
            stderr: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_stop_on_error(mut self, stop_on_error: bool) -> Self {
        self.stop_on_error = stop_on_error;
        self
    }

    /// A child context for one Fork sub-pipeline: a derived cancellation
    /// token (so cancelling the parent cancels every child), same registry,
    /// args, policy, and capture buffers.
    pub fn child(&self) -> Self {
        RunContext {
            registry: Arc::clone(&self.registry),
            args: Arc::clone(&self.args),
            cancel: self.cancel.child_token(),
            stop_on_error: self.stop_on_error,
            stdout: Arc::clone(&self.stdout),
            stderr: Arc::clone(&self.stderr),
        }
    }

    /// `Console`'s side-effect channel (DESIGN.md Open Question 3).
    pub async fn push_stdout(&self, line: impl Into<String>) {
        self.stdout.lock().await.push(line.into());
    }

    pub async fn push_stderr(&self, line: impl Into<String>) {
        self.stderr.lock().await.push(line.into());
    }

    pub async fn drain_stdout(&self) -> Vec<String> {
        self.stdout.lock().await.clone()
    }

    pub async fn drain_stderr(&self) -> Vec<String> {
        self.stderr.lock().await.clone()
    }

    /// The per-item error policy (spec §7): non-recoverable kinds always
    /// abort; `ItemError`/`ResourceError` abort only when `stop_on_error`
    /// is true. Otherwise the error is recorded to the run's stderr capture
    /// and this returns `Ok(())` so the caller can skip the item and keep
    /// pulling from upstream.
    pub async fn recover_or_abort(&self, err: ConduitError) -> Result<()> {
        if self.stop_on_error || !err.kind.is_recoverable() {
            return Err(err);
        }
        self.push_stderr(err.to_string()).await;
        Ok(())
    }
}
