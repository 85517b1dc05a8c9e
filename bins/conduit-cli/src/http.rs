//! HTTP driver (C10): `POST /run` builds and executes a pipeline document
//! sent in the request body and reports its captured output plus metrics;
//! `GET /schema` serves the same JSON Schema as the `schema` subcommand.
//!
//! No direct precedent — `rde-cli` has no HTTP surface, and its `axum`
//! dependency sat unused. Router shape follows axum's own handler/`Json`
//! extractor idiom, as used by `estuary-flow`'s control-plane API.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use conduit_core::context::RunContext;
use conduit_core::env::{resolve_yaml, RunArgs};
use conduit_core::error::ConduitError;
use conduit_core::executor::{Builder, Executor};
use conduit_core::registry::Registry;
use conduit_core::spec::{parse_pipeline, StageDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::Value;

struct AppState {
    registry: Arc<Registry>,
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    pipeline: Vec<StageDescriptor>,
    #[serde(default)]
    args: HashMap<String, String>,
    #[serde(default)]
    channel_capacity: Option<usize>,
    /// Spec §7's `stop_on_error` policy knob; defaults to `true` (abort on
    /// the first `ItemError`/`ResourceError`) the same as the CLI driver.
    #[serde(default = "default_stop_on_error")]
    stop_on_error: bool,
}

fn default_stop_on_error() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct RunResponse {
    success: bool,
    results: Vec<Value>,
    stdout: Vec<String>,
    stderr: Vec<String>,
    stats: conduit_core::metrics::RunStats,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    kind: conduit_core::error::ErrorKind,
    message: String,
}

impl From<ConduitError> for ErrorBody {
    fn from(err: ConduitError) -> Self {
        ErrorBody {
            success: false,
            error: ErrorDetail { kind: err.kind, message: err.message },
        }
    }
}

pub async fn run_server(host: &str, port: u16) -> anyhow::Result<()> {
    let mut registry = Registry::new();
    conduit_elements::register_builtins(&mut registry)?;
    if let Ok(search_paths) = std::env::var("CONDUIT_SEARCH_PATHS") {
        registry.load_search_paths(&search_paths)?;
    }
    let state = Arc::new(AppState { registry: Arc::new(registry) });

    let app = Router::new()
        .route("/run", post(run_handler))
        .route("/schema", get(schema_handler))
        .with_state(state);

    let addr = format!("{host}:{port}");
    tracing::info!(%addr, "HTTP driver listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_handler(State(state): State<Arc<AppState>>, Json(req): Json<RunRequest>) -> Response {
    match execute(Arc::clone(&state.registry), req).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => {
            let status = match err.kind {
                conduit_core::error::ErrorKind::UnknownElement => StatusCode::UNPROCESSABLE_ENTITY,
                conduit_core::error::ErrorKind::SchemaMismatch => StatusCode::UNPROCESSABLE_ENTITY,
                conduit_core::error::ErrorKind::ParseError => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(ErrorBody::from(err))).into_response()
        }
    }
}

async fn execute(registry: Arc<Registry>, req: RunRequest) -> conduit_core::error::Result<RunResponse> {
    let run_args: RunArgs = req.args;
    // Round-trip the already-parsed descriptors back through a YAML value so
    // `${...}` tokens inside string fields still expand the same way they
    // would coming from a pipeline file (spec §4.3 applies uniformly to both
    // drivers).
    let as_json = serde_json::to_value(&req.pipeline).map_err(|e| {
        ConduitError::new(conduit_core::error::ErrorKind::ParseError, format!("invalid pipeline document: {e}"))
    })?;
    let as_yaml = serde_yaml::to_value(&as_json).map_err(|e| {
        ConduitError::new(conduit_core::error::ErrorKind::ParseError, format!("invalid pipeline document: {e}"))
    })?;
    let resolved = resolve_yaml(&as_yaml, &run_args)?;
    let descriptors = parse_pipeline(&resolved)?;

    let ctx = RunContext::new(registry, run_args).with_stop_on_error(req.stop_on_error);
    let built = Builder::new(&ctx.registry, &ctx).build(&descriptors)?;
    let capacity = req.channel_capacity.unwrap_or(conduit_core::item::DEFAULT_CHANNEL_CAPACITY);
    let outcome = Executor::run(built, &ctx, capacity).await?;

    Ok(RunResponse {
        success: true,
        results: outcome.results,
        stdout: ctx.drain_stdout().await,
        stderr: ctx.drain_stderr().await,
        stats: outcome.stats,
    })
}

async fn schema_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(crate::schema_emit::emit_schema(&state.registry))
}
