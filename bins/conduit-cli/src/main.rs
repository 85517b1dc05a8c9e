//! # Conduit CLI
//!
//! Command-line entry point for the Conduit pipeline runtime: `run` executes
//! a pipeline document locally, `serve` exposes the same runtime over HTTP
//! (C10), and `schema` emits the element JSON Schema (C11).
//!
//! Grounded on `rde-cli/src/main.rs`'s overall shape — `clap::Parser` args
//! struct, `tracing_subscriber::registry()...init()` setup, YAML load then
//! build then run — generalized from its fixed source/transforms/sink
//! assembly into one call through `conduit_core`'s registry-driven builder
//! and executor, and split into subcommands per spec §6's CLI surface.

mod http;
mod schema_emit;

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use conduit_core::context::RunContext;
use conduit_core::env::{resolve_yaml, RunArgs};
use conduit_core::error::ConduitError;
use conduit_core::executor::{Builder, Executor};
use conduit_core::registry::Registry;
use conduit_core::spec::parse_pipeline;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(about = "Declarative, YAML-described streaming data pipeline runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a pipeline document locally.
    Run {
        /// Path to a pipeline YAML file, or `-` to read from stdin.
        pipeline: String,
        /// `key=value` run argument, repeatable. Feeds `${key}` expansion.
        #[arg(long = "args", value_parser = parse_arg_pair)]
        args: Vec<(String, String)>,
        /// Buffer size for inter-stage item channels.
        #[arg(long, default_value_t = conduit_core::item::DEFAULT_CHANNEL_CAPACITY)]
        channel_capacity: usize,
        /// Record per-item errors to stderr and keep processing the next
        /// item instead of aborting the run (spec §7's `stop_on_error`
        /// policy knob, default `true`/abort).
        #[arg(long)]
        continue_on_error: bool,
    },
    /// Run the HTTP driver (C10).
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Emit the element JSON Schema (C11).
    Schema {
        /// Write to this path instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn parse_arg_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) => Ok((k.to_string(), v.to_string())),
        None => Err(format!("expected key=value, got `{raw}`")),
    }
}

fn build_registry() -> conduit_core::error::Result<Registry> {
    let mut registry = Registry::new();
    conduit_elements::register_builtins(&mut registry)?;
    if let Ok(search_paths) = std::env::var("CONDUIT_SEARCH_PATHS") {
        registry.load_search_paths(&search_paths)?;
    }
    Ok(registry)
}

fn read_pipeline_source(pipeline: &str) -> anyhow::Result<String> {
    if pipeline == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        Ok(std::fs::read_to_string(pipeline)?)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { pipeline, args, channel_capacity, continue_on_error } => {
            run_command(pipeline, args, channel_capacity, continue_on_error).await
        }
        Command::Serve { host, port } => serve_command(host, port).await,
        Command::Schema { out } => schema_command(out),
    }
}

async fn run_command(pipeline: String, args: Vec<(String, String)>, channel_capacity: usize, continue_on_error: bool) -> ExitCode {
    let raw = match read_pipeline_source(&pipeline) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!(error = %e, "failed to read pipeline source");
            return ExitCode::from(2);
        }
    };
    let run_args: RunArgs = args.into_iter().collect::<HashMap<_, _>>();

    match run_pipeline(&raw, &run_args, channel_capacity, !continue_on_error).await {
        Ok(outcome) => {
            tracing::info!(
                duration_secs = outcome.stats.duration.as_secs_f64(),
                total_items = outcome.stats.total_items_processed,
                throughput = outcome.stats.throughput,
                "run complete"
            );
            for value in &outcome.results {
                println!("{value}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(kind = ?e.kind, stage = ?e.stage_id, error = %e.message, "run failed");
            ExitCode::from(e.kind.exit_code() as u8)
        }
    }
}

async fn run_pipeline(
    raw_yaml: &str,
    run_args: &RunArgs,
    channel_capacity: usize,
    stop_on_error: bool,
) -> conduit_core::error::Result<conduit_core::executor::RunOutcome> {
    let parsed: serde_yaml::Value = serde_yaml::from_str(raw_yaml).map_err(|e| {
        ConduitError::new(conduit_core::error::ErrorKind::ParseError, format!("invalid YAML: {e}"))
    })?;
    let resolved = resolve_yaml(&parsed, run_args)?;
    let descriptors = parse_pipeline(&resolved)?;

    let registry = build_registry()?;
    let ctx = RunContext::new(Arc::new(registry), run_args.clone()).with_stop_on_error(stop_on_error);
    let built = Builder::new(&ctx.registry, &ctx).build(&descriptors)?;
    Executor::run(built, &ctx, channel_capacity).await
}

async fn serve_command(host: String, port: u16) -> ExitCode {
    match http::run_server(&host, port).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "HTTP driver exited with an error");
            ExitCode::FAILURE
        }
    }
}

fn schema_command(out: Option<PathBuf>) -> ExitCode {
    let registry = match build_registry() {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e.message, "failed to build registry for schema emission");
            return ExitCode::FAILURE;
        }
    };
    let schema = schema_emit::emit_schema(&registry);
    let rendered = match serde_json::to_string_pretty(&schema) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize schema");
            return ExitCode::FAILURE;
        }
    };
    match out {
        Some(path) => match std::fs::write(&path, rendered) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %e, path = %path.display(), "failed to write schema file");
                ExitCode::FAILURE
            }
        },
        None => {
            println!("{rendered}");
            ExitCode::SUCCESS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_arg_pair_splits_on_first_equals() {
        assert_eq!(parse_arg_pair("limit=7").unwrap(), ("limit".to_string(), "7".to_string()));
        assert_eq!(parse_arg_pair("url=http://x?a=b").unwrap(), ("url".to_string(), "http://x?a=b".to_string()));
        assert!(parse_arg_pair("no-equals-sign").is_err());
    }

    #[tokio::test]
    async fn run_pipeline_executes_s1_hello_document() {
        let yaml = "- id: conduit.Input\n  data: [{message: \"Hello, Conduit!\"}]\n- id: conduit.Console\n  format: \"{{input.message}}\"\n";
        let outcome = run_pipeline(yaml, &HashMap::new(), conduit_core::item::DEFAULT_CHANNEL_CAPACITY, true).await.unwrap();
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0]["message"], "Hello, Conduit!");
    }

    #[tokio::test]
    async fn run_pipeline_reports_unknown_element() {
        let yaml = "- id: conduit.DoesNotExist\n";
        let err = run_pipeline(yaml, &HashMap::new(), conduit_core::item::DEFAULT_CHANNEL_CAPACITY, true)
            .await
            .unwrap_err();
        assert_eq!(err.kind, conduit_core::error::ErrorKind::UnknownElement);
        assert_eq!(err.kind.exit_code(), 3);
    }
}
