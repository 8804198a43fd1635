/// Taskgraph: DAG workflow orchestrator
/// 
/// Command line entry point. Loads a saved graph spec, runs it against the
/// HTTP caller and prints the run report as JSON.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use taskgraph::workflow::types::NodeId;
use taskgraph::{Config, HttpCaller, Payload, Workflow};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "taskgraph", version, about = "Run a saved task graph")]
struct Args {
    /// Graph spec produced by `Workflow::save`
    spec: PathBuf,

    /// JSON object of per-run inputs keyed by task id, or "root" for the root task
    #[arg(long)]
    input: Option<PathBuf>,

    /// Directory for task input/output artifacts
    #[arg(long, env = "TASKGRAPH_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Base URL remote endpoints are resolved against
    #[arg(long, env = "TASKGRAPH_CALLER_URL")]
    caller_url: Option<String>,
}

/// Application entry point
/// 
/// Exits with status 1 unless every task completed.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::default();
    let base_url = args.caller_url.unwrap_or(config.caller.base_url);

    let mut workflow = Workflow::load_from(&args.spec)
        .with_context(|| format!("failed to load graph spec {}", args.spec.display()))?
        .with_caller(Arc::new(HttpCaller::new(base_url)))
        .with_config(config.engine);

    if let Some(path) = &args.input {
        for (id, input) in read_inputs(path, &workflow)? {
            workflow.input(id, input)?;
        }
    }

    let handle = workflow.run(args.project_dir.as_deref())?;
    let report = handle.wait().await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

/// Parse `{"root": {...}, "3": {...}}` into per-task inputs
fn read_inputs(path: &Path, workflow: &Workflow) -> Result<Vec<(NodeId, Payload)>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read inputs {}", path.display()))?;
    let inputs: Payload = serde_json::from_str(&text)
        .with_context(|| format!("inputs in {} must be a JSON object", path.display()))?;

    let mut resolved = Vec::with_capacity(inputs.len());
    for (key, value) in inputs {
        let id = if key == "root" {
            workflow.graph().root().context("graph has no root task")?
        } else {
            NodeId(key.parse().with_context(|| format!("input key '{}' is not a task id", key))?)
        };
        let serde_json::Value::Object(input) = value else {
            bail!("input for '{}' must be a JSON object", key);
        };
        resolved.push((id, input));
    }
    Ok(resolved)
}
