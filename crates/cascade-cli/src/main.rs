//! CLI binary for running and validating Cascade pipelines.
//!
//! Pipelines are either loaded from a JSON file (`run`, `validate`, `info`)
//! or constructed by the built-in `sdk` command: regenerate SDKs from a
//! provider plugin binary and publish them to npm and PyPI when the content
//! changed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};

use cascade_exec::LocalCommandRunner;
use cascade_pipeline::{
    validate, validate_or_raise, Executor, ExecutorConfig, JsonRecordStore, PipelineGraph,
    RunRecordStore, Severity, Step,
};
use cascade_types::{CancelToken, CascadeError, RunReport, StepResult};

#[derive(Parser)]
#[command(name = "cascade", version, about = "Content-triggered pipeline runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline from a JSON definition file
    Run {
        /// Path to the pipeline JSON file
        pipeline: PathBuf,

        /// Run-record directory (default: .cascade/records)
        #[arg(short, long)]
        store: Option<PathBuf>,

        /// Per-command timeout in seconds (default: none)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Validate a pipeline JSON file
    Validate {
        /// Path to the pipeline JSON file
        pipeline: PathBuf,
    },

    /// Show execution order and dependencies of a pipeline
    Info {
        /// Path to the pipeline JSON file
        pipeline: PathBuf,
    },

    /// Generate SDKs from a provider plugin binary and publish them
    Sdk {
        /// Path to the provider plugin binary
        #[arg(long)]
        plugin_binary: PathBuf,

        /// Working directory (absolute; a fresh temp dir is created if unset)
        #[arg(long)]
        working_dir: Option<PathBuf>,

        /// Publish to the registries as a public package
        #[arg(long)]
        public: bool,

        /// Run-record directory (default: <working-dir>/.cascade/records)
        #[arg(short, long)]
        store: Option<PathBuf>,

        /// Generate only, skip the npm publish step
        #[arg(long)]
        skip_npm: bool,

        /// Generate only, skip the PyPI publish step
        #[arg(long)]
        skip_pypi: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            pipeline,
            store,
            timeout_secs,
        } => cmd_run(&pipeline, store.as_deref(), timeout_secs).await,
        Commands::Validate { pipeline } => cmd_validate(&pipeline),
        Commands::Info { pipeline } => cmd_info(&pipeline),
        Commands::Sdk {
            plugin_binary,
            working_dir,
            public,
            store,
            skip_npm,
            skip_pypi,
        } => cmd_sdk(&plugin_binary, working_dir, public, store, skip_npm, skip_pypi).await,
    }
}

// ---------------------------------------------------------------------------
// Pipeline loading
// ---------------------------------------------------------------------------

/// Load a pipeline definition and resolve `"$VAR"` environment values from
/// this process. The engine itself never reads the process environment;
/// substitution here is the caller doing its credential-sourcing job.
fn load_pipeline(path: &Path) -> anyhow::Result<PipelineGraph> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading pipeline file '{}'", path.display()))?;
    let mut steps: Vec<Step> =
        serde_json::from_str(&source).context("parsing pipeline definition")?;

    for step in &mut steps {
        for value in step.environment.values_mut() {
            if let Some(var) = value.strip_prefix('$') {
                *value = std::env::var(var).unwrap_or_default();
            }
        }
    }

    Ok(PipelineGraph::build(steps)?)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_run(
    path: &Path,
    store: Option<&Path>,
    timeout_secs: Option<u64>,
) -> anyhow::Result<()> {
    let graph = load_pipeline(path)?;
    validate_or_raise(&graph)?;

    let store_dir = store
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".cascade/records"));
    let store: Arc<dyn RunRecordStore> = Arc::new(JsonRecordStore::new(store_dir));

    let executor = Executor::with_config(
        Arc::new(LocalCommandRunner::new()),
        ExecutorConfig {
            command_timeout: timeout_secs.map(Duration::from_secs),
        },
    );
    let report = run_with_interrupt(&executor, &graph, store).await?;

    print_report(&graph, &report);
    finish(&report)
}

/// Run a pipeline, cancelling cleanly on Ctrl-C (in-flight commands are
/// terminated, run records stay at their prior state).
async fn run_with_interrupt(
    executor: &Executor,
    graph: &PipelineGraph,
    store: Arc<dyn RunRecordStore>,
) -> anyhow::Result<RunReport> {
    let cancel = CancelToken::new();
    let handler = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            handler.cancel();
        }
    });
    Ok(executor.run_with_cancel(graph, store, cancel).await?)
}

fn finish(report: &RunReport) -> anyhow::Result<()> {
    if report
        .steps
        .values()
        .any(|r| matches!(r, StepResult::Cancelled))
    {
        return Err(CascadeError::Cancelled.into());
    }
    if report.failed_count() > 0 {
        anyhow::bail!("{} step(s) did not succeed", report.failed_count());
    }
    Ok(())
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let graph = load_pipeline(path)?;
    let diagnostics = validate(&graph);

    if diagnostics.is_empty() {
        println!("OK: {} steps, no diagnostics", graph.len());
        return Ok(());
    }
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        println!("{severity}: [{}] {}", diag.rule, diag.message);
    }
    if diagnostics.iter().any(|d| d.severity == Severity::Error) {
        anyhow::bail!("validation failed");
    }
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let graph = load_pipeline(path)?;

    println!("{} steps, execution order:", graph.len());
    for step in graph.execution_order() {
        let deps = graph.dependencies(&step.name);
        if deps.is_empty() {
            println!("  {}", step.name);
        } else {
            println!("  {}  (after {})", step.name, deps.join(", "));
        }
        println!("      dir: {}", step.working_dir.display());
        println!("      cmd: {}", step.command);
    }
    Ok(())
}

async fn cmd_sdk(
    plugin_binary: &Path,
    working_dir: Option<PathBuf>,
    public: bool,
    store: Option<PathBuf>,
    skip_npm: bool,
    skip_pypi: bool,
) -> anyhow::Result<()> {
    let working_dir = match working_dir {
        Some(dir) => {
            anyhow::ensure!(
                dir.is_absolute(),
                "--working-dir must be an absolute path"
            );
            dir
        }
        None => tempfile::Builder::new()
            .prefix("cascade-sdk-")
            .tempdir()
            .context("creating working directory")?
            .keep(),
    };
    tracing::info!(working_dir = %working_dir.display(), "SDK pipeline working directory");

    let store_dir = store.unwrap_or_else(|| working_dir.join(".cascade/records"));
    let store: Arc<dyn RunRecordStore> = Arc::new(JsonRecordStore::new(store_dir));

    let graph = sdk_pipeline(plugin_binary, &working_dir, public, skip_npm, skip_pypi)?;
    validate_or_raise(&graph)?;

    let executor = Executor::new(Arc::new(LocalCommandRunner::new()));
    let report = run_with_interrupt(&executor, &graph, store).await?;
    print_report(&graph, &report);

    // Surface the registry responses from the publish steps.
    for publish in ["publish-npm", "publish-pypi"] {
        if let Some(StepResult::Executed { stdout, .. }) = report.result(publish) {
            if !stdout.trim().is_empty() {
                println!("--- {publish} ---\n{}", stdout.trim_end());
            }
        }
    }

    finish(&report)
}

/// The generate -> (npm, pypi) pipeline. Secrets and tool paths come from
/// this process's environment, resolved here and handed to the steps as
/// explicit values.
fn sdk_pipeline(
    plugin_binary: &Path,
    working_dir: &Path,
    public: bool,
    skip_npm: bool,
    skip_pypi: bool,
) -> anyhow::Result<PipelineGraph> {
    let base_env: Vec<(String, String)> = ["PATH", "HOME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        .collect();
    let with_base_env = |mut step: Step| {
        for (key, value) in &base_env {
            step = step.env(key.clone(), value.clone());
        }
        step
    };

    let mut steps = vec![with_base_env(
        Step::new(
            "generate-sdk",
            format!("pulumi package gen-sdk \"{}\"", plugin_binary.display()),
            working_dir,
        )
        .trigger_file(plugin_binary)
        .output_glob("sdk/**"),
    )];

    if !skip_npm {
        let npm_flags = if public { " --access public" } else { "" };
        steps.push(with_base_env(
            Step::new(
                "publish-npm",
                format!(
                    "echo '//registry.npmjs.org/:_authToken=${{NPM_TOKEN}}' > .npmrc; npm publish{npm_flags}"
                ),
                working_dir.join("sdk/nodejs"),
            )
            .trigger_output("generate-sdk")
            .env("NPM_TOKEN", std::env::var("NPM_TOKEN").unwrap_or_default()),
        ));
    }

    if !skip_pypi {
        steps.push(with_base_env(
            Step::new(
                "publish-pypi",
                "python3 -m pip install build twine && python3 -m build && \
                 python3 -m twine upload dist/* -u __token__ -p ${PYPI_TOKEN}",
                working_dir.join("sdk/python"),
            )
            .trigger_output("generate-sdk")
            .env("PYPI_TOKEN", std::env::var("PYPI_TOKEN").unwrap_or_default()),
        ));
    }

    Ok(PipelineGraph::build(steps)?)
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_report(graph: &PipelineGraph, report: &RunReport) {
    for step in graph.execution_order() {
        let line = match report.result(&step.name) {
            Some(StepResult::Executed { duration_ms, .. }) => {
                format!("executed ({duration_ms} ms)")
            }
            Some(StepResult::Skipped { .. }) => "skipped (unchanged)".to_string(),
            Some(StepResult::Failed { error, .. }) => format!("failed: {error}"),
            Some(StepResult::Blocked { upstream }) => {
                format!("blocked (upstream '{upstream}' did not succeed)")
            }
            Some(StepResult::Cancelled) => "cancelled".to_string(),
            None => "not run".to_string(),
        };
        println!("{:<16} {line}", step.name);
    }
}
