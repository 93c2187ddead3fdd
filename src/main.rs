use std::panic;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, ensure};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use coderunner::config::{Isolation, RunnerConfig};
use coderunner::core::domain::{RunMode, RunRequest};
use coderunner::core::orchestrator::Orchestrator;
use coderunner::core::result::RunOutcome;
use coderunner::storage::DirectorySource;

/// Build and run a project directory in a sandbox.
#[derive(Debug, Parser)]
#[command(name = "coderunner", version)]
struct Args {
    /// Project directory to run
    dir: PathBuf,

    /// File to start from, relative to the project directory
    #[arg(long)]
    entry: Option<String>,

    /// Wall-clock limit for each of the build and run phases
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Stop after a successful build
    #[arg(long)]
    build_only: bool,

    /// JSON config file (defaults to $CODERUNNER_CONFIG or config/runner.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// `process` or `container`
    #[arg(long)]
    isolation: Option<Isolation>,

    /// Extra environment for the program, as KEY=VALUE
    #[arg(long = "env", short = 'e', value_parser = parse_env)]
    environment: Vec<(String, String)>,
}

fn parse_env(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got `{}`", value))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    set_panic_hook();

    let args = Args::parse();
    ensure!(args.dir.is_dir(), "{} is not a directory", args.dir.display());

    let mut config = match &args.config {
        Some(path) => RunnerConfig::load(path)?.with_overrides(|key| std::env::var(key).ok())?,
        None => RunnerConfig::load_default()?,
    };
    if let Some(isolation) = args.isolation {
        config.isolation = isolation;
    }

    let orchestrator = Orchestrator::from_config(&config)
        .await
        .context("Failed to initialise the runner")?;
    let source = DirectorySource::new();
    let project_id = source.register(&args.dir);

    let mut request = RunRequest::new(project_id);
    if let Some(entry) = args.entry {
        request = request.with_entry_point(entry);
    }
    if let Some(timeout_ms) = args.timeout_ms {
        request = request.with_timeout(Duration::from_millis(timeout_ms));
    }
    if args.build_only {
        request = request.with_mode(RunMode::BuildOnly);
    }
    for (key, value) in args.environment {
        request = request.with_env(key, value);
    }

    let run = orchestrator.execute_project(request, &source);
    tokio::pin!(run);
    let outcome = tokio::select! {
        outcome = &mut run => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping run");
            orchestrator.stop(project_id);
            run.await
        }
    };
    orchestrator.shutdown().await;

    Ok(report(&outcome))
}

fn report(outcome: &RunOutcome) -> ExitCode {
    let Some(result) = outcome.result() else {
        eprintln!("project is already running");
        return ExitCode::FAILURE;
    };

    if !result.output.is_empty() {
        println!("{}", result.output);
    }
    for diagnostic in &result.diagnostics {
        match diagnostic.start_line {
            Some(line) => eprintln!("{} (line {}): {}", diagnostic.code, line, diagnostic.message),
            None => eprintln!("{}: {}", diagnostic.code, diagnostic.message),
        }
    }
    eprintln!("{:?}", result.state);

    if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
