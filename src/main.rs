//! stampede: run staged HTTP load tests from a config file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use stampede::config::LoadTestConfig;
use stampede::durations::{format_duration, parse_duration};
use stampede::runner::ScenarioRunner;
use stampede::script::HttpScript;
use stampede::summary::render_summary;
use stampede::LoadTestError;

/// Exit code for an invalid configuration.
const EXIT_INVALID_CONFIG: i32 = 104;
/// Exit code for a run stopped from outside (second Ctrl+C).
const EXIT_EXTERNALLY_ABORTED: i32 = 105;

/// Staged, concurrency-ramping HTTP load tests
#[derive(Debug, Parser)]
#[command(name = "stampede")]
#[command(about = "Run k6-style HTTP load tests from a TOML or JSON config", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a load test
    ///
    /// Executes every scenario of the config in parallel, prints a summary
    /// and exits with 0 when all thresholds pass, 99 when one fails, 104 for
    /// an invalid config and 105 when the run was cancelled.
    Run {
        /// Path to the config file (`.toml`, or `.json` for k6-style options)
        config: PathBuf,

        /// Number of virtual users (overrides `vus`)
        #[arg(long, env = "STAMPEDE_VUS")]
        vus: Option<u64>,

        /// Test duration such as `30s` or `1m20s` (overrides `duration` and
        /// replaces `stages`, `iterations` and `scenarios`)
        #[arg(long, env = "STAMPEDE_DURATION", value_parser = parse_duration)]
        duration: Option<Duration>,

        /// Disable colored output
        #[arg(long)]
        no_color: bool,
    },

    /// Check a config file without running it
    Validate {
        /// Path to the config file
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    let code = match execute(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            exit_code_for(&err)
        },
    };
    std::process::exit(code);
}

#[cfg(feature = "logging")]
fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stampede=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(not(feature = "logging"))]
fn init_logging() {}

fn execute(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            config,
            vus,
            duration,
            no_color,
        } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(execute_run(config, vus, duration, no_color))
        },
        Command::Validate { config } => execute_validate(&config),
    }
}

/// Map a fatal error to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<LoadTestError>() {
        Some(LoadTestError::Setup { .. }) | None => 1,
        Some(_) => EXIT_INVALID_CONFIG,
    }
}

fn load_config(path: &Path) -> Result<LoadTestConfig> {
    let config = LoadTestConfig::load(path)
        .with_context(|| format!("Failed to load config '{}'", path.display()))?;
    Ok(config)
}

async fn execute_run(
    config_path: PathBuf,
    vus: Option<u64>,
    duration: Option<Duration>,
    no_color: bool,
) -> Result<i32> {
    let mut config = load_config(&config_path)?;
    config.apply_overrides(vus, duration);

    let plan = config.plan()?;
    let script_config = config.script.as_ref().ok_or_else(|| LoadTestError::ConfigValidation {
        message: format!(
            "'{}' has no [script] section; the CLI needs one to know what each iteration does",
            config_path.display()
        ),
    })?;
    let script = HttpScript::new(script_config)?;

    let cancel = CancellationToken::new();
    tokio::spawn(handle_ctrl_c(cancel.clone()));

    eprintln!("Running load test from: {}", config_path.display());
    let result = ScenarioRunner::new(plan, script)
        .with_cancellation(cancel)
        .run()
        .await?;

    if no_color || !std::io::stdout().is_terminal() {
        colored::control::set_override(false);
    }
    println!("{}", render_summary(&result));

    Ok(result.exit_code())
}

fn execute_validate(config_path: &Path) -> Result<i32> {
    let config = load_config(config_path)?;
    let plan = config.plan()?;
    if let Some(script) = &config.script {
        HttpScript::new(script)?;
    }

    println!("{} is valid", config_path.display());
    for scenario in &plan.scenarios {
        let executor = &scenario.executor;
        println!(
            "  {}: {}, up to {} VUs, starts at {}, runs {} (+{} graceful stop)",
            scenario.name,
            executor.kind_name(),
            executor.max_vus(),
            format_duration(executor.start_time()),
            format_duration(executor.nominal_duration()),
            format_duration(executor.graceful_stop()),
        );
    }
    println!("  {} threshold(s)", plan.thresholds.len());
    if config.script.is_none() {
        println!("  no [script] section: `stampede run` needs one");
    }
    Ok(0)
}

/// First Ctrl+C stops the run gracefully; the second exits at once.
async fn handle_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    eprintln!("\nReceived Ctrl+C, stopping gracefully...");
    cancel.cancel();

    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    eprintln!("\nReceived second Ctrl+C, aborting immediately.");
    std::process::exit(EXIT_EXTERNALLY_ABORTED);
}
