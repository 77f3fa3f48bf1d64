//! tw - testwarden CLI
//!
//! Shows the process table the way the test watchdog classifies it, and
//! reaps stale test processes from CI scripts before or after a test run.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use testwarden_core::ProcessWatchdog;
use testwarden_core::config::{Config, LogFormat};
use testwarden_core::logging::init_logging;
use testwarden_core::process_scan::SystemProcessSource;
use testwarden_core::process_watchdog::{ClassifiedProcess, SweepSummary, sweep_blocking};

/// tw - test resource and process watchdog
#[derive(Parser, Debug)]
#[command(name = "tw")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to testwarden.toml (defaults to the per-user config location)
    #[arg(short, long, global = true, env = "TESTWARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List processes with their watchdog classification
    #[command(alias = "ls")]
    Scan {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Terminate stale test processes
    Sweep(SweepArgs),

    /// Print the effective configuration (file + environment overrides)
    Config {
        /// Emit JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct SweepArgs {
    /// Age threshold in seconds for every launch kind (overrides config)
    #[arg(long)]
    age_secs: Option<u64>,

    /// How long to wait for terminated processes to exit
    #[arg(long)]
    max_wait_ms: Option<u64>,

    /// Show what would be terminated without signalling anything
    #[arg(long)]
    dry_run: bool,

    /// Emit JSON instead of text
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if let Some(remediation) = err
                .downcast_ref::<testwarden_core::Error>()
                .and_then(testwarden_core::Error::remediation)
            {
                eprintln!();
                eprintln!("{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_logging(&config.logging).context("failed to initialize logging")?;
    tracing::debug!(config_path = ?cli.config, "configuration loaded");

    match cli.command {
        Commands::Scan { json } => scan(&config, json).await,
        Commands::Sweep(args) => sweep(&config, &args).await,
        Commands::Config { json } => show_config(&config, json),
    }
}

fn watchdog(config: &Config) -> Arc<ProcessWatchdog> {
    let source = Arc::new(SystemProcessSource::new(config.watchdog.unit_env_var.clone()));
    Arc::new(ProcessWatchdog::from_config(&config.watchdog, source))
}

async fn scan(config: &Config, json: bool) -> Result<()> {
    let watchdog = watchdog(config);
    let processes = tokio::task::spawn_blocking(move || watchdog.scan())
        .await
        .context("scan task failed")??;

    if json {
        println!("{}", serde_json::to_string_pretty(&processes)?);
    } else {
        print_processes(&processes);
    }
    Ok(())
}

async fn sweep(config: &Config, args: &SweepArgs) -> Result<()> {
    let watchdog = watchdog(config);
    let mut policy = *watchdog.policy();
    if let Some(age) = args.age_secs {
        policy.build_run_max_age = Duration::from_secs(age);
        policy.test_host_max_age = Duration::from_secs(age);
    }
    if let Some(wait) = args.max_wait_ms {
        policy.max_wait = Duration::from_millis(wait);
    }

    if args.dry_run {
        let plan = tokio::task::spawn_blocking(move || watchdog.plan(&policy))
            .await
            .context("sweep planning task failed")??;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&plan)?);
        } else {
            println!(
                "Would terminate {} of {} processes:",
                plan.selected.len(),
                plan.scanned
            );
            print_processes(&plan.selected);
        }
        return Ok(());
    }

    let summary = sweep_blocking(watchdog, policy).await;
    // Termination outcomes never fail the command; an unreadable process
    // table does.
    if summary.scanned == 0 && !summary.errors.is_empty() {
        return Err(testwarden_core::Error::ProcessScan(summary.errors.join("; ")).into());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn show_config(config: &Config, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        print!("{}", config.to_toml().map_err(testwarden_core::Error::from)?);
    }
    Ok(())
}

const MAX_COMMAND_WIDTH: usize = 100;

fn print_processes(processes: &[ClassifiedProcess]) {
    println!("{:>7}  {:>8}  {:<24}  COMMAND", "PID", "AGE", "CLASS");
    for process in processes {
        let class = match process.kinship {
            Some(kinship) => format!("{} [{kinship}]", process.classification),
            None => process.classification.to_string(),
        };
        let command: String = process
            .record
            .signature
            .as_deref()
            .unwrap_or("-")
            .chars()
            .take(MAX_COMMAND_WIDTH)
            .collect();
        println!(
            "{:>7}  {:>8}  {:<24}  {}",
            process.record.pid,
            format_age(process.record.age),
            class,
            command
        );
    }
}

fn print_summary(summary: &SweepSummary) {
    println!(
        "Scanned {} processes ({} test, {} foreign, {} unknown); selected {}",
        summary.scanned,
        summary.by_class.known_test,
        summary.by_class.foreign,
        summary.by_class.unknown,
        summary.selected
    );
    println!(
        "Terminated {}, timed out {}, already gone {}, failed {}",
        summary.terminated, summary.timed_out, summary.already_gone, summary.failed
    );
    if !summary.timed_out_pids.is_empty() {
        println!("Still running: {:?}", summary.timed_out_pids);
    }
    for error in &summary.errors {
        println!("  ! {error}");
    }
}

fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3_600 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h{:02}m", secs / 3_600, (secs % 3_600) / 60)
    }
}
