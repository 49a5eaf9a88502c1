pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod probe;
pub mod secret;
pub mod stage;
pub mod storage;
pub mod task;

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use camino::Utf8Path;
use clap::CommandFactory;
use clap_complete::Shell;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::Uptime;
use tracing_subscriber::prelude::*;

use crate::context::ProvisionContext;
use crate::executor::CommandExecutor;
use crate::ledger::Ledger;
use crate::probe::SystemProbe;
use crate::stage::StageReport;
use crate::storage::{Teardown, TeardownReport};

/// Installs the global subscriber: stderr with seconds since start, plus an
/// optional plain-text log file.
pub fn init_logging(opts: &cli::LoggingArgs) -> Result<()> {
    let filter = match opts.log_level {
        cli::LogLevel::Trace => LevelFilter::TRACE,
        cli::LogLevel::Debug => LevelFilter::DEBUG,
        cli::LogLevel::Info => LevelFilter::INFO,
        cli::LogLevel::Warn => LevelFilter::WARN,
        cli::LogLevel::Error => LevelFilter::ERROR,
    };

    let file_layer = match &opts.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file: {}", path))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_timer(Uptime::default())
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(Uptime::default())
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .try_init()
        .context("failed to set global default tracing subscriber")
}

fn load_context(
    config_path: &Utf8Path,
    state_path: &Utf8Path,
    dry_run: bool,
    executor: Arc<dyn CommandExecutor>,
    probe: Arc<dyn SystemProbe>,
) -> Result<ProvisionContext> {
    let config = config::load_config(config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;
    let mut ledger = Ledger::load(state_path)?;
    if dry_run {
        ledger = ledger.without_persistence();
    }
    Ok(ProvisionContext::new(config, ledger, executor, probe).with_dry_run(dry_run))
}

/// Runs one stage, skipping the tasks the state file lists as done.
pub fn run_stage(
    opts: &cli::RunArgs,
    executor: Arc<dyn CommandExecutor>,
    probe: Arc<dyn SystemProbe>,
) -> Result<StageReport> {
    info!("starting stage {} with state file {}", opts.stage, opts.state);
    if opts.clean {
        if opts.dry_run {
            info!("would remove state file {}", opts.state);
        } else if Ledger::clean(&opts.state)? {
            info!("removed state file {}", opts.state);
        }
    }

    let mut ctx = load_context(&opts.config, &opts.state, opts.dry_run, executor, probe)?;
    ctx.config
        .validate(opts.stage)
        .context("configuration validation failed")?;
    let stage = opts.stage.stage()?;
    stage.run(&mut ctx)
}

/// Mounts the storage stack and the bind mounts.
pub fn run_mount(
    opts: &cli::StorageArgs,
    executor: Arc<dyn CommandExecutor>,
    probe: Arc<dyn SystemProbe>,
) -> Result<()> {
    let mut ctx = load_context(&opts.config, &opts.state, opts.dry_run, executor, probe)?;
    ctx.config
        .validate_mount()
        .context("configuration validation failed")?;
    storage::mounts::mount_storage(&mut ctx)?;
    storage::bind::bind_mount(&mut ctx)?;
    info!("mounted {}", ctx.target_root());
    Ok(())
}

/// Releases the bind mounts and the storage stack, continuing past
/// failures. Failures are logged and returned in the report.
pub fn run_umount(
    opts: &cli::StorageArgs,
    executor: Arc<dyn CommandExecutor>,
    probe: Arc<dyn SystemProbe>,
) -> Result<TeardownReport> {
    let mut ctx = load_context(&opts.config, &opts.state, opts.dry_run, executor, probe)?;
    ctx.config
        .validate_storage()
        .context("configuration validation failed")?;
    let mut report = storage::bind::bind_umount(&mut ctx, Teardown::BestEffort)?;
    report.merge(storage::mounts::unmount_storage(&mut ctx, Teardown::BestEffort)?);
    if report.is_clean() {
        info!("released {} resource(s)", report.released.len());
    } else {
        warn!(
            "{} resource(s) could not be released, manual cleanup may be required: findmnt | grep {}",
            report.failures.len(),
            ctx.target_root()
        );
    }
    Ok(report)
}

pub fn run_validate(opts: &cli::ValidateArgs) -> Result<()> {
    let config = config::load_config(&opts.config)?;
    if let Some(stage) = opts.stage {
        config
            .validate(stage)
            .context("configuration validation failed")?;
    }
    info!("validation successful:\n{:#?}", config);
    Ok(())
}

/// Writes completions for `shell` to `out`.
pub fn write_completions(shell: Shell, out: &mut dyn Write) {
    let mut cmd = cli::Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, out);
}

/// Dispatches a parsed command line.
pub fn run(
    args: &cli::Cli,
    executor: Arc<dyn CommandExecutor>,
    probe: Arc<dyn SystemProbe>,
) -> Result<()> {
    match &args.command {
        cli::Commands::Run(opts) => {
            run_stage(opts, executor, probe)?;
        }
        cli::Commands::Mount(opts) => run_mount(opts, executor, probe)?,
        cli::Commands::Umount(opts) => {
            run_umount(opts, executor, probe)?;
        }
        cli::Commands::Validate(opts) => run_validate(opts)?,
        cli::Commands::Completions(opts) => write_completions(opts.shell, &mut std::io::stdout()),
    }
    Ok(())
}
