use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use crate::stage::StageKind;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a provisioning stage, resuming after the last completed task
    Run(RunArgs),

    /// Only mount the storage stack and the bind mounts
    Mount(StorageArgs),

    /// Only unmount the bind mounts and the storage stack (best effort)
    Umount(StorageArgs),

    /// Validate the given YAML configuration
    Validate(ValidateArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

impl Commands {
    /// Returns the logging options, if the command logs.
    pub fn logging(&self) -> Option<&LoggingArgs> {
        match self {
            Self::Run(opts) => Some(&opts.logging),
            Self::Mount(opts) | Self::Umount(opts) => Some(&opts.logging),
            Self::Validate(opts) => Some(&opts.logging),
            Self::Completions(_) => None,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    /// Set the log level
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,

    /// Also write log messages to this file
    #[arg(long)]
    pub log_file: Option<Utf8PathBuf>,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Stage to run: build (0) from rescue media, finish (1) inside the target
    #[arg(long)]
    pub stage: StageKind,

    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "system.yaml")]
    pub config: Utf8PathBuf,

    /// Path to the state file recording completed tasks
    #[arg(long, default_value = "provision.state")]
    pub state: Utf8PathBuf,

    /// Remove the state file before running
    #[arg(long)]
    pub clean: bool,

    /// Do not run, just show what would be done
    #[arg(long)]
    pub dry_run: bool,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug)]
pub struct StorageArgs {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "system.yaml")]
    pub config: Utf8PathBuf,

    /// Path to the state file holding the storage identifiers
    #[arg(long, default_value = "provision.state")]
    pub state: Utf8PathBuf,

    /// Do not run, just show what would be done
    #[arg(long)]
    pub dry_run: bool,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the YAML file to validate
    #[arg(short, long, default_value = "system.yaml")]
    pub config: Utf8PathBuf,

    /// Also check the keys this stage requires
    #[arg(long)]
    pub stage: Option<StageKind>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: Shell,
}

/// Represents log levels for controlling the verbosity of logging output.
///
/// This enum maps directly to the log levels used by the `tracing` crate:
/// - `Trace`: Designates very detailed application-level information,
///   including the captured output of every command.
/// - `Debug`: Designates information useful for debugging, such as each
///   command line in a form that can be replayed in a shell.
/// - `Info`: Designates general operational messages.
/// - `Warn`: Designates potentially harmful situations.
/// - `Error`: Designates error events that might still allow the application to continue running.
///
/// Every logging subcommand accepts it, so `--log-level debug` shows what a
/// stage would run before it runs it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

pub fn parse_args() -> Cli {
    Cli::parse()
}
