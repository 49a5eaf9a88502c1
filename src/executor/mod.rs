//! Command execution abstraction for rsprovision.
//!
//! This module provides:
//! - [`CommandSpec`]: Specification for commands to execute
//! - [`ExecutionResult`]: Exit status and captured output of a command
//! - [`CommandExecutor`]: Trait for command execution strategies
//! - [`RealCommandExecutor`]: Production implementation using `std::process::Command`
//! - [`ShellPipeline`]: The single place where a shell script is composed
//! - [`run_checked`]: Converts a non-zero exit into [`ProvisionError::CommandFailed`]

mod pipe;
mod quote;
mod real;
mod shell;

use std::fmt;
use std::process::ExitStatus;

use anyhow::Result;
use camino::Utf8PathBuf;

use crate::error::ProvisionError;

pub use quote::{quote_arg, quote_command};
pub use real::RealCommandExecutor;
pub use shell::ShellPipeline;

/// Marker that replaces sensitive standard input in every logged form.
pub const REDACTED: &str = "<secret>";

/// Standard input fed to a command.
#[derive(Clone)]
pub struct Stdin {
    data: String,
    sensitive: bool,
}

impl Stdin {
    /// Input that may appear in logs.
    pub fn plain(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            sensitive: false,
        }
    }

    /// Input that must never appear in logs or error reports.
    pub fn sensitive(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            sensitive: true,
        }
    }

    /// Returns the raw bytes to write to the child process.
    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    /// Returns true if the input is redacted in logs.
    pub fn is_sensitive(&self) -> bool {
        self.sensitive
    }

    /// Returns the form of the input that may be logged.
    ///
    /// Escaped for replay inside the single quotes of `echo -ne '...'`.
    pub fn display(&self) -> String {
        if self.sensitive {
            REDACTED.to_string()
        } else {
            self.data
                .replace('\\', "\\\\")
                .replace('\n', "\\n")
                .replace('\'', r"'\''")
        }
    }
}

impl fmt::Debug for Stdin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stdin")
            .field("data", &self.display())
            .field("sensitive", &self.sensitive)
            .finish()
    }
}

/// Specification for a command to be executed
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// The command to execute (e.g., "mkfs.btrfs")
    pub command: String,
    /// Command arguments
    pub args: Vec<String>,
    /// Working directory (optional, defaults to current directory)
    pub cwd: Option<Utf8PathBuf>,
    /// Environment variables to set (in addition to inherited environment)
    pub env: Vec<(String, String)>,
    /// Standard input; `None` leaves stdin closed
    pub stdin: Option<Stdin>,
    /// Filesystem tree to `chroot` into before running the command
    pub root: Option<Utf8PathBuf>,
    /// Unprivileged user to run the command as
    pub user: Option<String>,
}

impl CommandSpec {
    /// Creates a new CommandSpec with command and args
    #[must_use]
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
            stdin: None,
            root: None,
            user: None,
        }
    }

    /// Appends arguments
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds an environment variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets standard input
    #[must_use]
    pub fn with_stdin(mut self, stdin: Stdin) -> Self {
        self.stdin = Some(stdin);
        self
    }

    /// Runs the command inside `root` via `chroot`
    #[must_use]
    pub fn in_root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Runs the command as `user` via `sudo -u <user> --set-home`
    #[must_use]
    pub fn as_user(mut self, user: Option<&str>) -> Self {
        self.user = user.map(str::to_string);
        self
    }

    /// Returns the argument vector actually spawned, including the
    /// chroot and user prefixes.
    pub fn effective_argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 6);
        if let Some(root) = &self.root {
            argv.push("chroot".to_string());
            argv.push(root.to_string());
        }
        if let Some(user) = &self.user {
            argv.extend(["sudo".to_string(), "-u".to_string(), user.clone()]);
            argv.push("--set-home".to_string());
        }
        argv.push(self.command.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Renders the call as a replayable shell line.
    ///
    /// Standard input is shown as an `echo -ne` prefix; sensitive input is
    /// replaced by [`REDACTED`].
    pub fn display_line(&self) -> String {
        let call = quote_command(&self.effective_argv());
        match &self.stdin {
            Some(stdin) => format!("echo -ne '{}' | {}", stdin.display(), call),
            None => call,
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_line())
    }
}

/// Result of command execution
#[derive(Debug, Default)]
pub struct ExecutionResult {
    /// Exit status of the command (None in dry-run mode)
    pub status: Option<ExitStatus>,
    /// Captured standard output (lossy UTF-8)
    pub stdout: String,
    /// Captured standard error (lossy UTF-8)
    pub stderr: String,
}

impl ExecutionResult {
    /// A result without status or output, as produced in dry-run mode.
    pub fn dry_run() -> Self {
        Self::default()
    }

    /// Returns true if the command executed successfully.
    ///
    /// In dry-run mode (status is None), this always returns true.
    pub fn success(&self) -> bool {
        self.status.is_none_or(|s| s.success())
    }

    /// Returns the exit code if available
    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }
}

/// Trait for command execution.
///
/// Implementations must be `Send + Sync` so that the executor can be shared
/// as `Arc<dyn CommandExecutor>`. A non-zero exit is not an error at this
/// level; callers decide with [`run_checked`].
pub trait CommandExecutor: Send + Sync {
    /// Executes a command with the given specification.
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult>;
}

/// Builds the `CommandFailed` error for an unsuccessful result.
pub fn command_failed(spec: &CommandSpec, result: ExecutionResult) -> ProvisionError {
    ProvisionError::CommandFailed {
        command: quote_command(&spec.effective_argv()),
        code: result.code(),
        stdout: result.stdout,
        stderr: result.stderr,
        stdin: spec.stdin.as_ref().map(Stdin::display),
    }
}

/// Executes a command and fails with [`ProvisionError::CommandFailed`] on a
/// non-zero exit.
pub fn run_checked(executor: &dyn CommandExecutor, spec: &CommandSpec) -> Result<ExecutionResult> {
    let result = executor.execute(spec)?;
    if result.success() {
        Ok(result)
    } else {
        Err(command_failed(spec, result).into())
    }
}
