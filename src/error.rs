//! Domain-specific error types for rsprovision.
//!
//! This module defines `ProvisionError`, a `thiserror`-based enum that
//! provides typed error variants for the failure modes of the provisioning
//! engine. Public API functions return `Result<T, ProvisionError>` where the
//! caller is expected to match on the kind, while task actions and the
//! orchestrator continue to use `anyhow::Result`.
//!
//! `ProvisionError` implements `Into<anyhow::Error>`, so the `?` operator
//! converts it automatically, and `anyhow::Error::downcast_ref` recovers it
//! through any added context.

use std::fmt::Write as _;
use std::io;

/// Formats an IO error kind into a human-readable message.
///
/// Provides consistent messages for common IO error kinds
/// (e.g., "I/O error: not found") instead of the OS-level messages
/// (e.g., "No such file or directory (os error 2)"). For unrecognized
/// kinds, falls back to the OS-level message.
pub(crate) fn io_error_kind_message(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => "I/O error: not found".to_string(),
        io::ErrorKind::PermissionDenied => "I/O error: permission denied".to_string(),
        io::ErrorKind::IsADirectory => "I/O error: is a directory".to_string(),
        _ => format!("I/O error: {}", err),
    }
}

/// Renders the multi-line report of a failed external command.
fn command_failed_report(
    command: &str,
    code: &Option<i32>,
    stdout: &str,
    stderr: &str,
    stdin: &Option<String>,
) -> String {
    let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
    let mut report = format!(
        "command exited with: {}\ncall: {}\n    stdout: {}\n    stderr: {}",
        code, command, stdout, stderr
    );
    if let Some(stdin) = stdin {
        let _ = write!(report, "\n    stdin: {}", stdin);
    }
    report
}

/// Domain-specific error type for rsprovision.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProvisionError {
    /// An external tool exited unsuccessfully.
    #[error("{}", command_failed_report(.command, .code, .stdout, .stderr, .stdin))]
    CommandFailed {
        /// Shell-quoted call, including any chroot/user prefix.
        command: String,
        /// Exit code, or `None` if the process was killed by a signal.
        code: Option<i32>,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
        /// Standard input as it may be shown; the redaction marker when the
        /// input was sensitive.
        stdin: Option<String>,
    },

    /// The persisted state references something the live system does not have.
    #[error("state inconsistency: {0}")]
    StateInconsistency(String),

    /// A configuration value is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// One or more teardown steps failed.
    #[error("teardown error: {0}")]
    Teardown(String),

    /// An I/O operation failed with contextual information.
    #[error("{context}: {message}")]
    Io {
        /// What was being done when the error occurred, usually including a path.
        context: String,
        /// Human-readable description derived from [`io_error_kind_message`].
        message: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl ProvisionError {
    /// Creates an `Io` variant with the `message` field derived from `source`.
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: io_error_kind_message(&source),
            source,
        }
    }

    /// Returns the exit code if this is a `CommandFailed` error.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { code, .. } => *code,
            _ => None,
        }
    }
}
