//! Real command executor implementation.
//!
//! This module provides [`RealCommandExecutor`], which executes commands
//! using `std::process::Command`, feeding stdin and capturing output on
//! dedicated threads so that neither side can block the other.

use std::process::{Child, Command, Stdio};
use std::thread;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use which::which;

use super::pipe::{StreamType, capture_pipe, feed_pipe, panic_message};
use super::{CommandExecutor, CommandSpec, ExecutionResult};
use crate::error::ProvisionError;

/// Cleans up a child process after an internal failure.
///
/// Kills the child, waits for it to terminate and joins any helper threads
/// that were already started.
fn cleanup_child_process<T>(child: &mut Child, handles: Vec<JoinHandle<T>>) {
    let pid = child.id();
    if let Err(e) = child.kill() {
        tracing::debug!(pid = pid, "kill returned error (process may have already exited): {}", e);
    }
    if let Err(e) = child.wait() {
        tracing::warn!(pid = pid, "failed to wait for child process after kill: {}", e);
    }
    for handle in handles {
        if let Err(e) = handle.join() {
            tracing::warn!("helper thread panicked during cleanup: {}", panic_message(&*e));
        }
    }
}

fn internal_failure(spec: &CommandSpec, status: String) -> anyhow::Error {
    ProvisionError::CommandFailed {
        command: spec.display_line(),
        code: None,
        stdout: String::new(),
        stderr: status,
        stdin: spec.stdin.as_ref().map(|s| s.display()),
    }
    .into()
}

/// Joins a reader thread, returning its captured bytes.
fn join_reader(name: &str, handle: JoinHandle<Vec<u8>>, panicked: &mut Vec<String>) -> String {
    match handle.join() {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            let msg = panic_message(&*e);
            tracing::error!(stream = name, panic = msg, "reader thread panicked");
            panicked.push(format!("{}: {}", name, msg));
            String::new()
        }
    }
}

/// Command executor that runs actual system commands.
///
/// When `dry_run` is true, commands are logged but not executed,
/// and `execute()` returns a status-less [`ExecutionResult`].
pub struct RealCommandExecutor {
    pub dry_run: bool,
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        if self.dry_run {
            tracing::info!("dry run: {}", spec);
            return Ok(ExecutionResult::dry_run());
        }

        let argv = spec.effective_argv();
        let program = &argv[0];
        let cmd = which(program).with_context(|| format!("command not found: {}", program))?;
        tracing::trace!("command found: {}: {}", program, cmd.to_string_lossy());

        let mut command = Command::new(cmd);
        command.args(&argv[1..]);

        if let Some(ref cwd) = spec.cwd {
            command.current_dir(cwd);
        }

        for (key, value) in &spec.env {
            command.env(key, value);
        }

        command.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn command `{}`", spec.display_line()))?;

        tracing::trace!("spawned command: {}: pid={}", program, child.id());

        let stdin_handle = match &spec.stdin {
            Some(stdin) => {
                let pipe = child.stdin.take();
                let data = stdin.as_bytes().to_vec();
                match thread::Builder::new()
                    .name("stdin-writer".to_string())
                    .spawn(move || feed_pipe(pipe, data))
                {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        cleanup_child_process::<()>(&mut child, Vec::new());
                        return Err(internal_failure(
                            spec,
                            format!("failed to spawn stdin writer thread: {}", e),
                        ));
                    }
                }
            }
            None => None,
        };

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let stdout_handle = match thread::Builder::new()
            .name("stdout-reader".to_string())
            .spawn(move || capture_pipe(stdout_pipe, StreamType::Stdout))
        {
            Ok(handle) => handle,
            Err(e) => {
                cleanup_child_process(&mut child, stdin_handle.into_iter().collect());
                return Err(internal_failure(
                    spec,
                    format!("failed to spawn stdout reader thread: {}", e),
                ));
            }
        };

        let stderr_handle = match thread::Builder::new()
            .name("stderr-reader".to_string())
            .spawn(move || capture_pipe(stderr_pipe, StreamType::Stderr))
        {
            Ok(handle) => handle,
            Err(e) => {
                cleanup_child_process(&mut child, vec![stdout_handle]);
                if let Some(handle) = stdin_handle {
                    let _ = handle.join();
                }
                return Err(internal_failure(
                    spec,
                    format!("failed to spawn stderr reader thread: {}", e),
                ));
            }
        };

        let status = match child.wait() {
            Ok(s) => s,
            Err(e) => {
                cleanup_child_process(&mut child, vec![stdout_handle, stderr_handle]);
                if let Some(handle) = stdin_handle {
                    let _ = handle.join();
                }
                return Err(internal_failure(spec, format!("failed to wait for command: {}", e)));
            }
        };

        let mut panicked_streams = Vec::new();
        if let Some(handle) = stdin_handle
            && let Err(e) = handle.join()
        {
            panicked_streams.push(format!("stdin: {}", panic_message(&*e)));
        }
        let stdout = join_reader("stdout", stdout_handle, &mut panicked_streams);
        let stderr = join_reader("stderr", stderr_handle, &mut panicked_streams);

        if !panicked_streams.is_empty() {
            return Err(internal_failure(
                spec,
                format!(
                    "helper thread(s) panicked during command execution: {}",
                    panicked_streams.join(", ")
                ),
            ));
        }

        tracing::trace!("executed command: {}: success={}", program, status.success());

        Ok(ExecutionResult {
            status: Some(status),
            stdout,
            stderr,
        })
    }
}
