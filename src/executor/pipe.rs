//! Internal utilities for capturing command output.
//!
//! This module reads stdout/stderr pipes to completion, tracing each line as
//! it arrives and returning the captured bytes for error reports and for
//! callers that parse command output.

use std::io::{BufRead, BufReader, Read, Write};

/// Type of output stream for logging purposes.
#[derive(Clone, Copy)]
pub(super) enum StreamType {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Extracts a human-readable message from a thread panic.
pub(super) fn panic_message(err: &(dyn std::any::Any + Send)) -> &str {
    err.downcast_ref::<&str>()
        .copied()
        .or_else(|| err.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap_or("unknown panic")
}

/// Reads a pipe to EOF, tracing each line and returning everything read.
///
/// - Lines are traced at TRACE level; the captured text is what callers see
/// - I/O errors stop reading but don't fail command execution, the exit
///   status decides success
/// - `None` pipe logs an error and returns an empty buffer
pub(super) fn capture_pipe<R: Read>(pipe: Option<R>, stream_type: StreamType) -> Vec<u8> {
    let Some(pipe) = pipe else {
        tracing::error!(
            stream = %stream_type,
            "pipe was None (unexpected: Stdio::piped() was set), no output will be captured"
        );
        return Vec::new();
    };

    let mut reader = BufReader::new(pipe);
    let mut captured = Vec::new();
    let mut line_buf = Vec::new();

    loop {
        line_buf.clear();
        match reader.read_until(b'\n', &mut line_buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = line_buf.strip_suffix(b"\n").unwrap_or(&line_buf);
                let text = String::from_utf8_lossy(line);
                tracing::trace!(stream = %stream_type, "{}", text.trim_end_matches('\r'));
                captured.extend_from_slice(&line_buf);
            }
            Err(e) => {
                tracing::error!(stream = %stream_type, error = %e, "I/O error, stopping read");
                break;
            }
        }
    }

    captured
}

/// Writes `data` to the child's stdin and closes it.
///
/// A broken pipe means the child exited without reading everything; the
/// exit status will tell whether that was a failure.
pub(super) fn feed_pipe<W: Write>(pipe: Option<W>, data: Vec<u8>) {
    let Some(mut pipe) = pipe else {
        tracing::error!("stdin pipe was None (unexpected: Stdio::piped() was set)");
        return;
    };
    if let Err(e) = pipe.write_all(&data) {
        tracing::debug!(error = %e, "failed to write stdin of child process");
    }
}
