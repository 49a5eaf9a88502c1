//! Shell quoting for logged command lines.
//!
//! Commands are always spawned from argument vectors; quoting is only used
//! to render a call so that it can be copied into a shell and replayed, and
//! by [`ShellPipeline`](super::ShellPipeline) for its single `bash -c` script.

const META_CHARS: &[char] = &['|', '&', ';', '(', ')', '<', '>', ' ', '\t', '\n', '*', '?'];
const QUOTE_CHARS: &[char] = &['\'', '"', '`', '$', '\\'];

fn needs_quotes(arg: &str) -> bool {
    arg.is_empty() || arg.contains(META_CHARS) || arg.contains(QUOTE_CHARS)
}

/// Quotes a single argument for POSIX shells.
///
/// Arguments without shell meta characters are returned unchanged.
/// Everything else is wrapped in single quotes, with embedded single quotes
/// written as `'"'"'`.
pub fn quote_arg(arg: &str) -> String {
    if needs_quotes(arg) {
        format!("'{}'", arg.replace('\'', r#"'"'"'"#))
    } else {
        arg.to_string()
    }
}

/// Quotes and joins an argument vector into one replayable command line.
pub fn quote_command<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|a| quote_arg(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
