//! Composition of shell pipelines.
//!
//! Everything else in rsprovision spawns argument vectors directly. A few
//! operations (archive + compress into a file) need a real pipeline; this
//! builder is the only place where a `bash -c` script is assembled, and every
//! word in it is quoted with [`quote_arg`].

use camino::{Utf8Path, Utf8PathBuf};

use super::quote::{quote_arg, quote_command};
use super::CommandSpec;

/// A `|`-joined sequence of argument vectors with an optional output file.
#[derive(Debug, Clone, Default)]
pub struct ShellPipeline {
    stages: Vec<Vec<String>>,
    output: Option<Utf8PathBuf>,
}

impl ShellPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one pipeline stage.
    #[must_use]
    pub fn pipe<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stages.push(argv.into_iter().map(Into::into).collect());
        self
    }

    /// Redirects the output of the last stage into `path`.
    #[must_use]
    pub fn redirect_to(mut self, path: &Utf8Path) -> Self {
        self.output = Some(path.to_owned());
        self
    }

    /// Returns the shell script text.
    pub fn script(&self) -> String {
        let mut script = self
            .stages
            .iter()
            .map(|argv| quote_command(argv))
            .collect::<Vec<_>>()
            .join(" | ");
        if let Some(output) = &self.output {
            script.push_str(" > ");
            script.push_str(&quote_arg(output.as_str()));
        }
        script
    }

    /// Builds the `bash -c` command spec. `pipefail` makes a failure in any
    /// stage fail the whole pipeline.
    pub fn into_spec(self) -> CommandSpec {
        let script = format!("set -o pipefail; {}", self.script());
        CommandSpec::new("bash", ["-c".to_string(), script])
    }
}
