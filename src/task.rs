//! Named units of work.
//!
//! A [`Task`] couples a stable identifier with an action. The action reports
//! whether it applied its side effects ([`TaskOutcome::Done`]) or found that
//! it does not apply to the current configuration
//! ([`TaskOutcome::Skipped`]); any `Err` is a failure.

use std::fmt;

use anyhow::Result;

use crate::context::ProvisionContext;

/// Result of a task action that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Side effects applied.
    Done,
    /// Not applicable given the configuration or the live system.
    Skipped(String),
}

impl TaskOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped(reason.into())
    }
}

/// How a task interacts with the completion ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    /// Runs until it succeeds once; then recorded and never run again.
    Once,
    /// Runs on every invocation and is never recorded. Used for steps that
    /// bracket other tasks, such as mounting the storage stack.
    Always,
}

type Action = Box<dyn Fn(&mut ProvisionContext) -> Result<TaskOutcome>>;

pub struct Task {
    id: String,
    mode: TaskMode,
    action: Action,
}

impl Task {
    /// Creates a ledger-gated task.
    pub fn once<F>(id: impl Into<String>, action: F) -> Self
    where
        F: Fn(&mut ProvisionContext) -> Result<TaskOutcome> + 'static,
    {
        Self {
            id: id.into(),
            mode: TaskMode::Once,
            action: Box::new(action),
        }
    }

    /// Creates a task that runs on every invocation.
    pub fn always<F>(id: impl Into<String>, action: F) -> Self
    where
        F: Fn(&mut ProvisionContext) -> Result<TaskOutcome> + 'static,
    {
        Self {
            id: id.into(),
            mode: TaskMode::Always,
            action: Box::new(action),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> TaskMode {
        self.mode
    }

    /// Invokes the action.
    pub fn execute(&self, ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
        (self.action)(ctx)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
