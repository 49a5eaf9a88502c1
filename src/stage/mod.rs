//! Stages: ordered task lists sharing one ledger namespace.
//!
//! - [`build`]: runs from rescue media against raw storage
//! - [`finish`]: runs inside the freshly booted target
//!
//! A stage has no dependency graph; the list order is the dependency
//! declaration. For each task in order:
//!
//! 1. a `Once` task already in the ledger is skipped without invoking it,
//! 2. otherwise the action runs,
//! 3. `Done` is recorded (for `Once` tasks) and persisted before the next
//!    task starts, `Skipped` is logged and persisted but not recorded, and an
//!    error aborts the stage with all earlier progress kept.

pub mod build;
pub(crate) mod etc_mirror;
pub(crate) mod files;
pub mod finish;

use std::collections::HashSet;

use anyhow::{Context, Result};
use clap::ValueEnum;
use strum::{AsRefStr, Display};
use tracing::info;

use crate::context::ProvisionContext;
use crate::error::ProvisionError;
use crate::task::{Task, TaskMode, TaskOutcome};

/// The two canonical stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, ValueEnum)]
#[strum(serialize_all = "lowercase")]
pub enum StageKind {
    /// Partition, encrypt and install the base system from rescue media
    #[value(alias = "0")]
    Build,
    /// Configure the installed system after its first boot
    #[value(alias = "1")]
    Finish,
}

impl StageKind {
    /// Returns the task list of this stage.
    pub fn stage(self) -> Result<Stage, ProvisionError> {
        match self {
            Self::Build => Stage::new(self.as_ref(), build::tasks()),
            Self::Finish => Stage::new(self.as_ref(), finish::tasks()),
        }
    }
}

/// What happened to each task during [`Stage::run`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StageReport {
    /// Tasks whose action ran to `Done`.
    pub executed: Vec<String>,
    /// Tasks whose action returned `Skipped`.
    pub skipped: Vec<String>,
    /// Tasks not invoked because the ledger already lists them.
    pub already_done: Vec<String>,
}

#[derive(Debug)]
pub struct Stage {
    name: String,
    tasks: Vec<Task>,
}

impl Stage {
    /// Creates a stage. Task identifiers must be unique.
    pub fn new(name: impl Into<String>, tasks: Vec<Task>) -> Result<Self, ProvisionError> {
        let name = name.into();
        let mut seen = HashSet::new();
        for task in &tasks {
            if !seen.insert(task.id()) {
                return Err(ProvisionError::Config(format!(
                    "duplicate task id '{}' in stage '{}'",
                    task.id(),
                    name
                )));
            }
        }
        Ok(Self { name, tasks })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(Task::id)
    }

    /// Runs the tasks in order, recording progress in `ctx.ledger`.
    pub fn run(&self, ctx: &mut ProvisionContext) -> Result<StageReport> {
        info!("running stage {} ({} tasks)", self.name, self.tasks.len());
        let mut report = StageReport::default();

        for task in &self.tasks {
            let id = task.id();
            if task.mode() == TaskMode::Once && ctx.ledger.is_done(&self.name, id) {
                info!("skipping {}: already done", id);
                report.already_done.push(id.to_string());
                continue;
            }

            info!("running {}", id);
            let outcome = task
                .execute(ctx)
                .with_context(|| format!("task '{}' failed", id))?;

            match outcome {
                TaskOutcome::Done => {
                    if task.mode() == TaskMode::Once {
                        ctx.ledger.mark_done(&self.name, id)?;
                    }
                    report.executed.push(id.to_string());
                }
                TaskOutcome::Skipped(reason) => {
                    info!("skipping {} because of configuration: {}", id, reason);
                    ctx.ledger.persist()?;
                    report.skipped.push(id.to_string());
                }
            }
        }

        info!(
            "stage {} completed: {} executed, {} skipped, {} already done",
            self.name,
            report.executed.len(),
            report.skipped.len(),
            report.already_done.len()
        );
        Ok(report)
    }
}
