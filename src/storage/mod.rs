//! Layered storage lifecycle: partitions, RAID1, LUKS, btrfs and mounts.
//!
//! - [`layout`]: fixed partition layout and device naming
//! - [`resource`]: the stack as dependency-ordered resource nodes
//! - [`build`]: one-time creation steps, each its own task
//! - [`mounts`]: bringing the built stack up and down
//! - [`bind`]: `/dev`, `/proc` and `/sys` inside the target
//! - [`mount_table`]: parsing of the live mount table

pub mod bind;
pub mod build;
pub mod layout;
pub mod mount_table;
pub mod mounts;
pub mod resource;

use std::fs;

use anyhow::Result;
use camino::Utf8Path;
use tracing::error;

use crate::error::ProvisionError;

/// How teardown reacts to a failing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Abort on the first failure.
    Strict,
    /// Log each failure and keep going.
    BestEffort,
}

/// Outcome of a teardown run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// Targets and mappings released by this run.
    pub released: Vec<String>,
    /// Targets and mappings that were not present.
    pub absent: Vec<String>,
    /// One message per failed step.
    pub failures: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Converts collected failures into a `Teardown` error.
    pub fn into_result(self) -> Result<Self, ProvisionError> {
        if self.is_clean() {
            Ok(self)
        } else {
            Err(ProvisionError::Teardown(format!(
                "failed to release {} resource(s): {}",
                self.failures.len(),
                self.failures.join("; ")
            )))
        }
    }

    pub(crate) fn merge(&mut self, other: TeardownReport) {
        self.released.extend(other.released);
        self.absent.extend(other.absent);
        self.failures.extend(other.failures);
    }

    /// Records the result of one step according to `mode`.
    pub(crate) fn record(&mut self, mode: Teardown, name: &str, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                self.released.push(name.to_string());
                Ok(())
            }
            Err(e) if mode == Teardown::BestEffort => {
                error!("failed to release {}: {:#}", name, e);
                self.failures.push(format!("{}: {:#}", name, e));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Fails if any existing component of `target` below `root` is a symlink.
///
/// A symlink inside the target tree could redirect a mount point onto the
/// host filesystem.
pub(crate) fn validate_no_symlinks(root: &Utf8Path, target: &Utf8Path) -> Result<()> {
    let relative = target.strip_prefix(root).unwrap_or(target);
    let mut current = root.to_path_buf();

    for component in relative.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                return Err(ProvisionError::StateInconsistency(format!(
                    "symlink detected at {} in mount target path {}",
                    current, target,
                ))
                .into());
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => {
                return Err(ProvisionError::io(
                    format!("failed to check mount target path component: {}", current),
                    e,
                )
                .into());
            }
        }
    }

    Ok(())
}

/// Creates the mount point `target` below `root` after checking for symlinks.
pub(crate) fn create_mount_point(root: &Utf8Path, target: &Utf8Path) -> Result<()> {
    validate_no_symlinks(root, target)?;
    fs::create_dir_all(target)
        .map_err(|e| ProvisionError::io(format!("failed to create mount point: {}", target), e))?;
    Ok(())
}
