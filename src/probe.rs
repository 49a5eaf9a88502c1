//! Queries against the live system.
//!
//! Storage operations consult the mount table and device nodes to decide
//! whether a step is already in effect. The [`SystemProbe`] trait keeps
//! those queries behind a seam so the lifecycle can be driven against a
//! simulated host.

use std::fs;

use anyhow::Result;
use camino::Utf8Path;

use crate::error::ProvisionError;
use crate::storage::mount_table::{MountEntry, parse_mount_table};

const MOUNT_TABLE: &str = "/proc/self/mounts";

/// Read-only view of the live system.
pub trait SystemProbe: Send + Sync {
    /// Returns the current mount table.
    fn mount_table(&self) -> Result<Vec<MountEntry>>;

    /// Returns true if `path` exists, following symlinks.
    fn path_exists(&self, path: &Utf8Path) -> bool;
}

/// Probe of the host this process runs on.
#[derive(Debug, Default)]
pub struct HostProbe;

impl SystemProbe for HostProbe {
    fn mount_table(&self) -> Result<Vec<MountEntry>> {
        let text = fs::read_to_string(MOUNT_TABLE)
            .map_err(|e| ProvisionError::io(format!("failed to read {}", MOUNT_TABLE), e))?;
        Ok(parse_mount_table(&text))
    }

    fn path_exists(&self, path: &Utf8Path) -> bool {
        path.exists()
    }
}
