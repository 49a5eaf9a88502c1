//! Completion ledger and persisted provisioning state.
//!
//! The ledger is a single JSON document keyed by stage name. Each stage
//! keeps the set of completed task identifiers (`done_set`) and the
//! identifiers generated while building storage (`resources`), which a later
//! invocation needs to find the filesystems again after a reboot.
//!
//! Every mutation is written through to disk before the call returns. The
//! write goes to a temporary file in the same directory, is synced, and is
//! then renamed over the state file before the directory itself is synced,
//! so a crash leaves either the old or the new document behind, never a
//! truncated one. Keys this version does not know are carried through.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProvisionError;

/// Identifiers generated while building the storage stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceIds {
    /// Filesystem UUIDs keyed by role (`boot`, `boot-efi`, `root`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fs_uuid: BTreeMap<String, String>,
    /// RAID1 array UUIDs keyed by role (`boot`, `boot-efi`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub raid_uuid: BTreeMap<String, String>,
    /// LUKS volume UUIDs, one per root partition, in device order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub luks_uuid: Vec<String>,
}

impl ResourceIds {
    const EMPTY: ResourceIds = ResourceIds {
        fs_uuid: BTreeMap::new(),
        raid_uuid: BTreeMap::new(),
        luks_uuid: Vec::new(),
    };

    pub fn is_empty(&self) -> bool {
        self.fs_uuid.is_empty() && self.raid_uuid.is_empty() && self.luks_uuid.is_empty()
    }
}

/// Persisted record of one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    #[serde(default)]
    pub done_set: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "ResourceIds::is_empty")]
    pub resources: ResourceIds,
    /// Keys written by other versions, kept so a rewrite does not drop them.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The completion ledger, bound to its state file.
#[derive(Debug)]
pub struct Ledger {
    path: Utf8PathBuf,
    stages: BTreeMap<String, StageRecord>,
    persistent: bool,
}

static EMPTY_RESOURCES: ResourceIds = ResourceIds::EMPTY;

impl Ledger {
    /// Loads the ledger from `path`.
    ///
    /// A missing file yields an empty ledger: the first run has no history.
    pub fn load(path: &Utf8Path) -> Result<Self, ProvisionError> {
        let stages = match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                ProvisionError::StateInconsistency(format!(
                    "state file {} is not a valid ledger: {}",
                    path, e
                ))
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no state file at {}, starting with an empty ledger", path);
                BTreeMap::new()
            }
            Err(e) => {
                return Err(ProvisionError::io(format!("failed to read state file: {}", path), e));
            }
        };
        Ok(Self {
            path: path.to_owned(),
            stages,
            persistent: true,
        })
    }

    /// Creates an empty ledger that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            path: Utf8PathBuf::new(),
            stages: BTreeMap::new(),
            persistent: false,
        }
    }

    /// Keeps updates in memory only (dry-run mode).
    #[must_use]
    pub fn without_persistence(mut self) -> Self {
        self.persistent = false;
        self
    }

    /// Removes the state file. Returns true if a file was removed.
    pub fn clean(path: &Utf8Path) -> Result<bool, ProvisionError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ProvisionError::io(format!("failed to remove state file: {}", path), e)),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Returns the completed task identifiers of `stage`.
    pub fn done_set(&self, stage: &str) -> BTreeSet<String> {
        self.stages
            .get(stage)
            .map(|r| r.done_set.clone())
            .unwrap_or_default()
    }

    pub fn is_done(&self, stage: &str, task_id: &str) -> bool {
        self.stages
            .get(stage)
            .is_some_and(|r| r.done_set.contains(task_id))
    }

    /// Records `task_id` as completed and persists before returning.
    pub fn mark_done(&mut self, stage: &str, task_id: &str) -> Result<(), ProvisionError> {
        self.stages
            .entry(stage.to_string())
            .or_default()
            .done_set
            .insert(task_id.to_string());
        self.persist()
    }

    /// Returns the generated resource identifiers recorded for `stage`.
    pub fn resources(&self, stage: &str) -> &ResourceIds {
        self.stages
            .get(stage)
            .map(|r| &r.resources)
            .unwrap_or(&EMPTY_RESOURCES)
    }

    /// Applies `update` to the resource identifiers of `stage` and persists
    /// before returning.
    pub fn update_resources<F>(&mut self, stage: &str, update: F) -> Result<(), ProvisionError>
    where
        F: FnOnce(&mut ResourceIds),
    {
        update(&mut self.stages.entry(stage.to_string()).or_default().resources);
        self.persist()
    }

    /// Writes the whole document to the state file atomically.
    pub fn persist(&self) -> Result<(), ProvisionError> {
        if !self.persistent {
            return Ok(());
        }
        debug!("storing state as {}", self.path);

        let bytes = serde_json::to_vec_pretty(&self.stages).map_err(|e| {
            ProvisionError::io(
                format!("failed to serialize state for {}", self.path),
                io::Error::other(e),
            )
        })?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        };
        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
            ProvisionError::io(format!("failed to create temporary state file in {}", dir), e)
        })?;
        temp.write_all(&bytes)
            .and_then(|()| temp.write_all(b"\n"))
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|e| {
                ProvisionError::io(format!("failed to write temporary state file in {}", dir), e)
            })?;
        temp.persist(&self.path).map_err(|e| {
            ProvisionError::io(format!("failed to replace state file: {}", self.path), e.error)
        })?;
        // the rename is only durable once the directory entry is synced
        fs::File::open(dir).and_then(|d| d.sync_all()).map_err(|e| {
            ProvisionError::io(format!("failed to sync state directory {}", dir), e)
        })?;
        Ok(())
    }
}
