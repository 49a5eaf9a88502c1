//! The layered storage stack as a graph of resource nodes.
//!
//! [`ResourceStack::plan`] derives the chain
//! device → partition → (RAID1) → (LUKS mapping) → filesystem → mount
//! from the configuration and the identifiers recorded while building it.
//! Nodes are stored in dependency order, so walking them forward is a valid
//! construction order and walking them backward a valid teardown order.

use camino::{Utf8Path, Utf8PathBuf};
use strum::{AsRefStr, Display};

use crate::config::Config;
use crate::error::ProvisionError;
use crate::ledger::ResourceIds;
use crate::storage::layout::{self, FsRole};
use crate::storage::mount_table::{self, MountEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum ResourceKind {
    Device,
    Partition,
    RaidArray,
    CryptMapping,
    Filesystem,
    Mount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum LifecycleState {
    /// Not present on the live system.
    Absent,
    /// Exists but is not in use (closed mapping, unmounted filesystem).
    Created,
    /// Open or mounted.
    Active,
    /// Closed or unmounted by this run.
    TornDown,
}

/// Where and how a filesystem is mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// Path relative to the target root (empty for the root itself).
    pub relative: Utf8PathBuf,
    pub target: Utf8PathBuf,
    pub options: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNode {
    pub kind: ResourceKind,
    /// Stable name: a device path, mapping name, filesystem role or mount
    /// target.
    pub name: String,
    /// Generated identifier recorded in the state file, if any.
    pub uuid: Option<String>,
    /// Indices of the nodes this one depends on.
    pub parents: Vec<usize>,
    pub state: LifecycleState,
    pub mount: Option<MountPoint>,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceStack {
    nodes: Vec<ResourceNode>,
}

impl ResourceStack {
    fn push(
        &mut self,
        kind: ResourceKind,
        name: impl Into<String>,
        uuid: Option<String>,
        parents: Vec<usize>,
    ) -> usize {
        self.nodes.push(ResourceNode {
            kind,
            name: name.into(),
            uuid,
            parents,
            state: LifecycleState::Created,
            mount: None,
        });
        self.nodes.len() - 1
    }

    fn push_mount(
        &mut self,
        relative: &str,
        target_root: &Utf8Path,
        options: &str,
        parents: Vec<usize>,
    ) {
        let target = if relative.is_empty() {
            target_root.to_owned()
        } else {
            target_root.join(relative)
        };
        let idx = self.push(ResourceKind::Mount, target.as_str(), None, parents);
        self.nodes[idx].mount = Some(MountPoint {
            relative: Utf8PathBuf::from(relative),
            target,
            options: options.to_string(),
        });
    }

    /// Plans the stack for `config`, attaching the identifiers in `ids`.
    ///
    /// Missing identifiers are left empty; see [`require_ids`](Self::require_ids).
    pub fn plan(config: &Config, ids: &ResourceIds) -> Self {
        let mut stack = Self::default();
        let devices = config.devices();
        let fs_uuid = |role: FsRole| ids.fs_uuid.get(role.as_ref()).cloned();

        let device_nodes: Vec<usize> = devices
            .iter()
            .map(|d| stack.push(ResourceKind::Device, d.as_str(), None, vec![]))
            .collect();

        let partitions = |stack: &mut Self, role: FsRole| -> Vec<usize> {
            devices
                .iter()
                .zip(&device_nodes)
                .map(|(d, &parent)| {
                    let path = layout::partition_path(d, role.partition_number());
                    stack.push(ResourceKind::Partition, path.as_str(), None, vec![parent])
                })
                .collect()
        };
        let efi_parts = partitions(&mut stack, FsRole::BootEfi);
        let boot_parts = partitions(&mut stack, FsRole::Boot);
        let root_parts = partitions(&mut stack, FsRole::Root);

        let boot_layer = |stack: &mut Self, role: FsRole, parts: Vec<usize>| -> Vec<usize> {
            if config.is_mirrored() {
                let uuid = ids.raid_uuid.get(role.as_ref()).cloned();
                let md = layout::raid_device(role);
                vec![stack.push(ResourceKind::RaidArray, md.as_str(), uuid, parts)]
            } else {
                parts.into_iter().take(1).collect()
            }
        };
        let efi_block = boot_layer(&mut stack, FsRole::BootEfi, efi_parts);
        let boot_block = boot_layer(&mut stack, FsRole::Boot, boot_parts);

        let root_block: Vec<usize> = if config.init.cryptsetup {
            root_parts
                .into_iter()
                .enumerate()
                .map(|(i, part)| {
                    let uuid = ids.luks_uuid.get(i).cloned();
                    let name = layout::mapping_name(i);
                    stack.push(ResourceKind::CryptMapping, name, uuid, vec![part])
                })
                .collect()
        } else {
            root_parts
        };

        let filesystem = |stack: &mut Self, role: FsRole, parents: Vec<usize>| {
            stack.push(ResourceKind::Filesystem, role.as_ref(), fs_uuid(role), parents)
        };
        let root_fs = filesystem(&mut stack, FsRole::Root, root_block);
        let boot_fs = filesystem(&mut stack, FsRole::Boot, boot_block);
        let efi_fs = filesystem(&mut stack, FsRole::BootEfi, efi_block);

        let root = config.init.target_root.clone();
        stack.push_mount("", &root, "noatime,subvol=root", vec![root_fs]);
        let root_mount = stack.nodes.len() - 1;
        stack.push_mount("home", &root, "noatime,subvol=home", vec![root_fs, root_mount]);
        stack.push_mount("boot", &root, "noatime", vec![boot_fs, root_mount]);
        let boot_mount = stack.nodes.len() - 1;
        stack.push_mount("boot/efi", &root, "noatime", vec![efi_fs, boot_mount]);
        stack
    }

    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &ResourceNode {
        &self.nodes[idx]
    }

    pub fn set_state(&mut self, idx: usize, state: LifecycleState) {
        self.nodes[idx].state = state;
    }

    /// Indices of nodes of `kind`, in construction order.
    pub fn indices(&self, kind: ResourceKind) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].kind == kind)
            .collect()
    }

    /// Fails with `StateInconsistency` if a generated identifier is missing.
    pub fn require_ids(&self) -> Result<(), ProvisionError> {
        for node in &self.nodes {
            let generated = matches!(
                node.kind,
                ResourceKind::RaidArray | ResourceKind::CryptMapping | ResourceKind::Filesystem
            );
            if generated && node.uuid.is_none() {
                return Err(ProvisionError::StateInconsistency(format!(
                    "no recorded uuid for {} {}; has the build stage created the storage?",
                    node.kind, node.name
                )));
            }
        }
        Ok(())
    }

    /// Returns the `UUID=` source of a mount node.
    pub fn mount_source(&self, idx: usize) -> Result<String, ProvisionError> {
        let node = &self.nodes[idx];
        node.parents
            .iter()
            .map(|&p| &self.nodes[p])
            .find(|p| p.kind == ResourceKind::Filesystem)
            .and_then(|fs| fs.uuid.as_deref())
            .map(|uuid| format!("UUID={}", uuid))
            .ok_or_else(|| {
                ProvisionError::StateInconsistency(format!(
                    "no recorded filesystem uuid for mount point {}",
                    node.name
                ))
            })
    }

    /// Updates mount and mapping states from the live system.
    pub fn refresh(&mut self, table: &[MountEntry], mapping_exists: impl Fn(&Utf8Path) -> bool) {
        for node in &mut self.nodes {
            let active = match node.kind {
                ResourceKind::Mount => node
                    .mount
                    .as_ref()
                    .is_some_and(|m| mount_table::is_mounted(table, &m.target)),
                ResourceKind::CryptMapping => {
                    mapping_exists(layout::mapping_path(&node.name).as_path())
                }
                _ => continue,
            };
            node.state = if active {
                LifecycleState::Active
            } else {
                LifecycleState::Absent
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn full_ids(luks: usize) -> ResourceIds {
        let mut ids = ResourceIds::default();
        for role in ["boot", "boot-efi", "root"] {
            ids.fs_uuid.insert(role.to_string(), format!("{}-uuid", role));
        }
        for role in ["boot", "boot-efi"] {
            ids.raid_uuid.insert(role.to_string(), format!("{}-raid", role));
        }
        ids.luks_uuid = (0..luks).map(|i| format!("luks-{}", i)).collect();
        ids
    }

    #[test]
    fn single_device_plan() {
        let stack = ResourceStack::plan(&config("init:\n  device: /dev/sdb\n"), &full_ids(1));
        assert!(stack.indices(ResourceKind::RaidArray).is_empty());
        let crypts = stack.indices(ResourceKind::CryptMapping);
        assert_eq!(crypts.len(), 1);
        assert_eq!(stack.node(crypts[0]).name, "new-root-0");
        assert_eq!(stack.node(stack.node(crypts[0]).parents[0]).name, "/dev/sdb4");

        let targets: Vec<_> = stack
            .indices(ResourceKind::Mount)
            .into_iter()
            .map(|i| stack.node(i).name.clone())
            .collect();
        assert_eq!(
            targets,
            ["/mnt/new-root", "/mnt/new-root/home", "/mnt/new-root/boot", "/mnt/new-root/boot/efi"]
        );
        stack.require_ids().unwrap();
    }

    #[test]
    fn mirrored_plan_has_one_array_per_boot_layer() {
        let stack = ResourceStack::plan(
            &config("init:\n  device: /dev/sdb\n  mirror: /dev/sdc\n"),
            &full_ids(2),
        );
        let arrays = stack.indices(ResourceKind::RaidArray);
        assert_eq!(arrays.len(), 2);
        assert_eq!(stack.node(arrays[0]).name, "/dev/md/new-boot-efi");
        assert_eq!(stack.node(arrays[0]).parents.len(), 2);
        assert_eq!(stack.node(arrays[1]).uuid.as_deref(), Some("boot-raid"));
        assert_eq!(stack.indices(ResourceKind::CryptMapping).len(), 2);
    }

    #[test]
    fn nodes_follow_dependency_order() {
        let stack = ResourceStack::plan(
            &config("init:\n  device: /dev/sdb\n  mirror: /dev/sdc\n"),
            &full_ids(2),
        );
        for (i, node) in stack.nodes().iter().enumerate() {
            assert!(node.parents.iter().all(|&p| p < i), "{} depends on a later node", node.name);
        }
    }

    #[test]
    fn plain_root_without_cryptsetup() {
        let stack = ResourceStack::plan(
            &config("init:\n  device: /dev/sdb\n  cryptsetup: false\n"),
            &full_ids(0),
        );
        assert!(stack.indices(ResourceKind::CryptMapping).is_empty());
        stack.require_ids().unwrap();
    }

    #[test]
    fn missing_ids_are_a_state_inconsistency() {
        let config = config("init:\n  device: /dev/sdb\n");
        let stack = ResourceStack::plan(&config, &ResourceIds::default());
        let err = stack.require_ids().unwrap_err();
        assert!(matches!(err, ProvisionError::StateInconsistency(_)));
        let root_mount = stack.indices(ResourceKind::Mount)[0];
        assert!(stack.mount_source(root_mount).is_err());
    }

    #[test]
    fn mount_sources_use_filesystem_uuids() {
        let stack = ResourceStack::plan(&config("init:\n  device: /dev/sdb\n"), &full_ids(1));
        let mounts = stack.indices(ResourceKind::Mount);
        assert_eq!(stack.mount_source(mounts[0]).unwrap(), "UUID=root-uuid");
        assert_eq!(stack.mount_source(mounts[1]).unwrap(), "UUID=root-uuid");
        assert_eq!(stack.mount_source(mounts[2]).unwrap(), "UUID=boot-uuid");
        assert_eq!(stack.mount_source(mounts[3]).unwrap(), "UUID=boot-efi-uuid");
    }

    #[test]
    fn refresh_marks_live_state() {
        let mut stack = ResourceStack::plan(&config("init:\n  device: /dev/sdb\n"), &full_ids(1));
        let table =
            mount_table::parse_mount_table("/dev/mapper/new-root-0 /mnt/new-root btrfs rw 0 0\n");
        stack.refresh(&table, |p| p == "/dev/mapper/new-root-0");
        let mounts = stack.indices(ResourceKind::Mount);
        assert_eq!(stack.node(mounts[0]).state, LifecycleState::Active);
        assert_eq!(stack.node(mounts[1]).state, LifecycleState::Absent);
        let crypt = stack.indices(ResourceKind::CryptMapping)[0];
        assert_eq!(stack.node(crypt).state, LifecycleState::Active);
    }
}
