//! One-time creation of the storage stack.
//!
//! Each function is the action of one `build` task. Generated identifiers
//! are recorded in the ledger right after the command that applies them,
//! so an interrupted run never loses track of what exists on disk.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use tracing::{debug, info};
use uuid::Uuid;

use crate::context::ProvisionContext;
use crate::executor::{CommandSpec, Stdin};
use crate::storage::create_mount_point;
use crate::storage::layout::{self, FsRole};
use crate::storage::mount_table;
use crate::task::TaskOutcome;

const SUBVOLUMES: [&str; 2] = ["root", "home"];

fn partitions(ctx: &ProvisionContext, role: FsRole) -> Vec<Utf8PathBuf> {
    ctx.config
        .devices()
        .iter()
        .map(|d| layout::partition_path(d, role.partition_number()))
        .collect()
}

/// Block device carrying the filesystem of a boot role.
fn boot_block_device(ctx: &ProvisionContext, role: FsRole) -> Result<Utf8PathBuf> {
    if ctx.config.is_mirrored() {
        return Ok(layout::raid_device(role));
    }
    partitions(ctx, role)
        .into_iter()
        .next()
        .context("init.device is not configured")
}

/// Writes a fresh GPT to every device, deleting an existing table first.
pub fn create_partitions(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let script = layout::sfdisk_script(ctx.config.is_mirrored());
    for device in ctx.config.devices() {
        let listing = ctx.must(&CommandSpec::new("sfdisk", ["--list", device.as_str()]))?;
        if layout::has_partitions(&listing.stdout, &device) {
            info!("deleting existing partitions of {}", device);
            ctx.must(&CommandSpec::new("sfdisk", ["--delete", device.as_str()]))?;
        }
        let write =
            CommandSpec::new("sfdisk", [device.as_str()]).with_stdin(Stdin::plain(&script));
        ctx.must(&write)?;
    }
    Ok(TaskOutcome::Done)
}

/// Creates the RAID1 arrays for the EFI and boot partitions.
pub fn assemble_raid(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    if !ctx.config.is_mirrored() {
        return Ok(TaskOutcome::skipped("no mirror device configured"));
    }
    for role in [FsRole::BootEfi, FsRole::Boot] {
        let md = layout::raid_device(role);
        if !ctx.dry_run() && ctx.probe().path_exists(&md) {
            info!("stopping leftover array {}", md);
            ctx.must(&CommandSpec::new("mdadm", ["--stop", md.as_str()]))?;
        }
        let members = partitions(ctx, role);
        let wipe =
            CommandSpec::new("wipefs", ["--all"]).with_args(members.iter().map(|p| p.as_str()));
        ctx.must(&wipe)?;

        let uuid = Uuid::new_v4().to_string();
        let mut args = vec![
            "--create".to_string(),
            md.to_string(),
            "--run".to_string(),
            "--level=1".to_string(),
            "--uuid".to_string(),
            uuid.clone(),
            "--raid-devices=2".to_string(),
        ];
        // Trailing superblock: firmware must see the ESP members as plain FAT.
        if role == FsRole::BootEfi {
            args.push("--metadata=1.0".to_string());
        }
        args.extend(members.iter().map(|p| p.to_string()));
        ctx.must(&CommandSpec::new("mdadm", args))?;
        ctx.record_storage_ids(|ids| {
            ids.raid_uuid.insert(role.to_string(), uuid);
        })?;
    }
    Ok(TaskOutcome::Done)
}

/// Formats `/boot` as ext4 and the ESP as FAT.
pub fn format_boot(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let boot = boot_block_device(ctx, FsRole::Boot)?;
    let uuid = Uuid::new_v4().to_string();
    ctx.must(&CommandSpec::new("mkfs.ext4", ["-U", uuid.as_str(), boot.as_str()]))?;
    ctx.record_storage_ids(|ids| {
        ids.fs_uuid.insert(FsRole::Boot.to_string(), uuid);
    })?;

    let efi = boot_block_device(ctx, FsRole::BootEfi)?;
    let (volume_id, shown_as) = layout::vfat_volume_id(&Uuid::new_v4());
    ctx.must(&CommandSpec::new("mkfs.vfat", ["-i", volume_id.as_str(), efi.as_str()]))?;
    ctx.record_storage_ids(|ids| {
        ids.fs_uuid.insert(FsRole::BootEfi.to_string(), shown_as);
    })?;
    Ok(TaskOutcome::Done)
}

/// Closes every root mapping that is currently open.
fn close_mappings(ctx: &ProvisionContext) -> Result<()> {
    for i in 0..ctx.config.devices().len() {
        let name = layout::mapping_name(i);
        if ctx.dry_run() || ctx.probe().path_exists(&layout::mapping_path(&name)) {
            ctx.must(&CommandSpec::new("cryptsetup", ["luksClose", name.as_str()]))?;
        }
    }
    Ok(())
}

/// Opens the root partitions as mappings and returns the block devices
/// carrying the root filesystem.
fn open_root_devices(ctx: &mut ProvisionContext) -> Result<Vec<Utf8PathBuf>> {
    let parts = partitions(ctx, FsRole::Root);
    if !ctx.config.init.cryptsetup {
        return Ok(parts);
    }
    let secret = ctx.secret()?;
    let mut devices = Vec::with_capacity(parts.len());
    for (i, part) in parts.iter().enumerate() {
        let name = layout::mapping_name(i);
        let mapped = layout::mapping_path(&name);
        if !ctx.dry_run() && ctx.probe().path_exists(&mapped) {
            debug!("{} is already open", name);
        } else {
            let spec = CommandSpec::new(
                "cryptsetup",
                ["luksOpen", part.as_str(), name.as_str(), "--key-file", "-"],
            )
            .with_stdin(Stdin::sensitive(secret.expose()));
            ctx.must(&spec)?;
        }
        devices.push(mapped);
    }
    Ok(devices)
}

/// Sets up LUKS on every root partition (when enabled) and creates the
/// btrfs filesystem spanning them.
pub fn format_root(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let parts = partitions(ctx, FsRole::Root);
    let mut root_devices = parts.clone();

    if ctx.config.init.cryptsetup {
        close_mappings(ctx)?;
        let secret = ctx.secret()?;
        ctx.record_storage_ids(|ids| ids.luks_uuid.clear())?;
        root_devices.clear();
        for (i, part) in parts.iter().enumerate() {
            let uuid = Uuid::new_v4().to_string();
            let format = CommandSpec::new(
                "cryptsetup",
                [
                    "luksFormat",
                    part.as_str(),
                    "--key-file",
                    "-",
                    "--uuid",
                    uuid.as_str(),
                    "--batch-mode",
                ],
            )
            .with_stdin(Stdin::sensitive(secret.expose()));
            ctx.must(&format)?;
            ctx.record_storage_ids(|ids| ids.luks_uuid.push(uuid))?;

            let name = layout::mapping_name(i);
            let open = CommandSpec::new(
                "cryptsetup",
                ["luksOpen", part.as_str(), name.as_str(), "--key-file", "-"],
            )
            .with_stdin(Stdin::sensitive(secret.expose()));
            ctx.must(&open)?;
            root_devices.push(layout::mapping_path(&name));
        }
    }

    let device_args = root_devices.iter().map(|d| d.as_str());
    ctx.must(&CommandSpec::new("wipefs", ["--all"]).with_args(device_args.clone()))?;
    let uuid = Uuid::new_v4().to_string();
    let mut mkfs = CommandSpec::new("mkfs.btrfs", ["--uuid", uuid.as_str()]);
    if ctx.config.is_mirrored() {
        mkfs = mkfs.with_args(["--data", "raid1"]);
    }
    ctx.must(&mkfs.with_args(device_args))?;
    ctx.record_storage_ids(|ids| {
        ids.fs_uuid.insert(FsRole::Root.to_string(), uuid);
    })?;

    if ctx.config.init.cryptsetup {
        close_mappings(ctx)?;
    }
    Ok(TaskOutcome::Done)
}

/// Creates the `root` and `home` sub-volumes on the top level of the root
/// filesystem.
pub fn create_subvolumes(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let root_devices = open_root_devices(ctx)?;
    let Some(first) = root_devices.first() else {
        anyhow::bail!("no root device configured");
    };
    let target_root = ctx.target_root().to_owned();
    let mounted = !ctx.dry_run()
        && mount_table::is_mounted(&ctx.probe().mount_table()?, &target_root);
    if mounted {
        info!("{} is already mounted", target_root);
    } else {
        if !ctx.dry_run() {
            create_mount_point(&target_root, &target_root)?;
        }
        ctx.must(&CommandSpec::new(
            "mount",
            ["-o", "noatime", first.as_str(), target_root.as_str()],
        ))?;
    }

    for name in SUBVOLUMES {
        let path = target_root.join(name);
        if !ctx.dry_run() && ctx.probe().path_exists(&path) {
            info!("sub-volume {} already exists", path);
            continue;
        }
        ctx.must(&CommandSpec::new("btrfs", ["subvolume", "create", path.as_str()]))?;
    }

    ctx.must(&CommandSpec::new("umount", [target_root.as_str()]))?;
    if ctx.config.init.cryptsetup {
        close_mappings(ctx)?;
    }
    Ok(TaskOutcome::Done)
}
