//! Bringing the built storage stack up and down.
//!
//! [`mount_storage`] walks the planned [`ResourceStack`] forward: arrays,
//! mappings, then mount points from the root outwards. [`unmount_storage`]
//! walks it backward, after releasing anything else mounted below the
//! target root. Both consult the live system first, so already mounted
//! targets and already open mappings are left alone, and calling either
//! twice is harmless.

use anyhow::Result;
use camino::Utf8PathBuf;
use tracing::{debug, info};

use crate::context::ProvisionContext;
use crate::error::ProvisionError;
use crate::executor::{CommandSpec, Stdin};
use crate::storage::layout;
use crate::storage::mount_table::{self, MountEntry};
use crate::storage::resource::{LifecycleState, ResourceKind, ResourceStack};
use crate::storage::{Teardown, TeardownReport, create_mount_point};

/// Plans the stack and marks what is already in effect.
///
/// In dry-run mode the live system is not consulted and every node is
/// treated as inactive.
fn observed_stack(ctx: &ProvisionContext) -> Result<(ResourceStack, Vec<MountEntry>)> {
    let mut stack = ResourceStack::plan(&ctx.config, ctx.storage_ids());
    if ctx.dry_run() {
        return Ok((stack, Vec::new()));
    }
    let table = ctx.probe().mount_table()?;
    stack.refresh(&table, |path| ctx.probe().path_exists(path));
    Ok((stack, table))
}

/// Assembles, opens and mounts the storage stack below the target root.
pub fn mount_storage(ctx: &mut ProvisionContext) -> Result<ResourceStack> {
    let (mut stack, _) = observed_stack(ctx)?;
    stack.require_ids()?;

    if ctx.config.is_mirrored() {
        let result = ctx.run(&CommandSpec::new("mdadm", ["--assemble", "--scan"]))?;
        if !result.success() {
            debug!("mdadm --assemble --scan: {}", result.stderr.trim());
        }
    }

    let closed: Vec<usize> = stack
        .indices(ResourceKind::CryptMapping)
        .into_iter()
        .filter(|&i| stack.node(i).state != LifecycleState::Active)
        .collect();
    if !closed.is_empty() {
        let secret = ctx.secret()?;
        for idx in closed {
            let node = stack.node(idx);
            let uuid = node.uuid.as_deref().unwrap_or_default();
            let by_uuid = layout::by_uuid_path(uuid);
            if !ctx.dry_run() && !ctx.probe().path_exists(&by_uuid) {
                return Err(ProvisionError::StateInconsistency(format!(
                    "recorded LUKS volume {} of {} not found at {}",
                    uuid, node.name, by_uuid
                ))
                .into());
            }
            info!("opening {}", node.name);
            let spec = CommandSpec::new(
                "cryptsetup",
                ["luksOpen", by_uuid.as_str(), node.name.as_str(), "--key-file", "-"],
            )
            .with_stdin(Stdin::sensitive(secret.expose()));
            ctx.must(&spec)?;
            stack.set_state(idx, LifecycleState::Active);
        }
    }

    let root = ctx.target_root().to_owned();
    for idx in stack.indices(ResourceKind::Mount) {
        let node = stack.node(idx);
        let Some(mount) = node.mount.clone() else {
            continue;
        };
        if node.state == LifecycleState::Active {
            info!("{} is already mounted", mount.target);
            continue;
        }
        let source = stack.mount_source(idx)?;
        if !ctx.dry_run() {
            create_mount_point(&root, &mount.target)?;
        }
        info!("mounting {} on {}", source, mount.target);
        ctx.must(&CommandSpec::new(
            "mount",
            ["-o", mount.options.as_str(), source.as_str(), mount.target.as_str()],
        ))?;
        stack.set_state(idx, LifecycleState::Active);
    }
    Ok(stack)
}

/// Unmounts the stack in reverse order and closes the root mappings.
///
/// Mounts below the target root that are not part of the stack (bind mounts,
/// scratch mounts of an interrupted task) are released first, deepest path
/// first. Works without recorded identifiers, so a half-built stack can
/// still be released.
pub fn unmount_storage(ctx: &mut ProvisionContext, mode: Teardown) -> Result<TeardownReport> {
    let (mut stack, table) = observed_stack(ctx)?;
    let mut report = TeardownReport::default();

    let planned: Vec<Utf8PathBuf> = stack
        .indices(ResourceKind::Mount)
        .into_iter()
        .filter_map(|i| stack.node(i).mount.as_ref().map(|m| m.target.clone()))
        .collect();
    for stray in mount_table::stray_mounts(&table, ctx.target_root(), &planned) {
        info!("releasing {}, which is not part of the storage stack", stray);
        let result = ctx.must(&CommandSpec::new("umount", [stray.as_str()])).map(|_| ());
        report.record(mode, stray.as_str(), result)?;
    }

    let mut teardown_order = stack.indices(ResourceKind::Mount);
    teardown_order.reverse();
    let mut mappings = stack.indices(ResourceKind::CryptMapping);
    mappings.reverse();
    teardown_order.extend(mappings);

    for idx in teardown_order {
        let node = stack.node(idx);
        if node.state == LifecycleState::Absent {
            debug!("{} is not active", node.name);
            report.absent.push(node.name.clone());
            continue;
        }
        let spec = match node.kind {
            ResourceKind::Mount => CommandSpec::new("umount", [node.name.as_str()]),
            _ => CommandSpec::new("cryptsetup", ["luksClose", node.name.as_str()]),
        };
        info!("releasing {}", node.name);
        let name = node.name.clone();
        let result = ctx.must(&spec).map(|_| ());
        let released = result.is_ok();
        report.record(mode, &name, result)?;
        if released {
            stack.set_state(idx, LifecycleState::TornDown);
        }
    }
    Ok(report)
}
