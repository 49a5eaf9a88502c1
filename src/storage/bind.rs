//! Bind mounts of the host's `/dev`, `/proc` and `/sys` into the target.

use anyhow::Result;
use camino::Utf8PathBuf;
use tracing::{debug, info};

use crate::context::ProvisionContext;
use crate::executor::CommandSpec;
use crate::storage::mount_table::{self, MountEntry};
use crate::storage::{Teardown, TeardownReport, create_mount_point};

pub const BIND_POINTS: [&str; 3] = ["dev", "proc", "sys"];

fn live_table(ctx: &ProvisionContext) -> Result<Vec<MountEntry>> {
    if ctx.dry_run() {
        return Ok(Vec::new());
    }
    ctx.probe().mount_table()
}

/// Binds the host pseudo filesystems below the target root.
pub fn bind_mount(ctx: &mut ProvisionContext) -> Result<()> {
    let table = live_table(ctx)?;
    let root = ctx.target_root().to_owned();
    for point in BIND_POINTS {
        let target = ctx.target_path(point);
        if mount_table::is_mounted(&table, &target) {
            info!("{} is already mounted", target);
            continue;
        }
        if !ctx.dry_run() {
            create_mount_point(&root, &target)?;
        }
        let source = format!("/{}", point);
        ctx.must(&CommandSpec::new("mount", ["--bind", source.as_str(), target.as_str()]))?;
    }
    Ok(())
}

/// Releases the bind mounts.
///
/// Everything the target's tools mounted below a bind point (for example
/// `sys/fs/selinux`) is unmounted first, deepest path first. The bind
/// points follow in reverse order.
pub fn bind_umount(ctx: &mut ProvisionContext, mode: Teardown) -> Result<TeardownReport> {
    let table = live_table(ctx)?;
    let bind_targets: Vec<Utf8PathBuf> = BIND_POINTS.iter().map(|p| ctx.target_path(p)).collect();
    let mut report = TeardownReport::default();

    for nested in mount_table::nested_mounts(&table, &bind_targets) {
        info!("unmounting nested {}", nested);
        let result = ctx.must(&CommandSpec::new("umount", [nested.as_str()])).map(|_| ());
        report.record(mode, nested.as_str(), result)?;
    }

    for target in bind_targets.iter().rev() {
        if !ctx.dry_run() && !mount_table::is_mounted(&table, target) {
            debug!("{} is not mounted", target);
            report.absent.push(target.to_string());
            continue;
        }
        let result = ctx.must(&CommandSpec::new("umount", [target.as_str()])).map(|_| ());
        report.record(mode, target.as_str(), result)?;
    }
    Ok(report)
}
