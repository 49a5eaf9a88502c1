//! Git mirror of `/etc`.
//!
//! The `finish` stage records every change it makes under `/etc` in a
//! separate git directory whose work tree is `/etc`. Files are committed
//! once before an edit (the vanilla state) and once after it.

use anyhow::Result;
use camino::Utf8Path;
use tracing::{debug, warn};

use crate::context::ProvisionContext;
use crate::executor::CommandSpec;
use crate::stage::files;

const WORK_TREE: &str = "/etc";

/// Converts `/etc/x` or `x` into a path relative to the work tree.
fn relative(file: &str) -> &str {
    file.strip_prefix("/etc/").unwrap_or(file)
}

fn git(ctx: &ProvisionContext, args: &[&str]) -> CommandSpec {
    let git_dir = ctx.host_path(ctx.config.target.etc_mirror.as_str());
    let work_tree = ctx.host_path(WORK_TREE);
    CommandSpec::new(
        "git",
        [
            format!("--git-dir={}", git_dir),
            format!("--work-tree={}", work_tree),
        ],
    )
    .with_args(args.iter().copied())
    .with_cwd(work_tree)
}

/// Initializes the mirror, reusing an existing repository.
pub(crate) fn init(ctx: &ProvisionContext) -> Result<()> {
    let mirror = ctx.config.target.etc_mirror.clone();
    let host_mirror = ctx.host_path(mirror.as_str());
    files::create_dir(ctx, &host_mirror)?;
    if host_mirror.join("HEAD").exists() {
        warn!("reusing already initialized git repo: {}", mirror);
    } else {
        ctx.must(&git(ctx, &["init"]))?;
    }
    let git_mail = ctx.config.target.git_mail.clone().unwrap_or_default();
    let git_name = ctx.config.target.git_name.clone().unwrap_or_default();
    ctx.must(&git(ctx, &["config", "user.email", &git_mail]))?;
    ctx.must(&git(ctx, &["config", "user.name", &git_name]))?;
    Ok(())
}

/// Adds `file_list` and commits them with `message`.
///
/// An empty list is a no-op. Committing without changes is not an error.
pub(crate) fn commit<S: AsRef<str>>(
    ctx: &ProvisionContext,
    file_list: &[S],
    message: &str,
) -> Result<()> {
    if file_list.is_empty() {
        debug!("nothing to commit for: {}", message);
        return Ok(());
    }
    let mut add = vec!["add", "--"];
    add.extend(file_list.iter().map(|f| relative(f.as_ref())));
    ctx.must(&git(ctx, &add))?;
    let result = ctx.run(&git(ctx, &["commit", "-m", message]))?;
    if !result.success() {
        debug!("git commit reported no changes for: {}", message);
    }
    Ok(())
}

/// Keeps the entries of `candidates` that exist below `/etc`.
pub(crate) fn existing(ctx: &ProvisionContext, candidates: &[&str]) -> Vec<String> {
    candidates
        .iter()
        .map(|c| relative(c))
        .filter(|c| ctx.host_path(WORK_TREE).join(Utf8Path::new(c)).exists())
        .map(str::to_string)
        .collect()
}
