//! File edits performed by stage tasks.
//!
//! All writes are atomic: content goes to a temporary file next to the
//! destination, which is then renamed over it. Existing permission bits are
//! kept. In dry-run mode nothing is written.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;

use anyhow::{Context, Result};
use camino::Utf8Path;
use rustix::fs::{self as rfs, CWD, Mode, OFlags};
use tracing::info;

use crate::context::ProvisionContext;
use crate::error::ProvisionError;

/// Verifies that `dir` is a real directory and not a symlink.
///
/// Opens the directory with `O_NOFOLLOW`, so a symlinked `/etc` inside the
/// target cannot redirect writes to the host.
pub(crate) fn ensure_real_dir(dir: &Utf8Path) -> Result<(), ProvisionError> {
    let _fd = rfs::openat(
        CWD,
        dir.as_str(),
        OFlags::NOFOLLOW | OFlags::DIRECTORY | OFlags::RDONLY | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| match e {
        rustix::io::Errno::LOOP | rustix::io::Errno::NOTDIR => ProvisionError::StateInconsistency(
            format!("{} is a symlink or not a directory, refusing to write into it", dir),
        ),
        _ => ProvisionError::io(format!("failed to open {}", dir), std::io::Error::from(e)),
    })?;
    Ok(())
}

fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path))?;
    let mode = fs::metadata(path).ok().map(|m| m.permissions().mode() & 0o7777);

    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| ProvisionError::io(format!("failed to create temporary file in {}", dir), e))?;
    temp.write_all(content)
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|e| ProvisionError::io(format!("failed to write temporary file in {}", dir), e))?;
    let perms = fs::Permissions::from_mode(mode.unwrap_or(0o644));
    temp.as_file()
        .set_permissions(perms)
        .map_err(|e| ProvisionError::io(format!("failed to set permissions for {}", path), e))?;
    temp.persist(path)
        .map_err(|e| ProvisionError::io(format!("failed to replace {}", path), e.error))?;
    Ok(())
}

/// Writes `content` to `path`.
pub(crate) fn write_file(ctx: &ProvisionContext, path: &Utf8Path, content: &str) -> Result<()> {
    if ctx.dry_run() {
        info!("would write {}", path);
        return Ok(());
    }
    write_atomic(path, content.as_bytes())
}

/// Rewrites `path` line by line.
///
/// `edit` receives each line without its terminator and returns the
/// replacement text, which may span several lines.
pub(crate) fn line_edit<F>(ctx: &ProvisionContext, path: &Utf8Path, mut edit: F) -> Result<()>
where
    F: FnMut(&str) -> String,
{
    if ctx.dry_run() {
        info!("would edit {}", path);
        return Ok(());
    }
    let content = fs::read_to_string(path)
        .map_err(|e| ProvisionError::io(format!("failed to read {}", path), e))?;
    let mut edited = String::with_capacity(content.len());
    for line in content.lines() {
        edited.push_str(&edit(line));
        edited.push('\n');
    }
    write_atomic(path, edited.as_bytes())
}

/// Copies `src` to `dst`, keeping the permission bits of `src`.
pub(crate) fn copy_file(ctx: &ProvisionContext, src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    if ctx.dry_run() {
        info!("would copy {} to {}", src, dst);
        return Ok(());
    }
    fs::copy(src, dst)
        .map_err(|e| ProvisionError::io(format!("failed to copy {} to {}", src, dst), e))?;
    Ok(())
}

/// Creates `dir` and its parents.
pub(crate) fn create_dir(ctx: &ProvisionContext, dir: &Utf8Path) -> Result<()> {
    if ctx.dry_run() {
        return Ok(());
    }
    fs::create_dir_all(dir)
        .map_err(|e| ProvisionError::io(format!("failed to create directory: {}", dir), e))?;
    Ok(())
}

/// Sets the permission bits of `path`.
pub(crate) fn set_mode(ctx: &ProvisionContext, path: &Utf8Path, mode: u32) -> Result<()> {
    if ctx.dry_run() {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| ProvisionError::io(format!("failed to set permissions for {}", path), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use camino::Utf8PathBuf;

    use crate::config::Config;
    use crate::executor::RealCommandExecutor;
    use crate::ledger::Ledger;
    use crate::probe::HostProbe;

    fn context(dry_run: bool) -> ProvisionContext {
        ProvisionContext::new(
            Config::default(),
            Ledger::in_memory(),
            Arc::new(RealCommandExecutor { dry_run }),
            Arc::new(HostProbe),
        )
        .with_dry_run(dry_run)
    }

    fn temp_path(dir: &tempfile::TempDir, name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().join(name)).unwrap()
    }

    #[test]
    fn line_edit_rewrites_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "hosts");
        fs::write(&path, "hello\n23\n").unwrap();
        line_edit(&context(false), &path, |line| {
            if line.starts_with("hello") {
                format!("{} world", line)
            } else {
                line.to_string()
            }
        })
        .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello world\n23\n");
    }

    #[test]
    fn line_edit_keeps_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "sasl_passwd");
        fs::write(&path, "hello\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o700)).unwrap();
        line_edit(&context(false), &path, str::to_string).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o7777, 0o700);
    }

    #[test]
    fn write_file_creates_with_default_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "fstab");
        write_file(&context(false), &path, "UUID=x / btrfs\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "UUID=x / btrfs\n");
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o644);
    }

    #[test]
    fn dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "fstab");
        write_file(&context(true), &path, "x").unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn ensure_real_dir_rejects_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let real = temp_path(&dir, "real");
        let link = temp_path(&dir, "etc");
        fs::create_dir(&real).unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();
        assert!(ensure_real_dir(&real).is_ok());
        let err = ensure_real_dir(&link).unwrap_err();
        assert!(err.to_string().contains("symlink"));
    }
}
