//! The `build` stage: runs from rescue media against raw storage.
//!
//! Partitions and encrypts the devices, installs a minimal system into the
//! new root with `dnf --installroot`, makes it bootable and prepares the
//! files the `finish` stage needs. The storage and bind mounts are
//! bracketing steps that run on every invocation, so a resumed run finds
//! the target mounted again before the first pending task.

use std::fs;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::context::ProvisionContext;
use crate::error::ProvisionError;
use crate::executor::{CommandSpec, ShellPipeline, Stdin};
use crate::stage::files;
use crate::storage::layout::FsRole;
use crate::storage::{self, Teardown, bind, mounts};
use crate::task::{Task, TaskOutcome};

const BASE_PACKAGES: [&str; 9] = [
    "grub2-pc",
    "grub2-efi-x64",
    "shim-x64",
    "efibootmgr",
    "cryptsetup",
    "btrfs-progs",
    "mdadm",
    "git",
    "zsh",
];

const GRUB_CONFIGS: [&str; 2] = ["/boot/efi/EFI/fedora/grub.cfg", "/boot/grub2/grub.cfg"];

const RELABEL_EXCLUDES: [&str; 3] = ["/proc", "/dev", "/sys"];

const PRISTINE_ETC_ARCHIVE: &str = "/root/etc-pristine.tar.xz";

/// Returns the task list of the `build` stage.
pub fn tasks() -> Vec<Task> {
    vec![
        Task::always("selinux-permissive", selinux_permissive),
        Task::once("create-partitions", storage::build::create_partitions),
        Task::once("assemble-raid", storage::build::assemble_raid),
        Task::once("format-boot", storage::build::format_boot),
        Task::once("format-root", storage::build::format_root),
        Task::once("create-subvolumes", storage::build::create_subvolumes),
        Task::always("mount-storage", |ctx| {
            mounts::mount_storage(ctx)?;
            Ok(TaskOutcome::Done)
        }),
        Task::always("bind-mount", |ctx| {
            bind::bind_mount(ctx)?;
            Ok(TaskOutcome::Done)
        }),
        Task::once("install-base", install_base),
        Task::once("write-crypttab", write_crypttab),
        Task::once("write-fstab", write_fstab),
        Task::once("write-grub-defaults", write_grub_defaults),
        Task::always("refresh-resolver", refresh_resolver),
        Task::once("install-kernel", |ctx| {
            ctx.must(&in_target(ctx, "dnf", ["-y", "install", "kernel"]))?;
            Ok(TaskOutcome::Done)
        }),
        Task::once("install-grub", install_grub),
        Task::once("create-user", create_user),
        Task::once("authorized-keys", authorized_keys),
        Task::once("set-passwords", set_passwords),
        Task::once("host-keys", |ctx| {
            ctx.must(&in_target(ctx, "ssh-keygen", ["-A"]))?;
            Ok(TaskOutcome::Done)
        }),
        Task::always("print-host-key-fingerprints", print_host_key_fingerprints),
        Task::once("relabel-selinux", relabel_selinux),
        Task::once("archive-pristine-etc", archive_pristine_etc),
        Task::always("bind-umount", |ctx| {
            bind::bind_umount(ctx, Teardown::Strict)?;
            Ok(TaskOutcome::Done)
        }),
        Task::once("copy-self", copy_self),
        Task::always("umount-storage", |ctx| {
            mounts::unmount_storage(ctx, Teardown::Strict)?.into_result()?;
            Ok(TaskOutcome::Done)
        }),
    ]
}

/// Builds a command that runs chrooted into the new root.
fn in_target<I, S>(ctx: &ProvisionContext, command: &str, args: I) -> CommandSpec
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    CommandSpec::new(command, args).in_root(ctx.target_root())
}

/// Returns the recorded filesystem UUID of `role`.
fn fs_uuid(ctx: &ProvisionContext, role: FsRole) -> Result<String, ProvisionError> {
    ctx.storage_ids().fs_uuid.get(role.as_ref()).cloned().ok_or_else(|| {
        ProvisionError::StateInconsistency(format!("no recorded uuid for filesystem {}", role))
    })
}

/// Returns `path` in the target, after making sure its directory is real.
fn target_file(ctx: &ProvisionContext, path: &str) -> Result<Utf8PathBuf> {
    let file = ctx.target_path(path);
    if !ctx.dry_run()
        && let Some(dir) = file.parent()
    {
        files::ensure_real_dir(dir)?;
    }
    Ok(file)
}

fn selinux_permissive(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let result = ctx.run(&CommandSpec::new("setenforce", ["0"]))?;
    if !result.success() {
        debug!("setenforce 0 failed: {}", result.stderr.trim());
    }
    Ok(TaskOutcome::Done)
}

fn install_base(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let release = ctx.release()?;
    let dnf = |args: &[&str]| {
        CommandSpec::new(
            "dnf",
            [
                "-y".to_string(),
                format!("--installroot={}", ctx.target_root()),
                format!("--releasever={}", release),
            ],
        )
        .with_args(args.iter().copied())
    };
    ctx.must(&dnf(&["install", "system-release"]))?;
    // custom-environment is the minimal install without a desktop
    ctx.must(&dnf(&["group", "install", "custom-environment"]))?;
    let mut packages = vec!["install"];
    packages.extend(BASE_PACKAGES);
    ctx.must(&dnf(&packages))?;
    Ok(TaskOutcome::Done)
}

/// Renders `/etc/crypttab` for the recorded LUKS volumes.
pub fn crypttab(luks_uuids: &[String]) -> String {
    luks_uuids
        .iter()
        .map(|u| format!("luks-{0} UUID={0} none\n", u))
        .collect()
}

fn write_crypttab(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    if !ctx.config.init.cryptsetup {
        return Ok(TaskOutcome::skipped("init.cryptsetup is disabled"));
    }
    let luks = ctx.storage_ids().luks_uuid.clone();
    if luks.is_empty() {
        let message = "no recorded LUKS uuids".to_string();
        return Err(ProvisionError::StateInconsistency(message).into());
    }
    let path = target_file(ctx, "/etc/crypttab")?;
    files::write_file(ctx, &path, &crypttab(&luks))?;
    Ok(TaskOutcome::Done)
}

/// Renders `/etc/fstab` for the recorded filesystems.
pub fn fstab(boot: &str, boot_efi: &str, root: &str) -> String {
    format!(
        "UUID={boot}   /boot      ext4     defaults,noatime                                  1 2\n\
         UUID={boot_efi}   /boot/efi  vfat     umask=0077,shortname=winnt,noatime                0 2\n\
         UUID={root}   /          btrfs    subvol=root,x-systemd.device-timeout=0,noatime    0 0\n\
         UUID={root}   /home      btrfs    subvol=home,x-systemd.device-timeout=0,noatime    0 0\n"
    )
}

fn write_fstab(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let content = fstab(
        &fs_uuid(ctx, FsRole::Boot)?,
        &fs_uuid(ctx, FsRole::BootEfi)?,
        &fs_uuid(ctx, FsRole::Root)?,
    );
    let path = target_file(ctx, "/etc/fstab")?;
    files::write_file(ctx, &path, &content)?;
    Ok(TaskOutcome::Done)
}

/// Renders `/etc/default/grub`. A serial console is configured as a
/// fallback for virtual machines.
pub fn grub_defaults(luks_uuids: &[String]) -> String {
    let luks: String = luks_uuids
        .iter()
        .map(|u| format!("rd.luks.uuid={} ", u))
        .collect();
    format!(
        "GRUB_TIMEOUT=5\n\
         GRUB_DISTRIBUTOR=Fedora\n\
         GRUB_DEFAULT=saved\n\
         GRUB_DISABLE_SUBMENU=true\n\
         GRUB_TERMINAL_OUTPUT=console\n\
         GRUB_CMDLINE_LINUX=\"{}quiet console=tty0 console=ttyS0,115200\"\n\
         GRUB_DISABLE_RECOVERY=true\n",
        luks
    )
}

fn write_grub_defaults(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let luks = if ctx.config.init.cryptsetup {
        ctx.storage_ids().luks_uuid.clone()
    } else {
        Vec::new()
    };
    files::create_dir(ctx, &ctx.target_path("/etc/default"))?;
    let grub = target_file(ctx, "/etc/default/grub")?;
    files::write_file(ctx, &grub, &grub_defaults(&luks))?;

    // bochs_drm garbles the text console of qemu
    files::create_dir(ctx, &ctx.target_path("/etc/modprobe.d"))?;
    let blacklist = target_file(ctx, "/etc/modprobe.d/bochs.conf")?;
    files::write_file(ctx, &blacklist, "blacklist bochs_drm\n")?;
    Ok(TaskOutcome::Done)
}

fn refresh_resolver(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let host = ctx.host_path("/etc/resolv.conf");
    let target = target_file(ctx, "/etc/resolv.conf")?;
    if ctx.dry_run() {
        info!("would copy {} to {}", host, target);
        return Ok(TaskOutcome::Done);
    }
    let content = fs::read_to_string(&host)
        .map_err(|e| ProvisionError::io(format!("failed to read {}", host), e))?;
    // written by rename, so a symlinked resolv.conf in the target is replaced
    files::write_file(ctx, &target, &content)?;
    Ok(TaskOutcome::Done)
}

/// Returns the substitution that makes a generated grub config match the
/// firmware it boots from, if `config` needs one.
///
/// `grub2-mkconfig` picks `linux16`/`linuxefi` from the firmware of the
/// rescue system, not of the config's eventual consumer.
pub fn grub_fix(config: &str, running_on_efi: bool) -> Option<(&'static str, &'static str)> {
    let efi_config = config.contains("/EFI/");
    match (running_on_efi, efi_config) {
        (true, false) => Some((r"\b(linux|initrd)efi\b", "${1}16")),
        (false, true) => Some((r"\b(linux|initrd)16\b", "${1}efi")),
        _ => None,
    }
}

fn install_grub(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let running_on_efi = ctx.probe().path_exists(Utf8Path::new("/sys/firmware/efi"));
    for config in GRUB_CONFIGS {
        ctx.must(&in_target(ctx, "grub2-mkconfig", ["-o", config]))?;
        let Some((pattern, replacement)) = grub_fix(config, running_on_efi) else {
            continue;
        };
        let exp = Regex::new(pattern).with_context(|| format!("invalid pattern: {}", pattern))?;
        files::line_edit(ctx, &ctx.target_path(config), |line| {
            exp.replace_all(line, replacement).into_owned()
        })?;
    }
    // UEFI firmware finds the ESP on its own; only BIOS needs an install.
    for device in ctx.config.devices() {
        ctx.must(&in_target(ctx, "grub2-install", ["--target=i386-pc", device.as_str()]))?;
    }
    Ok(TaskOutcome::Done)
}

/// Returns true if `passwd` has an entry for `user`.
pub fn has_user(passwd: &str, user: &str) -> bool {
    passwd
        .lines()
        .any(|line| line.split(':').next() == Some(user))
}

fn create_user(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let user = ctx.config.user()?.to_string();
    let passwd = ctx.target_path("/etc/passwd");
    let existing = match fs::read_to_string(&passwd) {
        Ok(content) => has_user(&content, &user),
        Err(e) if ctx.dry_run() => {
            debug!("cannot read {}: {}", passwd, e);
            false
        }
        Err(e) => return Err(ProvisionError::io(format!("failed to read {}", passwd), e).into()),
    };
    if existing {
        info!("not creating user {} because it is already present", user);
    } else {
        ctx.must(&in_target(
            ctx,
            "useradd",
            ["--groups", "wheel", "--create-home", user.as_str()],
        ))?;
    }
    Ok(TaskOutcome::Done)
}

fn authorized_keys(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let Some(keys) = ctx.config.init.authorized_keys.clone() else {
        return Ok(TaskOutcome::skipped("init.authorized_keys is not set"));
    };
    let ssh_dir = ctx.target_path("/root/.ssh");
    files::create_dir(ctx, &ssh_dir)?;
    files::set_mode(ctx, &ssh_dir, 0o700)?;
    let path = ssh_dir.join("authorized_keys");
    let mut content = keys.trim_end().to_string();
    content.push('\n');
    files::write_file(ctx, &path, &content)?;
    files::set_mode(ctx, &path, 0o600)?;
    Ok(TaskOutcome::Done)
}

fn set_passwords(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let secret = ctx.secret()?;
    let user = ctx.config.user()?.to_string();
    let input: String = ["root", user.as_str()]
        .iter()
        .map(|u| format!("{}:{}\n", u, secret.expose()))
        .collect();
    let spec =
        in_target(ctx, "chpasswd", Vec::<String>::new()).with_stdin(Stdin::sensitive(input));
    ctx.must(&spec)?;
    Ok(TaskOutcome::Done)
}

/// Lists the SSH host keys of the target, sorted.
fn host_keys(ctx: &ProvisionContext) -> Result<Vec<Utf8PathBuf>> {
    let dir = ctx.target_path("/etc/ssh");
    let entries = match dir.read_dir_utf8() {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ProvisionError::io(format!("failed to read {}", dir), e).into()),
    };
    let mut keys = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ProvisionError::io(format!("failed to read {}", dir), e))?;
        let name = entry.file_name();
        if name.starts_with("ssh_host") && name.ends_with("key") {
            keys.push(entry.into_path());
        }
    }
    keys.sort();
    Ok(keys)
}

fn print_host_key_fingerprints(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let mut message = String::from("sshd host key fingerprints:");
    for key in host_keys(ctx)? {
        let result = ctx.must(&CommandSpec::new("ssh-keygen", ["-l", "-f", key.as_str()]))?;
        message.push_str("\n    ");
        message.push_str(result.stdout.trim());
    }
    info!("{}", message);
    Ok(TaskOutcome::Done)
}

/// Counts the files `restorecon -v` reports as relabeled.
pub fn count_relabeled(output: &str) -> usize {
    output
        .lines()
        .filter(|line| line.starts_with("Relabeled"))
        .count()
}

fn relabel_selinux(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    ctx.must(&in_target(ctx, "load_policy", ["-i"]))?;
    let mut args = vec!["-rv".to_string()];
    for exclude in RELABEL_EXCLUDES {
        args.push("-e".to_string());
        args.push(exclude.to_string());
    }
    args.push("/".to_string());
    let result = ctx.must(&in_target(ctx, "restorecon", args))?;
    info!("relabeled {} files", count_relabeled(&result.stdout));

    // The bind-mounted pseudo filesystems hide the mount point directories
    // below them; label those through a second view of the root.
    let root = ctx.target_root().to_owned();
    let view = ctx.target_path("/mnt/tmp");
    if !ctx.dry_run() {
        storage::create_mount_point(&root, &view)?;
    }
    ctx.must(&CommandSpec::new("mount", ["--bind", root.as_str(), view.as_str()]))?;
    let labeled = RELABEL_EXCLUDES.iter().try_for_each(|dir| {
        let reference = format!("--reference={}", dir);
        let inside = format!("/mnt/tmp{}", dir);
        ctx.must(&in_target(ctx, "chcon", [reference, inside])).map(|_| ())
    });
    let released = ctx.must(&CommandSpec::new("umount", [view.as_str()]));
    if let Err(e) = &released
        && labeled.is_err()
    {
        warn!("failed to unmount {}: {:#}", view, e);
    }
    labeled?;
    released?;
    Ok(TaskOutcome::Done)
}

fn archive_pristine_etc(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let etc = ctx.target_path("/etc");
    let archive = ctx.target_path(PRISTINE_ETC_ARCHIVE);
    let spec = ShellPipeline::new()
        .pipe(["tar", "-C", etc.as_str(), "-c", "."])
        .pipe(["xz", "-6", "--check=crc32"])
        .redirect_to(&archive)
        .into_spec();
    ctx.must(&spec)?;
    info!("archived pristine /etc to {}", archive);
    Ok(TaskOutcome::Done)
}

fn copy_self(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    info!("copying files needed for the finish stage to the target's /root");
    let destination = ctx.target_path("/root");
    let exe = std::env::current_exe()
        .map_err(|e| ProvisionError::io("failed to locate the running executable", e))?;
    let exe = Utf8PathBuf::from_path_buf(exe).map_err(|p| {
        ProvisionError::Config(format!("executable path is not UTF-8: {}", p.display()))
    })?;

    let mut sources = vec![exe, ctx.config.path.clone(), ctx.ledger.path().to_owned()];
    sources.retain(|p| !p.as_str().is_empty());
    for list in [&ctx.config.host.package_list, &ctx.config.host.unpackage_list] {
        if list.exists() {
            sources.push(list.clone());
        }
    }
    for source in sources {
        let Some(name) = source.file_name() else {
            continue;
        };
        files::copy_file(ctx, &source, &destination.join(name))?;
    }
    Ok(TaskOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypttab_lists_every_volume() {
        let uuids = vec!["a".to_string(), "b".to_string()];
        assert_eq!(crypttab(&uuids), "luks-a UUID=a none\nluks-b UUID=b none\n");
    }

    #[test]
    fn fstab_mounts_subvolumes() {
        let fstab = fstab("B", "AB12-CD34", "R");
        let lines: Vec<_> = fstab.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("UUID=B   /boot      ext4"));
        assert!(lines[1].starts_with("UUID=AB12-CD34   /boot/efi  vfat"));
        assert!(lines[2].contains("subvol=root"));
        assert!(lines[3].starts_with("UUID=R   /home"));
    }

    #[test]
    fn grub_cmdline_unlocks_luks_volumes() {
        let conf = grub_defaults(&["u1".to_string(), "u2".to_string()]);
        assert!(conf.contains(
            "GRUB_CMDLINE_LINUX=\"rd.luks.uuid=u1 rd.luks.uuid=u2 quiet console=tty0 \
             console=ttyS0,115200\"\n"
        ));
        assert!(grub_defaults(&[]).contains("GRUB_CMDLINE_LINUX=\"quiet console=tty0"));
    }

    #[test]
    fn grub_fix_rewrites_loader_commands() {
        let (pattern, replacement) = grub_fix("/boot/grub2/grub.cfg", true).unwrap();
        let exp = Regex::new(pattern).unwrap();
        assert_eq!(
            exp.replace_all("\tlinuxefi /vmlinuz ro", replacement),
            "\tlinux16 /vmlinuz ro"
        );
        let (pattern, replacement) = grub_fix("/boot/efi/EFI/fedora/grub.cfg", false).unwrap();
        let exp = Regex::new(pattern).unwrap();
        assert_eq!(
            exp.replace_all("\tinitrd16 /initramfs", replacement),
            "\tinitrdefi /initramfs"
        );
        assert!(grub_fix("/boot/grub2/grub.cfg", false).is_none());
        assert!(grub_fix("/boot/efi/EFI/fedora/grub.cfg", true).is_none());
    }

    #[test]
    fn passwd_lookup_matches_whole_name() {
        let passwd = "root:x:0:0::/root:/bin/bash\njuser2:x:1001:1001::/home/juser2:/bin/zsh\n";
        assert!(has_user(passwd, "root"));
        assert!(!has_user(passwd, "juser"));
    }

    #[test]
    fn relabel_count() {
        let out = "Relabeled /etc from a to b\nsomething else\nRelabeled /var from a to b\n";
        assert_eq!(count_relabeled(out), 2);
    }
}
