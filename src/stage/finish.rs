//! The `finish` stage: runs inside the freshly booted target.
//!
//! Every change below `/etc` is recorded in the git mirror set up by the
//! first task: the vanilla files are committed before an edit and the
//! result after it, so `git log` on the mirror documents the whole
//! configuration.

use std::fs;

use anyhow::{Context, Result};
use camino::Utf8Path;
use regex::Regex;
use tracing::info;
use uuid::Uuid;

use crate::context::ProvisionContext;
use crate::error::ProvisionError;
use crate::executor::CommandSpec;
use crate::stage::{etc_mirror, files};
use crate::task::{Task, TaskOutcome};

const ACCOUNT_FILES: [&str; 4] = ["passwd", "shadow", "group", "gshadow"];

const BUFFERBLOAT_SYSCTL: &str = "/etc/sysctl.d/01-disk-bufferbloat.conf";

const POSTFIX_MAPS: [&str; 3] = ["sender_relay", "sasl_passwd", "sender_transport"];

const U2F_SNIPPET: &str = "
# assuming pamu2fcfg defaults,
# equivalent to adding: origin=pam://$hostname appid=pam://$hostname
# add `debug` option for verbose troubleshooting
auth requisite pam_u2f.so authfile=/etc/u2f_map interactive
";

const PAM_FILES: [&str; 2] = ["pam.d/login", "pam.d/gdm-password"];

/// Returns the task list of the `finish` stage.
pub fn tasks() -> Vec<Task> {
    vec![
        Task::once("etc-mirror", |ctx| {
            etc_mirror::init(ctx)?;
            Ok(TaskOutcome::Done)
        }),
        Task::once("commit-core-files", commit_core_files),
        Task::once("set-hostname", set_hostname),
        Task::once("network-defaults", network_defaults),
        Task::once("set-locale", set_locale),
        Task::once("set-timezone", set_timezone),
        Task::once("harden-sshd", harden_sshd),
        Task::once("disk-writeback-limits", disk_writeback_limits),
        Task::once("set-shell", set_shell),
        Task::once("install-packages", install_packages),
        Task::once("remove-packages", remove_packages),
        Task::once("disable-avahi", disable_avahi),
        Task::once("tune-power", tune_power),
        Task::once("restore-postfix", restore_postfix),
        Task::once("restore-postgres", restore_postgres),
        Task::once("restore-etc", restore_etc),
        Task::once("enable-services", enable_services),
        Task::once("pam-u2f", pam_u2f),
        Task::once("nfs-server", nfs_server),
    ]
}

fn systemctl(ctx: &ProvisionContext, args: &[&str]) -> Result<()> {
    ctx.must(&CommandSpec::new("systemctl", args.iter().copied()))?;
    Ok(())
}

/// `rsync -aiR` of `files` (relative to `/etc`) from `old_etc` into `/etc`.
fn rsync_from_old_etc<S: AsRef<str>>(
    ctx: &ProvisionContext,
    old_etc: &Utf8Path,
    files: &[S],
) -> Result<()> {
    let sources = files.iter().map(|f| format!("{}/./{}", old_etc, f.as_ref()));
    let spec = CommandSpec::new("rsync", ["-aiR"])
        .with_args(sources)
        .with_args(["/etc"]);
    ctx.must(&spec)?;
    Ok(())
}

fn commit_core_files(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let mut core: Vec<String> = ["fstab", "default/grub", "modprobe.d/bochs.conf"]
        .map(String::from)
        .to_vec();
    core.extend(etc_mirror::existing(ctx, &["crypttab"]));
    etc_mirror::commit(ctx, &core, "add core etc files")?;
    Ok(TaskOutcome::Done)
}

/// Appends `hostname` to the loopback lines of `/etc/hosts`.
pub fn hosts_line(line: &str, hostname: &str) -> String {
    let loopback = line.starts_with("127.0.0.1") || line.starts_with("::1");
    if loopback && !line.split_whitespace().skip(1).any(|name| name == hostname) {
        format!("{} {}", line, hostname)
    } else {
        line.to_string()
    }
}

fn set_hostname(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let hostname = ctx.config.hostname()?.to_string();
    let mut vanilla = vec!["hosts".to_string()];
    vanilla.extend(etc_mirror::existing(ctx, &["hostname"]));
    etc_mirror::commit(ctx, &vanilla, "add hosts")?;

    ctx.must(&CommandSpec::new("hostnamectl", ["set-hostname", hostname.as_str()]))?;
    files::line_edit(ctx, &ctx.host_path("/etc/hosts"), |line| hosts_line(line, &hostname))?;
    etc_mirror::commit(ctx, &["hostname", "hosts"], "set hostname")?;
    Ok(TaskOutcome::Done)
}

/// Finds the first ethernet device and its MAC in `ip -o link` output.
pub fn default_eth(ip_link: &str) -> Result<Option<(String, String)>> {
    let exp = Regex::new(r"^[0-9]+: ([^:]+):.+link/ether ([^ ]+) .+$")
        .context("invalid ethernet pattern")?;
    Ok(ip_link
        .lines()
        .filter(|line| line.contains("link/ether"))
        .find_map(|line| exp.captures(line))
        .map(|caps| (caps[1].to_string(), caps[2].to_string())))
}

/// Renders a network-scripts connection profile with a stable, EUI-64
/// derived IPv6 address.
pub fn ifcfg(eth: &str, mac: &str, uuid: &Uuid) -> String {
    format!(
        "HWADDR={mac}\n\
         TYPE=Ethernet\n\
         BOOTPROTO=dhcp\n\
         DEFROUTE=yes\n\
         PEERDNS=yes\n\
         PEERROUTES=yes\n\
         IPV4_FAILURE_FATAL=no\n\
         IPV6INIT=yes\n\
         IPV6_AUTOCONF=yes\n\
         IPV6_DEFROUTE=yes\n\
         IPV6_PEERDNS=yes\n\
         IPV6_PEERROUTES=yes\n\
         IPV6_FAILURE_FATAL=no\n\
         IPV6_ADDR_GEN_MODE=eui64\n\
         NAME={eth}\n\
         UUID={uuid}\n\
         ONBOOT=yes\n\
         AUTOCONNECT_PRIORITY=-999\n"
    )
}

fn network_defaults(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    if !ctx.config.target.network.ipv6_eui64 {
        return Ok(TaskOutcome::skipped("target.network.ipv6_eui64 is disabled"));
    }
    let links = ctx.must(&CommandSpec::new("ip", ["-o", "link"]))?;
    let detected = default_eth(&links.stdout)?;
    let network = &ctx.config.target.network;
    let (eth, mac) = match (detected, &network.eth, &network.mac) {
        (Some(found), _, _) => {
            info!("autodetected default ethernet device {} (mac: {})", found.0, found.1);
            found
        }
        (None, Some(eth), Some(mac)) => (eth.clone(), mac.clone()),
        _ => {
            return Err(ProvisionError::Config(
                "no ethernet device detected and target.network.eth is not set".to_string(),
            )
            .into());
        }
    };

    let file = format!("sysconfig/network-scripts/ifcfg-{}", eth);
    let vanilla = etc_mirror::existing(ctx, &[file.as_str()]);
    etc_mirror::commit(ctx, &vanilla, "add default eth config")?;
    let path = ctx.host_path(&format!("/etc/{}", file));
    files::write_file(ctx, &path, &ifcfg(&eth, &mac, &Uuid::new_v4()))?;
    etc_mirror::commit(ctx, &[&file], "use eui-64 derived ipv6 address")?;
    Ok(TaskOutcome::Done)
}

fn set_locale(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let names = ["locale.conf", "vconsole.conf"];
    etc_mirror::commit(ctx, &etc_mirror::existing(ctx, &names), "add locale conf")?;
    let locale = ctx.config.target.locale.clone();
    ctx.must(&CommandSpec::new("localectl", ["set-locale", locale.as_str()]))?;
    etc_mirror::commit(ctx, &etc_mirror::existing(ctx, &names), "update locale")?;
    Ok(TaskOutcome::Done)
}

fn set_timezone(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    etc_mirror::commit(ctx, &etc_mirror::existing(ctx, &["localtime"]), "add localtime")?;
    let timezone = ctx.config.target.timezone.clone();
    ctx.must(&CommandSpec::new("timedatectl", ["set-timezone", timezone.as_str()]))?;
    etc_mirror::commit(ctx, &["localtime"], "set timezone")?;
    Ok(TaskOutcome::Done)
}

fn harden_sshd(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let file = "/etc/ssh/sshd_config";
    etc_mirror::commit(ctx, &[file], "add ssh/sshd_config")?;
    files::line_edit(ctx, &ctx.host_path(file), |line| {
        if line.starts_with("PasswordAuthentication yes") {
            "PasswordAuthentication no".to_string()
        } else {
            line.to_string()
        }
    })?;
    etc_mirror::commit(ctx, &[file], "disable sshd password auth")?;
    for action in ["start", "enable", "reload"] {
        systemctl(ctx, &[action, "sshd.service"])?;
    }
    Ok(TaskOutcome::Done)
}

fn disk_writeback_limits(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let vanilla = etc_mirror::existing(ctx, &[BUFFERBLOAT_SYSCTL]);
    etc_mirror::commit(ctx, &vanilla, "add 01-disk-bufferbloat.conf")?;
    files::write_file(
        ctx,
        &ctx.host_path(BUFFERBLOAT_SYSCTL),
        "vm.dirty_background_bytes=107374182\nvm.dirty_bytes=214748364\n",
    )?;
    etc_mirror::commit(ctx, &[BUFFERBLOAT_SYSCTL], "add anti-bufferbloat sysctl config")?;
    ctx.must(&CommandSpec::new("sysctl", ["--load", BUFFERBLOAT_SYSCTL]))?;
    Ok(TaskOutcome::Done)
}

fn set_shell(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let shell = ctx.config.target.shell.clone();
    if !ctx.dry_run() && !ctx.host_path(shell.as_str()).exists() {
        anyhow::bail!("there is no {}", shell);
    }
    etc_mirror::commit(ctx, &ACCOUNT_FILES, "add passwd ...")?;
    let user = ctx.config.user()?.to_string();
    for account in ["root", user.as_str()] {
        ctx.must(&CommandSpec::new("usermod", ["--shell", shell.as_str(), account]))?;
    }
    etc_mirror::commit(ctx, &ACCOUNT_FILES, &format!("change user shell to {}", shell))?;
    Ok(TaskOutcome::Done)
}

/// Reads a package list: one name per line, blank lines ignored.
fn read_package_list(path: &Utf8Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .map_err(|e| ProvisionError::io(format!("failed to read {}", path), e))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

fn install_packages(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let list = ctx.config.host.package_list.clone();
    if !list.exists() {
        return Ok(TaskOutcome::skipped(format!("{} does not exist", list)));
    }
    let packages = read_package_list(&list)?;
    info!("installing {} packages", packages.len());
    ctx.must(&CommandSpec::new("dnf", ["-y", "install"]).with_args(packages))?;
    etc_mirror::commit(
        ctx,
        &ACCOUNT_FILES,
        "record users/groups created by newly installed packages",
    )?;
    Ok(TaskOutcome::Done)
}

/// Removes unwanted members of installed package groups. Failures are not
/// fatal: a listed package may simply not be installed.
fn remove_packages(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let list = ctx.config.host.unpackage_list.clone();
    if !list.exists() {
        return Ok(TaskOutcome::skipped(format!("{} does not exist", list)));
    }
    let packages = read_package_list(&list)?;
    info!("removing {} packages", packages.len());
    let result = ctx.run(&CommandSpec::new("dnf", ["-y", "remove"]).with_args(packages))?;
    if !result.success() {
        info!("dnf remove exited with {:?}", result.code());
    }
    Ok(TaskOutcome::Done)
}

fn disable_avahi(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let socket = "/usr/lib/systemd/system/avahi-daemon.socket";
    if !ctx.host_path(socket).exists() {
        return Ok(TaskOutcome::skipped("avahi is not installed"));
    }
    for action in ["disable", "stop"] {
        systemctl(ctx, &[action, "avahi-daemon.socket", "avahi-daemon.service"])?;
    }
    Ok(TaskOutcome::Done)
}

/// Replaces the aggressive SATA link power setting of TLP.
pub fn tlp_line(line: &str) -> String {
    if line.starts_with("SATA_LINKPWR_ON_BAT=min_power") {
        "# disabled due to this warning:\n\
         # https://wiki.archlinux.org/index.php/TLP\n\
         #SATA_LINKPWR_ON_BAT=min_power\n\
         SATA_LINKPWR_ON_BAT=max_performance"
            .to_string()
    } else {
        line.to_string()
    }
}

fn tune_power(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    if !ctx.config.target.tune_power {
        return Ok(TaskOutcome::skipped("target.tune_power is disabled"));
    }
    let tlp = "/etc/default/tlp";
    if !ctx.host_path(tlp).exists() {
        return Ok(TaskOutcome::skipped("tlp is not installed"));
    }
    etc_mirror::commit(ctx, &[tlp], "add default/tlp")?;
    files::line_edit(ctx, &ctx.host_path(tlp), tlp_line)?;
    etc_mirror::commit(ctx, &[tlp], "be conservative about SATA link-power settings")?;
    Ok(TaskOutcome::Done)
}

/// Rewrites the host identity lines of a restored postfix `main.cf`.
pub fn main_cf_line(line: &str, hostname: &str) -> String {
    let short = hostname.split('.').next().unwrap_or(hostname);
    if line.starts_with("mydomain ") {
        format!("mydomain = {}", hostname)
    } else if line.starts_with("myhostname ") {
        format!("myhostname = {}", hostname)
    } else if line.starts_with("mydestination ") {
        format!(
            "mydestination = {0}.localdomain localhost.localdomain localhost {0} {1}",
            short, hostname
        )
    } else {
        line.to_string()
    }
}

fn restore_postfix(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    if !ctx.config.target.restore_postfix {
        return Ok(TaskOutcome::skipped("target.restore_postfix is disabled"));
    }
    let old_etc = ctx.config.old_etc("target.restore_postfix")?.to_owned();
    let hostname = ctx.config.hostname()?.to_string();
    let vanilla = [
        "postfix/main.cf",
        "postfix/master.cf",
        "postfix/virtual",
        "postfix/transport",
        "aliases",
    ];
    etc_mirror::commit(ctx, &etc_mirror::existing(ctx, &vanilla), "add vanilla postfix config")?;

    let mut restored: Vec<String> = POSTFIX_MAPS
        .iter()
        .chain(["main.cf"].iter())
        .map(|f| format!("postfix/{}", f))
        .collect();
    restored.push("aliases".to_string());
    rsync_from_old_etc(ctx, &old_etc, &restored)?;
    files::line_edit(ctx, &ctx.host_path("/etc/postfix/main.cf"), |line| {
        main_cf_line(line, &hostname)
    })?;
    files::set_mode(ctx, &ctx.host_path("/etc/postfix/sasl_passwd"), 0o640)?;
    etc_mirror::commit(ctx, &restored, "configure postfix")?;

    ctx.must(&CommandSpec::new("postalias", ["/etc/aliases"]))?;
    for map in POSTFIX_MAPS {
        let path = format!("/etc/postfix/{}", map);
        ctx.must(&CommandSpec::new("postmap", [path]))?;
    }
    systemctl(ctx, &["restart", "postfix.service"])?;
    systemctl(ctx, &["enable", "postfix.service"])?;
    Ok(TaskOutcome::Done)
}

fn restore_postgres(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    if !ctx.config.target.restore_postgres {
        return Ok(TaskOutcome::skipped("target.restore_postgres is disabled"));
    }
    let old_var = ctx.config.host.old_var.clone().ok_or_else(|| {
        ProvisionError::Config("host.old_var is required by target.restore_postgres".to_string())
    })?;
    let data = old_var.join("lib/pgsql/data");
    ctx.must(&CommandSpec::new("rsync", ["-a", data.as_str(), "/var/lib/pgsql"]))?;
    ctx.must(&CommandSpec::new("postgresql-setup", ["--upgrade"]))?;
    Ok(TaskOutcome::Done)
}

fn restore_etc(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let custom = ctx.config.target.custom_etc_files.clone();
    if custom.is_empty() {
        return Ok(TaskOutcome::skipped("target.custom_etc_files is empty"));
    }
    let old_etc = ctx.config.old_etc("target.custom_etc_files")?.to_owned();
    let candidates: Vec<&str> = custom.iter().map(String::as_str).collect();
    etc_mirror::commit(ctx, &etc_mirror::existing(ctx, &candidates), "add vanilla etc files")?;
    rsync_from_old_etc(ctx, &old_etc, &custom)?;
    etc_mirror::commit(ctx, &custom, "restore misc etc files")?;
    Ok(TaskOutcome::Done)
}

fn enable_services(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    let services = ctx.config.target.enable_services.clone();
    if services.is_empty() {
        return Ok(TaskOutcome::skipped("target.enable_services is empty"));
    }
    for service in &services {
        systemctl(ctx, &["enable", service.as_str()])?;
    }
    Ok(TaskOutcome::Done)
}

/// Line edit inserting the `pam_u2f` rule before the first `auth substack`
/// include of the system or password auth stack. `done` starts out false;
/// once the file is seen to use `pam_u2f` nothing more is changed.
pub fn u2f_line(done: &mut bool, line: &str) -> String {
    if *done {
        return line.to_string();
    }
    if line.contains("pam_u2f.so") {
        *done = true;
    }
    let include = line.starts_with("auth")
        && line.contains("substack")
        && (line.contains("system-auth") || line.contains("password-auth"));
    if include && !*done {
        *done = true;
        format!("\n{}\n{}", U2F_SNIPPET, line)
    } else {
        line.to_string()
    }
}

fn pam_u2f(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    if !ctx.config.target.setup_pamu2f {
        return Ok(TaskOutcome::skipped("target.setup_pamu2f is disabled"));
    }
    let old_etc = ctx.config.old_etc("target.setup_pamu2f")?.to_owned();
    let mapping = ["u2f_map", "u2f_mappings"]
        .iter()
        .map(|name| old_etc.join(name))
        .find(|path| path.exists())
        .ok_or_else(|| {
            ProvisionError::Config(format!("no u2f_map or u2f_mappings in {}", old_etc))
        })?;
    files::copy_file(ctx, &mapping, &ctx.host_path("/etc/u2f_map"))?;

    let mut added: Vec<&str> = PAM_FILES.to_vec();
    added.push("u2f_map");
    etc_mirror::commit(ctx, &added, "add pam files")?;
    for file in PAM_FILES {
        let mut done = false;
        let path = ctx.host_path(&format!("/etc/{}", file));
        files::line_edit(ctx, &path, |line| u2f_line(&mut done, line))?;
    }
    etc_mirror::commit(ctx, &PAM_FILES, "enable u2f auth")?;
    // SELinux policy denies pam_u2f reading the authfile from login
    ctx.must(&CommandSpec::new("semanage", ["permissive", "-a", "local_login_t"]))?;
    Ok(TaskOutcome::Done)
}

fn nfs_server(ctx: &mut ProvisionContext) -> Result<TaskOutcome> {
    if !ctx.config.target.setup_nfsd {
        return Ok(TaskOutcome::skipped("target.setup_nfsd is disabled"));
    }
    ctx.must(&CommandSpec::new("firewall-cmd", ["--add-service", "nfs"]))?;
    ctx.must(&CommandSpec::new("firewall-cmd", ["--permanent", "--add-service", "nfs"]))?;
    systemctl(ctx, &["enable", "nfs-server"])?;
    systemctl(ctx, &["start", "nfs-server"])?;
    Ok(TaskOutcome::Done)
}
