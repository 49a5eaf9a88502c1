mod helpers;

use std::fs;

use camino::Utf8Path;
use helpers::FakeSystem;
use rsprovision::stage::{Stage, finish};

const FINISH_YAML: &str = "
target:
  hostname: nas.example.org
  user: juser
  git_name: J. User
  git_mail: juser@example.org
  network:
    eth: eth0
    mac: 52:54:00:12:34:56
";

fn sysroot_with_etc(root: &Utf8Path) {
    for dir in ["etc/ssh", "etc/sysctl.d", "etc/sysconfig/network-scripts"] {
        fs::create_dir_all(root.join(dir)).unwrap();
    }
    fs::write(root.join("etc/hosts"), "127.0.0.1   localhost\n::1         localhost\n").unwrap();
    fs::write(
        root.join("etc/ssh/sshd_config"),
        "Port 22\nPasswordAuthentication yes\nUsePAM yes\n",
    )
    .unwrap();
}

fn subset(ids: &[&str]) -> Stage {
    let tasks = finish::tasks()
        .into_iter()
        .filter(|t| ids.contains(&t.id()))
        .collect();
    Stage::new("finish", tasks).unwrap()
}

#[test]
fn finish_edits_are_bracketed_by_mirror_commits() {
    let (_sysroot_dir, sysroot) = helpers::utf8_tempdir();
    let (_state_dir, state) = helpers::utf8_tempdir();
    sysroot_with_etc(&sysroot);
    let system = FakeSystem::new();
    let mut ctx = helpers::context(&system, helpers::config(FINISH_YAML, &sysroot), &state)
        .with_sysroot(sysroot.clone());

    let stage = subset(&["etc-mirror", "set-hostname", "harden-sshd", "disk-writeback-limits"]);
    let report = stage.run(&mut ctx).unwrap();
    assert_eq!(report.executed.len(), 4);

    assert!(sysroot.join("root/etc-mirror").is_dir());
    let hosts = fs::read_to_string(sysroot.join("etc/hosts")).unwrap();
    assert_eq!(
        hosts,
        "127.0.0.1   localhost nas.example.org\n::1         localhost nas.example.org\n"
    );
    let sshd = fs::read_to_string(sysroot.join("etc/ssh/sshd_config")).unwrap();
    assert!(sshd.contains("PasswordAuthentication no\n"));
    assert!(!sshd.contains("PasswordAuthentication yes"));
    let sysctl =
        fs::read_to_string(sysroot.join("etc/sysctl.d/01-disk-bufferbloat.conf")).unwrap();
    assert!(sysctl.starts_with("vm.dirty_background_bytes="));

    let git = system.calls_to("git");
    let prefix = format!(
        "git --git-dir={} --work-tree={}",
        sysroot.join("root/etc-mirror"),
        sysroot.join("etc")
    );
    assert!(git.iter().all(|c| c.starts_with(&prefix)), "{:?}", git);
    assert_eq!(git[0], format!("{} init", prefix));
    assert!(git.contains(&format!("{} config user.name J. User", prefix)));

    let sshd_add = format!("{} add -- ssh/sshd_config", prefix);
    let adds: Vec<usize> = git
        .iter()
        .enumerate()
        .filter(|(_, c)| **c == sshd_add)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(adds.len(), 2, "vanilla and edited sshd_config should be committed");

    assert_eq!(
        system.calls_to("hostnamectl"),
        ["hostnamectl set-hostname nas.example.org"]
    );
    assert_eq!(
        system.calls_to("systemctl"),
        [
            "systemctl start sshd.service",
            "systemctl enable sshd.service",
            "systemctl reload sshd.service"
        ]
    );
}

#[test]
fn network_defaults_falls_back_to_configured_device() {
    let (_sysroot_dir, sysroot) = helpers::utf8_tempdir();
    let (_state_dir, state) = helpers::utf8_tempdir();
    sysroot_with_etc(&sysroot);
    let system = FakeSystem::new();
    let mut ctx = helpers::context(&system, helpers::config(FINISH_YAML, &sysroot), &state)
        .with_sysroot(sysroot.clone());

    subset(&["network-defaults"]).run(&mut ctx).unwrap();
    let profile =
        fs::read_to_string(sysroot.join("etc/sysconfig/network-scripts/ifcfg-eth0")).unwrap();
    assert!(profile.starts_with("HWADDR=52:54:00:12:34:56\n"));
    assert!(profile.contains("IPV6_ADDR_GEN_MODE=eui64\n"));
}

#[test]
fn optional_features_are_skipped_and_retried() {
    let (_sysroot_dir, sysroot) = helpers::utf8_tempdir();
    let (_state_dir, state) = helpers::utf8_tempdir();
    sysroot_with_etc(&sysroot);
    let system = FakeSystem::new();
    let mut config = helpers::config(FINISH_YAML, &sysroot);
    config.host.package_list = sysroot.join("package.list");
    let mut ctx = helpers::context(&system, config, &state).with_sysroot(sysroot.clone());

    let stage = subset(&["install-packages", "restore-postfix", "pam-u2f", "nfs-server"]);
    let report = stage.run(&mut ctx).unwrap();
    assert_eq!(report.skipped.len(), 4);
    assert!(system.calls().is_empty());

    // Once the list exists, the next run installs it.
    fs::write(sysroot.join("package.list"), "zsh\n\ntmux\n").unwrap();
    let report = stage.run(&mut ctx).unwrap();
    assert_eq!(report.executed, ["install-packages"]);
    assert_eq!(system.calls_to("dnf"), ["dnf -y install zsh tmux"]);
}
