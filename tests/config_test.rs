mod helpers;

use std::fs;

use anyhow::Result;
use camino::Utf8Path;
use rsprovision::config::load_config;
use rsprovision::error::ProvisionError;
use rsprovision::secret::SecretSource;
use rsprovision::stage::StageKind;

fn write(dir: &Utf8Path, yaml: &str) -> camino::Utf8PathBuf {
    let path = dir.join("system.yaml");
    fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn test_load_config_full() -> Result<()> {
    let (_dir, dir) = helpers::utf8_tempdir();
    let path = write(
        &dir,
        r#"---
target:
  hostname: nas.example.org
  user: juser
  locale: LANG=de_DE.UTF-8
  timezone: UTC
  git_name: J. User
  git_mail: juser@example.org
  restore_postfix: true
  custom_etc_files:
  - aliases
  - ssh/ssh_config
  enable_services:
  - tlp.service
init:
  device: /dev/disk/by-id/does-not-exist-a
  mirror: /dev/disk/by-id/does-not-exist-b
  cryptsetup: true
  password:
    file: secrets/pw
  target_root: /mnt/target
host:
  old_etc: backup/etc
  package_list: lists/package.list
"#,
    );

    let config = load_config(&path)?;
    assert_eq!(config.path, path);
    assert_eq!(config.target.hostname.as_deref(), Some("nas.example.org"));
    assert_eq!(config.target.timezone, "UTC");
    assert_eq!(config.target.enable_services, ["tlp.service"]);
    assert!(config.is_mirrored());
    assert_eq!(config.init.target_root, "/mnt/target");
    assert_eq!(
        config.init.password,
        Some(SecretSource::File(dir.join("secrets/pw")))
    );
    assert_eq!(config.host.old_etc, Some(dir.join("backup/etc")));
    assert_eq!(config.host.package_list, dir.join("lists/package.list"));
    assert_eq!(config.host.unpackage_list, dir.join("unpackage.list"));

    config.validate(StageKind::Build)?;
    config.validate(StageKind::Finish)?;
    Ok(())
}

#[test]
fn test_prompt_password_keyword() -> Result<()> {
    let (_dir, dir) = helpers::utf8_tempdir();
    let path = write(&dir, "init:\n  password: prompt\n");
    let config = load_config(&path)?;
    assert_eq!(config.init.password, Some(SecretSource::Prompt));
    Ok(())
}

#[test]
fn test_unknown_key_is_rejected() {
    let (_dir, dir) = helpers::utf8_tempdir();
    let path = write(&dir, "init:\n  devcie: /dev/sdb\n");
    let err = load_config(&path).unwrap_err();
    let report = format!("{:#}", err);
    assert!(report.contains("failed to parse yaml"), "got: {}", report);
    assert!(report.contains("devcie"), "got: {}", report);
}

#[test]
fn test_missing_file_names_the_path() {
    let (_dir, dir) = helpers::utf8_tempdir();
    let err = load_config(&dir.join("nope.yaml")).unwrap_err();
    assert!(err.to_string().contains("nope.yaml"));
}

#[test]
fn test_custom_etc_files_must_stay_below_etc() -> Result<()> {
    let (_dir, dir) = helpers::utf8_tempdir();
    let path = write(
        &dir,
        "target:\n  hostname: h\n  user: u\n  git_name: n\n  git_mail: m\n  \
         custom_etc_files: [../shadow]\nhost:\n  old_etc: /backup/etc\n",
    );
    let config = load_config(&path)?;
    let err = config.validate(StageKind::Finish).unwrap_err();
    assert!(matches!(err, ProvisionError::Config(_)));
    assert!(err.to_string().contains("../shadow"));
    Ok(())
}

#[test]
fn test_user_name_is_checked() -> Result<()> {
    let (_dir, dir) = helpers::utf8_tempdir();
    let path = write(
        &dir,
        "target:\n  user: \"j user\"\ninit:\n  device: /dev/sdb\n  password: prompt\n",
    );
    let config = load_config(&path)?;
    let err = config.validate(StageKind::Build).unwrap_err();
    assert!(err.to_string().contains("target.user"));
    Ok(())
}

#[test]
fn test_storage_requires_absolute_target_root() -> Result<()> {
    let (_dir, dir) = helpers::utf8_tempdir();
    let path = write(
        &dir,
        "init:\n  device: /dev/sdb\n  cryptsetup: false\n  target_root: mnt/new-root\n",
    );
    let config = load_config(&path)?;
    let err = config.validate_storage().unwrap_err();
    assert!(err.to_string().contains("init.target_root must be an absolute path"));
    Ok(())
}

#[test]
fn test_password_is_only_required_to_mount() -> Result<()> {
    let (_dir, dir) = helpers::utf8_tempdir();
    let path = write(&dir, "init:\n  device: /dev/sdb\n");
    let config = load_config(&path)?;
    assert!(config.init.cryptsetup);
    config.validate_storage()?;
    let err = config.validate_mount().unwrap_err();
    assert!(err.to_string().contains("init.password is required"));
    Ok(())
}

#[test]
fn test_demo_config_validates() -> Result<()> {
    let path = Utf8Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/system.yaml");
    let config = load_config(&path)?;
    assert!(config.is_mirrored());
    assert_eq!(config.init.password, Some(SecretSource::Prompt));
    assert_eq!(config.host.package_list, path.parent().unwrap().join("package.list"));

    config.validate(StageKind::Build)?;
    config.validate(StageKind::Finish)?;
    Ok(())
}
