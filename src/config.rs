//! YAML configuration of a provisioning run.
//!
//! The file has three sections: `target` describes the installed system,
//! `init` the storage and credentials used while building it from rescue
//! media, and `host` files carried over from a previous installation.
//! Unknown keys are rejected. Relative paths are resolved against the
//! directory containing the configuration file.

use std::fs::File;
use std::io::BufReader;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tracing::debug;

use crate::error::ProvisionError;
use crate::secret::SecretSource;
use crate::stage::StageKind;

fn default_true() -> bool {
    true
}

fn default_locale() -> String {
    "LANG=en_US.UTF-8".to_string()
}

fn default_timezone() -> String {
    "Europe/Berlin".to_string()
}

fn default_etc_mirror() -> Utf8PathBuf {
    "/root/etc-mirror".into()
}

fn default_shell() -> Utf8PathBuf {
    "/usr/bin/zsh".into()
}

fn default_target_root() -> Utf8PathBuf {
    "/mnt/new-root".into()
}

fn default_package_list() -> Utf8PathBuf {
    "package.list".into()
}

fn default_unpackage_list() -> Utf8PathBuf {
    "unpackage.list".into()
}

/// Fallback network settings for the default ethernet device.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Device name used when none is detected from `ip -o link`.
    #[serde(default)]
    pub eth: Option<String>,
    /// MAC address used together with `eth`.
    #[serde(default)]
    pub mac: Option<String>,
    /// Write a connection profile with an EUI-64 derived IPv6 address.
    #[serde(default = "default_true")]
    pub ipv6_eui64: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            eth: None,
            mac: None,
            ipv6_eui64: true,
        }
    }
}

/// The `target` section: the system being installed.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    #[serde(default)]
    pub hostname: Option<String>,
    /// Unprivileged login user created in the target.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Distribution release; queried with `rpm -E %fedora` when unset.
    #[serde(default)]
    pub release: Option<String>,
    /// Git directory tracking changes to `/etc`.
    #[serde(default = "default_etc_mirror")]
    pub etc_mirror: Utf8PathBuf,
    #[serde(default)]
    pub git_name: Option<String>,
    #[serde(default)]
    pub git_mail: Option<String>,
    /// Login shell for root and the user.
    #[serde(default = "default_shell")]
    pub shell: Utf8PathBuf,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub restore_postfix: bool,
    #[serde(default)]
    pub restore_postgres: bool,
    #[serde(default)]
    pub setup_pamu2f: bool,
    #[serde(default)]
    pub setup_nfsd: bool,
    #[serde(default = "default_true")]
    pub tune_power: bool,
    /// Paths relative to `/etc` restored from `host.old_etc`.
    #[serde(default)]
    pub custom_etc_files: Vec<String>,
    #[serde(default)]
    pub enable_services: Vec<String>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            user: None,
            locale: default_locale(),
            timezone: default_timezone(),
            release: None,
            etc_mirror: default_etc_mirror(),
            git_name: None,
            git_mail: None,
            shell: default_shell(),
            network: NetworkConfig::default(),
            restore_postfix: false,
            restore_postgres: false,
            setup_pamu2f: false,
            setup_nfsd: false,
            tune_power: true,
            custom_etc_files: Vec::new(),
            enable_services: Vec::new(),
        }
    }
}

/// The `init` section: storage and credentials for the build stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitConfig {
    /// Primary target block device.
    #[serde(default)]
    pub device: Option<Utf8PathBuf>,
    /// Second block device; when set, boot and root are mirrored.
    #[serde(default)]
    pub mirror: Option<Utf8PathBuf>,
    /// Encrypt the root partitions with LUKS.
    #[serde(default = "default_true")]
    pub cryptsetup: bool,
    #[serde(default)]
    pub password: Option<SecretSource>,
    /// Written to root's `authorized_keys` when set.
    #[serde(default)]
    pub authorized_keys: Option<String>,
    /// Where the new root filesystem is mounted.
    #[serde(default = "default_target_root")]
    pub target_root: Utf8PathBuf,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            device: None,
            mirror: None,
            cryptsetup: true,
            password: None,
            authorized_keys: None,
            target_root: default_target_root(),
        }
    }
}

/// The `host` section: files from a previous installation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    #[serde(default)]
    pub old_etc: Option<Utf8PathBuf>,
    #[serde(default)]
    pub old_var: Option<Utf8PathBuf>,
    #[serde(default = "default_package_list")]
    pub package_list: Utf8PathBuf,
    #[serde(default = "default_unpackage_list")]
    pub unpackage_list: Utf8PathBuf,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            old_etc: None,
            old_var: None,
            package_list: default_package_list(),
            unpackage_list: default_unpackage_list(),
        }
    }
}

/// A complete configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub init: InitConfig,
    #[serde(default)]
    pub host: HostConfig,
    /// Directory of the configuration file.
    #[serde(skip)]
    pub dir: Utf8PathBuf,
    /// The configuration file itself, empty when not loaded from a file.
    #[serde(skip)]
    pub path: Utf8PathBuf,
}

fn resolve(path: &mut Utf8PathBuf, base_dir: &Utf8Path) {
    if path.is_relative() {
        *path = base_dir.join(&*path);
    }
}

fn require<'a>(value: &'a Option<String>, key: &str) -> Result<&'a str, ProvisionError> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ProvisionError::Config(format!("{} is required", key))),
    }
}

fn validate_name(value: &str, key: &str) -> Result<(), ProvisionError> {
    if value.chars().any(|c| c.is_whitespace() || c == ':' || c == '/') {
        return Err(ProvisionError::Config(format!(
            "{} '{}' must not contain whitespace, ':' or '/'",
            key, value
        )));
    }
    Ok(())
}

fn validate_absolute(path: &Utf8Path, key: &str) -> Result<(), ProvisionError> {
    if !path.is_absolute() {
        return Err(ProvisionError::Config(format!(
            "{} must be an absolute path: {}",
            key, path
        )));
    }
    Ok(())
}

impl Config {
    /// Resolves relative paths against `base_dir` and canonicalizes device
    /// paths that exist (so `/dev/disk/by-id/...` links become `/dev/sdX`).
    pub fn resolve_paths(&mut self, base_dir: &Utf8Path) {
        self.dir = base_dir.to_owned();
        if let Some(password) = &mut self.init.password {
            password.resolve_paths(base_dir);
        }
        for dev in [&mut self.init.device, &mut self.init.mirror].into_iter().flatten() {
            if let Ok(real) = dev.canonicalize_utf8() {
                debug!("resolved device {} to {}", dev, real);
                *dev = real;
            }
        }
        for path in [&mut self.host.old_etc, &mut self.host.old_var].into_iter().flatten() {
            resolve(path, base_dir);
        }
        resolve(&mut self.host.package_list, base_dir);
        resolve(&mut self.host.unpackage_list, base_dir);
    }

    /// Returns the target block devices, primary first.
    pub fn devices(&self) -> Vec<Utf8PathBuf> {
        self.init
            .device
            .iter()
            .chain(self.init.mirror.iter())
            .cloned()
            .collect()
    }

    /// Returns true if boot and root are mirrored across two devices.
    pub fn is_mirrored(&self) -> bool {
        self.init.mirror.is_some()
    }

    /// Returns the configured login user.
    pub fn user(&self) -> Result<&str, ProvisionError> {
        require(&self.target.user, "target.user")
    }

    /// Returns the configured hostname.
    pub fn hostname(&self) -> Result<&str, ProvisionError> {
        require(&self.target.hostname, "target.hostname")
    }

    /// Returns `host.old_etc`, which `feature` depends on.
    pub fn old_etc(&self, feature: &str) -> Result<&Utf8Path, ProvisionError> {
        self.host.old_etc.as_deref().ok_or_else(|| {
            ProvisionError::Config(format!("host.old_etc is required by {}", feature))
        })
    }

    /// Checks the keys `stage` needs before anything is executed.
    pub fn validate(&self, stage: StageKind) -> Result<(), ProvisionError> {
        match stage {
            StageKind::Build => self.validate_build(),
            StageKind::Finish => self.validate_finish(),
        }
    }

    /// Checks the keys needed to tear down the storage stack.
    pub fn validate_storage(&self) -> Result<(), ProvisionError> {
        let device = self
            .init
            .device
            .as_deref()
            .ok_or_else(|| ProvisionError::Config("init.device is required".to_string()))?;
        validate_absolute(device, "init.device")?;
        if let Some(mirror) = &self.init.mirror {
            validate_absolute(mirror, "init.mirror")?;
            if mirror == device {
                return Err(ProvisionError::Config(format!(
                    "init.mirror must differ from init.device: {}",
                    mirror
                )));
            }
        }
        validate_absolute(&self.init.target_root, "init.target_root")?;
        if self.init.target_root == "/" {
            return Err(ProvisionError::Config(
                "init.target_root must not be the root directory".to_string(),
            ));
        }
        Ok(())
    }

    /// Checks the keys needed to open and mount the storage stack.
    pub fn validate_mount(&self) -> Result<(), ProvisionError> {
        self.validate_storage()?;
        if self.init.cryptsetup && self.init.password.is_none() {
            return Err(ProvisionError::Config(
                "init.password is required when init.cryptsetup is enabled".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_build(&self) -> Result<(), ProvisionError> {
        self.validate_mount()?;
        if self.init.password.is_none() {
            return Err(ProvisionError::Config(
                "init.password is required to set the account passwords".to_string(),
            ));
        }
        validate_name(self.user()?, "target.user")?;
        Ok(())
    }

    fn validate_finish(&self) -> Result<(), ProvisionError> {
        validate_name(self.hostname()?, "target.hostname")?;
        validate_name(self.user()?, "target.user")?;
        require(&self.target.git_name, "target.git_name")?;
        require(&self.target.git_mail, "target.git_mail")?;
        validate_absolute(&self.target.etc_mirror, "target.etc_mirror")?;
        validate_absolute(&self.target.shell, "target.shell")?;
        if self.target.restore_postfix {
            self.old_etc("target.restore_postfix")?;
        }
        if self.target.setup_pamu2f {
            self.old_etc("target.setup_pamu2f")?;
        }
        if !self.target.custom_etc_files.is_empty() {
            self.old_etc("target.custom_etc_files")?;
            for file in &self.target.custom_etc_files {
                let path = Utf8Path::new(file);
                if path.is_absolute()
                    || path.components().any(|c| c == camino::Utf8Component::ParentDir)
                {
                    return Err(ProvisionError::Config(format!(
                        "target.custom_etc_files entry '{}' must be relative to /etc \
                        without '..' components",
                        file
                    )));
                }
            }
        }
        if self.target.restore_postgres && self.host.old_var.is_none() {
            return Err(ProvisionError::Config(
                "host.old_var is required by target.restore_postgres".to_string(),
            ));
        }
        if self.target.network.eth.is_some() != self.target.network.mac.is_some() {
            return Err(ProvisionError::Config(
                "target.network.eth and target.network.mac must be set together".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads a configuration file and resolves its relative paths.
pub fn load_config(path: &Utf8Path) -> Result<Config> {
    let file = File::open(path).with_context(|| format!("failed to load file: {}", path))?;
    let reader = BufReader::new(file);
    let mut config: Config = serde_yaml::from_reader(reader)
        .with_context(|| format!("failed to parse yaml: {}", path))?;
    let base_dir = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent.to_owned(),
        _ => Utf8PathBuf::from("."),
    };
    config.resolve_paths(&base_dir);
    config.path = path.to_owned();
    Ok(config)
}
