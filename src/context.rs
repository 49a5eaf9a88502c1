//! Explicit state shared by every task of a run.
//!
//! [`ProvisionContext`] bundles the resolved configuration, the completion
//! ledger, the command executor, the system probe and the password cache.
//! Tasks and storage operations receive it as `&mut ProvisionContext`.

use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::config::Config;
use crate::executor::{CommandExecutor, CommandSpec, ExecutionResult, run_checked};
use crate::ledger::{Ledger, ResourceIds};
use crate::probe::SystemProbe;
use crate::secret::{Secret, SecretCache};
use crate::stage::StageKind;

pub struct ProvisionContext {
    pub config: Config,
    pub ledger: Ledger,
    executor: Arc<dyn CommandExecutor>,
    probe: Arc<dyn SystemProbe>,
    secret: SecretCache,
    dry_run: bool,
    sysroot: Utf8PathBuf,
}

impl ProvisionContext {
    /// Creates a context. The password cache reads `init.password` lazily.
    pub fn new(
        config: Config,
        ledger: Ledger,
        executor: Arc<dyn CommandExecutor>,
        probe: Arc<dyn SystemProbe>,
    ) -> Self {
        let secret = SecretCache::new(config.init.password.clone());
        Self {
            config,
            ledger,
            executor,
            probe,
            secret,
            dry_run: false,
            sysroot: Utf8PathBuf::from("/"),
        }
    }

    /// Logs commands instead of running them; probes are bypassed and no
    /// files are written.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[must_use]
    pub fn with_secret(mut self, secret: SecretCache) -> Self {
        self.secret = secret;
        self
    }

    /// Prefixes host paths that tasks read or write directly (default `/`).
    #[must_use]
    pub fn with_sysroot(mut self, sysroot: impl Into<Utf8PathBuf>) -> Self {
        self.sysroot = sysroot.into();
        self
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn probe(&self) -> &dyn SystemProbe {
        self.probe.as_ref()
    }

    /// Runs a command; a non-zero exit is returned, not raised.
    pub fn run(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        debug!("calling: {}", spec.display_line());
        self.executor.execute(spec)
    }

    /// Runs a command and raises `CommandFailed` on a non-zero exit.
    pub fn must(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        debug!("calling: {}", spec.display_line());
        run_checked(self.executor.as_ref(), spec)
    }

    /// Returns the password, reading it on first use.
    pub fn secret(&mut self) -> Result<Secret> {
        self.secret.get().context("failed to obtain the password")
    }

    /// Mount point of the new root filesystem.
    pub fn target_root(&self) -> &Utf8Path {
        &self.config.init.target_root
    }

    /// Returns `path` inside the new root filesystem.
    pub fn target_path(&self, path: &str) -> Utf8PathBuf {
        self.target_root().join(path.trim_start_matches('/'))
    }

    /// Returns the location of an absolute host path, honouring the sysroot.
    pub fn host_path(&self, path: &str) -> Utf8PathBuf {
        self.sysroot.join(path.trim_start_matches('/'))
    }

    /// Returns the storage identifiers recorded by the build stage.
    pub fn storage_ids(&self) -> &ResourceIds {
        self.ledger.resources(StageKind::Build.as_ref())
    }

    /// Records storage identifiers under the build stage and persists.
    pub fn record_storage_ids<F>(&mut self, update: F) -> Result<()>
    where
        F: FnOnce(&mut ResourceIds),
    {
        self.ledger
            .update_resources(StageKind::Build.as_ref(), update)
            .context("failed to record storage identifiers")
    }

    /// Returns the distribution release, querying `rpm` when not configured.
    pub fn release(&self) -> Result<String> {
        if let Some(release) = &self.config.target.release {
            return Ok(release.clone());
        }
        let result = self.must(&CommandSpec::new("rpm", ["-E", "%fedora"]))?;
        let release = result.stdout.trim().to_string();
        if release.is_empty() && !self.dry_run {
            anyhow::bail!("rpm -E %fedora printed no release");
        }
        Ok(release)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RealCommandExecutor;
    use crate::probe::HostProbe;

    fn context() -> ProvisionContext {
        ProvisionContext::new(
            Config::default(),
            Ledger::in_memory(),
            Arc::new(RealCommandExecutor { dry_run: true }),
            Arc::new(HostProbe),
        )
    }

    #[test]
    fn target_and_host_paths() {
        let ctx = context().with_sysroot("/tmp/sysroot");
        assert_eq!(ctx.target_path("/etc/fstab"), "/mnt/new-root/etc/fstab");
        assert_eq!(ctx.target_path("root"), "/mnt/new-root/root");
        assert_eq!(ctx.host_path("/etc/hosts"), "/tmp/sysroot/etc/hosts");
    }

    #[test]
    fn release_from_config() {
        let mut ctx = context();
        ctx.config.target.release = Some("41".to_string());
        assert_eq!(ctx.release().unwrap(), "41");
    }

    #[test]
    fn storage_ids_live_under_build_stage() {
        let mut ctx = context();
        ctx.record_storage_ids(|ids| {
            ids.fs_uuid.insert("boot".to_string(), "u".to_string());
        })
        .unwrap();
        assert_eq!(ctx.storage_ids().fs_uuid["boot"], "u");
        assert!(ctx.ledger.resources("finish").is_empty());
    }

    #[test]
    fn secret_without_source_fails() {
        let mut ctx = context();
        let err = ctx.secret().unwrap_err();
        assert!(format!("{:#}", err).contains("init.password"));
    }
}
