use std::collections::BTreeSet;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use rsprovision::config::Config;
use rsprovision::context::ProvisionContext;
use rsprovision::executor::{CommandExecutor, CommandSpec, ExecutionResult};
use rsprovision::ledger::Ledger;
use rsprovision::probe::SystemProbe;
use rsprovision::secret::{Secret, SecretCache};
use rsprovision::storage::mount_table::MountEntry;

/// Password handed to every test context.
#[allow(dead_code)]
pub const PASSWORD: &str = "correct horse battery staple";

/// One command seen by [`FakeSystem`].
#[derive(Debug, Clone)]
pub struct Call {
    pub argv: Vec<String>,
    /// The redacted, loggable form of the call.
    pub line: String,
    /// Raw standard input as the child would have received it.
    pub stdin: Option<String>,
}

impl Call {
    #[allow(dead_code)]
    pub fn joined(&self) -> String {
        self.argv.join(" ")
    }
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    mounts: Vec<MountEntry>,
    paths: BTreeSet<Utf8PathBuf>,
    failures: Vec<String>,
}

/// Simulated host: records every command and applies the side effects of
/// mount, cryptsetup, mdadm and btrfs calls to an in-memory model that its
/// probe reports back.
#[derive(Default)]
pub struct FakeSystem {
    state: Mutex<State>,
}

#[allow(dead_code)]
impl FakeSystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every command whose joined argv starts with `prefix` exit 1.
    pub fn fail_on(&self, prefix: impl Into<String>) {
        self.state.lock().unwrap().failures.push(prefix.into());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    pub fn add_mount(&self, source: &str, target: impl Into<Utf8PathBuf>) {
        self.state.lock().unwrap().mounts.push(MountEntry {
            source: source.to_string(),
            target: target.into(),
            fstype: "none".to_string(),
            options: "rw".to_string(),
        });
    }

    pub fn add_path(&self, path: impl Into<Utf8PathBuf>) {
        self.state.lock().unwrap().paths.insert(path.into());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Joined argv of every call whose program is `program`.
    pub fn calls_to(&self, program: &str) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|c| c.argv.first().is_some_and(|p| p == program))
            .map(Call::joined)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn mounted_targets(&self) -> Vec<Utf8PathBuf> {
        let state = self.state.lock().unwrap();
        state.mounts.iter().map(|m| m.target.clone()).collect()
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.state.lock().unwrap().paths.contains(Utf8Path::new(path))
    }
}

fn status(code: i32) -> Option<ExitStatus> {
    Some(ExitStatus::from_raw(code << 8))
}

fn failed(code: i32, stderr: &str) -> ExecutionResult {
    ExecutionResult {
        status: status(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn value_after<'a>(argv: &'a [String], flag: &str) -> Option<&'a str> {
    argv.iter()
        .position(|a| a == flag)
        .and_then(|i| argv.get(i + 1))
        .map(String::as_str)
}

impl State {
    fn apply(&mut self, argv: &[String]) -> ExecutionResult {
        let args: Vec<&str> = argv.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["mount", .., source, target] => {
                self.mounts.push(MountEntry {
                    source: source.to_string(),
                    target: Utf8PathBuf::from(*target),
                    fstype: "none".to_string(),
                    options: "rw".to_string(),
                });
            }
            ["umount", target] => {
                let Some(pos) = self.mounts.iter().rposition(|m| m.target == *target) else {
                    return failed(32, &format!("umount: {}: not mounted.", target));
                };
                self.mounts.remove(pos);
            }
            ["cryptsetup", "luksOpen", _, name, ..] => {
                self.paths.insert(format!("/dev/mapper/{}", name).into());
            }
            ["cryptsetup", "luksClose", name] => {
                if !self.paths.remove(Utf8Path::new(&format!("/dev/mapper/{}", name))) {
                    return failed(4, &format!("Device {} is not active.", name));
                }
            }
            ["cryptsetup", "luksFormat", ..] => {
                if let Some(uuid) = value_after(argv, "--uuid") {
                    self.paths.insert(format!("/dev/disk/by-uuid/{}", uuid).into());
                }
            }
            ["mdadm", "--create", md, ..] => {
                self.paths.insert(Utf8PathBuf::from(*md));
            }
            ["mdadm", "--stop", md] => {
                self.paths.remove(Utf8Path::new(md));
            }
            ["btrfs", "subvolume", "create", path] => {
                self.paths.insert(Utf8PathBuf::from(*path));
            }
            _ => {}
        }
        ExecutionResult {
            status: status(0),
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

impl CommandExecutor for FakeSystem {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        let argv = spec.effective_argv();
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            argv: argv.clone(),
            line: spec.display_line(),
            stdin: spec
                .stdin
                .as_ref()
                .map(|s| String::from_utf8_lossy(s.as_bytes()).into_owned()),
        });
        let joined = argv.join(" ");
        if state.failures.iter().any(|prefix| joined.starts_with(prefix.as_str())) {
            return Ok(failed(1, "simulated failure"));
        }
        Ok(state.apply(&argv))
    }
}

impl SystemProbe for FakeSystem {
    fn mount_table(&self) -> Result<Vec<MountEntry>> {
        Ok(self.state.lock().unwrap().mounts.clone())
    }

    fn path_exists(&self, path: &Utf8Path) -> bool {
        self.state.lock().unwrap().paths.contains(path)
    }
}

/// Parses `yaml` and points the target root at `root`.
#[allow(dead_code)]
pub fn config(yaml: &str, root: &Utf8Path) -> Config {
    let mut config: Config = serde_yaml::from_str(yaml).expect("test config should parse");
    config.init.target_root = root.to_owned();
    config
}

/// A context running against `system` with a state file in `state_dir`.
#[allow(dead_code)]
pub fn context(system: &Arc<FakeSystem>, config: Config, state_dir: &Utf8Path) -> ProvisionContext {
    let ledger = Ledger::load(&state_dir.join("provision.state")).expect("ledger should load");
    let executor: Arc<dyn CommandExecutor> = system.clone();
    let probe: Arc<dyn SystemProbe> = system.clone();
    ProvisionContext::new(config, ledger, executor, probe)
        .with_secret(SecretCache::preloaded(Secret::new(PASSWORD)))
}

/// A temporary directory with a UTF-8 path.
#[allow(dead_code)]
pub fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("tempdir is UTF-8");
    (dir, path)
}

/// Single-device layout with LUKS.
#[allow(dead_code)]
pub const SINGLE_YAML: &str = "
target:
  user: juser
init:
  device: /dev/sdb
  password: prompt
";

/// Mirrored layout with LUKS.
#[allow(dead_code)]
pub const MIRRORED_YAML: &str = "
target:
  user: juser
init:
  device: /dev/sdb
  mirror: /dev/sdc
  password: prompt
";
