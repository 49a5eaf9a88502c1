//! The provisioning password.
//!
//! The password is read at most once per run and handed out as a [`Secret`],
//! whose `Debug` output is the redaction marker. Commands receive it only as
//! sensitive standard input, so it never reaches argv, logs or the state file.

use std::fmt;
use std::fs;
use std::io::{self, BufRead, Write};
use std::os::fd::{AsFd, BorrowedFd};

use camino::{Utf8Path, Utf8PathBuf};
use rustix::termios::{self, LocalModes, OptionalActions, Termios};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ProvisionError;
use crate::executor::REDACTED;

/// A password value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the cleartext. Only for feeding sensitive stdin.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", REDACTED)
    }
}

/// Where the password comes from.
///
/// In YAML either `{ file: path }` or the plain word `prompt`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "SecretSourceRepr")]
pub enum SecretSource {
    /// First line of a file, surrounding whitespace stripped.
    File(Utf8PathBuf),
    /// One line read from standard input.
    Prompt,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SecretSourceRepr {
    File {
        file: Utf8PathBuf,
    },
    Keyword(PromptKeyword),
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum PromptKeyword {
    Prompt,
}

impl From<SecretSourceRepr> for SecretSource {
    fn from(repr: SecretSourceRepr) -> Self {
        match repr {
            SecretSourceRepr::File { file } => Self::File(file),
            SecretSourceRepr::Keyword(PromptKeyword::Prompt) => Self::Prompt,
        }
    }
}

impl SecretSource {
    /// Resolves a relative password file against `base_dir`.
    pub fn resolve_paths(&mut self, base_dir: &Utf8Path) {
        if let Self::File(path) = self
            && path.is_relative()
        {
            *path = base_dir.join(&*path);
        }
    }

    fn read(&self) -> Result<Secret, ProvisionError> {
        match self {
            Self::File(path) => {
                debug!("reading password from {}", path);
                let content = fs::read_to_string(path).map_err(|e| {
                    ProvisionError::io(format!("failed to read password file: {}", path), e)
                })?;
                first_line(&content).ok_or_else(|| {
                    ProvisionError::Config(format!("password file {} is empty", path))
                })
            }
            Self::Prompt => {
                let mut stderr = io::stderr();
                write!(stderr, "Password: ")
                    .and_then(|()| stderr.flush())
                    .map_err(|e| ProvisionError::io("failed to write password prompt", e))?;
                let stdin = io::stdin();
                let secret = {
                    let _echo = EchoGuard::disable(stdin.as_fd())?;
                    read_line(&mut stdin.lock())
                };
                // the newline typed by the user was not echoed
                writeln!(stderr)
                    .map_err(|e| ProvisionError::io("failed to write password prompt", e))?;
                secret
            }
        }
    }
}

/// Turns terminal echo off on `fd` until dropped. A descriptor that is not a
/// terminal is left alone.
struct EchoGuard<'a> {
    fd: BorrowedFd<'a>,
    saved: Option<Termios>,
}

impl<'a> EchoGuard<'a> {
    fn disable(fd: BorrowedFd<'a>) -> Result<Self, ProvisionError> {
        if !termios::isatty(fd) {
            return Ok(Self { fd, saved: None });
        }
        let saved = termios::tcgetattr(fd)
            .map_err(|e| ProvisionError::io("failed to read terminal attributes", e.into()))?;
        let mut silent = saved.clone();
        silent.local_modes.remove(LocalModes::ECHO);
        termios::tcsetattr(fd, OptionalActions::Now, &silent)
            .map_err(|e| ProvisionError::io("failed to turn off terminal echo", e.into()))?;
        Ok(Self {
            fd,
            saved: Some(saved),
        })
    }
}

impl Drop for EchoGuard<'_> {
    fn drop(&mut self) {
        if let Some(saved) = &self.saved
            && let Err(e) = termios::tcsetattr(self.fd, OptionalActions::Now, saved)
        {
            warn!("failed to restore terminal echo: {}", e);
        }
    }
}

fn first_line(content: &str) -> Option<Secret> {
    content
        .lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(Secret::new)
}

/// Reads one password line from `reader`.
pub(crate) fn read_line(reader: &mut dyn BufRead) -> Result<Secret, ProvisionError> {
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .map_err(|e| ProvisionError::io("failed to read password from stdin".to_string(), e))?;
    first_line(&line)
        .ok_or_else(|| ProvisionError::Config("no password entered on stdin".to_string()))
}

/// Read-once cache in front of a [`SecretSource`].
#[derive(Debug)]
pub struct SecretCache {
    source: Option<SecretSource>,
    cached: Option<Secret>,
}

impl SecretCache {
    pub fn new(source: Option<SecretSource>) -> Self {
        Self {
            source,
            cached: None,
        }
    }

    /// A cache that already holds `secret` and never reads a source.
    pub fn preloaded(secret: Secret) -> Self {
        Self {
            source: None,
            cached: Some(secret),
        }
    }

    /// Returns the password, reading the source on first use.
    pub fn get(&mut self) -> Result<Secret, ProvisionError> {
        if let Some(secret) = &self.cached {
            return Ok(secret.clone());
        }
        let source = self.source.as_ref().ok_or_else(|| {
            ProvisionError::Config("init.password is required but not configured".to_string())
        })?;
        let secret = source.read()?;
        self.cached = Some(secret.clone());
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_is_redacted() {
        let secret = Secret::new("hunter2");
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains(REDACTED));
    }

    #[test]
    fn file_source_reads_first_line_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("pw")).unwrap();
        fs::write(&path, "  hunter2 \nsecond line\n").unwrap();

        let mut cache = SecretCache::new(Some(SecretSource::File(path.clone())));
        assert_eq!(cache.get().unwrap().expose(), "hunter2");

        // Cached: the file is not read again.
        fs::remove_file(&path).unwrap();
        assert_eq!(cache.get().unwrap().expose(), "hunter2");
    }

    #[test]
    fn empty_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("pw")).unwrap();
        fs::write(&path, "\n").unwrap();
        let mut cache = SecretCache::new(Some(SecretSource::File(path)));
        assert!(matches!(cache.get().unwrap_err(), ProvisionError::Config(_)));
    }

    #[test]
    fn missing_source_is_a_config_error() {
        let mut cache = SecretCache::new(None);
        let err = cache.get().unwrap_err();
        assert!(err.to_string().contains("init.password"));
    }

    #[test]
    fn read_line_trims_newline() {
        let mut input: &[u8] = b"hunter2\n";
        assert_eq!(read_line(&mut input).unwrap().expose(), "hunter2");
    }

    #[test]
    fn echo_guard_ignores_non_terminals() {
        let file = tempfile::tempfile().unwrap();
        let guard = EchoGuard::disable(file.as_fd()).unwrap();
        assert!(guard.saved.is_none());
    }

    #[test]
    fn echo_guard_restores_terminal_echo() {
        use rustix::fs::{Mode, OFlags};
        use rustix::pty::{self, OpenptFlags};

        // Needs a pseudo terminal; environments without /dev/ptmx skip this.
        let Ok(master) = pty::openpt(OpenptFlags::RDWR | OpenptFlags::NOCTTY) else {
            return;
        };
        pty::grantpt(&master).unwrap();
        pty::unlockpt(&master).unwrap();
        let name = pty::ptsname(&master, Vec::new()).unwrap();
        let tty = rustix::fs::open(name.as_c_str(), OFlags::RDWR | OFlags::NOCTTY, Mode::empty())
            .unwrap();
        let echo_on = || {
            let modes = termios::tcgetattr(&tty).unwrap().local_modes;
            modes.contains(LocalModes::ECHO)
        };
        assert!(echo_on());

        {
            let guard = EchoGuard::disable(tty.as_fd()).unwrap();
            assert!(guard.saved.is_some());
            assert!(!echo_on());
        }
        assert!(echo_on());
    }

    #[test]
    fn deserializes_file_and_prompt() {
        let file: SecretSource = serde_yaml::from_str("file: /root/pw").unwrap();
        assert_eq!(file, SecretSource::File("/root/pw".into()));
        let prompt: SecretSource = serde_yaml::from_str("prompt").unwrap();
        assert_eq!(prompt, SecretSource::Prompt);
        assert!(serde_yaml::from_str::<SecretSource>("ask").is_err());
    }

    #[test]
    fn resolve_paths_joins_relative_file() {
        let mut source = SecretSource::File("pw.txt".into());
        source.resolve_paths(Utf8Path::new("/srv/provision"));
        assert_eq!(source, SecretSource::File("/srv/provision/pw.txt".into()));
    }
}
