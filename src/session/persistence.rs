// ABOUTME: Per-process devstate files recording which sessions this process runs
// Lets a second process detect that a platform is already in use and find orphaned files

use crate::models::{ForwardedPort, Mode, Platform, SessionId};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

lazy_static! {
    static ref STATE_FILE: Regex = Regex::new(r"^devstate\.([0-9]+)\.json$").unwrap();
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode session state: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("a {mode} session is already running on platform {platform} in process {pid}")]
    AlreadyRunningOnPlatform {
        platform: Platform,
        mode: Mode,
        pid: i32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub component: String,
    pub platform: Platform,
    pub mode: Mode,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub forwarded_ports: Vec<ForwardedPort>,
}

/// Content of one `devstate.<pid>.json` file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevState {
    pub pid: i32,
    #[serde(default)]
    pub sessions: Vec<SessionRecord>,
}

/// Reports whether a process id is alive.
pub type Liveness = fn(i32) -> bool;

pub fn pid_exists(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // Exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
    pid: i32,
    liveness: Liveness,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pid: std::process::id() as i32,
            liveness: pid_exists,
        }
    }

    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_liveness(mut self, liveness: Liveness) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("devstate.{}.json", self.pid))
    }

    /// Add `record` to this process's file, failing if another live process already
    /// runs a session of the same mode on the same platform.
    pub fn save(&self, record: SessionRecord) -> Result<PathBuf, PersistenceError> {
        self.check_platform_free(record.platform, record.mode)?;

        let path = self.path();
        let mut state = self.read_own()?;
        state.pid = self.pid;
        state.sessions.retain(|existing| existing.session_id != record.session_id);
        state.sessions.push(record);
        self.write(&path, &state)?;
        debug!("Saved dev state to {}", path.display());
        Ok(path)
    }

    /// Drop a session from this process's file, deleting the file once it is empty.
    pub fn remove(&self, session_id: SessionId) -> Result<(), PersistenceError> {
        let path = self.path();
        let mut state = self.read_own()?;
        state.sessions.retain(|record| record.session_id != session_id);

        if state.sessions.is_empty() {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed dev state file {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(PersistenceError::Io { path, source }),
            }
            return Ok(());
        }
        self.write(&path, &state)
    }

    pub fn check_platform_free(&self, platform: Platform, mode: Mode) -> Result<(), PersistenceError> {
        for (_, state) in self.entries()? {
            if state.pid == self.pid || !(self.liveness)(state.pid) {
                continue;
            }
            let busy = state
                .sessions
                .iter()
                .any(|record| record.platform == platform && record.mode == mode);
            if busy {
                return Err(PersistenceError::AlreadyRunningOnPlatform {
                    platform,
                    mode,
                    pid: state.pid,
                });
            }
        }
        Ok(())
    }

    /// Platform of a live process's `mode` session of `component`, if one is recorded.
    pub fn active_platform(
        &self,
        component: &str,
        mode: Mode,
    ) -> Result<Option<Platform>, PersistenceError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|(_, state)| state.pid == self.pid || (self.liveness)(state.pid))
            .flat_map(|(_, state)| state.sessions)
            .find(|record| record.component == component && record.mode == mode)
            .map(|record| record.platform))
    }

    /// State files left behind by processes that are no longer alive.
    pub fn orphans(&self) -> Result<Vec<PathBuf>, PersistenceError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|(_, state)| state.pid != self.pid && !(self.liveness)(state.pid))
            .map(|(path, _)| path)
            .collect())
    }

    fn entries(&self) -> Result<Vec<(PathBuf, DevState)>, PersistenceError> {
        let dir = match fs::read_dir(&self.dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut entries = Vec::new();
        for entry in dir.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(captures) = STATE_FILE.captures(&name) else {
                continue;
            };
            let path = entry.path();
            let file_pid = captures[1].parse::<i32>().unwrap_or_default();
            let mut state = match fs::read_to_string(&path) {
                Ok(content) => serde_json::from_str::<DevState>(&content).unwrap_or_else(|e| {
                    warn!("Ignoring unreadable state file {}: {}", path.display(), e);
                    DevState::default()
                }),
                Err(e) => {
                    warn!("Failed to read state file {}: {}", path.display(), e);
                    continue;
                }
            };
            if state.pid == 0 {
                state.pid = file_pid;
            }
            entries.push((path, state));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    fn read_own(&self) -> Result<DevState, PersistenceError> {
        let path = self.path();
        match fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(&content).unwrap_or_default()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DevState::default()),
            Err(source) => Err(PersistenceError::Io { path, source }),
        }
    }

    fn write(&self, path: &Path, state: &DevState) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir).map_err(|source| PersistenceError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let json = serde_json::to_string_pretty(state)?;
        fs::write(path, json).map_err(|source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
