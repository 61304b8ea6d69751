//! Session Store
//!
//! Tracks the single active session and retires it on close. Closed
//! sessions are kept in memory and, when a [`SessionLog`] is attached,
//! appended to disk as JSON lines.

use crate::state::FailureReason;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opaque session identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    /// Closed by the user
    Disconnected,
    /// Closed by a failure
    Failed(FailureReason),
}

/// One tunnel session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: String,
    pub server_id: String,
    pub started_at: SystemTime,
    /// Set once closed
    pub ended_at: Option<SystemTime>,
    pub bytes_transferred: u64,
    pub status: SessionStatus,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Time elapsed since start (until end, when closed)
    pub fn duration(&self) -> std::time::Duration {
        let end = self.ended_at.unwrap_or_else(SystemTime::now);
        end.duration_since(self.started_at).unwrap_or_default()
    }
}

/// Session store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("A session is already active")]
    AlreadyActive,

    #[error("No active session")]
    NoActiveSession,

    #[error("Session log error: {0}")]
    Log(String),
}

#[derive(Default)]
struct Records {
    current: Option<Session>,
    history: Vec<Session>,
}

/// Single active session plus closed history
#[derive(Default)]
pub struct SessionStore {
    records: Mutex<Records>,
    log: Option<SessionLog>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist closed sessions to `log`
    pub fn with_log(log: SessionLog) -> Self {
        Self {
            records: Mutex::default(),
            log: Some(log),
        }
    }

    fn records(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a session; fails if one is already open
    pub fn open(&self, user_id: &str, server_id: &str) -> Result<Session, SessionError> {
        let mut records = self.records();
        if records.current.is_some() {
            return Err(SessionError::AlreadyActive);
        }

        let session = Session {
            id: SessionId::new(),
            user_id: user_id.to_string(),
            server_id: server_id.to_string(),
            started_at: SystemTime::now(),
            ended_at: None,
            bytes_transferred: 0,
            status: SessionStatus::Active,
        };

        info!("Session {} opened ({} -> {})", session.id, user_id, server_id);
        records.current = Some(session.clone());
        Ok(session)
    }

    /// Add observed traffic to the open session (no-op when none)
    pub fn record_bytes(&self, delta: u64) {
        if delta == 0 {
            return;
        }
        if let Some(session) = self.records().current.as_mut() {
            session.bytes_transferred = session.bytes_transferred.saturating_add(delta);
        }
    }

    /// Close the open session normally
    pub fn close(&self) -> Result<Session, SessionError> {
        self.close_with(SessionStatus::Disconnected)
    }

    /// Close the open session with a terminal status
    pub fn close_with(&self, status: SessionStatus) -> Result<Session, SessionError> {
        let closed = self.retire(status)?;
        if let Some(log) = &self.log {
            if let Err(e) = log.append(&closed) {
                warn!("Could not persist session {}: {}", closed.id, e);
            }
        }
        Ok(closed)
    }

    /// Close the open session in memory only.
    ///
    /// The caller appends the result to [`SessionStore::log`] itself, e.g.
    /// from a blocking task.
    pub fn retire(&self, status: SessionStatus) -> Result<Session, SessionError> {
        let closed = {
            let mut records = self.records();
            let mut session = records.current.take().ok_or(SessionError::NoActiveSession)?;
            session.ended_at = Some(SystemTime::now());
            session.status = status;
            records.history.push(session.clone());
            session
        };

        info!(
            "Session {} closed ({:?}, {} bytes)",
            closed.id, closed.status, closed.bytes_transferred
        );
        Ok(closed)
    }

    /// Attached log, if any
    pub fn log(&self) -> Option<&SessionLog> {
        self.log.as_ref()
    }

    pub fn current(&self) -> Option<Session> {
        self.records().current.clone()
    }

    /// Sessions closed since this store was created, oldest first
    pub fn history(&self) -> Vec<Session> {
        self.records().history.clone()
    }
}

/// Append-only JSON-lines session log
#[derive(Debug, Clone)]
pub struct SessionLog {
    path: PathBuf,
}

impl SessionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, session: &Session) -> Result<(), SessionError> {
        let line = serde_json::to_string(session).map_err(|e| SessionError::Log(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| SessionError::Log(e.to_string()))?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SessionError::Log(format!("{}: {}", self.path.display(), e)))?;
        writeln!(file, "{}", line).map_err(|e| SessionError::Log(e.to_string()))?;

        debug!("Appended session {} to {}", session.id, self.path.display());
        Ok(())
    }

    /// Read every record; a missing file is an empty log
    pub fn load(&self) -> Result<Vec<Session>, SessionError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SessionError::Log(format!("{}: {}", self.path.display(), e))),
        };

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|e| SessionError::Log(format!("line {}: {}", i + 1, e)))
            })
            .collect()
    }
}
