//! Session tokens, activity tracking, and the on-disk workspace layout.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, WorkspaceError};
use crate::sanitize;
use crate::workspace::Workspaces;

/// Opaque, server-generated session identifier.
///
/// Tokens are UUID v4 values. Parsing rejects anything else, so a token
/// taken from a request can be joined onto the uploads root safely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken(Uuid);

impl SessionToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for SessionToken {
    type Err = WorkspaceError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| WorkspaceError::InvalidToken(s.to_string()))
    }
}

/// Source of "now" for activity timestamps.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Activity map for live sessions plus the directory layout under the
/// uploads root.
///
/// The lock covers map reads and writes only. Directory creation happens
/// before the entry is inserted and deletion is left to the caller, so no
/// filesystem work runs while the lock is held.
pub struct WorkspaceStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    sessions: Mutex<HashMap<SessionToken, Instant>>,
}

impl WorkspaceStore {
    pub fn new(root: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let root = sanitize::absolutize(root.as_ref())
            .map_err(|e| WorkspaceError::io("resolve uploads root", e))?;
        Ok(Self {
            root,
            clock,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Absolute uploads root every workspace lives under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for `token`. Does not check that it exists.
    pub fn dir_of(&self, token: &SessionToken) -> PathBuf {
        self.root.join(token.to_string())
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Allocate a new session and create its directory.
    pub async fn create(&self) -> Result<SessionToken> {
        let token = SessionToken::generate();
        let dir = self.dir_of(&token);

        tokio::task::spawn_blocking({
            let dir = dir.clone();
            move || std::fs::create_dir_all(&dir)
        })
        .await?
        .map_err(|e| WorkspaceError::io(format!("mkdir {}", dir.display()), e))?;

        let now = self.clock.now();
        self.sessions.lock().await.insert(token, now);
        info!(session = %token, dir = %dir.display(), "Created workspace");
        Ok(token)
    }

    /// Record activity for `token`. Unknown tokens are ignored.
    pub async fn touch(&self, token: &SessionToken) {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock().await;
        if let Some(last_active) = sessions.get_mut(token) {
            *last_active = now;
        } else {
            debug!(session = %token, "Touch for unknown session ignored");
        }
    }

    /// Forget `token`. The directory is left for the caller to delete.
    pub async fn remove(&self, token: &SessionToken) -> bool {
        self.sessions.lock().await.remove(token).is_some()
    }

    pub async fn contains(&self, token: &SessionToken) -> bool {
        self.sessions.lock().await.contains_key(token)
    }

    /// Tokens whose last activity is strictly older than `timeout` before `now`.
    pub async fn expired(&self, now: Instant, timeout: Duration) -> Vec<SessionToken> {
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .filter(|(_, last_active)| now.saturating_duration_since(**last_active) > timeout)
            .map(|(token, _)| *token)
            .collect()
    }

    /// Snapshot of every live session and its last activity.
    pub async fn snapshot(&self) -> Vec<(SessionToken, Instant)> {
        let sessions = self.sessions.lock().await;
        sessions.iter().map(|(t, at)| (*t, *at)).collect()
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub workspaces: Arc<Workspaces>,
}

impl AppState {
    pub fn new(workspaces: Workspaces) -> Self {
        Self {
            workspaces: Arc::new(workspaces),
        }
    }
}
