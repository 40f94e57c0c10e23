//! Workspace operations exposed to the request layer.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::deleter::Deleter;
use crate::error::{Result, WorkspaceError};
use crate::orchestrator::{Orchestrator, OutputStream, Verb};
use crate::sanitize::{self, sanitize};
use crate::state::{SessionToken, WorkspaceStore};
use crate::variables::{
    apply_values, render_values, VariableDeclaration, VariableParser, DECLARATIONS_FILE,
    VALUES_FILE,
};

/// A file submitted by the client: its raw (untrusted) name and content.
#[derive(Debug, Clone)]
pub struct UploadedEntry {
    pub name: String,
    pub content: Vec<u8>,
}

impl UploadedEntry {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// One live session as reported by [`Workspaces::sessions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub token: SessionToken,
    pub idle: Duration,
}

/// Owns the session store and everything that acts on workspace directories.
pub struct Workspaces {
    store: WorkspaceStore,
    deleter: Arc<dyn Deleter>,
    orchestrator: Orchestrator,
    parser: Arc<dyn VariableParser>,
}

impl Workspaces {
    pub fn new(
        store: WorkspaceStore,
        deleter: Arc<dyn Deleter>,
        orchestrator: Orchestrator,
        parser: Arc<dyn VariableParser>,
    ) -> Self {
        Self {
            store,
            deleter,
            orchestrator,
            parser,
        }
    }

    pub fn store(&self) -> &WorkspaceStore {
        &self.store
    }

    pub fn dir_of(&self, token: &SessionToken) -> PathBuf {
        self.store.dir_of(token)
    }

    pub async fn create_workspace(&self) -> Result<SessionToken> {
        self.store.create().await
    }

    pub async fn touch(&self, token: &SessionToken) {
        self.store.touch(token).await;
    }

    /// Create a workspace and store `entries` in it.
    ///
    /// Fails without leaving a workspace behind when there is nothing to
    /// upload or an entry is rejected.
    pub async fn create_with_uploads(&self, entries: Vec<UploadedEntry>) -> Result<SessionToken> {
        if entries.is_empty() {
            return Err(WorkspaceError::NoFiles);
        }

        let token = self.create_workspace().await?;
        if let Err(e) = self.save_uploaded_entries(&token, entries).await {
            warn!(session = %token, error = %e, "Upload rejected, discarding workspace");
            self.explicit_cleanup(&token).await;
            return Err(e);
        }
        Ok(token)
    }

    /// Write uploaded files into the workspace of `token`.
    ///
    /// Stops at the first entry whose name would land outside the workspace;
    /// entries before it stay written.
    pub async fn save_uploaded_entries(
        &self,
        token: &SessionToken,
        entries: Vec<UploadedEntry>,
    ) -> Result<()> {
        self.touch(token).await;
        self.ensure_known(token).await?;
        let dir = self.dir_of(token);
        let count = entries.len();

        tokio::task::spawn_blocking(move || write_entries(&dir, &entries)).await??;
        info!(session = %token, files = count, "Saved upload");
        Ok(())
    }

    /// Declared variables, with previously submitted values as defaults.
    pub async fn list_variables(&self, token: &SessionToken) -> Result<Vec<VariableDeclaration>> {
        self.touch(token).await;
        self.ensure_known(token).await?;
        let dir = self.dir_of(token);
        let parser = self.parser.clone();

        let vars = tokio::task::spawn_blocking(move || {
            let mut decls = read_declarations(&dir, parser.as_ref());
            if let Some(values) = read_values(&dir, parser.as_ref()) {
                apply_values(&mut decls, &values);
            }
            decls
        })
        .await?;
        Ok(vars)
    }

    /// Overwrite the values file with one line per declared variable.
    pub async fn write_variable_values(
        &self,
        token: &SessionToken,
        values: HashMap<String, String>,
    ) -> Result<()> {
        self.touch(token).await;
        self.ensure_known(token).await?;
        let dir = self.dir_of(token);
        let parser = self.parser.clone();

        tokio::task::spawn_blocking(move || {
            let declared = read_declarations(&dir, parser.as_ref());
            let path = dir.join(VALUES_FILE);
            fs::write(&path, render_values(&declared, &values))
                .map_err(|e| WorkspaceError::io(format!("write {}", path.display()), e))
        })
        .await??;
        info!(session = %token, "Saved variable values");
        Ok(())
    }

    /// Raw bytes of the values file, for download.
    pub async fn read_variable_values_file(&self, token: &SessionToken) -> Result<Vec<u8>> {
        self.ensure_known(token).await?;
        let path = self.dir_of(token).join(VALUES_FILE);

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(WorkspaceError::FileNotFound),
            Err(e) => Err(WorkspaceError::io(format!("read {}", path.display()), e)),
        }
    }

    /// Start `verb` in the workspace and stream its output.
    pub async fn run_command(&self, token: &SessionToken, verb: &str) -> Result<OutputStream> {
        self.touch(token).await;
        let verb: Verb = verb.parse()?;
        self.ensure_known(token).await?;

        info!(session = %token, %verb, "Running command");
        Ok(self.orchestrator.run(*token, self.dir_of(token), verb))
    }

    /// Delete the workspace and forget the session. Never fails.
    pub async fn explicit_cleanup(&self, token: &SessionToken) {
        self.destroy(token).await;
        info!(session = %token, "Cleaned up session");
    }

    /// Destroy every session idle for longer than `timeout`.
    pub async fn reap_expired(&self, timeout: Duration) -> Vec<SessionToken> {
        let expired = self.store.expired(self.store.now(), timeout).await;
        for token in &expired {
            self.destroy(token).await;
            info!(session = %token, "Cleaned up inactive session");
        }
        expired
    }

    pub async fn sessions(&self) -> Vec<SessionSummary> {
        let now = self.store.now();
        self.store
            .snapshot()
            .await
            .into_iter()
            .map(|(token, last_active)| SessionSummary {
                token,
                idle: now.saturating_duration_since(last_active),
            })
            .collect()
    }

    async fn destroy(&self, token: &SessionToken) {
        let dir = self.dir_of(token);
        let deleter = self.deleter.clone();

        if let Err(e) = tokio::task::spawn_blocking(move || deleter.delete(&dir)).await {
            error!(session = %token, error = %e, "Delete task failed");
        }
        self.store.remove(token).await;
        self.orchestrator.forget(token);
    }

    async fn ensure_known(&self, token: &SessionToken) -> Result<()> {
        if self.store.contains(token).await {
            Ok(())
        } else {
            Err(WorkspaceError::NotFound)
        }
    }
}

fn write_entries(dir: &Path, entries: &[UploadedEntry]) -> Result<()> {
    let base = sanitize::absolutize(dir).map_err(|e| WorkspaceError::io("resolve workspace", e))?;

    for entry in entries {
        let clean = sanitize(&entry.name);
        if clean.is_empty() {
            continue;
        }
        let relative = sanitize::strip_top_level(&clean);

        let target = sanitize::absolutize(&base.join(relative))
            .map_err(|e| WorkspaceError::io("resolve upload target", e))?;
        if !sanitize::is_strict_descendant(&base, &target) {
            return Err(WorkspaceError::InvalidPath(entry.name.clone()));
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| WorkspaceError::io(format!("mkdir {}", parent.display()), e))?;
        }
        fs::write(&target, &entry.content)
            .map_err(|e| WorkspaceError::io(format!("write {}", target.display()), e))?;
    }
    Ok(())
}

/// Declarations from the workspace, or none when absent or unparsable.
fn read_declarations(dir: &Path, parser: &dyn VariableParser) -> Vec<VariableDeclaration> {
    let Some(source) = read_optional(&dir.join(DECLARATIONS_FILE)) else {
        return Vec::new();
    };
    parser.declarations(&source).unwrap_or_else(|e| {
        error!(dir = %dir.display(), error = %e, "Error parsing variables");
        Vec::new()
    })
}

fn read_values(dir: &Path, parser: &dyn VariableParser) -> Option<HashMap<String, String>> {
    let source = read_optional(&dir.join(VALUES_FILE))?;
    match parser.values(&source) {
        Ok(values) => Some(values),
        Err(e) => {
            error!(dir = %dir.display(), error = %e, "Error parsing variable values");
            None
        }
    }
}

fn read_optional(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(source) => Some(source),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read");
            None
        }
    }
}
