//! Best-effort recursive deletion of workspace directories.
//!
//! Files in a workspace may still be held by a provisioning process that is
//! winding down, so removal is retried with a linear backoff before falling
//! back to the platform's own recursive delete.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Anything that can remove a workspace directory.
///
/// Implementations never fail: problems are logged and swallowed.
pub trait Deleter: Send + Sync + 'static {
    fn delete(&self, path: &Path);
}

/// Bounded retry with linearly increasing delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Policy with no sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// Delay after the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1))
    }
}

/// Retrying, permission-widening directory removal.
#[derive(Debug, Clone)]
pub struct RobustDeleter {
    policy: RetryPolicy,
    force_command: Vec<String>,
}

impl RobustDeleter {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            force_command: vec!["rm".to_string(), "-rf".to_string()],
        }
    }

    /// Replace the last-resort command. The path is appended as the final argument.
    pub fn with_force_command(mut self, command: Vec<String>) -> Self {
        self.force_command = command;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    fn force_remove(&self, path: &Path) {
        let Some((program, args)) = self.force_command.split_first() else {
            error!(path = %path.display(), "No force delete command configured");
            return;
        };

        match Command::new(program).args(args).arg(path).status() {
            Ok(status) if status.success() && !exists(path) => {
                info!(path = %path.display(), "Force delete succeeded");
            }
            Ok(status) => {
                error!(path = %path.display(), %status, "Force delete failed");
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Force delete failed to start");
            }
        }
    }
}

impl Default for RobustDeleter {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Deleter for RobustDeleter {
    fn delete(&self, path: &Path) {
        for attempt in 1..=self.policy.max_attempts {
            if !exists(path) {
                debug!(path = %path.display(), "Nothing to delete");
                return;
            }

            widen_permissions(path);
            remove_tree(path);

            if !exists(path) {
                debug!(path = %path.display(), attempt, "Deleted");
                return;
            }

            let delay = self.policy.delay_for(attempt);
            warn!(path = %path.display(), attempt, ?delay, "Delete attempt incomplete, retrying");
            std::thread::sleep(delay);
        }

        if exists(path) {
            self.force_remove(path);
        }
    }
}

/// Existence check that does not follow a trailing symlink.
fn exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

/// Give the owner full access to every entry so removal is not blocked by
/// read-only files or directories. Symlinks are not followed.
#[cfg(unix)]
fn widen_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let extra = if file_type.is_dir() { 0o700 } else { 0o600 };
        let mut perms = meta.permissions();
        let mode = perms.mode();
        if mode & extra != extra {
            perms.set_mode(mode | extra);
            let _ = std::fs::set_permissions(entry.path(), perms);
        }
    }
}

#[cfg(not(unix))]
fn widen_permissions(_path: &Path) {}

/// Remove everything below and including `path`, skipping entries that fail.
fn remove_tree(path: &Path) {
    for entry in WalkDir::new(path)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let result = if entry.file_type().is_dir() {
            std::fs::remove_dir(entry.path())
        } else {
            std::fs::remove_file(entry.path())
        };
        if let Err(e) = result {
            debug!(path = %entry.path().display(), error = %e, "Skipping entry");
        }
    }
}
