//! Path sanitization for untrusted upload names.

use std::path::{Component, Path, PathBuf};

/// Turn an untrusted relative path into a traversal-free relative path.
///
/// Backslashes are treated as separators. `.` and empty components are
/// dropped, and `..` pops the previous component but never climbs above the
/// root, so `"../../etc/passwd"` becomes `"etc/passwd"`.
pub fn sanitize(raw: &str) -> String {
    let normalized = raw.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();

    for part in normalized.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    parts.join("/")
}

/// Strip the client-side top-level folder from an already sanitized name.
///
/// Browsers uploading a directory send `project/main.tf`; the workspace
/// stores it as `main.tf`. Names without a separator are kept as-is.
pub fn strip_top_level(sanitized: &str) -> &str {
    match sanitized.split_once('/') {
        Some((_, rest)) => rest,
        None => sanitized,
    }
}

/// Lexically resolve `path` to an absolute path without touching the disk.
pub fn absolutize(path: &Path) -> std::io::Result<PathBuf> {
    let base = if path.is_absolute() {
        PathBuf::new()
    } else {
        std::env::current_dir()?
    };

    let mut out = base;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

/// True when `candidate` lies strictly below `base` (never equal to it).
pub fn is_strict_descendant(base: &Path, candidate: &Path) -> bool {
    candidate != base && candidate.starts_with(base)
}
