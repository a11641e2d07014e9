//! Path validation: filesystem sandboxing to a workspace root.
//!
//! Ensures file tools can only reach paths inside the allowed roots and
//! blocks forbidden locations (e.g., ~/.ssh). Containment is always decided on
//! resolved paths, so `..` segments and symlinks cannot smuggle a path out.

use std::path::{Component, Path, PathBuf};

/// Error returned when path validation fails.
#[derive(Debug, thiserror::Error)]
pub enum PathValidationError {
    #[error("Path must be absolute: '{path}'")]
    NotAbsolute { path: String },

    #[error("Path '{path}' is outside allowed roots")]
    OutsideAllowedRoots { path: String },

    #[error("Path '{path}' matches forbidden pattern '{pattern}'")]
    ForbiddenPath { path: String, pattern: String },

    #[error("Failed to resolve path '{path}': {reason}")]
    ResolveFailed { path: String, reason: String },
}

/// Symlink hops allowed while resolving, matching the usual kernel limit.
const MAX_SYMLINK_HOPS: usize = 40;

/// Resolve `path` to its real location.
///
/// Existing paths are canonicalized. Otherwise components are walked from the
/// left: existing symlinks are followed even when their target is missing,
/// and the missing remainder is appended without being trusted lexically.
pub fn resolve(path: &Path) -> std::io::Result<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    resolve_walk(&absolute, 0)
}

fn resolve_walk(path: &Path, hops: usize) -> std::io::Result<PathBuf> {
    if hops > MAX_SYMLINK_HOPS {
        return Err(std::io::Error::other(format!(
            "too many levels of symbolic links resolving '{}'",
            path.display()
        )));
    }

    let mut resolved = PathBuf::new();
    let mut components = path.components();
    while let Some(component) = components.next() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                let candidate = resolved.join(name);
                match std::fs::symlink_metadata(&candidate) {
                    Ok(meta) if meta.file_type().is_symlink() => {
                        // `join` keeps an absolute link target as-is
                        let mut target = resolved.join(std::fs::read_link(&candidate)?);
                        target.extend(components);
                        return match target.canonicalize() {
                            Ok(canonical) => Ok(canonical),
                            Err(_) => resolve_walk(&target, hops + 1),
                        };
                    }
                    Ok(_) => resolved = candidate,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => resolved = candidate,
                    Err(e) => return Err(e),
                }
            }
        }
    }
    Ok(resolved)
}

/// True when `path` resolves to `root` or to something beneath it.
///
/// Anything that cannot be resolved counts as outside.
pub fn is_within_root(path: &Path, root: &Path) -> bool {
    match (resolve(path), resolve(root)) {
        (Ok(path), Ok(root)) => path.starts_with(&root),
        _ => false,
    }
}

/// Validate that a path is safe to access.
///
/// Checks:
/// 1. Path is absolute
/// 2. Path resolves inside one of the allowed roots (if any are configured)
/// 3. Path does not resolve into a forbidden location
///
/// Returns the resolved path on success.
pub fn validate_path(
    path: &str,
    allowed_roots: &[PathBuf],
    forbidden_paths: &[String],
) -> Result<PathBuf, PathValidationError> {
    let input = Path::new(path);
    if !input.is_absolute() {
        return Err(PathValidationError::NotAbsolute { path: path.into() });
    }

    let resolved = resolve(input).map_err(|e| PathValidationError::ResolveFailed {
        path: path.into(),
        reason: e.to_string(),
    })?;

    for forbidden in forbidden_paths {
        let expanded = PathBuf::from(expand_tilde(forbidden));
        let forbidden_resolved = resolve(&expanded).unwrap_or(expanded);
        if resolved.starts_with(&forbidden_resolved) {
            return Err(PathValidationError::ForbiddenPath {
                path: path.into(),
                pattern: forbidden.clone(),
            });
        }
    }

    if !allowed_roots.is_empty() && !allowed_roots.iter().any(|root| is_within_root(&resolved, root)) {
        return Err(PathValidationError::OutsideAllowedRoots { path: path.into() });
    }

    Ok(resolved)
}

/// Expand ~ to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if (path.starts_with("~/") || path == "~")
        && let Ok(home) = std::env::var("HOME")
    {
        return path.replacen('~', &home, 1);
    }
    path.to_string()
}
