//! Settings shared by every tool a registry builds.

use std::path::{Path, PathBuf};

use kestrel_config::AppConfig;
use kestrel_core::{ApprovalMode, ToolError};
use kestrel_security::{CommandPolicy, resolve, validate_path};

/// Workspace root, path rules, command policy and approval mode.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub target_dir: PathBuf,
    pub forbidden_paths: Vec<String>,
    pub approval_mode: ApprovalMode,
    pub policy: CommandPolicy,
}

impl ToolContext {
    pub fn new(target_dir: impl Into<PathBuf>) -> Self {
        let target_dir = target_dir.into();
        Self {
            target_dir: resolve(&target_dir).unwrap_or(target_dir),
            forbidden_paths: Vec::new(),
            approval_mode: ApprovalMode::Default,
            policy: CommandPolicy::default(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            forbidden_paths: config.autonomy.forbidden_paths.clone(),
            approval_mode: config.autonomy.approval_mode,
            policy: CommandPolicy::new(&config.tools.allowed_commands),
            ..Self::new(config.target_dir())
        }
    }

    pub fn with_approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }

    pub fn with_forbidden_paths(mut self, paths: Vec<String>) -> Self {
        self.forbidden_paths = paths;
        self
    }

    /// Resolve a tool path argument, requiring it to stay inside the target dir.
    pub fn check_path(&self, path: &str) -> Result<PathBuf, ToolError> {
        validate_path(path, std::slice::from_ref(&self.target_dir), &self.forbidden_paths)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))
    }

    /// `path` shown relative to the target dir when possible.
    pub fn display_path<'a>(&self, path: &'a Path) -> std::borrow::Cow<'a, str> {
        match path.strip_prefix(&self.target_dir) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_string_lossy(),
            _ => path.to_string_lossy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path());
        let err = ctx.check_path("notes.txt").unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn paths_outside_target_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path().join("inner"));
        std::fs::create_dir(dir.path().join("inner")).unwrap();
        let outside = dir.path().join("secret.txt");
        assert!(ctx.check_path(outside.to_str().unwrap()).is_err());
    }
}
