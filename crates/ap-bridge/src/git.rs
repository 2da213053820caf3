//! Project directory scan with read-only git metadata.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum GitReadError {
    /// Non-zero exit; carries trimmed stderr.
    #[error("git command failed: {0}")]
    Command(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("utf8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Read-only git queries used for project status.
pub trait GitReader: Send + Sync {
    fn current_branch(&self, repo: &Path) -> Result<String, GitReadError>;
    fn status_porcelain(&self, repo: &Path) -> Result<Vec<String>, GitReadError>;
    fn last_commit(&self, repo: &Path) -> Result<String, GitReadError>;
}

/// Shells out to the `git` binary.
pub struct ShellGit;

impl ShellGit {
    fn run(repo: &Path, args: &[&str]) -> Result<String, GitReadError> {
        let output = std::process::Command::new("git")
            .current_dir(repo)
            .args(args)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8(output.stderr)
                .unwrap_or_else(|_| "git returned non-utf8 stderr".to_string());
            return Err(GitReadError::Command(stderr.trim().to_string()));
        }
        Ok(String::from_utf8(output.stdout)?.trim().to_string())
    }
}

impl GitReader for ShellGit {
    fn current_branch(&self, repo: &Path) -> Result<String, GitReadError> {
        Self::run(repo, &["rev-parse", "--abbrev-ref", "HEAD"])
    }

    fn status_porcelain(&self, repo: &Path) -> Result<Vec<String>, GitReadError> {
        let out = Self::run(repo, &["status", "--porcelain"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }

    fn last_commit(&self, repo: &Path) -> Result<String, GitReadError> {
        Self::run(repo, &["log", "-1", "--format=%s"])
    }
}

// ---------------------------------------------------------------------------
// Project scan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectStatus {
    pub name: String,
    pub path: PathBuf,
    pub is_git: bool,
    pub branch: Option<String>,
    pub dirty_files: usize,
    pub last_commit: Option<String>,
}

pub struct ProjectScanner {
    root: PathBuf,
    git: Arc<dyn GitReader>,
}

impl ProjectScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_reader(root, Arc::new(ShellGit))
    }

    pub fn with_reader(root: impl Into<PathBuf>, git: Arc<dyn GitReader>) -> Self {
        Self {
            root: root.into(),
            git,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Visible subdirectories of the root, sorted by name. A missing root
    /// yields an empty list.
    pub fn scan(&self) -> Vec<ProjectStatus> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(root = %self.root.display(), error = %e, "project root unreadable");
                return Vec::new();
            }
        };

        let mut projects: Vec<ProjectStatus> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| {
                let name = e.file_name().to_str()?.to_string();
                (!name.starts_with('.')).then(|| self.status(&name, e.path()))
            })
            .collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        projects
    }

    fn status(&self, name: &str, path: PathBuf) -> ProjectStatus {
        let is_git = path.join(".git").exists();
        let mut status = ProjectStatus {
            name: name.to_string(),
            path,
            is_git,
            branch: None,
            dirty_files: 0,
            last_commit: None,
        };
        if is_git {
            status.branch = self.git.current_branch(&status.path).ok();
            status.dirty_files = self
                .git
                .status_porcelain(&status.path)
                .map(|l| l.len())
                .unwrap_or(0);
            status.last_commit = self.git.last_commit(&status.path).ok();
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeGit;

    impl GitReader for FakeGit {
        fn current_branch(&self, _repo: &Path) -> Result<String, GitReadError> {
            Ok("main".into())
        }
        fn status_porcelain(&self, _repo: &Path) -> Result<Vec<String>, GitReadError> {
            Ok(vec![" M src/lib.rs".into(), "?? new.txt".into()])
        }
        fn last_commit(&self, _repo: &Path) -> Result<String, GitReadError> {
            Err(GitReadError::Command("no commits".into()))
        }
    }

    #[test]
    fn scan_lists_visible_dirs_with_git_status() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("beta/.git")).unwrap();
        std::fs::create_dir_all(dir.path().join("alpha")).unwrap();
        std::fs::create_dir_all(dir.path().join(".hidden")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let scanner = ProjectScanner::with_reader(dir.path(), Arc::new(FakeGit));
        let projects = scanner.scan();
        let names: Vec<_> = projects.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        assert!(!projects[0].is_git);
        assert_eq!(projects[0].branch, None);

        let beta = &projects[1];
        assert_eq!(beta.branch.as_deref(), Some("main"));
        assert_eq!(beta.dirty_files, 2);
        assert_eq!(beta.last_commit, None);
    }

    #[test]
    fn missing_root_is_empty() {
        let scanner = ProjectScanner::new("/definitely/not/here");
        assert!(scanner.scan().is_empty());
    }
}
