use crate::fsutil::write_atomic;
use crate::plan::{Plan, PlanError};
use crate::types::TaskId;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PlanStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("plan for task #{id} is invalid: {source}")]
    Invalid {
        id: TaskId,
        #[source]
        source: PlanError,
    },
    #[error("no plan for task #{0}")]
    Missing(TaskId),
}

pub type Result<T> = std::result::Result<T, PlanStoreError>;

// ---------------------------------------------------------------------------
// PlanStore
// ---------------------------------------------------------------------------

/// Directory of `task-<id>.md` plan documents.
#[derive(Debug, Clone)]
pub struct PlanStore {
    dir: PathBuf,
}

impl PlanStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, id: TaskId) -> PathBuf {
        self.dir.join(format!("task-{id}.md"))
    }

    pub fn exists(&self, id: TaskId) -> bool {
        self.path(id).is_file()
    }

    /// Atomically write the plan document and return its path.
    pub fn save(&self, id: TaskId, content: &str) -> Result<PathBuf> {
        let path = self.path(id);
        write_atomic(&path, content.as_bytes())?;
        Ok(path)
    }

    pub fn parse(&self, path: &Path) -> std::result::Result<Plan, PlanError> {
        Plan::parse_file(path)
    }

    /// Load and parse the plan stored for `id`.
    pub fn load(&self, id: TaskId) -> Result<Plan> {
        let path = self.path(id);
        if !path.is_file() {
            return Err(PlanStoreError::Missing(id));
        }
        Plan::parse_file(&path).map_err(|source| PlanStoreError::Invalid { id, source })
    }

    /// Delete the plan for `id`. Returns `true` if a file was removed.
    pub fn remove(&self, id: TaskId) -> Result<bool> {
        let path = self.path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
