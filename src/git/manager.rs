//! Core GitManager implementation
//!
//! Contains the GitManager struct and repository access helpers

use git2::{Repository, Signature};
use std::path::{Path, PathBuf};

use crate::error::{OrchestratorError, Result};

/// Git manager for repository operations
pub struct GitManager {
    pub(crate) repo: Repository,
}

impl GitManager {
    /// Open the repository at the given path.
    ///
    /// A missing path or a directory that is not a git repository is a
    /// `Repository` error, fatal to team readiness.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(OrchestratorError::Repository(format!(
                "path does not exist: {}",
                path.display()
            )));
        }
        let repo = Repository::open(path).map_err(|e| {
            OrchestratorError::Repository(format!(
                "not a git repository: {} ({})",
                path.display(),
                e.message()
            ))
        })?;
        Ok(Self { repo })
    }

    /// Get the repository's .git path
    pub fn repo_path(&self) -> PathBuf {
        self.repo.path().to_path_buf()
    }

    /// Get the repository's working directory, if any
    pub fn workdir(&self) -> Option<PathBuf> {
        self.repo.workdir().map(|p| p.to_path_buf())
    }

    /// Committer signature, falling back to a fixed identity when the
    /// repository has no configured one.
    pub(crate) fn signature(&self) -> std::result::Result<Signature<'static>, git2::Error> {
        self.repo
            .signature()
            .or_else(|_| Signature::now("Gitswarm", "gitswarm@example.com"))
    }
}
