use crate::PipelineError;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Source of the repository head identifier a checkpoint is pinned to.
pub trait HeadProvider: Send + Sync {
    fn head(&self) -> Result<String, PipelineError>;
}

/// Reads `HEAD` of a git working tree through the `git` binary.
#[derive(Clone, Debug)]
pub struct GitHead {
    repo_dir: PathBuf,
}

impl GitHead {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }
}

impl HeadProvider for GitHead {
    fn head(&self) -> Result<String, PipelineError> {
        let output = Command::new("git")
            .arg("rev-parse")
            .arg("HEAD")
            .current_dir(&self.repo_dir)
            .output()
            .map_err(|error| PipelineError::Vcs(format!("failed to launch git: {error}")))?;
        if !output.status.success() {
            return Err(PipelineError::Vcs(format!(
                "git rev-parse HEAD in '{}' exited with {}: {}",
                self.repo_dir.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let head = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if head.is_empty() {
            return Err(PipelineError::Vcs("git rev-parse HEAD printed nothing".to_string()));
        }
        Ok(head)
    }
}

/// Fixed head identifier, for callers without a repository and for tests.
#[derive(Clone, Debug)]
pub struct StaticHead(pub String);

impl StaticHead {
    pub fn new(head: impl Into<String>) -> Self {
        Self(head.into())
    }
}

impl HeadProvider for StaticHead {
    fn head(&self) -> Result<String, PipelineError> {
        Ok(self.0.clone())
    }
}
