//! Applies a diff to the project directory in three ordered phases

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use tether_common::{DiffResult, FileNode};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Failed to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Refusing path outside the project directory: {0}")]
    OutsideRoot(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    DirectoryAdded,
    FileAdded,
    FileUpdated,
    DirectoryRemoved,
    FileRemoved,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            OperationKind::DirectoryAdded => "Directory Added",
            OperationKind::FileAdded => "File Added",
            OperationKind::FileUpdated => "File Updated",
            OperationKind::DirectoryRemoved => "Directory Removed",
            OperationKind::FileRemoved => "File Removed",
        };
        write!(f, "{}", label)
    }
}

/// One applied item. `applied` counts across all phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateProgress {
    pub applied: usize,
    pub total: usize,
    pub kind: OperationKind,
    pub path: String,
}

impl UpdateProgress {
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.applied as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub ignored: usize,
    pub failed: usize,
}

impl std::fmt::Display for UpdateReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} added, {} updated, {} removed, {} ignored",
            self.added, self.updated, self.removed, self.ignored
        )?;
        if self.failed > 0 {
            write!(f, ", {} failed", self.failed)?;
        }
        Ok(())
    }
}

pub struct UpdateExecutor {
    root: PathBuf,
    pacing: Duration,
}

impl UpdateExecutor {
    pub fn new(root: impl Into<PathBuf>, pacing: Duration) -> Self {
        Self {
            root: root.into(),
            pacing,
        }
    }

    /// Applies `diff` best-effort: a failed item is logged and counted, never rolled back.
    pub async fn apply(
        &self,
        diff: &DiffResult,
        progress: Option<&mpsc::UnboundedSender<UpdateProgress>>,
    ) -> UpdateReport {
        let total = diff.total();
        let mut applied = 0;
        let mut report = UpdateReport {
            ignored: diff.ignored.len(),
            ..Default::default()
        };

        for node in &diff.added {
            let kind = if node.is_directory {
                OperationKind::DirectoryAdded
            } else {
                OperationKind::FileAdded
            };
            match self.add(node).await {
                Ok(()) => report.added += 1,
                Err(e) => {
                    warn!("{}", e);
                    report.failed += 1;
                }
            }
            applied += 1;
            self.step(applied, total, kind, &node.path, progress).await;
        }

        for node in &diff.updated {
            match self.write(node).await {
                Ok(()) => report.updated += 1,
                Err(e) => {
                    warn!("{}", e);
                    report.failed += 1;
                }
            }
            applied += 1;
            self.step(applied, total, OperationKind::FileUpdated, &node.path, progress).await;
        }

        for entry in &diff.removed {
            let kind = if entry.node.is_directory {
                OperationKind::DirectoryRemoved
            } else {
                OperationKind::FileRemoved
            };
            match self.remove(&entry.node).await {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!("{}", e);
                    report.failed += 1;
                }
            }
            applied += 1;
            self.step(applied, total, kind, entry.path(), progress).await;
        }

        report
    }

    fn target(&self, node: &FileNode) -> Result<PathBuf, ExecutorError> {
        if !node.has_contained_path() {
            return Err(ExecutorError::OutsideRoot(node.path.clone()));
        }
        Ok(node
            .path
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part)))
    }

    async fn add(&self, node: &FileNode) -> Result<(), ExecutorError> {
        if !node.is_directory {
            return self.write(node).await;
        }

        let path = self.target(node)?;
        match tokio::fs::create_dir(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
            Err(e) => Err(io_error("create directory", &path, e)),
        }
    }

    async fn write(&self, node: &FileNode) -> Result<(), ExecutorError> {
        let path = self.target(node)?;
        let content = node.content.as_deref().unwrap_or("");
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| io_error("write", &path, e))
    }

    async fn remove(&self, node: &FileNode) -> Result<(), ExecutorError> {
        let path = self.target(node)?;
        let result = if node.is_directory {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove", &path, e)),
        }
    }

    async fn step(
        &self,
        applied: usize,
        total: usize,
        kind: OperationKind,
        path: &str,
        progress: Option<&mpsc::UnboundedSender<UpdateProgress>>,
    ) {
        let update = UpdateProgress {
            applied,
            total,
            kind,
            path: path.to_string(),
        };
        info!(
            "[ {}/{} ] {}: {} ({:.0}%)",
            applied,
            total,
            kind,
            path,
            update.ratio() * 100.0
        );

        if let Some(tx) = progress {
            let _ = tx.send(update);
        }

        if !self.pacing.is_zero() {
            tokio::time::sleep(self.pacing).await;
        }
    }
}

fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> ExecutorError {
    ExecutorError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}
