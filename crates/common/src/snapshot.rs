//! Recursive project tree scanning

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{FileNode, ProjectSnapshot};

/// Directory holding installed dependencies; never part of a client snapshot.
pub const DEPENDENCY_CACHE_DIR: &str = "node_modules";

/// Dependency lock file; never part of a client snapshot.
pub const DEPENDENCY_LOCK_FILE: &str = "package-lock.json";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Project directory not found: {0}")]
    RootNotFound(PathBuf),
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> SnapshotError {
    SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Names the client always leaves out of its own snapshot.
pub fn client_exclusions() -> Vec<String> {
    vec![DEPENDENCY_CACHE_DIR.to_string(), DEPENDENCY_LOCK_FILE.to_string()]
}

/// Scans `root` into a pre-order flat listing.
///
/// Entries whose name appears in `ignore` are skipped at every depth, together
/// with everything below them. Siblings are visited in name order.
pub fn scan(root: &Path, ignore: &[String]) -> Result<ProjectSnapshot, SnapshotError> {
    if !root.is_dir() {
        return Err(SnapshotError::RootNotFound(root.to_path_buf()));
    }

    let mut nodes = Vec::new();
    collect(root, "", ignore, &mut nodes)?;
    Ok(nodes)
}

fn collect(
    dir: &Path,
    prefix: &str,
    ignore: &[String],
    nodes: &mut Vec<FileNode>,
) -> Result<(), SnapshotError> {
    let mut entries = std::fs::read_dir(dir)
        .map_err(|e| io_err(dir, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| io_err(dir, e))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        if ignore.iter().any(|i| *i == name) {
            continue;
        }

        let path = entry.path();
        let relative = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };

        let file_type = entry.file_type().map_err(|e| io_err(&path, e))?;
        if file_type.is_dir() {
            nodes.push(FileNode::directory(name, relative.clone()));
            collect(&path, &relative, ignore, nodes)?;
        } else if file_type.is_file() {
            let bytes = std::fs::read(&path).map_err(|e| io_err(&path, e))?;
            match String::from_utf8(bytes) {
                Ok(content) => nodes.push(FileNode::file(name, relative, content)),
                Err(_) => warn!("Skipping non-text file: {}", relative),
            }
        } else {
            debug!("Skipping special entry: {}", relative);
        }
    }

    Ok(())
}

/// All nodes below the directory at `dir_path`, in snapshot order.
pub fn descendants<'a>(snapshot: &'a [FileNode], dir_path: &str) -> Vec<&'a FileNode> {
    snapshot.iter().filter(|n| n.is_descendant_of(dir_path)).collect()
}
