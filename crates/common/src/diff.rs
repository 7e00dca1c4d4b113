//! Snapshot classification into added/updated/removed/ignored sets

use std::collections::HashMap;

use crate::models::FileNode;
use crate::snapshot::descendants;

/// A node scheduled for deletion. Directories carry every node below them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedEntry {
    pub node: FileNode,
    pub children: Vec<FileNode>,
}

impl RemovedEntry {
    pub fn path(&self) -> &str {
        &self.node.path
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    pub added: Vec<FileNode>,
    pub updated: Vec<FileNode>,
    pub removed: Vec<RemovedEntry>,
    pub ignored: Vec<FileNode>,
}

impl DiffResult {
    /// Number of filesystem operations needed to apply this diff.
    pub fn total(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Everything in `incoming` becomes an addition. The caller empties the target first.
pub fn bootstrap(incoming: Vec<FileNode>) -> DiffResult {
    DiffResult {
        added: incoming,
        ..Default::default()
    }
}

/// Differential classification of `incoming` (authoritative) against `current`.
///
/// `ignore` matches file names only. Removed directories are never ignored and
/// their children are not filtered.
pub fn diff(incoming: &[FileNode], current: &[FileNode], ignore: &[String]) -> DiffResult {
    let is_ignored = |name: &str| ignore.iter().any(|i| i == name);

    let current_by_path: HashMap<&str, &FileNode> =
        current.iter().map(|n| (n.path.as_str(), n)).collect();
    let incoming_by_path: HashMap<&str, &FileNode> =
        incoming.iter().map(|n| (n.path.as_str(), n)).collect();

    let mut result = DiffResult::default();

    for node in incoming {
        match current_by_path.get(node.path.as_str()) {
            None => result.added.push(node.clone()),
            Some(_) if node.is_directory => {}
            Some(existing) if existing.content != node.content => {
                if is_ignored(&node.name) {
                    result.ignored.push(node.clone());
                } else {
                    result.updated.push(node.clone());
                }
            }
            Some(_) => {}
        }
    }

    let mut removed = Vec::new();
    for node in current {
        if incoming_by_path.contains_key(node.path.as_str()) {
            continue;
        }

        if node.is_directory {
            let children = descendants(current, &node.path)
                .into_iter()
                .cloned()
                .collect();
            removed.push(RemovedEntry {
                node: node.clone(),
                children,
            });
        } else if is_ignored(&node.name) {
            result.ignored.push(node.clone());
        } else {
            removed.push(RemovedEntry {
                node: node.clone(),
                children: Vec::new(),
            });
        }
    }

    // Suppress entries already covered by a removed directory. Matching is by
    // name only, so an unrelated removal sharing a basename is dropped as well.
    result.removed = removed
        .iter()
        .filter(|entry| {
            !removed
                .iter()
                .any(|dir| dir.children.iter().any(|c| c.name == entry.node.name))
        })
        .cloned()
        .collect();

    result
}
