//! Domain models for Tether

use std::collections::BTreeMap;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse lifecycle stage of a local project copy.
///
/// Ordered: a status compares greater than every stage it has moved past.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProjectStatus {
    Empty = 0,
    Unknown = 1,
    OutOfDate = 2,
    Updated = 3,
}

impl ProjectStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ProjectStatus::Empty),
            1 => Some(ProjectStatus::Unknown),
            2 => Some(ProjectStatus::OutOfDate),
            3 => Some(ProjectStatus::Updated),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Empty => "EMPTY",
            ProjectStatus::Unknown => "UNKNOWN",
            ProjectStatus::OutOfDate => "OUT_OF_DATE",
            ProjectStatus::Updated => "UPDATED",
        }
    }

    /// Whether the project may be started without `force`.
    pub fn is_resolvable(&self) -> bool {
        *self >= ProjectStatus::OutOfDate
    }
}

impl Default for ProjectStatus {
    fn default() -> Self {
        ProjectStatus::Empty
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry of a project snapshot.
///
/// `path` is relative to the project root and always `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "dir", default)]
    pub is_directory: bool,
    #[serde(default)]
    pub content: Option<String>,
}

impl FileNode {
    pub fn file(name: impl Into<String>, path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            is_directory: false,
            content: Some(content.into()),
        }
    }

    pub fn directory(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            is_directory: true,
            content: None,
        }
    }

    /// True when this node lives somewhere below the directory at `dir_path`.
    pub fn is_descendant_of(&self, dir_path: &str) -> bool {
        self.path.len() > dir_path.len()
            && self.path.starts_with(dir_path)
            && self.path.as_bytes()[dir_path.len()] == b'/'
    }

    /// False for empty, absolute or `..`-bearing paths that could leave the project root.
    pub fn has_contained_path(&self) -> bool {
        !self.path.is_empty()
            && Path::new(&self.path)
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
    }
}

/// Ordered flat pre-order listing of a project directory.
pub type ProjectSnapshot = Vec<FileNode>;

/// An external process invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub prefix: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Command {
    pub fn new(prefix: impl Into<String>, args: &[&str]) -> Self {
        Self {
            prefix: prefix.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.prefix)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageOperation {
    Install,
    Uninstall,
}

impl PackageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageOperation::Install => "install",
            PackageOperation::Uninstall => "uninstall",
        }
    }
}

impl Default for PackageOperation {
    fn default() -> Self {
        PackageOperation::Install
    }
}

/// A dependency the client must install or remove after an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    #[serde(default = "default_package_version")]
    pub version: String,
    #[serde(default)]
    pub dev: bool,
    #[serde(default)]
    pub operation: PackageOperation,
}

fn default_package_version() -> String {
    "latest".to_string()
}

impl PackageSpec {
    pub fn install(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_package_version(),
            dev: false,
            operation: PackageOperation::Install,
        }
    }

    /// `name@version`, as handed to the package manager.
    pub fn target(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Name, description and version of a project, as announced by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub name: String,
    pub description: Option<String>,
    pub version: String,
}

/// Full `getProject` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectPayload {
    pub name: String,
    pub description: Option<String>,
    pub version: String,
    #[serde(default)]
    pub files: Vec<FileNode>,
    #[serde(default)]
    pub commands: Vec<Command>,
    #[serde(default)]
    pub packages: Vec<PackageSpec>,
}

impl ProjectPayload {
    pub fn info(&self) -> ProjectInfo {
        ProjectInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            version: self.version.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to read manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse manifest {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Project descriptor persisted next to the project sources (`package.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub scripts: Option<BTreeMap<String, String>>,
}

impl ProjectManifest {
    /// Reads the manifest at `path`. A missing file is `Ok(None)`: no local project yet.
    pub fn load(path: &Path) -> Result<Option<Self>, ManifestError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ManifestError::Io {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };

        let manifest = serde_json::from_str(&content).map_err(|e| ManifestError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;

        Ok(Some(manifest))
    }

    pub fn info(&self) -> ProjectInfo {
        ProjectInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            version: self.version.clone(),
        }
    }

    /// `false` only when the manifest declares scripts and `script` is not among them.
    pub fn has_script(&self, script: &str) -> bool {
        match &self.scripts {
            Some(scripts) => scripts.contains_key(script),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_status_ordering() {
        assert!(ProjectStatus::Empty < ProjectStatus::Unknown);
        assert!(ProjectStatus::Updated.is_resolvable());
        assert!(ProjectStatus::OutOfDate.is_resolvable());
        assert!(!ProjectStatus::Unknown.is_resolvable());
        assert_eq!(ProjectStatus::from_u8(2), Some(ProjectStatus::OutOfDate));
        assert_eq!(ProjectStatus::from_u8(9), None);
    }

    #[test]
    fn test_descendant_matching() {
        let node = FileNode::file("b.txt", "src/a/b.txt", "");
        assert!(node.is_descendant_of("src"));
        assert!(node.is_descendant_of("src/a"));
        assert!(!node.is_descendant_of("sr"));
        assert!(!node.is_descendant_of("src/a/b.txt"));
    }

    #[test]
    fn test_contained_paths() {
        assert!(FileNode::file("a", "src/a.js", "").has_contained_path());
        assert!(FileNode::directory("src", "src").has_contained_path());
        assert!(!FileNode::file("x", "../escaped.txt", "").has_contained_path());
        assert!(!FileNode::file("x", "src/../../x", "").has_contained_path());
        assert!(!FileNode::file("passwd", "/etc/passwd", "").has_contained_path());
        assert!(!FileNode::file("x", "./x", "").has_contained_path());
        assert!(!FileNode::file("", "", "").has_contained_path());
    }

    #[test]
    fn test_manifest_absent_and_present() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("package.json");
        assert!(ProjectManifest::load(&path).unwrap().is_none());

        std::fs::write(
            &path,
            r#"{"name":"demo","version":"1.2.0","scripts":{"start":"node index.js"},"private":true}"#,
        )
        .unwrap();

        let manifest = ProjectManifest::load(&path).unwrap().unwrap();
        assert_eq!(manifest.name, "demo");
        assert_eq!(manifest.version, "1.2.0");
        assert!(manifest.has_script("start"));
        assert!(!manifest.has_script("dev"));
    }

    #[test]
    fn test_manifest_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("package.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(ProjectManifest::load(&path), Err(ManifestError::Parse { .. })));
    }

    #[test]
    fn test_package_target() {
        let mut pkg = PackageSpec::install("express");
        assert_eq!(pkg.target(), "express@latest");
        pkg.version = "4.18.0".to_string();
        assert_eq!(pkg.target(), "express@4.18.0");
    }
}
