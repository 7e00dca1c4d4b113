//! Authoritative project copy served to clients

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use tether_common::{
    scan, Command, ManifestError, PackageSpec, ProjectInfo, ProjectManifest, ProjectPayload,
    ProjectStatus, SnapshotError,
};

use crate::config::ProjectSettings;

pub const MANIFEST_FILE: &str = "package.json";

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("No package.json found in project directory {0}")]
    ManifestMissing(PathBuf),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

pub struct ProjectSource {
    root: PathBuf,
    ignore: Vec<String>,
    commands: Vec<Command>,
    packages: Vec<PackageSpec>,
    install_command: Command,
    manifest: RwLock<ProjectManifest>,
}

impl ProjectSource {
    pub fn open(settings: &ProjectSettings) -> Result<Self, ProjectError> {
        let manifest_path = settings.path.join(MANIFEST_FILE);
        let manifest = ProjectManifest::load(&manifest_path)?
            .ok_or_else(|| ProjectError::ManifestMissing(settings.path.clone()))?;

        Ok(Self {
            root: settings.path.clone(),
            ignore: settings.ignore.clone(),
            commands: settings.commands.clone(),
            packages: settings.packages.clone(),
            install_command: settings.install_command.clone(),
            manifest: RwLock::new(manifest),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Re-reads the manifest from disk, keeping the last good copy on failure.
    pub fn manifest(&self) -> ProjectManifest {
        match ProjectManifest::load(&self.root.join(MANIFEST_FILE)) {
            Ok(Some(manifest)) => {
                *self.manifest.write() = manifest.clone();
                manifest
            }
            Ok(None) => {
                warn!("Project manifest disappeared, serving cached copy");
                self.manifest.read().clone()
            }
            Err(e) => {
                warn!("Failed to reload project manifest, serving cached copy: {}", e);
                self.manifest.read().clone()
            }
        }
    }

    pub fn info(&self) -> ProjectInfo {
        self.manifest().info()
    }

    pub fn version(&self) -> String {
        self.manifest().version
    }

    /// Builds the `getProject` body for a client reporting `status`.
    pub fn payload(&self, status: ProjectStatus) -> Result<ProjectPayload, ProjectError> {
        let info = self.info();
        let files = scan(&self.root, &self.ignore)?;

        let mut commands = self.commands.clone();
        if status == ProjectStatus::Empty {
            commands.push(self.install_command.clone());
        }

        debug!("Serving {} entries for status {}", files.len(), status);

        Ok(ProjectPayload {
            name: info.name,
            description: info.description,
            version: info.version,
            files,
            commands,
            packages: self.packages.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn project(version: &str) -> (TempDir, ProjectSettings) {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(MANIFEST_FILE),
            format!(r#"{{"name":"demo","version":"{}"}}"#, version),
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("node_modules/x")).unwrap();
        fs::write(dir.path().join("index.js"), "run()").unwrap();

        let settings = ProjectSettings {
            path: dir.path().to_path_buf(),
            ..Default::default()
        };
        (dir, settings)
    }

    #[test]
    fn test_bootstrap_payload_appends_install() {
        let (_dir, settings) = project("1.0.0");
        let source = ProjectSource::open(&settings).unwrap();

        let payload = source.payload(ProjectStatus::Empty).unwrap();
        assert_eq!(payload.commands.len(), 1);
        assert_eq!(payload.commands[0].to_string(), "npm install");
        assert!(payload.files.iter().all(|f| !f.path.starts_with("node_modules")));

        let payload = source.payload(ProjectStatus::Unknown).unwrap();
        assert!(payload.commands.is_empty());
    }

    #[test]
    fn test_manifest_reload() {
        let (dir, settings) = project("1.0.0");
        let source = ProjectSource::open(&settings).unwrap();
        assert_eq!(source.version(), "1.0.0");

        fs::write(dir.path().join(MANIFEST_FILE), r#"{"name":"demo","version":"1.1.0"}"#).unwrap();
        assert_eq!(source.version(), "1.1.0");

        fs::write(dir.path().join(MANIFEST_FILE), "broken").unwrap();
        assert_eq!(source.version(), "1.1.0");
    }

    #[test]
    fn test_missing_manifest() {
        let dir = TempDir::new().unwrap();
        let settings = ProjectSettings {
            path: dir.path().to_path_buf(),
            ..Default::default()
        };
        assert!(matches!(
            ProjectSource::open(&settings),
            Err(ProjectError::ManifestMissing(_))
        ));
    }
}
