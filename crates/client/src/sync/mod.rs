//! Client-side project synchronization

mod executor;

pub use executor::*;

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use tether_common::{
    bootstrap, client_exclusions, diff, scan, ClientMessage, Command, DiffResult, ManifestError,
    PackageSpec, ProjectInfo, ProjectManifest, ProjectPayload, ProjectStatus, ServerMessage,
    SnapshotError, STATUS_OK,
};

use crate::connection::{Transport, TransportError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of one update: what changed on disk and what must run next.
#[derive(Debug, Clone, Default)]
pub struct UpdateOutcome {
    pub report: UpdateReport,
    pub commands: Vec<Command>,
    pub packages: Vec<PackageSpec>,
    /// Project identity served with the files. `None` when nothing was fetched.
    pub project: Option<ProjectInfo>,
}

pub struct Updater {
    project_dir: PathBuf,
    manifest_path: PathBuf,
    ignore: Vec<String>,
    executor: UpdateExecutor,
}

impl Updater {
    pub fn new(
        project_dir: impl Into<PathBuf>,
        manifest_path: impl Into<PathBuf>,
        ignore: Vec<String>,
        executor: UpdateExecutor,
    ) -> Self {
        Self {
            project_dir: project_dir.into(),
            manifest_path: manifest_path.into(),
            ignore,
            executor,
        }
    }

    pub fn local_version(&self) -> Result<Option<String>, ClientError> {
        Ok(ProjectManifest::load(&self.manifest_path)?.map(|m| m.version))
    }

    /// Fetches the authoritative tree and brings the project directory in line with it.
    ///
    /// `remote` is the project announced during the handshake.
    pub async fn run(
        &self,
        transport: &Transport,
        status: ProjectStatus,
        remote: Option<&ProjectInfo>,
    ) -> Result<UpdateOutcome, ClientError> {
        if status == ProjectStatus::Unknown {
            if let (Some(local), Some(remote)) = (self.local_version()?, remote) {
                if local == remote.version {
                    info!("Project is up to date (version {})", local);
                    return Ok(UpdateOutcome::default());
                }
                info!("New version found: {} => {}", local, remote.version);
            }
        }

        if status == ProjectStatus::Empty {
            self.clear_project_dir()?;
        }

        let reply = transport
            .request(ClientMessage::GetProject {
                status: status.as_u8(),
            })
            .await?;
        let payload = validate_payload(reply)?;
        info!("Version {} is available", payload.version);

        let plan = self.plan(status, &payload)?;
        info!("Updating {} items", plan.total());

        let report = self.executor.apply(&plan, None).await;
        info!("Project updated to version {}: {}", payload.version, report);

        let project = payload.info();
        Ok(UpdateOutcome {
            report,
            commands: payload.commands,
            packages: payload.packages,
            project: Some(project),
        })
    }

    fn plan(&self, status: ProjectStatus, payload: &ProjectPayload) -> Result<DiffResult, ClientError> {
        if status == ProjectStatus::Empty {
            return Ok(bootstrap(payload.files.clone()));
        }

        let current = scan(&self.project_dir, &client_exclusions())?;
        Ok(diff(&payload.files, &current, &self.ignore))
    }

    /// Empties the project directory, creating it when missing.
    fn clear_project_dir(&self) -> Result<(), ClientError> {
        let dir = &self.project_dir;
        if !dir.exists() {
            return std::fs::create_dir_all(dir).map_err(|e| io_error(dir, e));
        }

        let entries = std::fs::read_dir(dir).map_err(|e| io_error(dir, e))?;
        for entry in entries {
            let path = entry.map_err(|e| io_error(dir, e))?.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            result.map_err(|e| io_error(&path, e))?;
        }
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ClientError {
    ClientError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A usable `getProject` reply has status 200 and a non-empty file list
/// whose paths all stay inside the project directory.
pub fn validate_payload(reply: ServerMessage) -> Result<ProjectPayload, ClientError> {
    match reply {
        ServerMessage::Project {
            status: STATUS_OK,
            project: Some(project),
        } if !project.files.is_empty() => {
            if let Some(node) = project.files.iter().find(|f| !f.has_contained_path()) {
                return Err(ClientError::Protocol(format!(
                    "project payload has a path outside the project directory: {}",
                    node.path
                )));
            }
            Ok(project)
        }
        ServerMessage::Project { status: STATUS_OK, .. } => {
            Err(ClientError::Protocol("project payload has no files".to_string()))
        }
        ServerMessage::Project { status, .. } => {
            Err(ClientError::Protocol(format!("getProject failed with status {}", status)))
        }
        other => Err(ClientError::Protocol(format!(
            "unexpected {} reply to getProject",
            other.event()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use tether_common::FileNode;

    fn payload(files: Vec<FileNode>) -> ProjectPayload {
        ProjectPayload {
            name: "demo".to_string(),
            description: None,
            version: "1.1.0".to_string(),
            files,
            commands: vec![Command::new("npm", &["install"])],
            packages: vec![],
        }
    }

    fn updater(dir: &TempDir, ignore: Vec<String>) -> Updater {
        Updater::new(
            dir.path(),
            dir.path().join("package.json"),
            ignore,
            UpdateExecutor::new(dir.path(), Duration::ZERO),
        )
    }

    #[test]
    fn test_validate_payload() {
        let ok = ServerMessage::Project {
            status: 200,
            project: Some(payload(vec![FileNode::file("a", "a", "1")])),
        };
        assert_eq!(validate_payload(ok).unwrap().files.len(), 1);

        let empty = ServerMessage::Project {
            status: 200,
            project: Some(payload(vec![])),
        };
        assert!(matches!(validate_payload(empty), Err(ClientError::Protocol(_))));

        let refused = ServerMessage::Project {
            status: 401,
            project: None,
        };
        assert!(matches!(validate_payload(refused), Err(ClientError::Protocol(_))));

        let wrong = ServerMessage::Heartbeat { state: 1 };
        assert!(validate_payload(wrong).is_err());
    }

    #[test]
    fn test_validate_payload_rejects_escaping_paths() {
        for path in ["../outside.js", "/etc/passwd", "src/../../x", ""] {
            let reply = ServerMessage::Project {
                status: 200,
                project: Some(payload(vec![
                    FileNode::file("a", "a", "1"),
                    FileNode::file("x", path, "pwn"),
                ])),
            };
            assert!(
                matches!(validate_payload(reply), Err(ClientError::Protocol(_))),
                "{:?} was accepted",
                path
            );
        }
    }

    #[test]
    fn test_plan_bootstrap_takes_everything() {
        let dir = TempDir::new().unwrap();
        let files = vec![FileNode::directory("src", "src"), FileNode::file("a.js", "src/a.js", "a")];
        let plan = updater(&dir, vec![])
            .plan(ProjectStatus::Empty, &payload(files.clone()))
            .unwrap();
        assert_eq!(plan.added, files);
        assert!(plan.removed.is_empty());
    }

    #[test]
    fn test_plan_diff_respects_ignore_and_exclusions() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".env"), "LOCAL=1").unwrap();
        fs::create_dir(dir.path().join("node_modules")).unwrap();
        fs::write(dir.path().join("node_modules/dep.js"), "x").unwrap();

        let incoming = vec![FileNode::file(".env", ".env", "REMOTE=1")];
        let plan = updater(&dir, vec![".env".to_string()])
            .plan(ProjectStatus::OutOfDate, &payload(incoming))
            .unwrap();

        assert!(plan.updated.is_empty());
        assert_eq!(plan.ignored.len(), 1);
        assert!(plan.removed.is_empty());
    }

    #[test]
    fn test_clear_project_dir() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("project");
        fs::create_dir_all(project.join("nested")).unwrap();
        fs::write(project.join("nested/file"), "x").unwrap();
        fs::write(project.join("top"), "y").unwrap();

        let updater = Updater::new(
            &project,
            project.join("package.json"),
            vec![],
            UpdateExecutor::new(&project, Duration::ZERO),
        );
        updater.clear_project_dir().unwrap();
        assert!(project.exists());
        assert_eq!(fs::read_dir(&project).unwrap().count(), 0);

        fs::remove_dir(&project).unwrap();
        updater.clear_project_dir().unwrap();
        assert!(project.is_dir());
    }

    #[tokio::test]
    async fn test_unknown_project_matching_announced_version_skips_fetch() {
        use crate::connection::TransportEvent;
        use crate::state::{Behavior, ClientRuntimeState, Directive};
        use tether_common::ConnectionAck;

        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"name":"demo","version":"1.1.0"}"#,
        )
        .unwrap();
        let updater = updater(&dir, vec![]);

        let behavior = Behavior {
            auto_update: true,
            auto_start: true,
            reconnection_attempts: 3,
        };
        let mut state = ClientRuntimeState::new(behavior, true);
        state.on_transport(TransportEvent::Connect);
        state.on_connection(ConnectionAck {
            status: 200,
            message: None,
            heartbeat_interval: 10_000,
            session_id: None,
            project: Some(ProjectInfo {
                name: "demo".to_string(),
                description: None,
                version: "1.1.0".to_string(),
            }),
        });

        let local = updater.local_version().unwrap();
        let directives = state.on_version(200, Some("1.2.0".to_string()), local.as_deref());
        let status = match directives.as_slice() {
            [Directive::Update { status }] => *status,
            other => panic!("unexpected directives: {:?}", other),
        };
        assert_eq!(status, ProjectStatus::Unknown);

        // Not connected: any request would fail.
        let transport = Transport::new(Duration::from_millis(50));
        let outcome = updater
            .run(&transport, status, state.remote_project())
            .await
            .unwrap();
        assert!(outcome.project.is_none());
        assert_eq!(outcome.report, UpdateReport::default());

        let fetched = updater
            .run(&transport, ProjectStatus::OutOfDate, state.remote_project())
            .await;
        assert!(matches!(fetched, Err(ClientError::Transport(TransportError::NotConnected))));
    }

    #[test]
    fn test_local_version() {
        let dir = TempDir::new().unwrap();
        let updater = updater(&dir, vec![]);
        assert_eq!(updater.local_version().unwrap(), None);

        fs::write(
            dir.path().join("package.json"),
            r#"{"name":"demo","version":"1.0.0"}"#,
        )
        .unwrap();
        assert_eq!(updater.local_version().unwrap().as_deref(), Some("1.0.0"));
    }
}
