//! Connection readiness and project status state machine.
//!
//! The machine never performs I/O. Every input returns the directives the
//! runtime has to carry out, in order.

use std::time::Duration;

use tracing::{info, warn};

use tether_common::{ConnectionAck, ProjectInfo, ProjectStatus, STATUS_OK};

use crate::connection::TransportEvent;
use crate::sync::UpdateReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Disconnected,
    Authenticating,
    Ready,
    /// Offline for good: the project runs from whatever is on disk.
    Unready,
}

/// Lifecycle notifications for whoever embeds the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientSignal {
    Ready,
    Unready,
    /// The project may be started by the embedder (auto-start is off).
    Start,
    Updated(UpdateReport),
    UpdateFailed(String),
    ProjectExited(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    StartHeartbeat(Duration),
    StopHeartbeat,
    CloseTransport,
    Signal(ClientSignal),
    StartProject { force: bool },
    CheckVersion,
    /// `status` is the project status from before the version check.
    Update { status: ProjectStatus },
}

#[derive(Debug, Clone, Copy)]
pub struct Behavior {
    pub auto_update: bool,
    pub auto_start: bool,
    pub reconnection_attempts: u32,
}

#[derive(Debug)]
pub struct ClientRuntimeState {
    behavior: Behavior,
    connectivity: Connectivity,
    project_status: ProjectStatus,
    updated: bool,
    updating: bool,
    reconnecting: bool,
    reconnect_attempts: u32,
    remote_project: Option<ProjectInfo>,
}

impl ClientRuntimeState {
    /// `has_manifest` tells whether a local project already exists.
    pub fn new(behavior: Behavior, has_manifest: bool) -> Self {
        Self {
            behavior,
            connectivity: Connectivity::Disconnected,
            project_status: if has_manifest {
                ProjectStatus::Unknown
            } else {
                ProjectStatus::Empty
            },
            updated: false,
            updating: false,
            reconnecting: false,
            reconnect_attempts: 0,
            remote_project: None,
        }
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity
    }

    pub fn project_status(&self) -> ProjectStatus {
        self.project_status
    }

    pub fn is_updated(&self) -> bool {
        self.updated
    }

    pub fn is_updating(&self) -> bool {
        self.updating
    }

    pub fn remote_project(&self) -> Option<&ProjectInfo> {
        self.remote_project.as_ref()
    }

    pub fn on_transport(&mut self, event: TransportEvent) -> Vec<Directive> {
        if self.connectivity == Connectivity::Unready {
            return Vec::new();
        }

        match event {
            TransportEvent::Connect => {
                self.connectivity = Connectivity::Authenticating;
                Vec::new()
            }
            TransportEvent::ConnectError(reason) => {
                if self.connectivity == Connectivity::Ready {
                    return Vec::new();
                }
                if !self.reconnecting {
                    warn!("Connection failed: {}", reason);
                    return self.fallback();
                }
                if self.reconnect_attempts >= self.behavior.reconnection_attempts {
                    warn!(
                        "Giving up after {} reconnection attempts: {}",
                        self.reconnect_attempts, reason
                    );
                    return self.fallback();
                }
                Vec::new()
            }
            TransportEvent::Disconnect(reason) => {
                info!("Disconnected: {}", reason);
                self.connectivity = Connectivity::Disconnected;
                vec![Directive::StopHeartbeat]
            }
            TransportEvent::ReconnectAttempt(attempt) => {
                self.reconnecting = true;
                self.reconnect_attempts = attempt;
                Vec::new()
            }
            TransportEvent::Reconnect => {
                self.reconnecting = false;
                self.reconnect_attempts = 0;
                Vec::new()
            }
        }
    }

    pub fn on_connection(&mut self, ack: ConnectionAck) -> Vec<Directive> {
        if self.connectivity == Connectivity::Unready {
            return Vec::new();
        }

        if ack.status != STATUS_OK {
            warn!(
                "Server refused the connection ({}): {}",
                ack.status,
                ack.message.as_deref().unwrap_or("no reason given")
            );
            return self.fallback();
        }

        self.connectivity = Connectivity::Ready;
        if ack.project.is_some() {
            self.remote_project = ack.project;
        }

        let mut directives = vec![
            Directive::StartHeartbeat(Duration::from_millis(ack.heartbeat_interval)),
            Directive::Signal(ClientSignal::Ready),
        ];

        if self.updating {
            info!("Update still in progress, waiting for it to finish");
        } else if self.behavior.auto_update && !self.updated {
            directives.push(Directive::CheckVersion);
        } else {
            directives.push(Directive::StartProject { force: true });
        }
        directives
    }

    /// Handles the `checkVersion` reply. `local_version` comes from the on-disk manifest.
    pub fn on_version(
        &mut self,
        status: u16,
        message: Option<String>,
        local_version: Option<&str>,
    ) -> Vec<Directive> {
        if self.updating {
            return Vec::new();
        }

        if status != STATUS_OK {
            warn!("Version check failed ({}), keeping local project", status);
            self.updated = true;
            return self.release(true);
        }

        let remote = message.unwrap_or_default();
        if local_version == Some(remote.as_str()) {
            info!("Project is up to date (v{})", remote);
            self.project_status = ProjectStatus::Updated;
            self.updated = true;
            return self.release(false);
        }

        info!(
            "Project out of date (local: {}, remote: {})",
            local_version.unwrap_or("none"),
            remote
        );
        let checked = self.project_status;
        if checked != ProjectStatus::Empty {
            self.project_status = ProjectStatus::OutOfDate;
        }
        self.updating = true;
        vec![Directive::Update { status: checked }]
    }

    pub fn on_update_finished(&mut self, result: Result<UpdateReport, String>) -> Vec<Directive> {
        self.updating = false;
        match result {
            Ok(report) => {
                self.project_status = ProjectStatus::Updated;
                self.updated = true;
                let mut directives = vec![Directive::Signal(ClientSignal::Updated(report))];
                directives.extend(self.release(false));
                directives
            }
            Err(reason) => {
                warn!("Update failed: {}", reason);
                let mut directives = vec![Directive::Signal(ClientSignal::UpdateFailed(reason))];
                // The fallback deferred its start to this update.
                if self.connectivity == Connectivity::Unready {
                    directives.extend(self.offline_start());
                }
                directives
            }
        }
    }

    /// Gives the project to the supervisor, or to the embedder when auto-start is off.
    fn release(&self, force: bool) -> Vec<Directive> {
        if self.behavior.auto_start {
            vec![Directive::StartProject { force }]
        } else {
            vec![Directive::Signal(ClientSignal::Start)]
        }
    }

    fn fallback(&mut self) -> Vec<Directive> {
        self.connectivity = Connectivity::Unready;
        let mut directives = vec![
            Directive::StopHeartbeat,
            Directive::CloseTransport,
            Directive::Signal(ClientSignal::Unready),
        ];

        if self.updating {
            info!("Project starts once the running update finishes");
        } else {
            directives.extend(self.offline_start());
        }
        directives
    }

    fn offline_start(&self) -> Vec<Directive> {
        if !self.behavior.auto_start {
            vec![Directive::Signal(ClientSignal::Start)]
        } else if self.project_status >= ProjectStatus::Unknown {
            vec![Directive::StartProject { force: true }]
        } else {
            warn!("No local project to run while offline");
            Vec::new()
        }
    }
}
