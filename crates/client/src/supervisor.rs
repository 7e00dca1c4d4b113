//! Runs the synced project and restarts it when it exits

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use tether_common::{ManifestError, ProjectManifest, ProjectStatus};

use crate::actions::{program_name, ActionError, StreamedChild};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Project is not ready to start (status: {0})")]
    NotReady(ProjectStatus),
    #[error("Project is already running")]
    AlreadyRunning,
    #[error("Supervisor has been stopped")]
    Stopped,
    #[error("Script {0} not found in package.json")]
    ScriptNotFound(String),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Spawn(#[from] ActionError),
    #[error("Project exited with code {0:?}")]
    Exited(Option<i32>),
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub project_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub package_manager: String,
    pub start_script: String,
    pub auto_restart: bool,
    pub restart_delay: Duration,
}

pub struct Supervisor {
    settings: SupervisorSettings,
    running: AtomicBool,
    stopped: AtomicBool,
    stop: Notify,
    idle: Notify,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop: Notify::new(),
            idle: Notify::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start_command(&self) -> (String, Vec<String>) {
        (
            program_name(&self.settings.package_manager),
            vec!["run".to_string(), self.settings.start_script.clone()],
        )
    }

    /// Runs the project until it exits for good.
    ///
    /// With auto-restart the process is respawned after every exit and this
    /// only returns once [`Supervisor::stop`] is called.
    pub async fn start(&self, status: ProjectStatus, force: bool) -> Result<(), SupervisorError> {
        if !status.is_resolvable() && !force {
            error!("Project is not ready to start");
            return Err(SupervisorError::NotReady(status));
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SupervisorError::Stopped);
        }

        let script = &self.settings.start_script;
        if let Some(manifest) = ProjectManifest::load(&self.settings.manifest_path)? {
            if !manifest.has_script(script) {
                error!("Script {} not found in package.json", script);
                return Err(SupervisorError::ScriptNotFound(script.clone()));
            }
        }

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SupervisorError::AlreadyRunning);
        }

        let result = self.supervise().await;

        self.running.store(false, Ordering::SeqCst);
        self.idle.notify_waiters();
        result
    }

    async fn supervise(&self) -> Result<(), SupervisorError> {
        let (program, args) = self.start_command();

        loop {
            info!("Starting project with script: {} {}", program, args.join(" "));
            let mut child = StreamedChild::spawn(&program, &args, &self.settings.project_dir)?;

            let exit = tokio::select! {
                status = child.wait() => Some(status?),
                _ = self.wait_stopped() => None,
            };

            let Some(status) = exit else {
                info!("Stopping project");
                child.kill().await;
                return Ok(());
            };

            if status.success() {
                info!("Project closed with no errors");
            } else {
                warn!("Project exited with code {:?}", status.code());
            }

            if !self.settings.auto_restart {
                return if status.success() {
                    Ok(())
                } else {
                    Err(SupervisorError::Exited(status.code()))
                };
            }

            info!("Restarting project...");
            tokio::select! {
                _ = tokio::time::sleep(self.settings.restart_delay) => {}
                _ = self.wait_stopped() => return Ok(()),
            }
        }
    }

    /// Kills the running project and refuses later starts.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop.notify_waiters();
    }

    async fn wait_stopped(&self) {
        loop {
            let notified = self.stop.notified();
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once no project process is supervised.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }
}
