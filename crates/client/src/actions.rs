//! Post-update actions: dependency operations and server-declared commands

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use tether_common::{Command as ProjectCommand, PackageSpec};

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with code {code:?}")]
    Exited { program: String, code: Option<i32> },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Platform executable name for a package-manager style tool.
pub fn program_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{}.cmd", name)
    } else {
        name.to_string()
    }
}

/// A child whose stdout/stderr are forwarded line by line into the log.
pub struct StreamedChild {
    child: Child,
    pumps: Vec<JoinHandle<()>>,
}

impl StreamedChild {
    pub fn spawn(program: &str, args: &[String], dir: &Path) -> Result<Self, ActionError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ActionError::Spawn {
            program: program.to_string(),
            source: e,
        })?;

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!("{}", line);
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("{}", line);
                }
            }));
        }

        Ok(Self { child, pumps })
    }

    /// Cancel safe: dropping the future leaves the child running.
    pub async fn wait(&mut self) -> Result<ExitStatus, ActionError> {
        let status = self.child.wait().await?;
        for pump in self.pumps.drain(..) {
            let _ = pump.await;
        }
        Ok(status)
    }

    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill child process: {}", e);
        }
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }
}

/// Runs `program` to completion inside `dir`.
async fn run_to_completion(program: &str, args: &[String], dir: &Path) -> Result<(), ActionError> {
    let mut child = StreamedChild::spawn(program, args, dir)?;
    let status = child.wait().await?;
    if status.success() {
        Ok(())
    } else {
        Err(ActionError::Exited {
            program: program.to_string(),
            code: status.code(),
        })
    }
}

/// Outcome of both batches. Each batch stops at its first failure.
#[derive(Debug)]
pub struct ActionReport {
    pub packages: Result<usize, ActionError>,
    pub commands: Result<usize, ActionError>,
}

impl ActionReport {
    pub fn is_success(&self) -> bool {
        self.packages.is_ok() && self.commands.is_ok()
    }
}

pub struct ActionRunner {
    project_dir: PathBuf,
    package_manager: String,
}

impl ActionRunner {
    pub fn new(project_dir: impl Into<PathBuf>, package_manager: impl Into<String>) -> Self {
        Self {
            project_dir: project_dir.into(),
            package_manager: package_manager.into(),
        }
    }

    pub fn package_command(&self, spec: &PackageSpec) -> (String, Vec<String>) {
        let mut args = vec![spec.operation.as_str().to_string(), spec.target()];
        if spec.dev {
            args.push("--save-dev".to_string());
        }
        (program_name(&self.package_manager), args)
    }

    /// Returns how many packages were processed.
    pub async fn run_packages(&self, packages: &[PackageSpec]) -> Result<usize, ActionError> {
        if packages.is_empty() {
            return Ok(0);
        }

        info!("Installing packages...");
        for (done, spec) in packages.iter().enumerate() {
            let (program, args) = self.package_command(spec);
            info!("{} {}...", spec.operation.as_str(), spec.target());
            if let Err(e) = run_to_completion(&program, &args, &self.project_dir).await {
                error!("Failed to {} package {}: {}", spec.operation.as_str(), spec.name, e);
                return Err(e);
            }
            info!("Package {} done ({}/{})", spec.name, done + 1, packages.len());
        }
        Ok(packages.len())
    }

    /// Returns how many commands were run.
    pub async fn run_commands(&self, commands: &[ProjectCommand]) -> Result<usize, ActionError> {
        if commands.is_empty() {
            return Ok(0);
        }

        info!("Running commands...");
        for cmd in commands {
            info!("Running command: {}", cmd);
            if let Err(e) = run_to_completion(&cmd.prefix, &cmd.args, &self.project_dir).await {
                error!("Failed to execute command {}: {}", cmd, e);
                return Err(e);
            }
            info!("Command {} executed successfully", cmd);
        }
        Ok(commands.len())
    }

    /// Packages first, then commands. A failed package batch does not skip the commands.
    pub async fn run_all(&self, packages: &[PackageSpec], commands: &[ProjectCommand]) -> ActionReport {
        let packages = self.run_packages(packages).await;
        let commands = self.run_commands(commands).await;
        ActionReport { packages, commands }
    }
}
