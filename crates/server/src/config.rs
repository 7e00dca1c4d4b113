//! Server configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tether_common::{Command, PackageSpec};
use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub project: ProjectSettings,
}

impl ServerConfig {
    pub fn load(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| "Failed to parse config file")?;
        Ok(config)
    }

    pub fn save(&self, path: &PathBuf) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "tether", "tether-server") {
            config_dir.config_dir().join("server.toml")
        } else {
            PathBuf::from("server.toml")
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.bind_address.trim().is_empty() {
            bail!("server.bind_address must not be empty");
        }
        if self.server.heartbeat_interval_ms == 0 {
            bail!("server.heartbeat_interval_ms must be greater than zero");
        }
        if self.project.path.as_os_str().is_empty() {
            bail!("project.path must not be empty");
        }
        if matches!(&self.auth.key, Some(key) if key.is_empty()) {
            bail!("auth.key must not be empty when set");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_address: String,
    pub heartbeat_interval_ms: u64,
    pub idle_timeout: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4433".to_string(),
            heartbeat_interval_ms: 10_000,
            idle_timeout: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Shared secret clients must present. `None` accepts everyone.
    pub key: Option<String>,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            key: None,
            cert_path: PathBuf::from("./certs/server.crt"),
            key_path: PathBuf::from("./certs/server.key"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSettings {
    pub path: PathBuf,
    pub ignore: Vec<String>,
    pub commands: Vec<Command>,
    pub packages: Vec<PackageSpec>,
    /// Appended to the command list for clients without a local copy.
    pub install_command: Command,
}

fn default_ignore() -> Vec<String> {
    vec!["node_modules".to_string(), "package-lock.json".to_string()]
}

fn default_install_command() -> Command {
    Command::new("npm", &["install"])
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./project"),
            ignore: default_ignore(),
            commands: Vec::new(),
            packages: Vec::new(),
            install_command: default_install_command(),
        }
    }
}

pub fn generate_example_config() -> Result<String> {
    let config = ServerConfig::default();
    toml::to_string_pretty(&config).context("Failed to serialize default config")
}
