//! Client configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub project: ProjectSettings,
    #[serde(default)]
    pub behavior: BehaviorSettings,
}

impl ClientConfig {
    pub fn load(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| "Failed to parse config file")?;
        Ok(config)
    }

    pub fn save(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "tether", "tether-client") {
            config_dir.config_dir().join("client.toml")
        } else {
            PathBuf::from("client.toml")
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection.server_address.trim().is_empty() {
            bail!("connection.server_address must not be empty");
        }
        if self.connection.server_name.trim().is_empty() {
            bail!("connection.server_name must not be empty");
        }
        if self.project.start_script.trim().is_empty() {
            bail!("project.start_script must not be empty");
        }
        if self.project.package_manager.trim().is_empty() {
            bail!("project.package_manager must not be empty");
        }
        if self.connection.reconnection_delay_ms > self.connection.reconnection_delay_max_ms {
            bail!("connection.reconnection_delay_ms exceeds reconnection_delay_max_ms");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub server_address: String,
    /// TLS server name checked against the server certificate.
    pub server_name: String,
    pub ca_path: PathBuf,
    pub key: Option<String>,
    pub timeout: u64,
    pub reconnection_attempts: u32,
    pub reconnection_delay_ms: u64,
    pub reconnection_delay_max_ms: u64,
}

impl ConnectionSettings {
    pub fn reconnection_delay(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay_ms)
    }

    pub fn reconnection_delay_max(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay_max_ms)
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            server_address: "localhost:4433".to_string(),
            server_name: "localhost".to_string(),
            ca_path: PathBuf::from("./certs/ca.crt"),
            key: None,
            timeout: 30,
            reconnection_attempts: 10,
            reconnection_delay_ms: 1000,
            reconnection_delay_max_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSettings {
    pub dir: PathBuf,
    /// Manifest file name, relative to `dir`.
    pub manifest: String,
    pub start_script: String,
    pub package_manager: String,
    /// File names whose local changes survive updates.
    pub ignore: Vec<String>,
}

impl ProjectSettings {
    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(&self.manifest)
    }
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./project"),
            manifest: "package.json".to_string(),
            start_script: "start".to_string(),
            package_manager: "npm".to_string(),
            ignore: vec!["package-lock.json".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorSettings {
    pub auto_update: bool,
    pub auto_start: bool,
    pub auto_restart: bool,
    pub restart_delay_ms: u64,
    /// Delay between individual file operations during an update.
    pub pacing_ms: u64,
}

impl Default for BehaviorSettings {
    fn default() -> Self {
        Self {
            auto_update: true,
            auto_start: true,
            auto_restart: true,
            restart_delay_ms: 1000,
            pacing_ms: 100,
        }
    }
}

pub fn generate_example_config() -> Result<String> {
    let config = ClientConfig::default();
    toml::to_string_pretty(&config).context("Failed to serialize default config")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/client.toml");

        let mut config = ClientConfig::default();
        config.connection.key = Some("abc".to_string());
        config.behavior.auto_restart = false;
        config.save(&path).unwrap();

        let loaded = ClientConfig::load(&path).unwrap();
        assert_eq!(loaded.connection.key.as_deref(), Some("abc"));
        assert!(!loaded.behavior.auto_restart);
        assert_eq!(loaded.project.ignore, vec!["package-lock.json"]);
        loaded.validate().unwrap();
    }

    #[test]
    fn test_validate_requires_start_script() {
        let config: ClientConfig = toml::from_str(
            r#"
            [project]
            start_script = ""
            "#,
        )
        .unwrap();
        assert_eq!(config.connection.reconnection_attempts, 10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_manifest_path() {
        let settings = ProjectSettings::default();
        assert_eq!(settings.manifest_path(), PathBuf::from("./project/package.json"));
    }
}
