use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::core::errors::{BearError, Result};
use crate::deploy::remote::HostAddress;

/// Deployment configuration, usually loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BearConfig {
    /// Application name, used for grid and service names
    pub name: String,
    /// Size of the worker pool; one worker per host is needed for hosts to
    /// wait on each other
    pub max_workers: usize,
    /// Default bound for waits on another host's step, in milliseconds
    pub wait_timeout_ms: u64,
    pub releases: ReleasesConfig,
    pub stages: Vec<StageConfig>,
}

impl Default for BearConfig {
    fn default() -> Self {
        Self {
            name: "app".to_string(),
            max_workers: 8,
            wait_timeout_ms: 30_000,
            releases: ReleasesConfig::default(),
            stages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReleasesConfig {
    /// Application root on every host; releases live in `<root>/releases`
    pub root: String,
    /// Releases kept by cleanup, the current one included
    pub keep_releases: usize,
    /// Folder name of the release being prepared
    pub pending_name: String,
    /// Remove an abandoned pending folder before preparing a new one
    pub clean_pending: bool,
}

impl Default for ReleasesConfig {
    fn default() -> Self {
        Self {
            root: "/var/lib/bear/app".to_string(),
            keep_releases: 5,
            pending_name: "pending".to_string(),
            clean_pending: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageConfig {
    pub name: String,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

/// One target host. The password is read from config but never written
/// back out or printed.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostConfig {
    pub name: String,
    pub address: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

fn default_username() -> String {
    "root".to_string()
}

impl HostConfig {
    pub fn host_address(&self) -> HostAddress {
        HostAddress::new(&self.username, &self.address).with_password(self.password.clone())
    }
}

impl fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostConfig")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl BearConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: BearConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| BearError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn stage(&self, name: &str) -> Result<&StageConfig> {
        self.stages
            .iter()
            .find(|stage| stage.name == name)
            .ok_or_else(|| BearError::configuration_field(format!("unknown stage '{}'", name), "stages"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(BearError::validation_field(
                "max_workers must be greater than 0",
                "max_workers",
            ));
        }
        if self.releases.keep_releases == 0 {
            return Err(BearError::validation_field(
                "keep_releases must keep at least the current release",
                "releases.keep_releases",
            ));
        }
        if self.releases.root.trim().is_empty() {
            return Err(BearError::validation_field(
                "releases root must not be empty",
                "releases.root",
            ));
        }

        let mut stage_names = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(BearError::validation_field(
                    "stage name must not be empty",
                    "stages.name",
                ));
            }
            if !stage_names.insert(stage.name.as_str()) {
                return Err(BearError::validation_field(
                    format!("duplicate stage '{}'", stage.name),
                    "stages.name",
                ));
            }
            if stage.hosts.is_empty() {
                return Err(BearError::validation_field(
                    format!("stage '{}' has no hosts", stage.name),
                    "stages.hosts",
                ));
            }

            let mut host_names = HashSet::new();
            for host in &stage.hosts {
                if !host_names.insert(host.name.as_str()) {
                    return Err(BearError::validation_field(
                        format!("duplicate host '{}' in stage '{}'", host.name, stage.name),
                        "stages.hosts.name",
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const YAML: &str = r#"
name: shop
max_workers: 4
wait_timeout_ms: 500
releases:
  root: /var/lib/shop
  keep_releases: 3
stages:
  - name: staging
    hosts:
      - name: web-1
        address: 10.0.0.1
        username: deploy
        password: s3cret
      - name: web-2
        address: 10.0.0.2
"#;

    #[test]
    fn test_load_from_yaml() {
        let config = BearConfig::from_yaml_str(YAML).unwrap();
        assert_eq!(config.name, "shop");
        assert_eq!(config.wait_timeout(), Duration::from_millis(500));
        assert_eq!(config.releases.pending_name, "pending");
        assert!(config.releases.clean_pending);

        let stage = config.stage("staging").unwrap();
        assert_eq!(stage.hosts.len(), 2);
        assert_eq!(stage.hosts[1].username, "root");
        assert!(config.stage("production").is_err());
    }

    #[test]
    fn test_password_never_leaves() {
        let config = BearConfig::from_yaml_str(YAML).unwrap();
        let host = &config.stage("staging").unwrap().hosts[0];
        assert_eq!(host.password.as_deref(), Some("s3cret"));

        assert!(!format!("{:?}", host).contains("s3cret"));
        assert!(!config.to_yaml().unwrap().contains("s3cret"));
        assert_eq!(host.host_address().to_string(), "deploy@10.0.0.1");
    }

    #[test]
    fn test_validation() {
        let mut config = BearConfig::from_yaml_str(YAML).unwrap();
        config.max_workers = 0;
        assert_eq!(config.validate().unwrap_err().category(), "validation");

        let duplicate_host = YAML.replace("name: web-2", "name: web-1");
        assert!(BearConfig::from_yaml_str(&duplicate_host).is_err());

        let empty_stage = "stages:\n  - name: qa\n";
        assert!(BearConfig::from_yaml_str(empty_stage).is_err());

        assert!(BearConfig::from_yaml_str("{}").is_ok());
    }
}
