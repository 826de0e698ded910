//! Settings file management

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use tracing::info;

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Settings file read when no `--config` is given
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/dockyard/settings.json";

/// Deployment environment.
///
/// In production the shared `web` network is owned by the reverse proxy and
/// must already exist; in development compose is allowed to create it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Development,
}

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit logs as JSON
    #[serde(default)]
    pub log_json: bool,

    /// Optional directory for rolling log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Deployment environment
    #[serde(default)]
    pub environment: Environment,

    /// Root directory holding one sub-directory per project
    #[serde(default = "default_projects_dir")]
    pub projects_dir: PathBuf,

    /// Directory of the project/service record store
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Domain used to synthesize default hosts for public services
    #[serde(default = "default_base_domain")]
    pub base_domain: String,

    /// Reverse proxy certificate resolver for TLS routers
    #[serde(default = "default_cert_resolver")]
    pub cert_resolver: String,

    /// Container runtime executable
    #[serde(default = "default_docker_command")]
    pub docker_command: String,

    /// Compose invocation, program first
    #[serde(default = "default_compose_command")]
    pub compose_command: Vec<String>,

    /// Resource limits applied to every container
    #[serde(default)]
    pub container_limits: Option<ContainerLimitSettings>,

    /// Replica count applied to every container
    #[serde(default)]
    pub container_replicas: Option<u32>,
}

fn default_projects_dir() -> PathBuf {
    PathBuf::from("/var/lib/dockyard/projects")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/dockyard/state")
}

fn default_base_domain() -> String {
    "localhost".to_string()
}

fn default_cert_resolver() -> String {
    "le".to_string()
}

fn default_docker_command() -> String {
    "docker".to_string()
}

fn default_compose_command() -> Vec<String> {
    vec!["docker".to_string(), "compose".to_string()]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            environment: Environment::default(),
            projects_dir: default_projects_dir(),
            state_dir: default_state_dir(),
            base_domain: default_base_domain(),
            cert_resolver: default_cert_resolver(),
            docker_command: default_docker_command(),
            compose_command: default_compose_command(),
            container_limits: None,
            container_replicas: None,
        }
    }
}

impl Settings {
    /// Read the settings file, falling back to defaults when it does not exist
    pub async fn load(file: &File) -> Result<Self, DeployError> {
        if !file.exists().await {
            info!(
                "No settings file at {}, using defaults",
                file.path().display()
            );
            return Ok(Self::default());
        }
        file.read_json()
            .await
            .map_err(|e| DeployError::Config(format!("{}: {}", file.path().display(), e)))
    }
}

/// Container resource limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLimitSettings {
    /// CPU quota, e.g. "0.5"
    pub cpus: String,

    /// Memory limit, e.g. "512M"
    pub memory: String,
}
