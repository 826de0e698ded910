//! Application configuration options

use std::path::PathBuf;

use crate::compose::builder::RenderOptions;
use crate::compose::labels::IngressOptions;
use crate::storage::layout::ProjectLayout;
use crate::storage::settings::Settings;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Where project directories live
    pub layout: ProjectLayout,

    /// Where the file store keeps its records
    pub state_dir: PathBuf,

    /// How compose documents are rendered
    pub render: RenderOptions,

    /// Container runtime commands
    pub runtime: RuntimeOptions,
}

/// External commands driving the container runtime
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub docker_command: String,
    pub compose_command: Vec<String>,
}

impl AppOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            layout: ProjectLayout::new(&settings.projects_dir),
            state_dir: settings.state_dir.clone(),
            render: RenderOptions {
                environment: settings.environment,
                ingress: IngressOptions {
                    base_domain: settings.base_domain.clone(),
                    cert_resolver: settings.cert_resolver.clone(),
                },
                container_limits: settings.container_limits.clone(),
                container_replicas: settings.container_replicas,
            },
            runtime: RuntimeOptions {
                docker_command: settings.docker_command.clone(),
                compose_command: settings.compose_command.clone(),
            },
        }
    }
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}
