//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::deploy::runtime::{ContainerRuntime, DockerCli};
use crate::errors::DeployError;
use crate::store::file::FileStore;
use crate::store::ProjectStore;

/// Handles shared by every project operation
#[derive(Clone)]
pub struct AppState {
    pub options: AppOptions,

    /// Project and service records
    pub store: Arc<dyn ProjectStore>,

    /// Container runtime
    pub runtime: Arc<dyn ContainerRuntime>,
}

impl AppState {
    /// Assemble state from explicitly constructed handles
    pub fn new(
        options: AppOptions,
        store: Arc<dyn ProjectStore>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            options,
            store,
            runtime,
        }
    }

    /// File store plus the docker CLI, as configured
    pub async fn init(options: AppOptions) -> Result<Self, DeployError> {
        info!("Initializing application state...");

        tokio::fs::create_dir_all(options.layout.root()).await?;
        tokio::fs::create_dir_all(&options.state_dir).await?;

        let store = Arc::new(FileStore::new(&options.state_dir));
        let runtime = Arc::new(DockerCli::new(
            options.runtime.docker_command.clone(),
            options.runtime.compose_command.clone(),
        )?);

        Ok(Self::new(options, store, runtime))
    }
}
