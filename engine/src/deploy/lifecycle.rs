//! Container lifecycle of one project

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::deploy::runtime::{ContainerRuntime, LogSource, SERVICE_LABEL, WORKING_DIR_LABEL};
use crate::deploy::shell::{ShellSession, TerminalSize};
use crate::errors::{DeployError, ServiceFailure};
use crate::models::project::RegistryCredential;

/// State of one service's container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    pub state: String,
    pub status: String,
}

impl ContainerState {
    /// Running or paused containers still hold the project's resources
    pub fn is_active(&self) -> bool {
        self.state == "running" || self.state == "paused"
    }
}

/// An image to pull, tagged with the service it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub service: String,
    pub image: String,
}

/// Drives login, pull, logout, up and down for a single project directory
#[derive(Clone)]
pub struct ContainerLifecycle {
    runtime: Arc<dyn ContainerRuntime>,
    project_dir: PathBuf,
}

impl ContainerLifecycle {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            project_dir: project_dir.into(),
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Log in to every registry in order, stopping at the first failure
    pub async fn login(&self, credentials: &[RegistryCredential]) -> Result<(), DeployError> {
        for credential in credentials {
            debug!("Logging in to registry {}", credential.registry);
            self.runtime
                .login(&self.project_dir, credential)
                .await
                .map_err(|e| {
                    error!("Unable to log in to {}: {}", credential.registry, e);
                    e
                })?;
        }
        Ok(())
    }

    /// Pull every image concurrently.
    ///
    /// All pulls run to completion even when some fail; the result names
    /// every failed service.
    pub async fn pull(&self, requests: Vec<PullRequest>) -> Result<(), DeployError> {
        if requests.is_empty() {
            return Ok(());
        }

        info!(
            "Pulling {} images for {}",
            requests.len(),
            self.project_dir.display()
        );

        let mut tasks = JoinSet::new();
        for request in requests {
            let runtime = self.runtime.clone();
            let dir = self.project_dir.clone();
            tasks.spawn(async move {
                let result = runtime.pull(&dir, &request.image).await;
                (request, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((request, Ok(()))) => debug!("Pulled {} for {}", request.image, request.service),
                Ok((request, Err(e))) => {
                    error!("Unable to pull {} for {}: {}", request.image, request.service, e);
                    failures.push(ServiceFailure {
                        service: request.service,
                        message: e.to_string(),
                    });
                }
                Err(e) => failures.push(ServiceFailure {
                    service: "<unknown>".to_string(),
                    message: format!("pull task failed: {}", e),
                }),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            failures.sort_by(|a, b| a.service.cmp(&b.service));
            Err(DeployError::PullAggregateFailure(failures))
        }
    }

    /// Log out of every registry in order, stopping at the first failure
    pub async fn logout(&self, credentials: &[RegistryCredential]) -> Result<(), DeployError> {
        for credential in credentials {
            self.runtime
                .logout(&self.project_dir, &credential.registry)
                .await?;
        }
        Ok(())
    }

    /// Login, pull, logout, then `compose up`.
    ///
    /// With no pulls and no credentials this just brings up whatever compose
    /// file is in place.
    pub async fn start(
        &self,
        pulls: Vec<PullRequest>,
        credentials: &[RegistryCredential],
    ) -> Result<(), DeployError> {
        self.login(credentials).await?;
        self.pull(pulls).await?;
        self.logout(credentials).await?;
        self.up().await
    }

    pub async fn up(&self) -> Result<(), DeployError> {
        info!("Starting containers in {}", self.project_dir.display());
        self.runtime.compose_up(&self.project_dir).await
    }

    pub async fn down(&self) -> Result<(), DeployError> {
        info!("Stopping containers in {}", self.project_dir.display());
        self.runtime.compose_down(&self.project_dir).await
    }

    /// State of every container whose compose working directory ends with
    /// this project's directory, keyed by service
    pub async fn container_state(&self) -> Result<HashMap<String, ContainerState>, DeployError> {
        let dir = self.project_dir.to_string_lossy();
        let containers = self.runtime.list_containers().await?;

        Ok(containers
            .into_iter()
            .filter(|c| {
                c.labels
                    .get(WORKING_DIR_LABEL)
                    .map(|wd| wd.ends_with(dir.as_ref()))
                    .unwrap_or(false)
            })
            .map(|c| {
                let service = c.labels.get(SERVICE_LABEL).cloned().unwrap_or_default();
                (
                    service,
                    ContainerState {
                        state: c.state,
                        status: c.status,
                    },
                )
            })
            .collect())
    }

    /// Whether any container of the project is running or paused
    pub async fn any_container_running(&self) -> Result<bool, DeployError> {
        Ok(self
            .container_state()
            .await?
            .values()
            .any(ContainerState::is_active))
    }

    /// Follow one service's logs
    pub async fn logs(&self, service: &str) -> Result<Box<dyn LogSource>, DeployError> {
        self.runtime.compose_logs(&self.project_dir, service).await
    }

    /// Interactive shell in one service's container
    pub async fn shell(
        &self,
        service: &str,
        size: TerminalSize,
    ) -> Result<ShellSession, DeployError> {
        info!("Opening shell in {} of {}", service, self.project_dir.display());
        self.runtime
            .compose_exec(&self.project_dir, service, size)
            .await
    }
}
