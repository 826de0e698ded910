//! Container runtime boundary
//!
//! Everything the engine asks of docker and compose goes through
//! [`ContainerRuntime`]. [`DockerCli`] drives the real CLIs; tests substitute
//! a scripted runtime.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::deploy::process::{LineStream, ProcessCommand, ProcessRunner};
use crate::deploy::shell::{spawn_pty, ShellSession, TerminalSize, SHELL};
use crate::errors::DeployError;
use crate::models::project::RegistryCredential;

/// Label compose puts on every container with its project directory
pub const WORKING_DIR_LABEL: &str = "com.docker.compose.project.working_dir";

/// Label compose puts on every container with its service key
pub const SERVICE_LABEL: &str = "com.docker.compose.service";

/// A container as reported by the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    pub labels: HashMap<String, String>,
    /// Machine state, e.g. `running`
    pub state: String,
    /// Human status, e.g. `Up 3 hours`
    pub status: String,
}

/// A source of log lines for one service
#[async_trait]
pub trait LogSource: Send {
    /// Next line, `None` when the source is exhausted
    async fn next_line(&mut self) -> Result<Option<String>, DeployError>;
}

#[async_trait]
impl LogSource for LineStream {
    async fn next_line(&mut self) -> Result<Option<String>, DeployError> {
        LineStream::next_line(self).await
    }
}

/// Container runtime operations, all scoped to a project directory
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Log in to a registry, storing credentials in the project directory
    async fn login(&self, project_dir: &Path, credential: &RegistryCredential)
        -> Result<(), DeployError>;

    /// Pull one image
    async fn pull(&self, project_dir: &Path, image: &str) -> Result<(), DeployError>;

    /// Log out of a registry
    async fn logout(&self, project_dir: &Path, registry: &str) -> Result<(), DeployError>;

    /// `compose up -d`
    async fn compose_up(&self, project_dir: &Path) -> Result<(), DeployError>;

    /// `compose down --remove-orphans`
    async fn compose_down(&self, project_dir: &Path) -> Result<(), DeployError>;

    /// Every compose-managed container on the host
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DeployError>;

    /// Follow the logs of one service
    async fn compose_logs(
        &self,
        project_dir: &Path,
        service: &str,
    ) -> Result<Box<dyn LogSource>, DeployError>;

    /// Open an interactive shell in one service's container
    async fn compose_exec(
        &self,
        project_dir: &Path,
        service: &str,
        size: TerminalSize,
    ) -> Result<ShellSession, DeployError>;
}

/// Runtime backed by the docker and compose command line tools
#[derive(Debug, Clone)]
pub struct DockerCli {
    docker: String,
    compose: Vec<String>,
    runner: ProcessRunner,
}

impl DockerCli {
    /// `compose` is the compose invocation, program first (e.g. `docker compose`)
    pub fn new(docker: impl Into<String>, compose: Vec<String>) -> Result<Self, DeployError> {
        if compose.is_empty() {
            return Err(DeployError::Config(
                "compose command must not be empty".to_string(),
            ));
        }
        Ok(Self {
            docker: docker.into(),
            compose,
            runner: ProcessRunner::new(),
        })
    }

    /// Docker invocation using the project directory as its config directory
    fn docker(&self, project_dir: &Path) -> ProcessCommand {
        ProcessCommand::new(&self.docker)
            .args(["--config", "./"])
            .current_dir(project_dir)
    }

    fn compose(&self, project_dir: &Path) -> ProcessCommand {
        ProcessCommand::new(&self.compose[0])
            .args(self.compose[1..].iter().cloned())
            .current_dir(project_dir)
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn login(
        &self,
        project_dir: &Path,
        credential: &RegistryCredential,
    ) -> Result<(), DeployError> {
        let cmd = self
            .docker(project_dir)
            .args([
                "login",
                credential.registry.as_str(),
                "-u",
                credential.username.as_str(),
                "--password-stdin",
            ])
            .stdin(credential.password.clone());
        self.runner.run(&cmd).await
    }

    async fn pull(&self, project_dir: &Path, image: &str) -> Result<(), DeployError> {
        let cmd = self.docker(project_dir).args(["pull", image]);
        self.runner.run(&cmd).await
    }

    async fn logout(&self, project_dir: &Path, registry: &str) -> Result<(), DeployError> {
        let cmd = self.docker(project_dir).args(["logout", registry]);
        self.runner.run(&cmd).await
    }

    async fn compose_up(&self, project_dir: &Path) -> Result<(), DeployError> {
        let cmd = self.compose(project_dir).args(["up", "-d"]);
        self.runner.run(&cmd).await
    }

    async fn compose_down(&self, project_dir: &Path) -> Result<(), DeployError> {
        let cmd = self.compose(project_dir).args(["down", "--remove-orphans"]);
        self.runner.run(&cmd).await
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DeployError> {
        let cmd = ProcessCommand::new(&self.docker).args([
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("label={}", WORKING_DIR_LABEL),
            "--format".to_string(),
            "{{json .}}".to_string(),
        ]);
        let lines = self.runner.output(&cmd).await?;
        parse_container_list(&lines)
    }

    async fn compose_logs(
        &self,
        project_dir: &Path,
        service: &str,
    ) -> Result<Box<dyn LogSource>, DeployError> {
        let cmd = self.compose(project_dir).args(["logs", "-f", service]);
        Ok(Box::new(self.runner.spawn_lines(&cmd)?))
    }

    async fn compose_exec(
        &self,
        project_dir: &Path,
        service: &str,
        size: TerminalSize,
    ) -> Result<ShellSession, DeployError> {
        let cmd = self.compose(project_dir).args(["exec", service, SHELL]);
        spawn_pty(&cmd, size)
    }
}

#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "Labels", default)]
    labels: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Status", default)]
    status: String,
}

/// Parse `docker ps --format '{{json .}}'` output, one JSON object per line
pub fn parse_container_list(lines: &[String]) -> Result<Vec<ContainerSummary>, DeployError> {
    let mut containers = Vec::new();
    for line in lines.iter().map(|l| l.trim()).filter(|l| !l.is_empty()) {
        let ps: PsLine = serde_json::from_str(line)?;
        containers.push(ContainerSummary {
            labels: parse_labels(&ps.labels),
            state: ps.state,
            status: ps.status,
        });
    }
    debug!("Runtime reported {} containers", containers.len());
    Ok(containers)
}

fn parse_labels(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
