//! Scripted container runtime and helpers shared by the tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use dockyard::compose::builder::RenderOptions;
use dockyard::deploy::runtime::{ContainerRuntime, ContainerSummary, LogSource};
use dockyard::deploy::shell::{ShellSession, TerminalSize};
use dockyard::deploy::transaction::DeploymentTransaction;
use dockyard::errors::DeployError;
use dockyard::models::project::{ProjectRecord, RegistryCredential, Upn};
use dockyard::models::service::{Public, Service};
use dockyard::storage::layout::{ProjectLayout, COMPOSE_FILE_NAME};
use dockyard::store::memory::MemoryStore;
use dockyard::store::{DesiredState, ProjectStore, ServiceRow};

/// A call the engine made against the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Login(String),
    Pull(String),
    Logout(String),
    Up,
    Down,
    List,
    Logs(String),
    Exec(String),
}

/// Runtime that records every call and fails on demand
#[derive(Default)]
pub struct FakeRuntime {
    calls: Mutex<Vec<Call>>,
    /// Compose file contents seen by every successful `up`
    ups: Mutex<Vec<Option<String>>>,
    failing_pulls: Mutex<HashSet<String>>,
    failing_logins: Mutex<HashSet<String>>,
    pull_delays: Mutex<HashMap<String, Duration>>,
    fail_up: AtomicBool,
    fail_down: AtomicBool,
    fail_logout: AtomicBool,
    containers: Mutex<Vec<ContainerSummary>>,
    log_lines: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_pull(&self, image: &str) {
        self.failing_pulls.lock().unwrap().insert(image.to_string());
    }

    pub fn fail_login(&self, registry: &str) {
        self.failing_logins
            .lock()
            .unwrap()
            .insert(registry.to_string());
    }

    pub fn delay_pull(&self, image: &str, delay: Duration) {
        self.pull_delays
            .lock()
            .unwrap()
            .insert(image.to_string(), delay);
    }

    pub fn fail_up(&self, fail: bool) {
        self.fail_up.store(fail, Ordering::SeqCst);
    }

    pub fn fail_down(&self, fail: bool) {
        self.fail_down.store(fail, Ordering::SeqCst);
    }

    pub fn fail_logout(&self, fail: bool) {
        self.fail_logout.store(fail, Ordering::SeqCst);
    }

    pub fn set_containers(&self, containers: Vec<ContainerSummary>) {
        *self.containers.lock().unwrap() = containers;
    }

    pub fn set_log_lines(&self, lines: &[&str]) {
        *self.log_lines.lock().unwrap() = lines.iter().map(|l| l.to_string()).collect();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ups(&self) -> Vec<Option<String>> {
        self.ups.lock().unwrap().clone()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Pull(image) => Some(image),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

fn scripted_failure(command: &str) -> DeployError {
    DeployError::subprocess(command, "exit code 1: scripted failure")
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn login(
        &self,
        _project_dir: &Path,
        credential: &RegistryCredential,
    ) -> Result<(), DeployError> {
        self.record(Call::Login(credential.registry.clone()));
        if self
            .failing_logins
            .lock()
            .unwrap()
            .contains(&credential.registry)
        {
            return Err(scripted_failure("docker login"));
        }
        Ok(())
    }

    async fn pull(&self, _project_dir: &Path, image: &str) -> Result<(), DeployError> {
        self.record(Call::Pull(image.to_string()));
        let delay = self.pull_delays.lock().unwrap().get(image).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_pulls.lock().unwrap().contains(image) {
            return Err(scripted_failure(&format!("docker pull {}", image)));
        }
        Ok(())
    }

    async fn logout(&self, _project_dir: &Path, registry: &str) -> Result<(), DeployError> {
        self.record(Call::Logout(registry.to_string()));
        if self.fail_logout.load(Ordering::SeqCst) {
            return Err(scripted_failure("docker logout"));
        }
        Ok(())
    }

    async fn compose_up(&self, project_dir: &Path) -> Result<(), DeployError> {
        self.record(Call::Up);
        if self.fail_up.load(Ordering::SeqCst) {
            return Err(scripted_failure("docker compose up -d"));
        }
        let contents = std::fs::read_to_string(project_dir.join(COMPOSE_FILE_NAME)).ok();
        self.ups.lock().unwrap().push(contents);
        Ok(())
    }

    async fn compose_down(&self, _project_dir: &Path) -> Result<(), DeployError> {
        self.record(Call::Down);
        if self.fail_down.load(Ordering::SeqCst) {
            return Err(scripted_failure("docker compose down --remove-orphans"));
        }
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DeployError> {
        self.record(Call::List);
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn compose_logs(
        &self,
        _project_dir: &Path,
        service: &str,
    ) -> Result<Box<dyn LogSource>, DeployError> {
        self.record(Call::Logs(service.to_string()));
        let lines = self.log_lines.lock().unwrap().clone();
        Ok(Box::new(ScriptedLogs(lines.into())))
    }

    /// Answers with a session that echoes its input
    async fn compose_exec(
        &self,
        _project_dir: &Path,
        service: &str,
        _size: TerminalSize,
    ) -> Result<ShellSession, DeployError> {
        self.record(Call::Exec(service.to_string()));
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(8);
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(8);
        let exit = tokio::spawn(async move {
            while let Some(data) = input_rx.recv().await {
                if output_tx.send(data).await.is_err() {
                    break;
                }
            }
            Ok(())
        });
        Ok(ShellSession::new(input_tx, output_rx, exit))
    }
}

struct ScriptedLogs(VecDeque<String>);

#[async_trait]
impl LogSource for ScriptedLogs {
    async fn next_line(&mut self) -> Result<Option<String>, DeployError> {
        Ok(self.0.pop_front())
    }
}

/// Memory store whose commits can be made to fail
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_commits: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProjectStore for FlakyStore {
    async fn save_project(&self, record: &ProjectRecord) -> Result<(), DeployError> {
        self.inner.save_project(record).await
    }

    async fn load_project(&self, upn: &Upn) -> Result<ProjectRecord, DeployError> {
        self.inner.load_project(upn).await
    }

    async fn delete_project(&self, upn: &Upn) -> Result<(), DeployError> {
        self.inner.delete_project(upn).await
    }

    async fn list_registry_credentials(
        &self,
        upn: &Upn,
    ) -> Result<Vec<RegistryCredential>, DeployError> {
        self.inner.list_registry_credentials(upn).await
    }

    async fn commit_desired_state(
        &self,
        upn: &Upn,
        state: &DesiredState,
    ) -> Result<(), DeployError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(DeployError::PersistenceFailure(
                "database unavailable".to_string(),
            ));
        }
        self.inner.commit_desired_state(upn, state).await
    }

    async fn load_services(&self, upn: &Upn) -> Result<Vec<ServiceRow>, DeployError> {
        self.inner.load_services(upn).await
    }

    async fn save_service_fragment(
        &self,
        upn: &Upn,
        usn: &str,
        name: &str,
        dcj: &str,
    ) -> Result<(), DeployError> {
        self.inner.save_service_fragment(upn, usn, name, dcj).await
    }

    async fn delete_services(&self, upn: &Upn, usns: &[String]) -> Result<(), DeployError> {
        self.inner.delete_services(upn, usns).await
    }
}

/// A valid service with a port and an image
pub fn service(usn: &str, image: &str) -> Service {
    Service {
        usn: usn.to_string(),
        name: usn.to_string(),
        image: image.to_string(),
        image_tag: "1.0".to_string(),
        ports: vec!["8080".to_string()],
        public: Public::default(),
        ..Default::default()
    }
}

/// A project directory inside a temporary projects root
pub struct Workspace {
    pub temp: tempfile::TempDir,
    pub layout: ProjectLayout,
    pub upn: Upn,
}

impl Workspace {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(temp.path());
        Self {
            temp,
            layout,
            upn: Upn::from("brave-otter-a1b2c3d4e5"),
        }
    }

    pub fn project_dir(&self) -> PathBuf {
        self.layout.project_dir(&self.upn).path().to_path_buf()
    }

    pub fn compose_path(&self) -> PathBuf {
        self.layout.compose_file(&self.upn).path().to_path_buf()
    }

    pub fn config_path(&self) -> PathBuf {
        self.layout.docker_config_file(&self.upn).path().to_path_buf()
    }

    /// Write a previously deployed configuration
    pub fn seed(&self, compose: &str, config: &str) {
        std::fs::create_dir_all(self.project_dir()).unwrap();
        std::fs::write(self.compose_path(), compose).unwrap();
        std::fs::write(self.config_path(), config).unwrap();
    }

    /// Every `*.tmp` file left in the project directory
    pub fn backups(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(self.project_dir()) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map(|x| x == "tmp").unwrap_or(false))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn transaction(
        &self,
        runtime: Arc<FakeRuntime>,
        store: Arc<dyn ProjectStore>,
    ) -> DeploymentTransaction {
        DeploymentTransaction::new(
            self.upn.clone(),
            self.layout.clone(),
            runtime,
            store,
            RenderOptions::default(),
        )
    }
}
