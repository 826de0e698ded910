//! Deployment transaction
//!
//! Stop, back up, apply, pull, start, commit. Any failure once a backup
//! exists restores the backup and brings the previous configuration back up
//! before the single failure is returned to the caller.

use std::fmt;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::compose::builder::{render_yaml, service_key, RenderOptions};
use crate::compose::fragment;
use crate::deploy::fsm::{TransactionEvent, TransactionFsm, TransactionState};
use crate::deploy::lifecycle::{ContainerLifecycle, PullRequest};
use crate::deploy::reconcile::{ReconcilePlan, Reconciler};
use crate::deploy::runtime::ContainerRuntime;
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::models::project::{RegistryCredential, Upn};
use crate::models::service::Service;
use crate::storage::layout::ProjectLayout;
use crate::store::{DesiredState, ProjectStore, ServiceRow};

/// Step of a transaction, as reported in failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Prepare,
    Stop,
    Backup,
    Apply,
    Pull,
    Start,
    Commit,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Prepare => "prepare",
            Step::Stop => "stop",
            Step::Backup => "backup",
            Step::Apply => "apply",
            Step::Pull => "pull",
            Step::Start => "start",
            Step::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// One redeploy of one project
pub struct DeploymentTransaction {
    upn: Upn,
    layout: ProjectLayout,
    lifecycle: ContainerLifecycle,
    store: Arc<dyn ProjectStore>,
    reconciler: Reconciler,
    options: RenderOptions,
    fsm: TransactionFsm,
    /// Which configuration files were moved to a backup
    backed_up: [bool; 2],
}

impl DeploymentTransaction {
    pub fn new(
        upn: Upn,
        layout: ProjectLayout,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn ProjectStore>,
        options: RenderOptions,
    ) -> Self {
        let lifecycle = ContainerLifecycle::new(runtime, layout.project_dir(&upn).path());
        let reconciler = Reconciler::new(store.clone(), layout.clone());
        Self {
            upn,
            layout,
            lifecycle,
            store,
            reconciler,
            options,
            fsm: TransactionFsm::new(),
            backed_up: [false; 2],
        }
    }

    pub fn state(&self) -> TransactionState {
        self.fsm.state()
    }

    /// States visited so far
    pub fn history(&self) -> &[TransactionState] {
        self.fsm.history()
    }

    /// Deploy `services` as the project's complete desired state
    pub async fn execute(
        mut self,
        services: &[Service],
        credentials: &[RegistryCredential],
    ) -> Result<TransactionState, DeployError> {
        self.run(services, credentials).await?;
        Ok(self.state())
    }

    /// Like [`execute`](Self::execute) but keeps the transaction around so the
    /// path it took can be inspected
    pub async fn run(
        &mut self,
        services: &[Service],
        credentials: &[RegistryCredential],
    ) -> Result<(), DeployError> {
        info!("Deploying {} services to {}", services.len(), self.upn);

        // Render and plan before anything is touched
        let prepared = match self.prepare(services).await {
            Ok(prepared) => prepared,
            Err(e) => return Err(self.fail(Step::Prepare, e).await),
        };

        if let Err(e) = self.stop().await {
            return Err(self.fail(Step::Stop, e).await);
        }
        self.advance(TransactionEvent::Stop)?;

        if let Err(e) = self.backup().await {
            return Err(self.fail(Step::Backup, e).await);
        }
        self.advance(TransactionEvent::Backup)?;

        if let Err(e) = self.apply(services, &prepared.yaml).await {
            return Err(self.fail(Step::Apply, e).await);
        }
        self.advance(TransactionEvent::Apply)?;

        if let Err(e) = self.pull(services, credentials).await {
            return Err(self.fail(Step::Pull, e).await);
        }
        self.advance(TransactionEvent::Pull)?;

        if let Err(e) = self.lifecycle.up().await {
            return Err(self.fail(Step::Start, e).await);
        }
        self.advance(TransactionEvent::Start)?;

        if let Err(e) = self.commit(&prepared, credentials).await {
            return Err(self.fail(Step::Commit, e).await);
        }
        self.advance(TransactionEvent::Commit)?;

        info!("Deployment of {} committed", self.upn);
        Ok(())
    }

    async fn prepare(&self, services: &[Service]) -> Result<Prepared, DeployError> {
        for service in services {
            service.validate()?;
        }
        let yaml = render_yaml(services, self.upn.as_str(), &self.options)?;
        let plan = self.reconciler.plan(&self.upn, services).await?;

        let mut rows = Vec::with_capacity(services.len());
        for service in services {
            rows.push(ServiceRow {
                usn: service.usn.clone(),
                name: service.name.clone(),
                dcj: fragment::encode(service, self.upn.as_str(), &self.options)?,
            });
        }
        Ok(Prepared { yaml, plan, rows })
    }

    async fn stop(&self) -> Result<(), DeployError> {
        if !self.layout.compose_file(&self.upn).exists().await {
            info!("No compose file for {} yet, nothing to stop", self.upn);
            return Ok(());
        }
        self.lifecycle.down().await
    }

    /// Move both configuration files to their backup names.
    ///
    /// If the second move fails the first is undone.
    async fn backup(&mut self) -> Result<(), DeployError> {
        let [compose, config] = self.layout.config_files(&self.upn);

        let first = compose
            .move_to_backup()
            .await
            .map_err(|e| DeployError::BackupFailure(format!("{}: {}", compose.name(), e)))?;

        let second = match config.move_to_backup().await {
            Ok(moved) => moved,
            Err(e) => {
                if first {
                    if let Err(undo) = compose.restore_backup().await {
                        error!("Unable to undo backup of {}: {}", compose.name(), undo);
                    }
                }
                return Err(DeployError::BackupFailure(format!(
                    "{}: {}",
                    config.name(),
                    e
                )));
            }
        };

        self.backed_up = [first, second];
        Ok(())
    }

    async fn apply(&self, services: &[Service], yaml: &str) -> Result<(), DeployError> {
        self.layout
            .compose_file(&self.upn)
            .write_private(yaml.as_bytes())
            .await?;

        for service in services.iter().filter(|s| s.has_volumes()) {
            self.layout
                .service_volume_dir(&self.upn, &service_key(service))
                .create()
                .await?;
        }
        Ok(())
    }

    async fn pull(
        &self,
        services: &[Service],
        credentials: &[RegistryCredential],
    ) -> Result<(), DeployError> {
        let mut requests = Vec::with_capacity(services.len());
        for service in services {
            requests.push(PullRequest {
                service: service.label().to_string(),
                image: service.image_reference()?,
            });
        }

        self.lifecycle.login(credentials).await?;
        self.lifecycle.pull(requests).await?;
        self.lifecycle.logout(credentials).await
    }

    /// Persist the desired state in one store commit, then discard stale
    /// volumes and the backups
    async fn commit(
        &self,
        prepared: &Prepared,
        credentials: &[RegistryCredential],
    ) -> Result<(), DeployError> {
        let desired = DesiredState {
            services: prepared.rows.clone(),
            stale: prepared.plan.stale.clone(),
            credentials: credentials.to_vec(),
        };
        self.store
            .commit_desired_state(&self.upn, &desired)
            .await
            .map_err(as_persistence)?;

        self.reconciler
            .remove_volumes(&self.upn, &prepared.plan)
            .await;

        for file in self.layout.config_files(&self.upn) {
            if let Err(e) = file.backup().delete().await {
                error!("Unable to remove backup {}: {}", file.backup().name(), e);
            }
        }
        Ok(())
    }

    fn advance(&mut self, event: TransactionEvent) -> Result<(), DeployError> {
        self.fsm.process(event).map(|_| ())
    }

    /// Record the failure, roll back if a backup exists, and wrap the error
    async fn fail(&mut self, step: Step, err: DeployError) -> DeployError {
        error!("Deployment of {} failed during {}: {}", self.upn, step, err);

        if let Err(e) = self.fsm.process(TransactionEvent::Fail(err.to_string())) {
            error!("{}", e);
        }

        if self.fsm.state().needs_rollback() {
            let outcome = match self.rollback(step).await {
                Ok(()) => TransactionEvent::RollbackComplete,
                Err(e) => {
                    error!("Rollback of {} incomplete: {}", self.upn, e);
                    TransactionEvent::RollbackFailed(e.to_string())
                }
            };
            if let Err(e) = self.fsm.process(outcome) {
                error!("{}", e);
            }
        }

        DeployError::DeploymentFailed {
            step: step.to_string(),
            source: Box::new(err),
        }
    }

    /// Restore the backups and start whatever configuration is then in place
    async fn rollback(&self, failed: Step) -> Result<(), DeployError> {
        info!("Rolling back {}", self.upn);
        let mut problems = Vec::new();

        // New containers may be running once `up` has been attempted
        if matches!(failed, Step::Start | Step::Commit) {
            if let Err(e) = self.lifecycle.down().await {
                warn!("Unable to stop new containers of {}: {}", self.upn, e);
            }
        }

        let files = self.layout.config_files(&self.upn);
        for (file, backed_up) in files.iter().zip(self.backed_up) {
            if let Err(e) = restore(file, backed_up).await {
                error!("Unable to restore {}: {}", file.name(), e);
                problems.push(format!("{}: {}", file.name(), e));
            }
        }

        if self.layout.compose_file(&self.upn).exists().await {
            if let Err(e) = self.lifecycle.start(Vec::new(), &[]).await {
                problems.push(e.to_string());
            }
        } else {
            info!("No previous configuration for {}, leaving it stopped", self.upn);
        }

        if problems.is_empty() {
            info!("Rolled back {}", self.upn);
            Ok(())
        } else {
            Err(DeployError::RollbackPartialFailure(problems.join("; ")))
        }
    }
}

/// Put a configuration file back the way it was before the transaction
async fn restore(file: &File, backed_up: bool) -> Result<(), DeployError> {
    if backed_up {
        file.restore_backup().await
    } else {
        // Written by this transaction; there was nothing before it
        file.delete().await
    }
}

fn as_persistence(err: DeployError) -> DeployError {
    match err {
        DeployError::PersistenceFailure(_) => err,
        other => DeployError::PersistenceFailure(other.to_string()),
    }
}

/// Everything derived from the desired services before the first side effect
struct Prepared {
    yaml: String,
    plan: ReconcilePlan,
    rows: Vec<ServiceRow>,
}
