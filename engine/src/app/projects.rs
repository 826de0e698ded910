//! Project lifecycle operations
//!
//! Every mutating operation on a project holds that project's lock, so two
//! requests against the same UPN never run their transactions concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::app::state::AppState;
use crate::compose::builder::{render_yaml, service_key};
use crate::compose::fragment;
use crate::deploy::lifecycle::{ContainerLifecycle, ContainerState};
use crate::deploy::logstream::LogStream;
use crate::deploy::shell::{ShellSession, TerminalSize};
use crate::deploy::transaction::DeploymentTransaction;
use crate::errors::DeployError;
use crate::models::project::{Project, ProjectRecord, RegistryCredential, Upn};
use crate::models::service::Service;
use crate::store::{load_desired_services, DesiredState, ServiceRow};
use crate::utils::{digest_eq, rand_string, random_name};

/// Length of the random suffix of a UPN
const UPN_SUFFIX_LEN: usize = 10;

/// Length of a webhook access token
const ACCESS_TOKEN_LEN: usize = 12;

/// Length of the random suffix of a USN
const USN_SUFFIX_LEN: usize = 6;

/// Creates, redeploys and removes projects
pub struct ProjectManager {
    state: AppState,
    locks: Mutex<HashMap<Upn, Arc<Mutex<()>>>>,
}

impl ProjectManager {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    async fn lock(&self, upn: &Upn) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(upn.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of UPNs with a lock entry
    pub async fn tracked_locks(&self) -> usize {
        self.locks.lock().await.len()
    }

    fn lifecycle(&self, upn: &Upn) -> ContainerLifecycle {
        ContainerLifecycle::new(
            self.state.runtime.clone(),
            self.state.options.layout.project_dir(upn).path(),
        )
    }

    /// Create a project: allocate names, lay out its directory, write its
    /// first compose document and persist it. Nothing is started.
    pub async fn create(
        &self,
        name: &str,
        mut services: Vec<Service>,
        credentials: Vec<RegistryCredential>,
    ) -> Result<Project, DeployError> {
        if name.trim().is_empty() {
            return Err(DeployError::Validation("project name is required".to_string()));
        }
        assign_usns(&mut services);
        for service in &services {
            service.validate()?;
        }

        let upn = Upn::new(format!("{}-{}", random_name(), rand_string(UPN_SUFFIX_LEN)));
        let layout = &self.state.options.layout;
        let options = &self.state.options.render;

        // Render before anything touches the disk
        let yaml = render_yaml(&services, upn.as_str(), options)?;
        let mut rows = Vec::with_capacity(services.len());
        for service in &services {
            rows.push(ServiceRow {
                usn: service.usn.clone(),
                name: service.name.clone(),
                dcj: fragment::encode(service, upn.as_str(), options)?,
            });
        }

        // The UPN is fresh, so no other request can hold its lock yet
        let project_dir = layout.project_dir(&upn);
        project_dir.create().await?;

        let record = ProjectRecord {
            upn: upn.clone(),
            name: name.to_string(),
            access_token: rand_string(ACCESS_TOKEN_LEN),
            path: project_dir.path().to_string_lossy().into_owned(),
        };

        let prepared = async {
            for service in services.iter().filter(|s| s.has_volumes()) {
                layout
                    .service_volume_dir(&upn, &service_key(service))
                    .create()
                    .await?;
            }
            layout
                .compose_file(&upn)
                .write_private(yaml.as_bytes())
                .await?;
            self.persist_new(&record, rows, &credentials)
                .await
        }
        .await;

        if let Err(e) = prepared {
            error!("Unable to create project {}: {}", upn, e);
            if let Err(cleanup) = project_dir.delete().await {
                warn!("Unable to remove {}: {}", project_dir.path().display(), cleanup);
            }
            if let Err(cleanup) = self.state.store.delete_project(&upn).await {
                warn!("Unable to remove records of {}: {}", upn, cleanup);
            }
            return Err(e);
        }

        info!("Created project {} ({})", upn, name);
        Ok(Project {
            record,
            services,
            registry_credentials: credentials,
        })
    }

    async fn persist_new(
        &self,
        record: &ProjectRecord,
        rows: Vec<ServiceRow>,
        credentials: &[RegistryCredential],
    ) -> Result<(), DeployError> {
        let store = &self.state.store;
        store.save_project(record).await?;
        let desired = DesiredState {
            services: rows,
            stale: Vec::new(),
            credentials: credentials.to_vec(),
        };
        store.commit_desired_state(&record.upn, &desired).await
    }

    /// Load a project with every readable service
    pub async fn load(&self, upn: &Upn) -> Result<Project, DeployError> {
        let store = self.state.store.as_ref();
        let record = store.load_project(upn).await?;
        let loaded = load_desired_services(store, upn).await?;
        if !loaded.failures.is_empty() {
            warn!(
                "{} services of {} could not be read",
                loaded.failures.len(),
                upn
            );
        }
        Ok(Project {
            record,
            services: loaded.services,
            registry_credentials: store.list_registry_credentials(upn).await?,
        })
    }

    /// Replace the project's services and redeploy
    pub async fn update(
        &self,
        upn: &Upn,
        mut services: Vec<Service>,
        credentials: Vec<RegistryCredential>,
    ) -> Result<Project, DeployError> {
        let _guard = self.lock(upn).await;
        let record = self.state.store.load_project(upn).await?;
        assign_usns(&mut services);

        self.transaction(upn)
            .execute(&services, &credentials)
            .await?;

        Ok(Project {
            record,
            services,
            registry_credentials: credentials,
        })
    }

    /// Redeploy with new image tags, keyed by service display name.
    ///
    /// The access token is checked before anything else happens.
    pub async fn redeploy_from_hook(
        &self,
        upn: &Upn,
        access_token: &str,
        tags: &[(String, String)],
    ) -> Result<Project, DeployError> {
        let _guard = self.lock(upn).await;

        let store = self.state.store.as_ref();
        let record = store.load_project(upn).await.map_err(|e| match e {
            DeployError::NotFound(_) => DeployError::Unauthorized("unknown project".to_string()),
            other => other,
        })?;
        if !digest_eq(access_token, &record.access_token) {
            return Err(DeployError::Unauthorized("invalid access token".to_string()));
        }

        // Redeploying without an unreadable service would reconcile it away
        let loaded = load_desired_services(store, upn).await?;
        if !loaded.failures.is_empty() {
            let unreadable: Vec<String> = loaded.failures.iter().map(|f| f.to_string()).collect();
            return Err(DeployError::PersistenceFailure(format!(
                "unreadable services: {}",
                unreadable.join("; ")
            )));
        }
        let mut project = Project {
            record,
            services: loaded.services,
            registry_credentials: store.list_registry_credentials(upn).await?,
        };

        let changed = project.apply_image_tags(tags.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        info!("Webhook redeploy of {} changes {} image tags", upn, changed);

        self.transaction(upn)
            .execute(&project.services, &project.registry_credentials)
            .await?;
        Ok(project)
    }

    /// Stop the project and remove it.
    ///
    /// The directory is renamed aside first; its contents are removed in the
    /// background once the records are gone.
    pub async fn delete(&self, upn: &Upn) -> Result<(), DeployError> {
        let guard = self.lock(upn).await;
        let deleted = self.delete_locked(upn).await;
        // The project is gone, so later requests start from a fresh lock
        if matches!(deleted, Ok(()) | Err(DeployError::NotFound(_))) {
            self.locks.lock().await.remove(upn);
        }
        drop(guard);
        deleted
    }

    async fn delete_locked(&self, upn: &Upn) -> Result<(), DeployError> {
        let layout = &self.state.options.layout;
        self.state.store.load_project(upn).await?;

        if layout.compose_file(upn).exists().await {
            self.lifecycle(upn).down().await?;
        }

        let project_dir = layout.project_dir(upn);
        let deleted_dir = layout.deleted_project_dir(upn);
        let renamed = project_dir.exists().await;
        if renamed {
            project_dir.rename_to(&deleted_dir).await?;
        }

        if let Err(e) = self.state.store.delete_project(upn).await {
            error!("Unable to delete records of {}: {}", upn, e);
            if renamed {
                if let Err(undo) = deleted_dir.rename_to(&project_dir).await {
                    error!("Unable to restore {}: {}", project_dir.path().display(), undo);
                }
            }
            return Err(e);
        }

        if renamed {
            tokio::spawn(async move {
                if let Err(e) = deleted_dir.delete().await {
                    error!("Unable to remove {}: {}", deleted_dir.path().display(), e);
                }
            });
        }

        info!("Deleted project {}", upn);
        Ok(())
    }

    /// Container state per service
    pub async fn container_state(
        &self,
        upn: &Upn,
    ) -> Result<HashMap<String, ContainerState>, DeployError> {
        self.state.store.load_project(upn).await?;
        self.lifecycle(upn).container_state().await
    }

    /// Follow the logs of one service
    pub async fn stream_logs(&self, upn: &Upn, service: &str) -> Result<LogStream, DeployError> {
        self.state.store.load_project(upn).await?;
        let source = self.lifecycle(upn).logs(service).await?;
        Ok(LogStream::new(source))
    }

    /// Open a shell in one service's container
    pub async fn open_shell(
        &self,
        upn: &Upn,
        service: &str,
        size: TerminalSize,
    ) -> Result<ShellSession, DeployError> {
        self.state.store.load_project(upn).await?;
        self.lifecycle(upn).shell(service, size).await
    }

    /// Compose document of the persisted desired state
    pub async fn render(&self, upn: &Upn) -> Result<String, DeployError> {
        let project = self.load(upn).await?;
        render_yaml(
            &project.services,
            upn.as_str(),
            &self.state.options.render,
        )
    }

    fn transaction(&self, upn: &Upn) -> DeploymentTransaction {
        DeploymentTransaction::new(
            upn.clone(),
            self.state.options.layout.clone(),
            self.state.runtime.clone(),
            self.state.store.clone(),
            self.state.options.render.clone(),
        )
    }
}

/// Give every service without a USN a fresh one
fn assign_usns(services: &mut [Service]) {
    for service in services.iter_mut().filter(|s| s.usn.is_empty()) {
        service.usn = format!("{}-{}", random_name(), rand_string(USN_SUFFIX_LEN));
    }
}
