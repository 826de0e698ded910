//! Project persistence
//!
//! The store is an explicit handle passed to every component that needs it.
//! Each service is one row holding its fragment, so a corrupt row is skipped
//! on read without hiding the rest of the project.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::compose::fragment;
use crate::errors::{DeployError, ServiceFailure};
use crate::models::project::{ProjectRecord, RegistryCredential, Upn};
use crate::models::service::Service;

/// One persisted service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRow {
    pub usn: String,
    /// Display name
    pub name: String,
    /// JSON fragment `{"<usn>": <container spec>}`
    pub dcj: String,
}

/// Everything a deployment persists for its project
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    /// Rows inserted or replaced
    pub services: Vec<ServiceRow>,
    /// USNs whose rows are removed
    pub stale: Vec<String>,
    /// Replaces the project's registry credentials
    pub credentials: Vec<RegistryCredential>,
}

/// Persistence operations used by the engine
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn save_project(&self, record: &ProjectRecord) -> Result<(), DeployError>;

    /// Fails with `NotFound` for an unknown project
    async fn load_project(&self, upn: &Upn) -> Result<ProjectRecord, DeployError>;

    /// Remove the project with its services and credentials
    async fn delete_project(&self, upn: &Upn) -> Result<(), DeployError>;

    async fn list_registry_credentials(
        &self,
        upn: &Upn,
    ) -> Result<Vec<RegistryCredential>, DeployError>;

    /// Store a deployment's rows, removals and credentials as one unit.
    ///
    /// Either all of `state` is applied or the store is left unchanged.
    async fn commit_desired_state(
        &self,
        upn: &Upn,
        state: &DesiredState,
    ) -> Result<(), DeployError>;

    /// Every service row of the project, ordered by USN
    async fn load_services(&self, upn: &Upn) -> Result<Vec<ServiceRow>, DeployError>;

    /// Insert or replace one service row
    async fn save_service_fragment(
        &self,
        upn: &Upn,
        usn: &str,
        name: &str,
        dcj: &str,
    ) -> Result<(), DeployError>;

    /// Remove service rows; unknown USNs are ignored
    async fn delete_services(&self, upn: &Upn, usns: &[String]) -> Result<(), DeployError>;
}

/// Services decoded from their rows, with the rows that could not be read
#[derive(Debug, Default)]
pub struct LoadedServices {
    pub services: Vec<Service>,
    pub failures: Vec<ServiceFailure>,
}

/// Decode every row on its own
pub fn decode_rows(rows: Vec<ServiceRow>) -> LoadedServices {
    let mut loaded = LoadedServices::default();
    for row in rows {
        match fragment::decode(&row.name, &row.dcj) {
            Ok(service) => loaded.services.push(service),
            Err(e) => {
                warn!("Skipping unreadable service {}: {}", row.usn, e);
                loaded.failures.push(ServiceFailure {
                    service: row.usn,
                    message: e.to_string(),
                });
            }
        }
    }
    loaded
}

/// Load and decode the services of a project
pub async fn load_desired_services(
    store: &dyn ProjectStore,
    upn: &Upn,
) -> Result<LoadedServices, DeployError> {
    Ok(decode_rows(store.load_services(upn).await?))
}
