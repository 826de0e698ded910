//! In-memory store

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::errors::DeployError;
use crate::models::project::{ProjectRecord, RegistryCredential, Upn};
use crate::store::{DesiredState, ProjectStore, ServiceRow};

#[derive(Debug, Default)]
struct Tables {
    projects: HashMap<Upn, ProjectRecord>,
    credentials: HashMap<Upn, Vec<RegistryCredential>>,
    services: HashMap<Upn, BTreeMap<String, ServiceRow>>,
}

/// Store keeping everything in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn save_project(&self, record: &ProjectRecord) -> Result<(), DeployError> {
        let mut tables = self.tables.lock().await;
        tables.projects.insert(record.upn.clone(), record.clone());
        Ok(())
    }

    async fn load_project(&self, upn: &Upn) -> Result<ProjectRecord, DeployError> {
        let tables = self.tables.lock().await;
        tables
            .projects
            .get(upn)
            .cloned()
            .ok_or_else(|| DeployError::NotFound(format!("project {}", upn)))
    }

    async fn delete_project(&self, upn: &Upn) -> Result<(), DeployError> {
        let mut tables = self.tables.lock().await;
        tables.projects.remove(upn);
        tables.credentials.remove(upn);
        tables.services.remove(upn);
        Ok(())
    }

    async fn list_registry_credentials(
        &self,
        upn: &Upn,
    ) -> Result<Vec<RegistryCredential>, DeployError> {
        let tables = self.tables.lock().await;
        Ok(tables.credentials.get(upn).cloned().unwrap_or_default())
    }

    async fn commit_desired_state(
        &self,
        upn: &Upn,
        state: &DesiredState,
    ) -> Result<(), DeployError> {
        let mut tables = self.tables.lock().await;
        let rows = tables.services.entry(upn.clone()).or_default();
        for usn in &state.stale {
            rows.remove(usn);
        }
        for row in &state.services {
            rows.insert(row.usn.clone(), row.clone());
        }
        tables
            .credentials
            .insert(upn.clone(), state.credentials.clone());
        Ok(())
    }

    async fn load_services(&self, upn: &Upn) -> Result<Vec<ServiceRow>, DeployError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .services
            .get(upn)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_service_fragment(
        &self,
        upn: &Upn,
        usn: &str,
        name: &str,
        dcj: &str,
    ) -> Result<(), DeployError> {
        let mut tables = self.tables.lock().await;
        tables.services.entry(upn.clone()).or_default().insert(
            usn.to_string(),
            ServiceRow {
                usn: usn.to_string(),
                name: name.to_string(),
                dcj: dcj.to_string(),
            },
        );
        Ok(())
    }

    async fn delete_services(&self, upn: &Upn, usns: &[String]) -> Result<(), DeployError> {
        let mut tables = self.tables.lock().await;
        if let Some(rows) = tables.services.get_mut(upn) {
            for usn in usns {
                rows.remove(usn);
            }
        }
        Ok(())
    }
}
