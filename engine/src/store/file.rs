//! JSON file store
//!
//! Layout under the state directory:
//!
//! ```text
//! <state_dir>/<upn>/project.json
//! <state_dir>/<upn>/state/credentials.json
//! <state_dir>/<upn>/state/services/<usn>.json
//! ```
//!
//! A deployment commit builds a complete new `state/` next to the live one
//! and swaps it in with two renames. A swap interrupted between the renames
//! is undone the next time the project is accessed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::project::{ProjectRecord, RegistryCredential, Upn};
use crate::store::{DesiredState, ProjectStore, ServiceRow};

const PROJECT_FILE: &str = "project.json";
const CREDENTIALS_FILE: &str = "credentials.json";
const SERVICES_DIR: &str = "services";
const STATE_DIR: &str = "state";
const STAGING_DIR: &str = "state.next";
const PREVIOUS_DIR: &str = "state.prev";

/// Store writing one JSON file per record
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn project_dir(&self, upn: &Upn) -> Result<Dir, DeployError> {
        check_key(upn.as_str())?;
        Ok(Dir::new(self.root.join(upn.as_str())))
    }

    /// The live state directory of a project
    async fn live_state(&self, upn: &Upn) -> Result<Dir, DeployError> {
        let project = self.project_dir(upn)?;
        let state = project.subdir(STATE_DIR);
        let previous = project.subdir(PREVIOUS_DIR);
        if !state.exists().await && previous.exists().await {
            warn!("Restoring state of {} after an interrupted commit", upn);
            previous.rename_to(&state).await.map_err(persistence)?;
        }
        Ok(state)
    }

    async fn service_file(&self, upn: &Upn, usn: &str) -> Result<File, DeployError> {
        check_key(usn)?;
        Ok(service_file(
            &self.live_state(upn).await?.subdir(SERVICES_DIR),
            usn,
        ))
    }
}

fn service_file(services: &Dir, usn: &str) -> File {
    services.file(&format!("{}.json", usn))
}

fn is_row_file(path: &Path) -> bool {
    path.extension().map(|e| e == "json").unwrap_or(false)
}

/// Keys become file names and must stay inside their directory
fn check_key(key: &str) -> Result<(), DeployError> {
    if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
        return Err(DeployError::Validation(format!("invalid key: '{}'", key)));
    }
    Ok(())
}

fn persistence(err: DeployError) -> DeployError {
    match err {
        DeployError::Validation(_) | DeployError::NotFound(_) => err,
        other => DeployError::PersistenceFailure(other.to_string()),
    }
}

/// Write the full next state into `staging`: rows of `live` that the commit
/// leaves alone, then the committed rows and credentials
async fn stage(live: &Dir, staging: &Dir, desired: &DesiredState) -> Result<(), DeployError> {
    let services = staging.subdir(SERVICES_DIR);
    services.create().await?;

    let replaced: HashSet<&str> = desired
        .stale
        .iter()
        .chain(desired.services.iter().map(|row| &row.usn))
        .map(String::as_str)
        .collect();

    let current = live.subdir(SERVICES_DIR);
    if current.exists().await {
        for path in current.list_files().await? {
            let usn = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !is_row_file(&path) || replaced.contains(usn.as_str()) {
                continue;
            }
            // Copied as bytes so unreadable rows survive unchanged
            let contents = File::new(&path).read_bytes().await?;
            service_file(&services, &usn).write_bytes(&contents).await?;
        }
    }

    for row in &desired.services {
        check_key(&row.usn)?;
        service_file(&services, &row.usn).write_json(row).await?;
    }

    staging
        .file(CREDENTIALS_FILE)
        .write_private(&serde_json::to_vec(&desired.credentials)?)
        .await
}

/// Replace `live` with `staging`, putting `live` back if the second rename fails
async fn swap(live: &Dir, staging: &Dir, previous: &Dir) -> Result<(), DeployError> {
    previous.delete().await?;
    let had_live = live.exists().await;
    if had_live {
        live.rename_to(previous).await?;
    }

    if let Err(e) = staging.rename_to(live).await {
        if had_live {
            if let Err(undo) = previous.rename_to(live).await {
                error!("Unable to restore {}: {}", live.path().display(), undo);
            }
        }
        return Err(e);
    }

    if let Err(e) = previous.delete().await {
        warn!("Unable to remove {}: {}", previous.path().display(), e);
    }
    Ok(())
}

#[async_trait]
impl ProjectStore for FileStore {
    async fn save_project(&self, record: &ProjectRecord) -> Result<(), DeployError> {
        let dir = self.project_dir(&record.upn)?;
        dir.create().await.map_err(persistence)?;
        let file = dir.file(PROJECT_FILE);
        file.write_atomic(&serde_json::to_vec_pretty(record)?)
            .await
            .map_err(persistence)?;
        file.set_permissions_600().await.map_err(persistence)
    }

    async fn load_project(&self, upn: &Upn) -> Result<ProjectRecord, DeployError> {
        let file = self.project_dir(upn)?.file(PROJECT_FILE);
        if !file.exists().await {
            return Err(DeployError::NotFound(format!("project {}", upn)));
        }
        file.read_json().await.map_err(persistence)
    }

    async fn delete_project(&self, upn: &Upn) -> Result<(), DeployError> {
        self.project_dir(upn)?.delete().await.map_err(persistence)
    }

    async fn list_registry_credentials(
        &self,
        upn: &Upn,
    ) -> Result<Vec<RegistryCredential>, DeployError> {
        let file = self.live_state(upn).await?.file(CREDENTIALS_FILE);
        if !file.exists().await {
            return Ok(Vec::new());
        }
        file.read_json().await.map_err(persistence)
    }

    async fn commit_desired_state(
        &self,
        upn: &Upn,
        desired: &DesiredState,
    ) -> Result<(), DeployError> {
        let project = self.project_dir(upn)?;
        let live = self.live_state(upn).await?;
        let staging = project.subdir(STAGING_DIR);
        let previous = project.subdir(PREVIOUS_DIR);

        staging.delete().await.map_err(persistence)?;
        let committed = match stage(&live, &staging, desired).await {
            Ok(()) => swap(&live, &staging, &previous).await,
            Err(e) => Err(e),
        };

        if let Err(e) = committed {
            if let Err(cleanup) = staging.delete().await {
                warn!("Unable to remove {}: {}", staging.path().display(), cleanup);
            }
            return Err(persistence(e));
        }
        debug!(
            "Committed {} services of {}, removed {}",
            desired.services.len(),
            upn,
            desired.stale.len()
        );
        Ok(())
    }

    async fn load_services(&self, upn: &Upn) -> Result<Vec<ServiceRow>, DeployError> {
        let dir = self.live_state(upn).await?.subdir(SERVICES_DIR);
        if !dir.exists().await {
            return Ok(Vec::new());
        }

        let mut rows = Vec::new();
        for path in dir.list_files().await.map_err(persistence)? {
            if !is_row_file(&path) {
                continue;
            }
            match File::new(&path).read_json::<ServiceRow>().await {
                Ok(row) => rows.push(row),
                Err(e) => {
                    // Unreadable rows still surface with their USN so they can be reconciled
                    let usn = path
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    debug!("Service row {} is unreadable: {}", path.display(), e);
                    rows.push(ServiceRow {
                        usn,
                        name: String::new(),
                        dcj: String::new(),
                    });
                }
            }
        }
        rows.sort_by(|a, b| a.usn.cmp(&b.usn));
        Ok(rows)
    }

    async fn save_service_fragment(
        &self,
        upn: &Upn,
        usn: &str,
        name: &str,
        dcj: &str,
    ) -> Result<(), DeployError> {
        let file = self.service_file(upn, usn).await?;
        self.live_state(upn)
            .await?
            .subdir(SERVICES_DIR)
            .create()
            .await
            .map_err(persistence)?;
        let row = ServiceRow {
            usn: usn.to_string(),
            name: name.to_string(),
            dcj: dcj.to_string(),
        };
        file.write_atomic(&serde_json::to_vec(&row)?)
            .await
            .map_err(persistence)
    }

    async fn delete_services(&self, upn: &Upn, usns: &[String]) -> Result<(), DeployError> {
        for usn in usns {
            self.service_file(upn, usn)
                .await?
                .delete()
                .await
                .map_err(persistence)?;
        }
        Ok(())
    }
}
