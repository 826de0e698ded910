//! Service reconciliation
//!
//! Services persisted for a project but missing from its new desired set are
//! deleted together with their volume directories. A service still named in
//! the `depends_on` of a remaining service blocks the whole update.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::DeployError;
use crate::models::project::Upn;
use crate::models::service::{sanitize_name, Service};
use crate::storage::layout::ProjectLayout;
use crate::store::ProjectStore;

/// Services to remove from a project
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub stale: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.stale.is_empty()
    }
}

/// Compute `current - desired`, refusing to drop anything still depended on.
///
/// Pure: nothing is touched.
pub fn plan(current: &[String], desired: &[Service]) -> Result<ReconcilePlan, DeployError> {
    let keep: BTreeSet<&str> = desired.iter().map(|s| s.usn.as_str()).collect();
    let stale: Vec<String> = current
        .iter()
        .filter(|usn| !keep.contains(usn.as_str()))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut dependents = BTreeSet::new();
    for service in desired {
        for dependency in service.depends_on.keys() {
            if stale
                .iter()
                .any(|usn| usn == dependency || sanitize_name(usn) == *dependency)
            {
                dependents.insert(service.label().to_string());
            }
        }
    }

    if !dependents.is_empty() {
        return Err(DeployError::ReconciliationBlocked {
            dependents: dependents.into_iter().collect(),
        });
    }

    Ok(ReconcilePlan { stale })
}

/// Plans reconciliation against the store and cleans up the project directory
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn ProjectStore>,
    layout: ProjectLayout,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ProjectStore>, layout: ProjectLayout) -> Self {
        Self { store, layout }
    }

    /// Plan against what is persisted right now
    pub async fn plan(&self, upn: &Upn, desired: &[Service]) -> Result<ReconcilePlan, DeployError> {
        let current: Vec<String> = self
            .store
            .load_services(upn)
            .await?
            .into_iter()
            .map(|row| row.usn)
            .collect();
        plan(&current, desired)
    }

    /// Remove the volume directories of services dropped by a committed plan.
    ///
    /// Their rows go away with the store commit; a leftover directory is only
    /// logged.
    pub async fn remove_volumes(&self, upn: &Upn, plan: &ReconcilePlan) {
        if plan.is_empty() {
            return;
        }

        info!("Removing services {} from {}", plan.stale.join(", "), upn);
        for usn in &plan.stale {
            let volumes = self.layout.service_volume_dir(upn, &sanitize_name(usn));
            if let Err(e) = volumes.delete().await {
                warn!(
                    "Unable to remove volumes of {} at {}: {}",
                    usn,
                    volumes.path().display(),
                    e
                );
            }
        }
    }
}
