//! Service reconciliation tests

use std::sync::Arc;

use dockyard::compose::builder::RenderOptions;
use dockyard::compose::fragment;
use dockyard::compose::types::Condition;
use dockyard::deploy::fsm::TransactionState;
use dockyard::errors::DeployError;
use dockyard::models::service::Service;
use dockyard::store::memory::MemoryStore;
use dockyard::store::ProjectStore;

use crate::fake::{service, Call, FakeRuntime, Workspace};

const OLD_COMPOSE: &str = "services: {}\n";

/// Persist `services` as the project's current state and create their volumes
async fn persist(ws: &Workspace, store: &MemoryStore, services: &[Service]) {
    for s in services {
        let dcj = fragment::encode(s, ws.upn.as_str(), &RenderOptions::default()).unwrap();
        store
            .save_service_fragment(&ws.upn, &s.usn, &s.name, &dcj)
            .await
            .unwrap();
        std::fs::create_dir_all(ws.layout.service_volume_dir(&ws.upn, &s.usn).path()).unwrap();
    }
}

fn with_volume(mut s: Service) -> Service {
    s.volumes = vec!["/var/lib/data".to_string()];
    s
}

#[tokio::test]
async fn test_dependent_service_blocks_removal() {
    let ws = Workspace::new();
    ws.seed(OLD_COMPOSE, "{}");
    let runtime = FakeRuntime::new();
    let store = Arc::new(MemoryStore::new());

    let a = with_volume(service("a", "app/a"));
    let b = with_volume(service("b", "app/b"));
    persist(&ws, &store, &[a.clone(), b]).await;

    let mut a_depends = a;
    a_depends
        .depends_on
        .insert("b".to_string(), Condition::default());

    let mut tx = ws.transaction(runtime.clone(), store.clone());
    let err = tx.run(&[a_depends], &[]).await.unwrap_err();

    match err.root_cause() {
        DeployError::ReconciliationBlocked { dependents } => {
            assert_eq!(dependents, &vec!["a".to_string()]);
        }
        other => panic!("unexpected error: {:?}", other),
    }

    // The update was rejected before anything was stopped or removed
    assert_eq!(tx.state(), TransactionState::Failed);
    assert!(runtime.calls().is_empty());
    assert!(ws.layout.service_volume_dir(&ws.upn, "b").exists().await);
    assert_eq!(store.load_services(&ws.upn).await.unwrap().len(), 2);
    assert_eq!(std::fs::read_to_string(ws.compose_path()).unwrap(), OLD_COMPOSE);
}

#[tokio::test]
async fn test_removed_service_loses_fragment_and_volumes() {
    let ws = Workspace::new();
    ws.seed(OLD_COMPOSE, "{}");
    let runtime = FakeRuntime::new();
    let store = Arc::new(MemoryStore::new());

    let a = with_volume(service("a", "app/a"));
    let b = with_volume(service("b", "app/b"));
    persist(&ws, &store, &[a.clone(), b]).await;

    let mut tx = ws.transaction(runtime.clone(), store.clone());
    tx.run(&[a], &[]).await.unwrap();

    assert_eq!(tx.state(), TransactionState::Committed);
    let rows = store.load_services(&ws.upn).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].usn, "a");
    assert!(!ws.layout.service_volume_dir(&ws.upn, "b").exists().await);
    assert!(ws.layout.service_volume_dir(&ws.upn, "a").exists().await);
    assert!(runtime.calls().contains(&Call::Up));
}

#[tokio::test]
async fn test_failed_deployment_keeps_stale_services() {
    let ws = Workspace::new();
    ws.seed(OLD_COMPOSE, "{}");
    let runtime = FakeRuntime::new();
    runtime.fail_pull("app/a:1.0");
    let store = Arc::new(MemoryStore::new());

    let a = with_volume(service("a", "app/a"));
    let b = with_volume(service("b", "app/b"));
    persist(&ws, &store, &[a.clone(), b]).await;

    let mut tx = ws.transaction(runtime, store.clone());
    tx.run(&[a], &[]).await.unwrap_err();

    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(store.load_services(&ws.upn).await.unwrap().len(), 2);
    assert!(ws.layout.service_volume_dir(&ws.upn, "b").exists().await);
}
