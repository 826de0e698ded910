//! Container lifecycle tests

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dockyard::deploy::lifecycle::{ContainerLifecycle, PullRequest};
use dockyard::deploy::runtime::{ContainerSummary, SERVICE_LABEL, WORKING_DIR_LABEL};
use dockyard::errors::DeployError;
use dockyard::models::project::RegistryCredential;

use crate::fake::{Call, FakeRuntime};

fn requests(count: usize) -> Vec<PullRequest> {
    (1..=count)
        .map(|i| PullRequest {
            service: format!("svc-{:02}", i),
            image: format!("registry.local/app-{:02}:1.0", i),
        })
        .collect()
}

#[tokio::test]
async fn test_pulls_run_concurrently() {
    let runtime = FakeRuntime::new();
    let requests = requests(10);
    for (i, request) in requests.iter().enumerate() {
        runtime.delay_pull(&request.image, Duration::from_millis(20 * (i as u64 + 1)));
    }
    let lifecycle = ContainerLifecycle::new(runtime.clone(), "/srv/projects/p");

    let started = Instant::now();
    lifecycle.pull(requests.clone()).await.unwrap();
    let elapsed = started.elapsed();

    // Slowest pull is 200ms, the sum of all pulls 1.1s
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(800), "took {:?}", elapsed);

    let mut pulled = runtime.pulls();
    pulled.sort();
    let expected: Vec<_> = requests.into_iter().map(|r| r.image).collect();
    assert_eq!(pulled, expected);
}

#[tokio::test]
async fn test_pull_collects_every_failure() {
    let runtime = FakeRuntime::new();
    let requests = requests(10);
    runtime.fail_pull(&requests[7].image);
    runtime.fail_pull(&requests[2].image);
    runtime.fail_pull(&requests[4].image);
    // A slow failure must not be cut short by a fast one
    runtime.delay_pull(&requests[7].image, Duration::from_millis(50));

    let lifecycle = ContainerLifecycle::new(runtime.clone(), "/srv/projects/p");
    let err = lifecycle.pull(requests).await.unwrap_err();

    match err {
        DeployError::PullAggregateFailure(failures) => {
            let failed: Vec<_> = failures.iter().map(|f| f.service.as_str()).collect();
            assert_eq!(failed, vec!["svc-03", "svc-05", "svc-08"]);
            assert!(failures[0].message.contains("app-03"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(runtime.pulls().len(), 10);
}

#[tokio::test]
async fn test_login_stops_at_first_failure() {
    let runtime = FakeRuntime::new();
    runtime.fail_login("quay.io");
    let credentials = vec![
        RegistryCredential::new("ci", "a", "ghcr.io"),
        RegistryCredential::new("ci", "b", "quay.io"),
        RegistryCredential::new("ci", "c", "registry.gitlab.com"),
    ];

    let lifecycle = ContainerLifecycle::new(runtime.clone(), "/srv/projects/p");
    assert!(lifecycle.login(&credentials).await.is_err());
    assert_eq!(
        runtime.calls(),
        vec![
            Call::Login("ghcr.io".to_string()),
            Call::Login("quay.io".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_start_with_nothing_to_pull_only_brings_up() {
    let runtime = FakeRuntime::new();
    let lifecycle = ContainerLifecycle::new(runtime.clone(), "/srv/projects/p");
    lifecycle.start(Vec::new(), &[]).await.unwrap();
    assert_eq!(runtime.calls(), vec![Call::Up]);
}

fn container(working_dir: &str, service: &str, state: &str) -> ContainerSummary {
    ContainerSummary {
        labels: HashMap::from([
            (WORKING_DIR_LABEL.to_string(), working_dir.to_string()),
            (SERVICE_LABEL.to_string(), service.to_string()),
        ]),
        state: state.to_string(),
        status: format!("{} for a while", state),
    }
}

#[tokio::test]
async fn test_container_state_matches_project_by_suffix() {
    let runtime = FakeRuntime::new();
    runtime.set_containers(vec![
        container("/host/srv/projects/p", "web", "exited"),
        container("/srv/projects/p", "api", "paused"),
        container("/srv/projects/other", "db", "running"),
    ]);
    let lifecycle = ContainerLifecycle::new(runtime.clone(), "/srv/projects/p");

    let states = lifecycle.container_state().await.unwrap();
    let mut services: Vec<_> = states.keys().cloned().collect();
    services.sort();
    assert_eq!(services, vec!["api", "web"]);
    assert_eq!(states["web"].state, "exited");

    // Paused still counts as running
    assert!(lifecycle.any_container_running().await.unwrap());

    runtime.set_containers(vec![container("/srv/projects/p", "web", "exited")]);
    assert!(!lifecycle.any_container_running().await.unwrap());
}
