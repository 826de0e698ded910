//! Project manager tests

use std::sync::Arc;
use std::time::Duration;

use dockyard::app::options::AppOptions;
use dockyard::app::projects::ProjectManager;
use dockyard::app::state::AppState;
use dockyard::deploy::shell::TerminalSize;
use dockyard::errors::DeployError;
use dockyard::models::project::Upn;
use dockyard::storage::settings::Settings;
use dockyard::store::memory::MemoryStore;
use dockyard::store::ProjectStore;

use crate::fake::{service, Call, FakeRuntime};

struct Fixture {
    _temp: tempfile::TempDir,
    runtime: Arc<FakeRuntime>,
    store: Arc<MemoryStore>,
    manager: ProjectManager,
}

fn fixture() -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let settings = Settings {
        projects_dir: temp.path().join("projects"),
        state_dir: temp.path().join("state"),
        base_domain: "apps.example.com".to_string(),
        ..Default::default()
    };
    let runtime = FakeRuntime::new();
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(
        AppOptions::from_settings(&settings),
        store.clone(),
        runtime.clone(),
    );
    Fixture {
        _temp: temp,
        runtime,
        store,
        manager: ProjectManager::new(state),
    }
}

#[tokio::test]
async fn test_create_lays_out_project() {
    let f = fixture();
    let mut web = service("", "nginx");
    web.name = "web".to_string();
    web.volumes = vec!["/data".to_string()];

    let project = f.manager.create("shop", vec![web], vec![]).await.unwrap();
    let upn = project.upn().clone();

    // <adjective>-<noun>-<10 alphanumerics>
    let parts: Vec<_> = upn.as_str().split('-').collect();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[2].len(), 10);
    assert_eq!(project.record.access_token.len(), 12);

    let usn = project.services[0].usn.clone();
    assert!(!usn.is_empty());

    let layout = &f.manager.state().options.layout;
    assert!(layout.compose_file(&upn).exists().await);
    assert!(layout.service_volume_dir(&upn, &usn).exists().await);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(layout.compose_file(&upn).path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    // Creating only prepares; nothing is started
    assert!(f.runtime.calls().is_empty());

    let loaded = f.manager.load(&upn).await.unwrap();
    assert_eq!(loaded.services[0].usn, usn);
    assert_eq!(loaded.services[0].name, "web");

    let rendered = f.manager.render(&upn).await.unwrap();
    let written = std::fs::read_to_string(layout.compose_file(&upn).path()).unwrap();
    assert_eq!(rendered, written);
}

#[tokio::test]
async fn test_create_rejects_invalid_services() {
    let f = fixture();
    let mut web = service("web", "nginx");
    web.ports.clear();

    let err = f.manager.create("shop", vec![web], vec![]).await.unwrap_err();
    assert!(matches!(err, DeployError::Validation(_)));
    let projects = std::fs::read_dir(f.manager.state().options.layout.root());
    assert!(projects.map(|mut d| d.next().is_none()).unwrap_or(true));
}

#[tokio::test]
async fn test_webhook_redeploys_with_new_tag() {
    let f = fixture();
    let project = f
        .manager
        .create("shop", vec![service("web", "nginx"), service("api", "acme/api")], vec![])
        .await
        .unwrap();
    let upn = project.upn().clone();
    let token = project.record.access_token.clone();

    let tags = vec![("api".to_string(), "2.3.1".to_string())];
    let redeployed = f
        .manager
        .redeploy_from_hook(&upn, &token, &tags)
        .await
        .unwrap();

    let api = redeployed.services.iter().find(|s| s.name == "api").unwrap();
    assert_eq!(api.image_tag, "2.3.1");
    assert!(f.runtime.pulls().contains(&"acme/api:2.3.1".to_string()));
    assert!(f.runtime.calls().contains(&Call::Up));

    let compose = f.manager.render(&upn).await.unwrap();
    assert!(compose.contains("acme/api:2.3.1"));
    assert!(compose.contains("nginx:1.0"));
}

#[tokio::test]
async fn test_webhook_rejects_wrong_token() {
    let f = fixture();
    let project = f
        .manager
        .create("shop", vec![service("web", "nginx")], vec![])
        .await
        .unwrap();

    let err = f
        .manager
        .redeploy_from_hook(project.upn(), "not-the-token", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::Unauthorized(_)));

    let err = f
        .manager
        .redeploy_from_hook(&Upn::from("no-such-project"), "x", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::Unauthorized(_)));
    assert!(f.runtime.calls().is_empty());
}

#[tokio::test]
async fn test_webhook_refuses_unreadable_services() {
    let f = fixture();
    let project = f
        .manager
        .create("shop", vec![service("web", "nginx")], vec![])
        .await
        .unwrap();
    let upn = project.upn().clone();
    f.store
        .save_service_fragment(&upn, "broken", "db", "{\"broken\":")
        .await
        .unwrap();

    let err = f
        .manager
        .redeploy_from_hook(&upn, &project.record.access_token, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::PersistenceFailure(_)));
    assert_eq!(f.store.load_services(&upn).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_update_removes_dropped_services() {
    let f = fixture();
    let project = f
        .manager
        .create("shop", vec![service("web", "nginx"), service("api", "acme/api")], vec![])
        .await
        .unwrap();
    let upn = project.upn().clone();

    f.manager
        .update(&upn, vec![service("web", "nginx")], vec![])
        .await
        .unwrap();

    let rows = f.store.load_services(&upn).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].usn, "web");
}

#[tokio::test]
async fn test_delete_removes_project() {
    let f = fixture();
    let project = f
        .manager
        .create("shop", vec![service("web", "nginx")], vec![])
        .await
        .unwrap();
    let upn = project.upn().clone();
    let layout = f.manager.state().options.layout.clone();

    f.manager.delete(&upn).await.unwrap();

    assert_eq!(f.runtime.calls(), vec![Call::Down]);
    assert!(!layout.project_dir(&upn).exists().await);
    assert!(matches!(
        f.store.load_project(&upn).await,
        Err(DeployError::NotFound(_))
    ));

    // The renamed directory is removed in the background
    let deleted = layout.deleted_project_dir(&upn);
    for _ in 0..50 {
        if !deleted.exists().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!deleted.exists().await);
}

#[tokio::test]
async fn test_delete_forgets_project_lock() {
    let f = fixture();
    let mut upns = Vec::new();
    for name in ["shop", "blog", "wiki"] {
        let project = f
            .manager
            .create(name, vec![service("web", "nginx")], vec![])
            .await
            .unwrap();
        upns.push(project.upn().clone());
    }
    // Creating never contends, so only deployments leave an entry behind
    assert_eq!(f.manager.tracked_locks().await, 0);

    for upn in &upns {
        f.manager
            .update(upn, vec![service("web", "nginx")], vec![])
            .await
            .unwrap();
    }
    assert_eq!(f.manager.tracked_locks().await, 3);

    for upn in &upns {
        f.manager.delete(upn).await.unwrap();
    }
    assert_eq!(f.manager.tracked_locks().await, 0);

    // Deleting an unknown project leaves no entry either
    let err = f.manager.delete(&upns[0]).await.unwrap_err();
    assert!(matches!(err, DeployError::NotFound(_)));
    assert_eq!(f.manager.tracked_locks().await, 0);
}

#[tokio::test]
async fn test_shell_session_reaches_service() {
    let f = fixture();
    let project = f
        .manager
        .create("shop", vec![service("web", "nginx")], vec![])
        .await
        .unwrap();

    let mut session = f
        .manager
        .open_shell(project.upn(), "web", TerminalSize::default())
        .await
        .unwrap();
    session.write(b"ls /\n".to_vec()).await.unwrap();
    assert_eq!(session.read().await, Some(b"ls /\n".to_vec()));
    session.close().await.unwrap();

    assert!(f.runtime.calls().contains(&Call::Exec("web".to_string())));

    let err = f
        .manager
        .open_shell(&Upn::from("no-such-project"), "web", TerminalSize::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::NotFound(_)));
}

#[tokio::test]
async fn test_logs_are_numbered() {
    let f = fixture();
    let project = f
        .manager
        .create("shop", vec![service("web", "nginx")], vec![])
        .await
        .unwrap();
    f.runtime.set_log_lines(&["listening on :8080", "GET / 200"]);

    let mut stream = f.manager.stream_logs(project.upn(), "web").await.unwrap();
    let mut lines = Vec::new();
    while let Some(line) = stream.next().await.unwrap() {
        lines.push(line.to_string());
    }
    assert_eq!(lines, vec!["1 listening on :8080", "2 GET / 200"]);
    assert!(f.runtime.calls().contains(&Call::Logs("web".to_string())));
}
