//! Compose document and ingress label tests

use dockyard::compose::builder::{build_document, render_yaml, RenderOptions};
use dockyard::compose::labels::{ingress_labels, IngressOptions};
use dockyard::compose::types::{ComposeDocument, WEB_NETWORK};
use dockyard::errors::DeployError;
use dockyard::models::service::{Public, Service};
use dockyard::storage::settings::Environment;

use crate::fake::service;

const UPN: &str = "swift-fox-7x2k9qa1bd";

#[test]
fn test_default_host_labels() {
    let public = Public {
        enabled: true,
        hosts: vec![],
        port: "8080".to_string(),
        ssl: false,
        compress: false,
    };
    let options = IngressOptions {
        base_domain: "example.com".to_string(),
        ..Default::default()
    };

    let labels = ingress_labels("api", UPN, &public, &options);
    assert_eq!(
        labels,
        vec![
            "traefik.enable=true".to_string(),
            "traefik.http.services.swift-fox-7x2k9qa1bd-api.loadbalancer.server.port=8080"
                .to_string(),
            "traefik.http.routers.swift-fox-7x2k9qa1bd-api.rule=Host(`swift-fox-7x2k9qa1bd-api.example.com`)"
                .to_string(),
        ]
    );
}

#[test]
fn test_full_label_order() {
    let public = Public {
        enabled: true,
        hosts: vec!["Shop.Example.com".to_string(), "www.example.com".to_string()],
        port: "3000".to_string(),
        ssl: true,
        compress: true,
    };
    let labels = ingress_labels("web", UPN, &public, &IngressOptions::default());
    let id = format!("{}-web", UPN);

    assert_eq!(labels.len(), 8);
    assert_eq!(labels[0], "traefik.enable=true");
    assert_eq!(
        labels[2],
        format!(
            "traefik.http.routers.{}.rule=Host(`shop.example.com`)||Host(`www.example.com`)",
            id
        )
    );
    assert_eq!(labels[3], format!("traefik.http.routers.{}.entrypoints=https", id));
    assert_eq!(labels[4], format!("traefik.http.routers.{}.tls=true", id));
    assert_eq!(
        labels[5],
        format!("traefik.http.routers.{}.tls.certresolver=le", id)
    );
    assert_eq!(
        labels[6],
        format!("traefik.http.middlewares.{}-compress.compress=true", id)
    );
    assert_eq!(
        labels[7],
        format!("traefik.http.routers.{}.middlewares={}-compress", id, id)
    );
}

#[test]
fn test_private_service_has_no_labels() {
    let labels = ingress_labels("db", UPN, &Public::default(), &IngressOptions::default());
    assert!(labels.is_empty());
}

fn project() -> Vec<Service> {
    let mut web = service("web", "nginx");
    web.env_vars = vec![
        ("MODE".to_string(), "prod".to_string()),
        ("EMPTY".to_string(), String::new()),
        (String::new(), "orphan".to_string()),
    ];
    web.volumes = vec!["/usr/share/nginx/html".to_string()];
    web.public.enabled = true;
    web.public.port = "8080".to_string();

    let mut api = service("Api Server", "ghcr.io/acme/api");
    api.ports = vec!["9000:9000".to_string(), "9001".to_string()];
    vec![web, api]
}

#[test]
fn test_rendering_is_idempotent() {
    let options = RenderOptions::default();
    let first = render_yaml(&project(), UPN, &options).unwrap();
    let second = render_yaml(&project(), UPN, &options).unwrap();
    assert_eq!(first.as_bytes(), second.as_bytes());

    let parsed = ComposeDocument::from_yaml(&first).unwrap();
    assert_eq!(parsed, build_document(&project(), UPN, &options).unwrap());
}

#[test]
fn test_document_contents() {
    let document = build_document(&project(), UPN, &RenderOptions::default()).unwrap();

    let keys: Vec<_> = document.services.keys().cloned().collect();
    assert_eq!(keys, vec!["api-server", "web"]);

    let web = &document.services["web"];
    assert_eq!(web.restart, "always");
    assert_eq!(web.environment, vec!["MODE=prod"]);
    assert_eq!(
        web.volumes,
        vec!["./data/web/usr/share/nginx/html:/usr/share/nginx/html"]
    );
    assert_eq!(web.labels.len(), 3);

    let api = &document.services["api-server"];
    assert_eq!(api.ports, vec!["9000:9000", "9001"]);
    assert!(api.labels.is_empty());
    assert!(api.volumes.is_empty());

    assert!(document.networks[WEB_NETWORK].external);
}

#[test]
fn test_development_creates_web_network() {
    let options = RenderOptions {
        environment: Environment::Development,
        ..Default::default()
    };
    let document = build_document(&project(), UPN, &options).unwrap();
    assert!(!document.networks[WEB_NETWORK].external);
}

#[test]
fn test_volumes_need_a_project_name() {
    let document = build_document(&project(), "", &RenderOptions::default()).unwrap();
    assert!(document.services["web"].volumes.is_empty());
}

#[test]
fn test_malformed_image_fails_whole_document() {
    let mut services = project();
    services.push(Service {
        image: "redis".to_string(),
        image_tag: String::new(),
        ..service("cache", "redis")
    });

    match build_document(&services, UPN, &RenderOptions::default()) {
        Err(DeployError::MalformedImageReference { service, reference }) => {
            assert_eq!(service, "cache");
            assert_eq!(reference, "redis:");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}
