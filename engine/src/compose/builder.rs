//! Compose document builder
//!
//! Pure translation of a project's services into a compose document. Nothing
//! is written here; callers decide where the rendered document goes.

use std::collections::BTreeMap;

use crate::compose::labels::{ingress_labels, IngressOptions};
use crate::compose::types::{
    ComposeDocument, Container, Deploy, Limits, Network, Reservations, Resources,
    DEFAULT_NETWORK, WEB_NETWORK,
};
use crate::errors::DeployError;
use crate::models::service::{sanitize_name, Service};
use crate::storage::layout::PERSISTENT_VOLUME_DIR_NAME;
use crate::storage::settings::{ContainerLimitSettings, Environment};

const RESTART_POLICY: &str = "always";

/// Rendering options
#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    pub environment: Environment,
    pub ingress: IngressOptions,
    /// Limits forced onto every container
    pub container_limits: Option<ContainerLimitSettings>,
    /// Replica count forced onto every container
    pub container_replicas: Option<u32>,
}

/// Build the compose document of a project.
///
/// Fails without producing anything if any service has a malformed image
/// reference or two services share a key.
pub fn build_document(
    services: &[Service],
    upn: &str,
    options: &RenderOptions,
) -> Result<ComposeDocument, DeployError> {
    let mut rendered = BTreeMap::new();

    for service in services {
        let key = service_key(service);
        let container = build_container(service, upn, options)?;
        if rendered.insert(key.clone(), container).is_some() {
            return Err(DeployError::Validation(format!(
                "duplicate service key: {}",
                key
            )));
        }
    }

    Ok(ComposeDocument {
        networks: networks(options.environment),
        services: rendered,
    })
}

/// Render a document straight to YAML
pub fn render_yaml(
    services: &[Service],
    upn: &str,
    options: &RenderOptions,
) -> Result<String, DeployError> {
    Ok(build_document(services, upn, options)?.to_yaml()?)
}

/// Compose key of a service
pub fn service_key(service: &Service) -> String {
    sanitize_name(service.label())
}

/// Build the container specification of a single service
pub fn build_container(
    service: &Service,
    upn: &str,
    options: &RenderOptions,
) -> Result<Container, DeployError> {
    let image = service.image_reference()?;
    let key = service_key(service);

    let environment = service
        .env_vars
        .iter()
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let volumes = if service.has_volumes() && !upn.is_empty() {
        service
            .volumes
            .iter()
            .filter(|v| !v.trim().is_empty())
            .map(|v| volume_mapping(&key, v))
            .collect()
    } else {
        Vec::new()
    };

    Ok(Container {
        image,
        restart: RESTART_POLICY.to_string(),
        networks: vec![WEB_NETWORK.to_string(), DEFAULT_NETWORK.to_string()],
        ports: service
            .ports
            .iter()
            .filter(|p| !p.trim().is_empty())
            .cloned()
            .collect(),
        command: service.command.clone().filter(|c| !c.is_empty()),
        environment,
        volumes,
        labels: ingress_labels(&key, upn, &service.public, &options.ingress),
        healthcheck: service.healthcheck.clone(),
        depends_on: service.depends_on.clone(),
        deploy: deploy_block(service.deploy.clone(), options),
    })
}

/// `./data/<usn>/<relative path>:<container path>`
fn volume_mapping(service_key: &str, container_path: &str) -> String {
    let relative = container_path.trim_start_matches('/');
    format!(
        "./{}/{}/{}:{}",
        PERSISTENT_VOLUME_DIR_NAME, service_key, relative, container_path
    )
}

fn deploy_block(deploy: Option<Deploy>, options: &RenderOptions) -> Option<Deploy> {
    if options.container_limits.is_none() && options.container_replicas.is_none() {
        return deploy;
    }

    let mut deploy = deploy.unwrap_or_default();
    if let Some(limits) = &options.container_limits {
        let resources = deploy.resources.get_or_insert_with(Resources::default);
        resources.limits = Some(Limits {
            cpus: Some(limits.cpus.clone()),
            memory: Some(limits.memory.clone()),
            pids: resources.limits.as_ref().and_then(|l| l.pids),
        });
        resources.reservations = Some(Reservations {
            cpus: Some(limits.cpus.clone()),
            memory: Some(limits.memory.clone()),
        });
    }
    if let Some(replicas) = options.container_replicas {
        deploy.replicas = Some(replicas);
    }
    Some(deploy)
}

fn networks(environment: Environment) -> BTreeMap<String, Network> {
    let mut networks = BTreeMap::new();
    networks.insert(
        WEB_NETWORK.to_string(),
        Network {
            external: environment == Environment::Production,
            driver: None,
        },
    );
    networks.insert(
        DEFAULT_NETWORK.to_string(),
        Network {
            external: false,
            driver: Some("bridge".to_string()),
        },
    );
    networks
}
