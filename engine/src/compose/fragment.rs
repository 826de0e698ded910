//! Per-service fragments
//!
//! A fragment is the JSON object `{"<usn>": <container spec>}` persisted for
//! each service. Reading it back yields the user-facing service definition.
//! Each fragment is decoded on its own so one corrupt row never hides the
//! others.

use std::collections::BTreeMap;

use crate::compose::builder::{build_container, service_key, RenderOptions};
use crate::compose::labels::public_from_labels;
use crate::compose::types::Container;
use crate::errors::DeployError;
use crate::models::service::{split_image_reference, Service};

/// Render the fragment of one service
pub fn encode(service: &Service, upn: &str, options: &RenderOptions) -> Result<String, DeployError> {
    let container = build_container(service, upn, options)?;
    let mut fragment = BTreeMap::new();
    fragment.insert(service_key(service), container);
    Ok(serde_json::to_string(&fragment)?)
}

/// Decode a fragment back into `(usn, container spec)`
pub fn decode_container(dcj: &str) -> Result<(String, Container), DeployError> {
    let fragment: BTreeMap<String, Container> = serde_json::from_str(dcj)?;
    let mut entries = fragment.into_iter();
    match (entries.next(), entries.next()) {
        (Some(entry), None) => Ok(entry),
        _ => Err(DeployError::PersistenceFailure(
            "fragment must hold exactly one service".to_string(),
        )),
    }
}

/// Decode a fragment into the service it was rendered from.
///
/// Empty env, volume, and host lists come back as a single empty placeholder
/// entry so editors always have a row to fill in.
pub fn decode(name: &str, dcj: &str) -> Result<Service, DeployError> {
    let (usn, container) = decode_container(dcj)?;

    let (image, image_tag) = split_image_reference(&container.image).map_err(|_| {
        DeployError::MalformedImageReference {
            service: usn.clone(),
            reference: container.image.clone(),
        }
    })?;

    let mut env_vars: Vec<(String, String)> = container
        .environment
        .iter()
        .map(|e| match e.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (e.clone(), String::new()),
        })
        .collect();
    if env_vars.is_empty() {
        env_vars.push((String::new(), String::new()));
    }

    let mut volumes: Vec<String> = container
        .volumes
        .iter()
        .filter_map(|v| v.rsplit_once(':').map(|(_, target)| target.to_string()))
        .collect();
    if volumes.is_empty() {
        volumes.push(String::new());
    }

    let mut public = public_from_labels(&container.labels);
    if public.hosts.is_empty() {
        public.hosts.push(String::new());
    }

    Ok(Service {
        usn,
        name: name.to_string(),
        image: image.to_string(),
        image_tag: image_tag.to_string(),
        ports: container.ports,
        command: container.command,
        env_vars,
        volumes,
        public,
        depends_on: container.depends_on,
        healthcheck: container.healthcheck,
        deploy: container.deploy,
    })
}
