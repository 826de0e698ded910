//! Service models

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::compose::types::{Condition, Deploy, HealthCheck};
use crate::errors::DeployError;

/// Public routing configuration of a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Public {
    /// Route traffic from the reverse proxy to this service
    #[serde(default)]
    pub enabled: bool,

    /// Host names; empty (or a single empty string) means "synthesize one"
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Container port the proxy forwards to
    #[serde(default)]
    pub port: String,

    /// Serve over TLS with an automatically resolved certificate
    #[serde(default)]
    pub ssl: bool,

    /// Enable response compression
    #[serde(default)]
    pub compress: bool,
}

/// A logical service of a project
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Unique service name, assigned once and never changed
    #[serde(default)]
    pub usn: String,

    /// Display name
    pub name: String,

    /// Image without tag
    pub image: String,

    /// Image tag
    pub image_tag: String,

    /// `host:container` or bare port strings
    #[serde(default)]
    pub ports: Vec<String>,

    /// Command override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Ordered `(key, value)` pairs
    #[serde(default)]
    pub env_vars: Vec<(String, String)>,

    /// Container-side volume paths
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Public routing
    #[serde(default)]
    pub public: Public,

    /// Dependency USN to wait condition
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub depends_on: BTreeMap<String, Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheck>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<Deploy>,
}

impl Service {
    /// The `image:tag` reference, failing when either half is missing
    pub fn image_reference(&self) -> Result<String, DeployError> {
        let reference = format!("{}:{}", self.image, self.image_tag);
        split_image_reference(&reference).map_err(|_| DeployError::MalformedImageReference {
            service: self.label().to_string(),
            reference: reference.clone(),
        })?;
        Ok(reference)
    }

    /// Whether the service declares at least one real volume
    pub fn has_volumes(&self) -> bool {
        self.volumes.iter().any(|v| !v.trim().is_empty())
    }

    /// The USN when assigned, otherwise the display name
    pub fn label(&self) -> &str {
        if self.usn.is_empty() {
            &self.name
        } else {
            &self.usn
        }
    }

    /// Check the user-supplied fields before anything is rendered
    pub fn validate(&self) -> Result<(), DeployError> {
        if self.name.trim().is_empty() {
            return Err(DeployError::Validation("service name is required".to_string()));
        }
        if self.ports.iter().all(|p| p.trim().is_empty()) {
            return Err(DeployError::Validation(format!(
                "service {} needs at least one port",
                self.name
            )));
        }
        self.image_reference()?;
        Ok(())
    }
}

/// Split `image:tag` into its two halves.
///
/// The split happens at the last colon so registry ports survive
/// (`registry:5000/app:1.2`), but a "tag" containing a slash means the colon
/// belonged to the registry and the tag is missing.
pub fn split_image_reference(reference: &str) -> Result<(&str, &str), DeployError> {
    let malformed = || DeployError::MalformedImageReference {
        service: String::new(),
        reference: reference.to_string(),
    };

    let (image, tag) = reference.rsplit_once(':').ok_or_else(malformed)?;
    if image.is_empty() || tag.is_empty() || tag.contains('/') {
        return Err(malformed());
    }
    Ok((image, tag))
}

/// Lower-case a name and replace spaces with hyphens
pub fn sanitize_name(name: &str) -> String {
    name.replace(' ', "-").to_lowercase()
}
