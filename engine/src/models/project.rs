//! Project models

use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::models::service::Service;

/// Unique project name, also the project's directory name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Upn(String);

impl Upn {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Upn {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Upn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Credentials for one container registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryCredential {
    pub username: String,

    #[serde(
        serialize_with = "serialize_secret",
        deserialize_with = "deserialize_secret"
    )]
    pub password: SecretString,

    /// Registry host, e.g. `ghcr.io`
    pub registry: String,
}

impl RegistryCredential {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        registry: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
            registry: registry.into(),
        }
    }
}

fn serialize_secret<S>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(secret.expose_secret())
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    Ok(SecretString::from(value))
}

/// Project record as persisted by the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub upn: Upn,
    pub name: String,
    pub access_token: String,
    /// Project directory, derived from the UPN at creation time
    pub path: String,
}

/// A project with its desired services
#[derive(Debug, Clone)]
pub struct Project {
    pub record: ProjectRecord,
    pub services: Vec<Service>,
    pub registry_credentials: Vec<RegistryCredential>,
}

impl Project {
    pub fn upn(&self) -> &Upn {
        &self.record.upn
    }

    /// Apply webhook tag overrides keyed by service display name.
    ///
    /// Returns the number of services whose tag changed.
    pub fn apply_image_tags<'a, I>(&mut self, tags: I) -> usize
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut changed = 0;
        for (name, tag) in tags {
            for service in self.services.iter_mut().filter(|s| s.name == name) {
                if service.image_tag != tag {
                    service.image_tag = tag.to_string();
                    changed += 1;
                }
            }
        }
        changed
    }
}
