//! Reverse proxy ingress labels
//!
//! Labels are the whole contract with the proxy. Emission order is fixed:
//! enable, service port, router rule, then the three TLS labels when `ssl` is
//! set, then the two compression labels when `compress` is set.
//!
//! Host names are inserted verbatim between backticks. A host containing a
//! backtick is not escaped and produces a rule the proxy will reject.

use crate::models::service::Public;

const ENABLE_LABEL: &str = "traefik.enable=true";

/// Settings shared by every generated router
#[derive(Debug, Clone)]
pub struct IngressOptions {
    /// Domain for synthesized default hosts
    pub base_domain: String,

    /// Certificate resolver used by TLS routers
    pub cert_resolver: String,
}

impl Default for IngressOptions {
    fn default() -> Self {
        Self {
            base_domain: "localhost".to_string(),
            cert_resolver: "le".to_string(),
        }
    }
}

/// Routing identifier of a service, `<upn>-<service>`
pub fn routing_id(upn: &str, service_name: &str) -> String {
    format!("{}-{}", upn, service_name)
}

/// Generate the ingress labels of one service.
///
/// `service_name` must already be sanitized. Returns an empty list when the
/// service is not public.
pub fn ingress_labels(
    service_name: &str,
    upn: &str,
    public: &Public,
    options: &IngressOptions,
) -> Vec<String> {
    if !public.enabled {
        return Vec::new();
    }

    let id = routing_id(upn, service_name);
    let rule = host_rule(&id, &public.hosts, &options.base_domain);

    let mut labels = vec![
        ENABLE_LABEL.to_string(),
        format!(
            "traefik.http.services.{}.loadbalancer.server.port={}",
            id, public.port
        ),
        format!("traefik.http.routers.{}.rule={}", id, rule),
    ];

    if public.ssl {
        labels.push(format!("traefik.http.routers.{}.entrypoints=https", id));
        labels.push(format!("traefik.http.routers.{}.tls=true", id));
        labels.push(format!(
            "traefik.http.routers.{}.tls.certresolver={}",
            id, options.cert_resolver
        ));
    }

    if public.compress {
        labels.push(format!(
            "traefik.http.middlewares.{}-compress.compress=true",
            id
        ));
        labels.push(format!(
            "traefik.http.routers.{}.middlewares={}-compress",
            id, id
        ));
    }

    labels
}

/// Build the router rule.
///
/// Clauses are joined with `||` and no surrounding spaces: YAML emitters fold
/// long scalars at spaces, which would split the rule across lines.
fn host_rule(routing_id: &str, hosts: &[String], base_domain: &str) -> String {
    if hosts.iter().all(|h| h.is_empty()) {
        let host = format!("{}.{}", routing_id, base_domain).to_lowercase();
        return format!("Host(`{}`)", host);
    }

    hosts
        .iter()
        .filter(|h| !h.is_empty())
        .map(|h| format!("Host(`{}`)", h.to_lowercase()))
        .collect::<Vec<_>>()
        .join("||")
}

/// Recover the routing configuration from a label list
pub fn public_from_labels(labels: &[String]) -> Public {
    Public {
        enabled: labels
            .first()
            .map(|l| l.eq_ignore_ascii_case(ENABLE_LABEL))
            .unwrap_or(false),
        hosts: hosts_from_labels(labels),
        port: port_from_labels(labels).unwrap_or_default(),
        ssl: labels.iter().any(|l| l.ends_with("entrypoints=https")),
        compress: labels.iter().any(|l| l.ends_with("compress=true")),
    }
}

fn hosts_from_labels(labels: &[String]) -> Vec<String> {
    let mut hosts = Vec::new();
    for label in labels.iter().filter(|l| l.contains(".rule=Host")) {
        let mut rest = label.as_str();
        while let Some(start) = rest.find("Host(`") {
            let after = &rest[start + "Host(`".len()..];
            match after.find("`)") {
                Some(end) => {
                    hosts.push(after[..end].to_string());
                    rest = &after[end + 2..];
                }
                None => break,
            }
        }
    }
    hosts
}

fn port_from_labels(labels: &[String]) -> Option<String> {
    labels
        .iter()
        .find(|l| l.contains("loadbalancer.server.port"))
        .and_then(|l| l.split_once('='))
        .map(|(_, port)| port.to_string())
}
