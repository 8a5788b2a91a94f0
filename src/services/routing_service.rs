//! src/services/routing_service.rs
//!
//! Routing output for the external reverse proxy.
//!
//! Pod routes are label-driven: every pod container carries labels that the
//! proxy's container provider reads directly (see [`container_labels`]). The
//! only file this module writes is the control-plane document, which routes
//! the configured `server_domain` to this process. The proxy watches the
//! routing directory and reloads on change, so writes go through a temp file
//! and a rename.

use crate::models::domain::PodDomain;
use crate::services::pod_store::{PodStore, StoreError};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Settings key holding the control-plane host name.
pub const SERVER_DOMAIN_KEY: &str = "server_domain";

/// File name of the control-plane routing document.
pub const SERVER_ROUTE_FILE: &str = "deeploy-server.yml";

/// Router and service name used for the control plane.
pub const SERVER_ROUTE_NAME: &str = "deeploy-server";

pub const CERT_RESOLVER: &str = "letsencrypt";

const BANNER: &str = "# Generated by deeploy. Do not edit: this file is overwritten on every change.\n";
const HOSTNAME_MAX_LEN: usize = 253;
const LABEL_MAX_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("invalid domain `{domain}`: {reason}")]
    InvalidDomain { domain: String, reason: String },
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type RoutingResult<T> = Result<T, RoutingError>;

/// Dynamic-configuration document in the proxy's file-provider schema.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct RoutingDocument {
    pub http: HttpSection,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct HttpSection {
    pub routers: BTreeMap<String, RouterEntry>,
    pub services: BTreeMap<String, ServiceEntry>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct RouterEntry {
    pub rule: String,
    pub service: String,
    #[serde(rename = "entryPoints")]
    pub entry_points: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsEntry>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct TlsEntry {
    #[serde(rename = "certResolver")]
    pub cert_resolver: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct ServiceEntry {
    #[serde(rename = "loadBalancer")]
    pub load_balancer: LoadBalancer,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct LoadBalancer {
    pub servers: Vec<ServerUrl>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct ServerUrl {
    pub url: String,
}

/// Writes and removes the control-plane routing document.
#[derive(Clone, Debug)]
pub struct RoutingService {
    dir: PathBuf,
    dev_mode: bool,
    internal_host: String,
    internal_port: u16,
}

impl RoutingService {
    pub fn new(
        dir: impl Into<PathBuf>,
        dev_mode: bool,
        internal_host: impl Into<String>,
        internal_port: u16,
    ) -> Self {
        Self {
            dir: dir.into(),
            dev_mode,
            internal_host: internal_host.into(),
            internal_port,
        }
    }

    pub fn dev_mode(&self) -> bool {
        self.dev_mode
    }

    pub fn server_file(&self) -> PathBuf {
        self.dir.join(SERVER_ROUTE_FILE)
    }

    /// Build the control-plane document for `domain`.
    pub fn server_document(&self, domain: &str) -> RoutingDocument {
        let mut routers = BTreeMap::new();
        routers.insert(
            SERVER_ROUTE_NAME.to_string(),
            RouterEntry {
                rule: format!("Host(`{}`)", domain),
                service: SERVER_ROUTE_NAME.to_string(),
                entry_points: vec![entrypoint(self.dev_mode).to_string()],
                tls: (!self.dev_mode).then(|| TlsEntry {
                    cert_resolver: CERT_RESOLVER.to_string(),
                }),
            },
        );

        let mut services = BTreeMap::new();
        services.insert(
            SERVER_ROUTE_NAME.to_string(),
            ServiceEntry {
                load_balancer: LoadBalancer {
                    servers: vec![ServerUrl {
                        url: format!("http://{}:{}", self.internal_host, self.internal_port),
                    }],
                },
            },
        );

        RoutingDocument {
            http: HttpSection { routers, services },
        }
    }

    /// Render the document text, banner included.
    pub fn render_server_document(&self, domain: &str) -> RoutingResult<String> {
        let yaml = serde_yaml::to_string(&self.server_document(domain))?;
        Ok(format!("{}{}", BANNER, yaml))
    }

    /// Validate `domain` and (re)write the control-plane document.
    pub async fn set_server_domain(&self, domain: &str) -> RoutingResult<PathBuf> {
        let domain = normalize_domain(domain)?;
        let contents = self.render_server_document(&domain)?;
        let path = self.server_file();
        atomic_write(&path, contents.as_bytes()).await?;
        info!(domain = %domain, path = %path.display(), "wrote server routing document");
        Ok(path)
    }

    /// Remove the control-plane document. Missing files are fine.
    pub async fn delete_server_domain(&self) -> RoutingResult<()> {
        let path = self.server_file();
        match fs::remove_file(&path).await {
            Ok(()) => info!(path = %path.display(), "removed server routing document"),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("server routing document {} already absent", path.display());
            }
            Err(err) => return Err(RoutingError::Io(err)),
        }
        Ok(())
    }

    /// Bring the routing directory in line with the stored settings.
    pub async fn sync(&self, store: &dyn PodStore) -> RoutingResult<()> {
        match store.get_setting(SERVER_DOMAIN_KEY).await? {
            Some(domain) if !domain.trim().is_empty() => {
                self.set_server_domain(&domain).await?;
            }
            _ => self.delete_server_domain().await?,
        }
        Ok(())
    }
}

fn entrypoint(dev_mode: bool) -> &'static str {
    if dev_mode { "web" } else { "websecure" }
}

/// Labels that describe a pod's routes to the proxy.
///
/// Two namespaces: `traefik.*` is what the proxy consumes, `deeploy.*`
/// records the same intent (host, port, TLS hint, pod id) in a stable form
/// for reconciliation and inspection.
pub fn container_labels(
    pod_id: Uuid,
    domains: &[PodDomain],
    network: &str,
    dev_mode: bool,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("deeploy.managed".to_string(), "true".to_string());
    labels.insert("deeploy.pod.id".to_string(), pod_id.to_string());
    labels.insert("traefik.enable".to_string(), "true".to_string());
    labels.insert("traefik.docker.network".to_string(), network.to_string());

    for (index, domain) in domains.iter().enumerate() {
        // Stored rows predate validation; a stray backtick would break the rule.
        let host = match normalize_domain(&domain.domain) {
            Ok(host) => host,
            Err(err) => {
                warn!(pod_id = %pod_id, "skipping domain: {}", err);
                continue;
            }
        };
        let name = format!("deeploy-{}-{}", pod_id.simple(), index);
        let tls = domain.ssl_enabled && !dev_mode;

        let router = format!("traefik.http.routers.{}", name);
        labels.insert(format!("{}.rule", router), format!("Host(`{}`)", host));
        labels.insert(
            format!("{}.entrypoints", router),
            entrypoint(dev_mode).to_string(),
        );
        labels.insert(format!("{}.service", router), name.clone());
        if tls {
            labels.insert(format!("{}.tls", router), "true".to_string());
            labels.insert(
                format!("{}.tls.certresolver", router),
                CERT_RESOLVER.to_string(),
            );
        }
        labels.insert(
            format!("traefik.http.services.{}.loadbalancer.server.port", name),
            domain.port.to_string(),
        );

        let ours = format!("deeploy.domain.{}", index);
        labels.insert(format!("{}.host", ours), host);
        labels.insert(format!("{}.port", ours), domain.port.to_string());
        labels.insert(format!("{}.ssl", ours), domain.ssl_enabled.to_string());
    }

    labels
}

/// Convert a title to a DNS-safe label, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Network alias for a pod: its title slug plus a short id suffix so two pods
/// with the same title never share a name.
pub fn network_alias(pod_id: Uuid, title: &str) -> String {
    let slug = slugify(title, 40);
    let id = pod_id.simple().to_string();
    let suffix = &id[..8];
    if slug.is_empty() {
        format!("pod-{}", suffix)
    } else {
        format!("{}-{}", slug, suffix)
    }
}

/// Lowercase and validate a host name.
///
/// - 1–253 characters overall, labels 1–63 characters
/// - letters, digits, and hyphens only; labels cannot start or end with a hyphen
pub fn normalize_domain(domain: &str) -> RoutingResult<String> {
    let invalid = |reason: &str| RoutingError::InvalidDomain {
        domain: domain.to_string(),
        reason: reason.to_string(),
    };

    let normalized = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if normalized.is_empty() || normalized.len() > HOSTNAME_MAX_LEN {
        return Err(invalid("must be between 1 and 253 characters"));
    }

    for label in normalized.split('.') {
        if label.is_empty() || label.len() > LABEL_MAX_LEN {
            return Err(invalid("each label must be between 1 and 63 characters"));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invalid(
                "allowed characters are letters, digits, dots, and hyphens",
            ));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("labels cannot start or end with a hyphen"));
        }
    }

    Ok(normalized)
}

/// Write `contents` to `path` so readers only ever see a complete file.
async fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
        io::Error::new(ErrorKind::Other, "routing path missing parent directory")
    })?;
    fs::create_dir_all(&parent).await?;

    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    let mut file = fs::File::create(&tmp_path).await?;
    let written = async {
        file.write_all(contents).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);

    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err);
    }
    if let Err(err) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err);
    }
    Ok(())
}
