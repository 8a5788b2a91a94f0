//! Routing binding between a host name and a pod's container port.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Whether a domain was supplied by the user or generated from the pod title.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum DomainType {
    Custom,
    Auto,
}

/// A host bound to a pod. `domain` is unique across all pods.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct PodDomain {
    pub id: Uuid,

    pub pod_id: Uuid,

    /// Host name routed to the pod (e.g. `app.example.com`).
    pub domain: String,

    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub domain_type: DomainType,

    /// Container-internal port the proxy forwards to.
    pub port: i64,

    /// TLS hint; the proxy makes the final decision.
    pub ssl_enabled: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
