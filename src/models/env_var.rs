//! Per-pod environment variables. Values are stored encrypted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct PodEnvVar {
    pub id: Uuid,
    pub pod_id: Uuid,

    /// Variable name, unique per pod.
    pub key: String,

    /// Ciphertext produced by the crypto box. Never serialized to clients.
    #[serde(skip_serializing)]
    pub value: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
