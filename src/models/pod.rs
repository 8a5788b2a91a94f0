//! Represents a pod, one deployable unit (repo + Dockerfile + runtime state).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Lifecycle status of a pod as recorded by the control plane.
///
/// `Building` is only ever written by the deploy pipeline while it holds the
/// pod's build slot.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PodStatus {
    #[default]
    Idle,
    Building,
    Running,
    Stopped,
    Failed,
}

impl PodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodStatus::Idle => "idle",
            PodStatus::Building => "building",
            PodStatus::Running => "running",
            PodStatus::Stopped => "stopped",
            PodStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pod record.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Pod {
    /// Stable identifier; also used to derive container and image names.
    pub id: Uuid,

    /// Owning user.
    pub user_id: Uuid,

    /// Project this pod is grouped under.
    pub project_id: Uuid,

    /// Human label.
    pub title: String,

    /// Git remote to clone. A pod without one cannot be deployed.
    pub repo_url: Option<String>,

    /// Branch to check out (defaults to `main`).
    pub branch: String,

    /// Dockerfile path relative to the repository root.
    pub dockerfile_path: String,

    /// Optional reference to a stored git token for private repositories.
    pub git_token_id: Option<Uuid>,

    /// Last known container handle.
    pub container_id: Option<String>,

    pub status: PodStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pod {
    /// Repository URL if one is configured and non-blank.
    pub fn repo(&self) -> Option<&str> {
        self.repo_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    /// Container id if one is recorded and non-blank.
    pub fn container(&self) -> Option<&str> {
        self.container_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
    }

    /// Name given to the pod's container on the shared network.
    pub fn container_name(&self) -> String {
        container_name(self.id)
    }

    /// Local image tag the pipeline builds for this pod.
    pub fn image_tag(&self) -> String {
        format!("deeploy-{}:latest", self.id)
    }
}

/// `deeploy-<pod_id>`
pub fn container_name(pod_id: Uuid) -> String {
    format!("deeploy-{}", pod_id)
}
