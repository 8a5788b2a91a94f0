//! src/services/pod_store.rs
//!
//! Persistence contract consumed by the deploy pipeline, plus the SQLite
//! implementation used by the server. Pods, domains, env vars, and git tokens
//! are created elsewhere; this layer reads them and writes back pod status.

use crate::models::{
    domain::PodDomain,
    env_var::PodEnvVar,
    git_token::GitToken,
    pod::{Pod, PodStatus},
    user::{ApiToken, User},
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

const POD_COLUMNS: &str = "id, user_id, project_id, title, repo_url, branch, dockerfile_path, \
                           git_token_id, container_id, status, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Typed record store used by the deploy pipeline and the HTTP layer.
///
/// Every operation is atomic at single-record granularity. `NotFound` is
/// distinct from I/O failures.
#[async_trait]
pub trait PodStore: Send + Sync {
    async fn get_pod(&self, id: Uuid) -> StoreResult<Pod>;

    /// Overwrite every mutable field of the pod and bump `updated_at`.
    async fn update_pod(&self, pod: &Pod) -> StoreResult<()>;

    async fn list_domains(&self, pod_id: Uuid) -> StoreResult<Vec<PodDomain>>;

    async fn list_env_vars(&self, pod_id: Uuid) -> StoreResult<Vec<PodEnvVar>>;

    async fn get_git_token(&self, id: Uuid) -> StoreResult<GitToken>;

    async fn list_pods_by_status(&self, statuses: &[PodStatus]) -> StoreResult<Vec<Pod>>;

    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Returns whether a row was removed.
    async fn delete_setting(&self, key: &str) -> StoreResult<bool>;

    /// Resolve the SHA-256 hex digest of a bearer token to its user.
    async fn find_user_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<Uuid>>;

    /// Cheap connectivity check for readiness.
    async fn ping(&self) -> StoreResult<()>;
}

/// SQLite-backed store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pub db: Arc<SqlitePool>,
}

impl SqliteStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> StoreResult<usize> {
        let statements = MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }

        Ok(statements.len())
    }

    /// Fetch a user by name, creating it if absent.
    pub async fn ensure_user(&self, username: &str) -> StoreResult<User> {
        let existing = sqlx::query_as::<_, User>(
            "SELECT id, username, created_at FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&*self.db)
        .await?;
        if let Some(user) = existing {
            return Ok(user);
        }

        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            created_at: Utc::now(),
        };
        sqlx::query("INSERT INTO users (id, username, created_at) VALUES (?, ?, ?)")
            .bind(user.id)
            .bind(&user.username)
            .bind(user.created_at)
            .execute(&*self.db)
            .await?;
        Ok(user)
    }

    /// Record a bearer token for `user_id` by its digest.
    pub async fn insert_api_token(
        &self,
        user_id: Uuid,
        name: &str,
        token_hash: &str,
    ) -> StoreResult<ApiToken> {
        let token = ApiToken {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            token_hash: token_hash.to_string(),
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO api_tokens (id, user_id, name, token_hash, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(token.id)
        .bind(token.user_id)
        .bind(&token.name)
        .bind(&token.token_hash)
        .bind(token.created_at)
        .execute(&*self.db)
        .await?;
        Ok(token)
    }
}

#[async_trait]
impl PodStore for SqliteStore {
    async fn get_pod(&self, id: Uuid) -> StoreResult<Pod> {
        sqlx::query_as::<_, Pod>(&format!("SELECT {} FROM pods WHERE id = ?", POD_COLUMNS))
            .bind(id)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => StoreError::NotFound {
                    entity: "pod",
                    id: id.to_string(),
                },
                other => StoreError::Sqlx(other),
            })
    }

    async fn update_pod(&self, pod: &Pod) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE pods SET
                title = ?, repo_url = ?, branch = ?, dockerfile_path = ?,
                git_token_id = ?, container_id = ?, status = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&pod.title)
        .bind(&pod.repo_url)
        .bind(&pod.branch)
        .bind(&pod.dockerfile_path)
        .bind(pod.git_token_id)
        .bind(&pod.container_id)
        .bind(pod.status)
        .bind(Utc::now())
        .bind(pod.id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "pod",
                id: pod.id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_domains(&self, pod_id: Uuid) -> StoreResult<Vec<PodDomain>> {
        let rows = sqlx::query_as::<_, PodDomain>(
            "SELECT id, pod_id, domain, type, port, ssl_enabled, created_at, updated_at
             FROM pod_domains WHERE pod_id = ? ORDER BY created_at ASC, domain ASC",
        )
        .bind(pod_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    async fn list_env_vars(&self, pod_id: Uuid) -> StoreResult<Vec<PodEnvVar>> {
        let rows = sqlx::query_as::<_, PodEnvVar>(
            "SELECT id, pod_id, key, value, created_at, updated_at
             FROM pod_env_vars WHERE pod_id = ? ORDER BY key ASC",
        )
        .bind(pod_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    async fn get_git_token(&self, id: Uuid) -> StoreResult<GitToken> {
        sqlx::query_as::<_, GitToken>(
            "SELECT id, user_id, name, provider, token, created_at, updated_at
             FROM git_tokens WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::NotFound {
                entity: "git token",
                id: id.to_string(),
            },
            other => StoreError::Sqlx(other),
        })
    }

    async fn list_pods_by_status(&self, statuses: &[PodStatus]) -> StoreResult<Vec<Pod>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM pods WHERE status IN (",
            POD_COLUMNS
        ));
        let mut separated = builder.separated(", ");
        for status in statuses {
            separated.push_bind(*status);
        }
        separated.push_unseparated(") ORDER BY created_at ASC");

        let rows: Vec<Pod> = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(rows)
    }

    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&*self.db)
            .await?;
        Ok(value)
    }

    async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn delete_setting(&self, key: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_user_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<Uuid>> {
        let user_id =
            sqlx::query_scalar::<_, Uuid>("SELECT user_id FROM api_tokens WHERE token_hash = ?")
                .bind(token_hash)
                .fetch_optional(&*self.db)
                .await?;
        Ok(user_id)
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

/// Record builders shared by tests across modules.
#[cfg(test)]
pub mod fixtures {
    use super::*;
    use crate::models::{domain::DomainType, git_token::GitProvider};
    use sqlx::sqlite::SqlitePoolOptions;

    /// A migrated in-memory store. One connection, so every query sees the
    /// same database.
    pub async fn memory_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStore::new(Arc::new(pool));
        store.migrate().await.unwrap();
        store
    }

    /// Insert a user, a project, and a pod. Returns the pod.
    pub async fn insert_pod(store: &SqliteStore, user_id: Uuid, repo_url: Option<&str>) -> Pod {
        let now = Utc::now();
        let project_id = Uuid::new_v4();
        sqlx::query(
            "INSERT OR IGNORE INTO users (id, username, created_at) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(format!("user-{}", user_id))
        .bind(now)
        .execute(&*store.db)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO projects (id, user_id, title, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(project_id)
        .bind(user_id)
        .bind("project")
        .bind(now)
        .bind(now)
        .execute(&*store.db)
        .await
        .unwrap();

        let pod = Pod {
            id: Uuid::new_v4(),
            user_id,
            project_id,
            title: "My App".into(),
            repo_url: repo_url.map(str::to_string),
            branch: "main".into(),
            dockerfile_path: "Dockerfile".into(),
            git_token_id: None,
            container_id: None,
            status: PodStatus::Idle,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(&format!(
            "INSERT INTO pods ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            POD_COLUMNS
        ))
        .bind(pod.id)
        .bind(pod.user_id)
        .bind(pod.project_id)
        .bind(&pod.title)
        .bind(&pod.repo_url)
        .bind(&pod.branch)
        .bind(&pod.dockerfile_path)
        .bind(pod.git_token_id)
        .bind(&pod.container_id)
        .bind(pod.status)
        .bind(pod.created_at)
        .bind(pod.updated_at)
        .execute(&*store.db)
        .await
        .unwrap();
        pod
    }

    pub async fn insert_domain(store: &SqliteStore, pod_id: Uuid, domain: &str, port: i64) {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO pod_domains (id, pod_id, domain, type, port, ssl_enabled, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(pod_id)
        .bind(domain)
        .bind(DomainType::Custom)
        .bind(port)
        .bind(true)
        .bind(now)
        .bind(now)
        .execute(&*store.db)
        .await
        .unwrap();
    }

    pub async fn insert_env_var(store: &SqliteStore, pod_id: Uuid, key: &str, sealed: &str) {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO pod_env_vars (id, pod_id, key, value, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(pod_id)
        .bind(key)
        .bind(sealed)
        .bind(now)
        .bind(now)
        .execute(&*store.db)
        .await
        .unwrap();
    }

    pub async fn insert_git_token(store: &SqliteStore, user_id: Uuid, sealed: &str) -> Uuid {
        let now = Utc::now();
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO git_tokens (id, user_id, name, provider, token, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(user_id)
        .bind("ci")
        .bind(GitProvider::Github)
        .bind(sealed)
        .bind(now)
        .bind(now)
        .execute(&*store.db)
        .await
        .unwrap();
        id
    }
}
