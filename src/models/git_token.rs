//! Stored access tokens for cloning private repositories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Git hosting provider. Determines the username paired with the token
/// during HTTPS authentication.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum GitProvider {
    Github,
    Gitlab,
    Bitbucket,
}

impl GitProvider {
    /// Username each provider expects alongside a token over HTTPS basic auth.
    pub fn auth_username(&self) -> &'static str {
        match self {
            GitProvider::Github => "x-access-token",
            GitProvider::Gitlab => "oauth2",
            GitProvider::Bitbucket => "x-token-auth",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct GitToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub provider: GitProvider,

    /// Ciphertext at rest.
    #[serde(skip_serializing)]
    pub token: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
