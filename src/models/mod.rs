//! Data models for the deployment control plane.
//!
//! These map to database tables via `sqlx::FromRow` and serialize as JSON
//! via `serde`. Secret-bearing fields (env values, git tokens) hold
//! ciphertext and are skipped during serialization.

pub mod domain;
pub mod env_var;
pub mod git_token;
pub mod pod;
pub mod user;
