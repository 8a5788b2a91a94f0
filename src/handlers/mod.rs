pub mod auth;
pub mod extract;
pub mod health_handlers;
pub mod pod_handlers;
pub mod settings_handlers;
