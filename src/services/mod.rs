pub mod build_logs;
pub mod container_runtime;
pub mod crypto_service;
pub mod deploy_service;
pub mod pod_store;
pub mod routing_service;
pub mod token_service;
