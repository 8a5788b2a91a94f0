//! Shared handler state.

use crate::services::{
    deploy_service::DeployService, pod_store::PodStore, routing_service::RoutingService,
};
use std::{path::PathBuf, sync::Arc};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PodStore>,
    pub deployer: DeployService,
    pub routing: RoutingService,
    /// Scratch root for clones; also checked by readiness.
    pub build_dir: PathBuf,
}

impl AppState {
    pub fn new(deployer: DeployService, routing: RoutingService, build_dir: PathBuf) -> Self {
        Self {
            store: deployer.store().clone(),
            deployer,
            routing,
            build_dir,
        }
    }
}
