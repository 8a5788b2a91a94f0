//! src/services/deploy_service.rs
//!
//! DeployService: the deploy pipeline and the read paths around it.
//!
//! A deploy runs clone → build → gather config → stop old → run new →
//! record status, strictly in that order, while holding the pod's build
//! slot. Only one deploy per pod can hold the slot; a second attempt fails
//! fast with `AlreadyDeploying`. Every line the pipeline produces goes into
//! the [`BuildLogBuffer`], and every failure after the pod enters `building`
//! leaves it `failed`, so no outcome strands a pod in `building`.

use crate::models::pod::{Pod, PodStatus};
use crate::services::{
    build_logs::BuildLogBuffer,
    container_runtime::{ContainerRuntime, GitCredentials, LineSink, RunSpec, RuntimeError},
    crypto_service::CryptoBox,
    pod_store::{PodStore, StoreError},
    routing_service::{self, RoutingService},
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default number of container log lines returned by the log surface.
pub const DEFAULT_LOG_LINES: usize = 100;

/// Upper bound on requested container log lines.
pub const MAX_LOG_LINES: usize = 5000;

/// Extra time given to cancelled builds to unwind after the grace period.
const CANCEL_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("a deploy is already in progress for pod {0}")]
    AlreadyDeploying(Uuid),
    #[error("{0}")]
    NotConfigured(String),
    #[error("pod {0} has no container")]
    NotRunning(Uuid),
    #[error("git token unavailable: {0}")]
    TokenUnavailable(String),
    #[error("environment variable `{key}` could not be decrypted")]
    SecretCorrupt { key: String },
    #[error("deploy pipeline aborted unexpectedly")]
    Aborted,
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type DeployResult<T> = Result<T, DeployError>;

/// Response body of the log surface.
#[derive(Serialize, Debug, Clone)]
pub struct PodLogs {
    pub logs: Vec<String>,
    pub status: PodStatus,
}

/// Outcome of the start-up reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub failed: usize,
    pub stopped: usize,
    pub unchanged: usize,
}

/// Exclusive right to deploy one pod. Released when dropped, including
/// during a panic unwind.
#[derive(Debug)]
pub struct BuildSlot {
    pod_id: Uuid,
    slots: Arc<Mutex<HashSet<Uuid>>>,
}

impl BuildSlot {
    pub fn pod_id(&self) -> Uuid {
        self.pod_id
    }
}

impl Drop for BuildSlot {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.remove(&self.pod_id);
        debug!(pod_id = %self.pod_id, "released build slot");
    }
}

#[derive(Clone)]
pub struct DeployService {
    store: Arc<dyn PodStore>,
    runtime: Arc<dyn ContainerRuntime>,
    crypto: Arc<CryptoBox>,
    logs: BuildLogBuffer,
    routing: RoutingService,
    network: String,
    slots: Arc<Mutex<HashSet<Uuid>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for DeployService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployService")
            .field("network", &self.network)
            .field("in_flight", &self.tracker.len())
            .finish()
    }
}

impl DeployService {
    pub fn new(
        store: Arc<dyn PodStore>,
        runtime: Arc<dyn ContainerRuntime>,
        crypto: Arc<CryptoBox>,
        logs: BuildLogBuffer,
        routing: RoutingService,
        network: impl Into<String>,
    ) -> Self {
        Self {
            store,
            runtime,
            crypto,
            logs,
            routing,
            network: network.into(),
            slots: Arc::new(Mutex::new(HashSet::new())),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn PodStore> {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Claim the build slot for `pod_id`, or fail without side effects.
    pub fn try_acquire(&self, pod_id: Uuid) -> DeployResult<BuildSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if !slots.insert(pod_id) {
            return Err(DeployError::AlreadyDeploying(pod_id));
        }
        debug!(pod_id = %pod_id, "acquired build slot");
        Ok(BuildSlot {
            pod_id,
            slots: self.slots.clone(),
        })
    }

    pub fn is_deploying(&self, pod_id: Uuid) -> bool {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.contains(&pod_id)
    }

    /// Run a full deploy of `pod_id` and wait for it.
    pub async fn deploy(&self, cancel: &CancellationToken, pod_id: Uuid) -> DeployResult<()> {
        let slot = self.try_acquire(pod_id)?;
        self.deploy_with_slot(slot, cancel.clone()).await
    }

    /// Run the pipeline for an already-acquired slot.
    ///
    /// The pipeline runs on its own task so that a panic inside it still
    /// releases the slot and is recorded as a failure.
    pub async fn deploy_with_slot(
        &self,
        slot: BuildSlot,
        cancel: CancellationToken,
    ) -> DeployResult<()> {
        let pod_id = slot.pod_id();
        let service = self.clone();
        let handle = tokio::spawn(async move { service.run_pipeline(slot, &cancel).await });

        match handle.await {
            Ok(result) => result,
            Err(join_err) => {
                error!(pod_id = %pod_id, "deploy task aborted: {}", join_err);
                self.record_abort(pod_id).await;
                Err(DeployError::Aborted)
            }
        }
    }

    /// Start a deploy that outlives the caller. Process shutdown, not the
    /// caller, decides when it is cancelled.
    pub fn spawn_deploy(&self, slot: BuildSlot) {
        let service = self.clone();
        let cancel = self.shutdown.child_token();
        self.tracker.spawn(async move {
            let pod_id = slot.pod_id();
            match service.deploy_with_slot(slot, cancel).await {
                Ok(()) => info!(pod_id = %pod_id, "deploy finished"),
                Err(err) => warn!(pod_id = %pod_id, "deploy failed: {}", err),
            }
        });
    }

    /// Stop the pod's container and record `stopped`. The container id is kept.
    /// Refused while a deploy holds the pod's slot.
    pub async fn stop(&self, pod_id: Uuid) -> DeployResult<Pod> {
        if self.is_deploying(pod_id) {
            return Err(DeployError::AlreadyDeploying(pod_id));
        }
        self.stop_held(pod_id).await
    }

    /// Stop for a caller that already holds the slot.
    async fn stop_held(&self, pod_id: Uuid) -> DeployResult<Pod> {
        let mut pod = self.store.get_pod(pod_id).await?;
        let Some(container_id) = pod.container().map(str::to_string) else {
            return Err(DeployError::NotRunning(pod_id));
        };

        self.runtime.stop_container(&container_id).await?;
        if let Err(err) = self.runtime.remove_container(&container_id).await {
            warn!(pod_id = %pod_id, container_id = %container_id, "failed to remove stopped container: {}", err);
        }

        pod.status = PodStatus::Stopped;
        self.store.update_pod(&pod).await?;
        info!(pod_id = %pod_id, container_id = %container_id, "pod stopped");
        Ok(pod)
    }

    /// Stop then deploy, waiting for the deploy to finish. Stop errors are ignored.
    pub async fn restart(&self, cancel: &CancellationToken, pod_id: Uuid) -> DeployResult<()> {
        let slot = self.prepare_restart(pod_id).await?;
        self.deploy_with_slot(slot, cancel.clone()).await
    }

    /// Stop now, deploy in the background.
    pub async fn restart_detached(&self, pod_id: Uuid) -> DeployResult<()> {
        let slot = self.prepare_restart(pod_id).await?;
        self.spawn_deploy(slot);
        Ok(())
    }

    async fn prepare_restart(&self, pod_id: Uuid) -> DeployResult<BuildSlot> {
        let slot = self.try_acquire(pod_id)?;
        if let Err(err) = self.stop_held(pod_id).await {
            debug!(pod_id = %pod_id, "ignoring stop error during restart: {}", err);
        }
        Ok(slot)
    }

    /// Build output while a build is relevant, otherwise the container's tail.
    pub async fn get_logs(&self, pod_id: Uuid, lines: usize) -> DeployResult<PodLogs> {
        let pod = self.store.get_pod(pod_id).await?;
        let status = pod.status;

        let container_id = match pod.container() {
            Some(id) if !matches!(status, PodStatus::Building | PodStatus::Failed) => id,
            _ => {
                return Ok(PodLogs {
                    logs: self.logs.snapshot(pod_id),
                    status,
                });
            }
        };

        let lines = lines.clamp(1, MAX_LOG_LINES);
        match self.runtime.logs_tail(container_id, lines).await {
            Ok(logs) => Ok(PodLogs { logs, status }),
            Err(err) => {
                debug!(pod_id = %pod_id, "container logs unavailable, serving build log: {}", err);
                Ok(PodLogs {
                    logs: self.logs.snapshot(pod_id),
                    status,
                })
            }
        }
    }

    /// Align recorded status with reality after a restart of this process.
    ///
    /// - `building` pods lost their pipeline with the old process → `failed`
    /// - `running` pods whose container is not running → `stopped`
    pub async fn reconcile(&self) -> DeployResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let pods = self
            .store
            .list_pods_by_status(&[PodStatus::Building, PodStatus::Running])
            .await?;

        for mut pod in pods {
            if self.is_deploying(pod.id) {
                report.unchanged += 1;
                continue;
            }

            let next = match (pod.status, pod.container()) {
                (PodStatus::Building, _) => Some(PodStatus::Failed),
                (_, None) => Some(PodStatus::Stopped),
                (_, Some(container_id)) => match self.runtime.container_running(container_id).await {
                    Ok(Some(true)) => None,
                    Ok(_) => Some(PodStatus::Stopped),
                    Err(err) => {
                        warn!(pod_id = %pod.id, "cannot inspect container, leaving status: {}", err);
                        None
                    }
                },
            };

            match next {
                Some(status) => {
                    info!(pod_id = %pod.id, from = %pod.status, to = %status, "reconciled pod status");
                    pod.status = status;
                    self.store.update_pod(&pod).await?;
                    match status {
                        PodStatus::Failed => report.failed += 1,
                        _ => report.stopped += 1,
                    }
                }
                None => report.unchanged += 1,
            }
        }

        if let Err(err) = self.routing.sync(self.store.as_ref()).await {
            warn!("failed to sync routing document: {}", err);
        }

        Ok(report)
    }

    /// Wait up to `grace` for detached deploys, then cancel what is left.
    pub async fn shutdown(&self, grace: Duration) {
        self.tracker.close();
        if self.tracker.is_empty() {
            return;
        }

        info!(in_flight = self.tracker.len(), "waiting for in-flight deploys");
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            return;
        }

        warn!(
            in_flight = self.tracker.len(),
            "grace period elapsed, cancelling in-flight deploys"
        );
        self.shutdown.cancel();
        if tokio::time::timeout(CANCEL_DRAIN, self.tracker.wait())
            .await
            .is_err()
        {
            error!("deploys still running after cancellation");
        }
    }

    async fn run_pipeline(&self, slot: BuildSlot, cancel: &CancellationToken) -> DeployResult<()> {
        let pod_id = slot.pod_id();
        self.logs.clear(pod_id);
        self.log(pod_id, format!("==> Starting deploy pipeline for pod {}", pod_id));

        let mut pod = match self.store.get_pod(pod_id).await {
            Ok(pod) => pod,
            Err(err) => {
                let err = DeployError::from(err);
                self.append_error(pod_id, &err);
                return Err(err);
            }
        };

        let Some(repo_url) = pod.repo().map(str::to_string) else {
            let err = DeployError::NotConfigured("no repository configured".into());
            self.append_error(pod_id, &err);
            return Err(err);
        };
        self.log(
            pod_id,
            format!(
                "==> Repository: {} (branch {})",
                redact_url(&repo_url),
                pod.branch
            ),
        );

        pod.status = PodStatus::Building;
        if let Err(err) = self.store.update_pod(&pod).await {
            let err = DeployError::from(err);
            self.append_error(pod_id, &err);
            return Err(err);
        }
        info!(pod_id = %pod_id, "deploy started");

        match self.build_and_run(&pod, &repo_url, cancel).await {
            Ok((container_id, domain_count)) => {
                pod.container_id = Some(container_id.clone());
                pod.status = PodStatus::Running;
                if let Err(err) = self.store.update_pod(&pod).await {
                    let err = DeployError::from(err);
                    self.append_error(pod_id, &err);
                    self.mark_failed_if_building(pod_id).await;
                    return Err(err);
                }

                self.log(
                    pod_id,
                    format!(
                        "==> Deploy complete: container {} serving {} domain(s)",
                        short_id(&container_id),
                        domain_count
                    ),
                );
                info!(pod_id = %pod_id, container_id = %container_id, "pod running");

                if let Err(err) = self.routing.sync(self.store.as_ref()).await {
                    warn!(pod_id = %pod_id, "failed to sync routing document: {}", err);
                }
                drop(slot);
                Ok(())
            }
            Err(err) => {
                self.append_error(pod_id, &err);
                pod.status = PodStatus::Failed;
                if let Err(store_err) = self.store.update_pod(&pod).await {
                    error!(pod_id = %pod_id, "failed to record failed status: {}", store_err);
                }
                drop(slot);
                Err(err)
            }
        }
    }

    /// Steps after the pod is marked `building`. Returns the new container id
    /// and the number of domains routed to it.
    async fn build_and_run(
        &self,
        pod: &Pod,
        repo_url: &str,
        cancel: &CancellationToken,
    ) -> DeployResult<(String, usize)> {
        let pod_id = pod.id;

        let credentials = match pod.git_token_id {
            Some(token_id) => {
                let creds = self.git_credentials(pod, token_id).await?;
                self.log(pod_id, "==> Using stored git token for private repository");
                Some(creds)
            }
            None => None,
        };

        self.log(pod_id, "==> Cloning repository");
        let scratch = self
            .runtime
            .clone_repo(repo_url, &pod.branch, credentials.as_ref())
            .await?;
        drop(credentials);
        self.log(pod_id, "==> Clone complete");

        let image_tag = pod.image_tag();
        self.log(
            pod_id,
            format!("==> Building image {} from {}", image_tag, pod.dockerfile_path),
        );
        let sink: LineSink = Arc::new(self.logs.sink(pod_id));
        self.runtime
            .build_image(cancel, scratch.path(), &pod.dockerfile_path, &image_tag, sink)
            .await?;
        drop(scratch);
        self.log(pod_id, "==> Build complete");

        let domains = self.store.list_domains(pod_id).await?;
        if domains.is_empty() {
            return Err(DeployError::NotConfigured(
                "no domain configured - add a domain first".into(),
            ));
        }

        let mut env = BTreeMap::new();
        for var in self.store.list_env_vars(pod_id).await? {
            let value = self.crypto.decrypt(&var.value).map_err(|err| {
                debug!(pod_id = %pod_id, key = %var.key, "env decrypt failed: {}", err);
                DeployError::SecretCorrupt {
                    key: var.key.clone(),
                }
            })?;
            env.insert(var.key, value);
        }
        self.log(
            pod_id,
            format!("==> Loaded {} environment variable(s)", env.len()),
        );

        if let Some(old) = pod.container() {
            self.log(
                pod_id,
                format!("==> Stopping previous container {}", short_id(old)),
            );
            if let Err(err) = self.runtime.stop_container(old).await {
                warn!(pod_id = %pod_id, container_id = %old, "failed to stop previous container: {}", err);
            }
            if let Err(err) = self.runtime.remove_container(old).await {
                warn!(pod_id = %pod_id, container_id = %old, "failed to remove previous container: {}", err);
            }
        }

        let spec = RunSpec {
            pod_id,
            image_tag,
            container_name: pod.container_name(),
            network_alias: routing_service::network_alias(pod_id, &pod.title),
            env,
            labels: routing_service::container_labels(
                pod_id,
                &domains,
                &self.network,
                self.routing.dev_mode(),
            ),
        };
        self.log(
            pod_id,
            format!("==> Starting container {}", spec.container_name),
        );
        let container_id = self.runtime.run_container(&spec).await?;

        Ok((container_id, domains.len()))
    }

    async fn git_credentials(&self, pod: &Pod, token_id: Uuid) -> DeployResult<GitCredentials> {
        let token = self
            .store
            .get_git_token(token_id)
            .await
            .map_err(|err| DeployError::TokenUnavailable(err.to_string()))?;
        if token.user_id != pod.user_id {
            return Err(DeployError::TokenUnavailable(format!(
                "token {} belongs to another user",
                token_id
            )));
        }
        let plaintext = self
            .crypto
            .decrypt(&token.token)
            .map_err(|err| DeployError::TokenUnavailable(err.to_string()))?;
        Ok(GitCredentials {
            provider: token.provider,
            token: plaintext,
        })
    }

    /// The slot was released during unwind, so a newer deploy may own the pod
    /// by now. Its log and status are left alone.
    async fn record_abort(&self, pod_id: Uuid) {
        if self.is_deploying(pod_id) {
            warn!(pod_id = %pod_id, "newer deploy in flight, leaving its status alone");
            return;
        }
        self.append_error(pod_id, &DeployError::Aborted);
        self.mark_failed_if_building(pod_id).await;
    }

    async fn mark_failed_if_building(&self, pod_id: Uuid) {
        match self.store.get_pod(pod_id).await {
            Ok(mut pod) if pod.status == PodStatus::Building => {
                pod.status = PodStatus::Failed;
                if let Err(err) = self.store.update_pod(&pod).await {
                    error!(pod_id = %pod_id, "failed to record failed status: {}", err);
                }
            }
            Ok(_) => {}
            Err(err) => error!(pod_id = %pod_id, "failed to reload pod: {}", err),
        }
    }

    fn log(&self, pod_id: Uuid, line: impl Into<String>) {
        self.logs.append(pod_id, line);
    }

    fn append_error(&self, pod_id: Uuid, err: &DeployError) {
        self.logs.append(pod_id, format!("ERROR: {}", err));
    }
}

/// Drop any `user:password@` part of a URL before it reaches a log.
fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://***@{}", scheme, &rest[at + 1..]),
        None => url.to_string(),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
