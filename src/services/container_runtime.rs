//! src/services/container_runtime.rs
//!
//! Container runtime adapter. Every interaction with git, the container
//! daemon, and the build scratch space goes through [`ContainerRuntime`].
//! The shipped implementation clones with the `git` CLI and drives the
//! container daemon through its HTTP API, streaming build output line by line.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bollard::{
    Docker, body_full,
    models::{
        ContainerCreateBody, EndpointSettings, HostConfig, NetworkCreateRequest,
        NetworkingConfig, RestartPolicy, RestartPolicyNameEnum,
    },
    query_parameters::{
        BuildImageOptionsBuilder, CreateContainerOptionsBuilder, InspectContainerOptions,
        InspectNetworkOptions, LogsOptionsBuilder, RemoveContainerOptionsBuilder,
        StartContainerOptions, StopContainerOptionsBuilder,
    },
};
use bytes::Bytes;
use futures::StreamExt;
use std::{
    collections::{BTreeMap, HashMap},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};
use thiserror::Error;
use tokio::{process::Command, sync::Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::git_token::GitProvider;

const MAX_DOCKERFILE_PATH_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("clone failed: {0}")]
    CloneFailed(String),
    #[error("build failed: {0}")]
    BuildFailed(String),
    #[error("run failed: {0}")]
    RunFailed(String),
    #[error("build cancelled")]
    Cancelled,
    #[error("invalid dockerfile path `{0}`")]
    InvalidPath(String),
    #[error("container daemon error: {0}")]
    Daemon(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Receives build output one line at a time.
pub type LineSink = Arc<dyn Fn(String) + Send + Sync>;

/// Plaintext credentials for cloning a private repository. Lives only for the
/// duration of a deploy.
#[derive(Clone)]
pub struct GitCredentials {
    pub provider: GitProvider,
    pub token: String,
}

impl std::fmt::Debug for GitCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitCredentials")
            .field("provider", &self.provider)
            .field("token", &"***")
            .finish()
    }
}

/// Everything needed to start a pod container.
#[derive(Clone, Debug)]
pub struct RunSpec {
    pub pod_id: Uuid,
    pub image_tag: String,
    pub container_name: String,
    /// Extra DNS name for the container on the shared network.
    pub network_alias: String,
    /// Plaintext environment. Never logged.
    pub env: BTreeMap<String, String>,
    /// Routing labels read by the proxy.
    pub labels: BTreeMap<String, String>,
}

/// A per-deploy working directory, removed when dropped.
///
/// Owning the directory through this guard means every exit path of a deploy,
/// including a panic, deletes the checkout.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Create a fresh, empty directory under `base`.
    pub fn create(base: &Path) -> io::Result<Self> {
        let path = base.join(format!("clone-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("removed scratch dir {}", self.path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                "failed to remove scratch dir {}: {}",
                self.path.display(),
                err
            ),
        }
    }
}

/// Operations the deploy pipeline needs from the host.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Shallow-clone `branch` of `repo_url` into a fresh scratch directory.
    async fn clone_repo(
        &self,
        repo_url: &str,
        branch: &str,
        credentials: Option<&GitCredentials>,
    ) -> RuntimeResult<ScratchDir>;

    /// Build `image_tag` from `dockerfile` inside `workdir`, streaming output
    /// into `sink`. Cancelling `cancel` kills the build.
    async fn build_image(
        &self,
        cancel: &CancellationToken,
        workdir: &Path,
        dockerfile: &str,
        image_tag: &str,
        sink: LineSink,
    ) -> RuntimeResult<String>;

    /// Create and start a container on the shared network. Returns its id.
    async fn run_container(&self, spec: &RunSpec) -> RuntimeResult<String>;

    /// Idempotent: a missing container is not an error.
    async fn stop_container(&self, container_id: &str) -> RuntimeResult<()>;

    /// Idempotent: a missing container is not an error.
    async fn remove_container(&self, container_id: &str) -> RuntimeResult<()>;

    /// Last `lines` lines of combined stdout/stderr, oldest first.
    async fn logs_tail(&self, container_id: &str, lines: usize) -> RuntimeResult<Vec<String>>;

    /// `None` when the daemon does not know the container.
    async fn container_running(&self, container_id: &str) -> RuntimeResult<Option<bool>>;

    /// Check the daemon is reachable.
    async fn ping(&self) -> RuntimeResult<()>;
}

/// [`ContainerRuntime`] that talks to the Docker Engine API and clones with
/// the `git` command-line tool.
pub struct DockerRuntime {
    docker: Docker,
    git: PathBuf,
    build_dir: PathBuf,
    network: String,
    network_ready: Mutex<bool>,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime")
            .field("git", &self.git)
            .field("build_dir", &self.build_dir)
            .field("network", &self.network)
            .finish()
    }
}

impl DockerRuntime {
    /// Connect to the local daemon using `DOCKER_HOST` or the default socket.
    pub fn connect(build_dir: impl Into<PathBuf>, network: impl Into<String>) -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(daemon_error)?;
        Ok(Self {
            docker,
            git: resolve_program("git"),
            build_dir: build_dir.into(),
            network: network.into(),
            network_ready: Mutex::new(false),
        })
    }

    /// Create the shared network once; later calls are no-ops.
    async fn ensure_network(&self) -> RuntimeResult<()> {
        let mut ready = self.network_ready.lock().await;
        if *ready {
            return Ok(());
        }

        match self
            .docker
            .inspect_network(&self.network, None::<InspectNetworkOptions>)
            .await
        {
            Ok(_) => {}
            Err(err) if is_not_found(&err) => {
                let request = NetworkCreateRequest {
                    name: self.network.clone(),
                    driver: Some("bridge".into()),
                    ..Default::default()
                };
                match self.docker.create_network(request).await {
                    Ok(_) => info!("created container network {}", self.network),
                    // Lost a race with another creator.
                    Err(err) if status_code(&err) == Some(409) => {}
                    Err(err) => {
                        return Err(RuntimeError::RunFailed(format!(
                            "creating network {}: {}",
                            self.network, err
                        )));
                    }
                }
            }
            Err(err) => return Err(daemon_error(err)),
        }

        *ready = true;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn clone_repo(
        &self,
        repo_url: &str,
        branch: &str,
        credentials: Option<&GitCredentials>,
    ) -> RuntimeResult<ScratchDir> {
        tokio::fs::create_dir_all(&self.build_dir).await?;
        let scratch = ScratchDir::create(&self.build_dir)?;

        let mut cmd = Command::new(&self.git);
        cmd.args(["clone", "--depth", "1", "--single-branch", "--branch", branch])
            .arg("--")
            .arg(repo_url)
            .arg(scratch.path())
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // The token travels in the child's environment as an extra HTTP header,
        // never on the argument list.
        if let Some(creds) = credentials {
            cmd.env("GIT_CONFIG_COUNT", "1")
                .env("GIT_CONFIG_KEY_0", "http.extraHeader")
                .env("GIT_CONFIG_VALUE_0", basic_auth_header(creds));
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| RuntimeError::CloneFailed(format!("spawning git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = redact(stderr.trim(), credentials);
            return Err(RuntimeError::CloneFailed(if detail.is_empty() {
                format!("git exited with {}", output.status)
            } else {
                detail
            }));
        }

        Ok(scratch)
    }

    async fn build_image(
        &self,
        cancel: &CancellationToken,
        workdir: &Path,
        dockerfile: &str,
        image_tag: &str,
        sink: LineSink,
    ) -> RuntimeResult<String> {
        ensure_relative_path(dockerfile)?;
        if !workdir.join(dockerfile).is_file() {
            return Err(RuntimeError::BuildFailed(format!(
                "dockerfile `{}` not found in repository",
                dockerfile
            )));
        }

        let dir = workdir.to_path_buf();
        let context = tokio::task::spawn_blocking(move || tar_context(&dir))
            .await
            .map_err(|e| RuntimeError::BuildFailed(format!("packing build context: {}", e)))??;
        debug!(image = image_tag, bytes = context.len(), "sending build context");

        let options = BuildImageOptionsBuilder::default()
            .dockerfile(dockerfile)
            .t(image_tag)
            .rm(true)
            .forcerm(true)
            .build();
        let mut stream = std::pin::pin!(self.docker.build_image(
            options,
            None,
            Some(body_full(Bytes::from(context))),
        ));

        loop {
            // Dropping the stream closes the connection, which aborts the build.
            let next = tokio::select! {
                next = stream.next() => next,
                _ = cancel.cancelled() => {
                    warn!(image = image_tag, "build cancelled, dropping build stream");
                    return Err(RuntimeError::Cancelled);
                }
            };
            match next {
                Some(Ok(info)) => {
                    if let Some(text) = info.stream {
                        for line in text.lines().filter(|l| !l.trim().is_empty()) {
                            sink(line.trim_end().to_string());
                        }
                    }
                }
                Some(Err(err)) => {
                    let message = build_error_message(err);
                    sink(format!("ERROR: {}", message));
                    return Err(RuntimeError::BuildFailed(message));
                }
                None => break,
            }
        }

        Ok(image_tag.to_string())
    }

    async fn run_container(&self, spec: &RunSpec) -> RuntimeResult<String> {
        self.ensure_network().await?;

        // A container holding the name but unknown to the caller would block the run.
        let force = RemoveContainerOptionsBuilder::default().force(true).build();
        match self
            .docker
            .remove_container(&spec.container_name, Some(force))
            .await
        {
            Ok(()) => debug!(name = %spec.container_name, "removed stale container by name"),
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(RuntimeError::RunFailed(err.to_string())),
        }

        let body = container_body(spec, &self.network)?;
        let options = CreateContainerOptionsBuilder::default()
            .name(&spec.container_name)
            .build();
        let created = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| RuntimeError::RunFailed(e.to_string()))?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
            .map_err(|e| RuntimeError::RunFailed(e.to_string()))?;
        Ok(created.id)
    }

    async fn stop_container(&self, container_id: &str) -> RuntimeResult<()> {
        let options = StopContainerOptionsBuilder::default().t(10).build();
        match self.docker.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => {
                debug!("stop skipped, container already gone");
                Ok(())
            }
            // 304: already stopped
            Err(err) if status_code(&err) == Some(304) => Ok(()),
            Err(err) => Err(RuntimeError::Daemon(format!("stop failed: {}", err))),
        }
    }

    async fn remove_container(&self, container_id: &str) -> RuntimeResult<()> {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        match self
            .docker
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => {
                debug!("remove skipped, container already gone");
                Ok(())
            }
            Err(err) => Err(RuntimeError::Daemon(format!("remove failed: {}", err))),
        }
    }

    async fn logs_tail(&self, container_id: &str, lines: usize) -> RuntimeResult<Vec<String>> {
        let options = LogsOptionsBuilder::default()
            .stdout(true)
            .stderr(true)
            .tail(&lines.to_string())
            .build();
        let mut stream = std::pin::pin!(self.docker.logs(container_id, Some(options)));

        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            let output = chunk.map_err(daemon_error)?;
            text.push_str(&String::from_utf8_lossy(&output.into_bytes()));
        }
        Ok(last_lines(&text, lines))
    }

    async fn container_running(&self, container_id: &str) -> RuntimeResult<Option<bool>> {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => Ok(Some(
                details.state.and_then(|s| s.running).unwrap_or(false),
            )),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(daemon_error(err)),
        }
    }

    async fn ping(&self) -> RuntimeResult<()> {
        self.docker.ping().await.map_err(daemon_error)?;
        Ok(())
    }
}

/// Container create body: env as `KEY=VALUE` entries, labels, restart policy,
/// and an endpoint on the shared network carrying the alias.
fn container_body(spec: &RunSpec, network: &str) -> RuntimeResult<ContainerCreateBody> {
    let mut env = Vec::with_capacity(spec.env.len());
    for (key, value) in &spec.env {
        ensure_env_key(key)?;
        env.push(format!("{}={}", key, value));
    }
    let labels: HashMap<String, String> = spec
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let endpoint = EndpointSettings {
        aliases: Some(vec![spec.network_alias.clone()]),
        ..Default::default()
    };

    Ok(ContainerCreateBody {
        image: Some(spec.image_tag.clone()),
        env: Some(env),
        labels: Some(labels),
        host_config: Some(HostConfig {
            network_mode: Some(network.to_string()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                ..Default::default()
            }),
            ..Default::default()
        }),
        networking_config: Some(NetworkingConfig {
            endpoints_config: Some(HashMap::from([(network.to_string(), endpoint)])),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Pack the checkout as an uncompressed tar. Symlinks are stored as links so a
/// repository cannot pull host files into the context.
fn tar_context(dir: &Path) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    builder.into_inner()
}

fn status_code(err: &bollard::errors::Error) -> Option<u16> {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    status_code(err) == Some(404)
}

fn daemon_error(err: bollard::errors::Error) -> RuntimeError {
    RuntimeError::Daemon(err.to_string())
}

/// The daemon reports a failing build step as a stream error; keep only its message.
fn build_error_message(err: bollard::errors::Error) -> String {
    match err {
        bollard::errors::Error::DockerStreamError { error } => error.trim().to_string(),
        bollard::errors::Error::DockerResponseServerError { message, .. } => {
            message.trim().to_string()
        }
        other => other.to_string(),
    }
}

fn last_lines(text: &str, limit: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(limit);
    lines[skip..].iter().map(|l| l.to_string()).collect()
}

/// Locate `name` on PATH once, so later per-command env overrides cannot
/// change which binary runs.
fn resolve_program(name: &str) -> PathBuf {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(name))
                .find(|candidate| candidate.is_file())
        })
        .unwrap_or_else(|| PathBuf::from(name))
}

fn basic_auth_header(creds: &GitCredentials) -> String {
    let pair = format!("{}:{}", creds.provider.auth_username(), creds.token);
    format!(
        "Authorization: Basic {}",
        general_purpose::STANDARD.encode(pair)
    )
}

/// Strip every trace of the token from text that may reach logs.
fn redact(text: &str, credentials: Option<&GitCredentials>) -> String {
    match credentials {
        Some(creds) if !creds.token.is_empty() => {
            let encoded = general_purpose::STANDARD
                .encode(format!("{}:{}", creds.provider.auth_username(), creds.token));
            text.replace(&creds.token, "***").replace(&encoded, "***")
        }
        _ => text.to_string(),
    }
}

/// The Dockerfile must resolve inside the checkout.
fn ensure_relative_path(path: &str) -> RuntimeResult<()> {
    let invalid = path.is_empty()
        || path.len() > MAX_DOCKERFILE_PATH_LEN
        || path.starts_with('/')
        || path.starts_with('-')
        || path.split(['/', '\\']).any(|segment| segment == "..")
        || path.bytes().any(|b| b.is_ascii_control() || b == b'\0');
    if invalid {
        return Err(RuntimeError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// The daemon splits each entry on the first `=`, so a key may hold anything
/// but `=` and NUL.
fn ensure_env_key(key: &str) -> RuntimeResult<()> {
    if key.is_empty() || key.contains(['=', '\0']) {
        return Err(RuntimeError::RunFailed(format!(
            "invalid environment variable name `{}`",
            key.escape_debug()
        )));
    }
    Ok(())
}
