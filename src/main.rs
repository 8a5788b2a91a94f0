use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::{
    io::{ErrorKind, Read},
    str::FromStr,
    sync::Arc,
};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use config::{AppConfig, Command};
use services::{
    build_logs::BuildLogBuffer,
    container_runtime::{ContainerRuntime, DockerRuntime},
    crypto_service::CryptoBox,
    deploy_service::DeployService,
    pod_store::SqliteStore,
    routing_service::RoutingService,
    token_service::{generate_token, hash_token},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    init_logging();

    // --- Parse config + command ---
    let (cfg, command) = AppConfig::from_env_and_args()?;
    tracing::info!("Starting deeploy with config: {:?}", cfg);

    let crypto = Arc::new(
        CryptoBox::from_config_key(cfg.encryption_key.as_deref())
            .context("loading DEEPLOY_ENCRYPTION_KEY")?,
    );
    if !crypto.is_enabled() {
        tracing::warn!("DEEPLOY_ENCRYPTION_KEY is not set; secrets are stored in plaintext");
    }

    // --- Seal mode needs no database ---
    if command == Command::Seal {
        let mut plaintext = String::new();
        std::io::stdin().read_to_string(&mut plaintext)?;
        println!(
            "{}",
            crypto.encrypt(plaintext.trim_end_matches(&['\r', '\n'][..]))?
        );
        return Ok(());
    }

    // --- Initialize SQLite connection ---
    let db = connect(&cfg.database_url).await?;
    let store = SqliteStore::new(db);
    let statements = store.migrate().await.context("running migrations")?;
    tracing::debug!("Applied {} migration statements", statements);

    match &command {
        Command::Migrate => {
            tracing::info!("Database migration complete.");
            return Ok(()); // exit after migration
        }
        Command::IssueToken(username) => {
            let user = store.ensure_user(username).await?;
            let token = generate_token();
            store
                .insert_api_token(user.id, "cli", &hash_token(&token))
                .await?;
            tracing::info!(user = %user.username, "issued API token");
            println!("{}", token);
            return Ok(());
        }
        Command::Seal | Command::Serve => {}
    }

    // --- Ensure working directories exist ---
    for dir in [&cfg.build_dir, &cfg.routing_dir] {
        if !dir.exists() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
            tracing::info!("Created directory {}", dir.display());
        }
    }

    // --- Initialize core services ---
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect(&cfg.build_dir, &cfg.network)
            .context("configuring container daemon client")?,
    );
    if let Err(err) = runtime.ping().await {
        tracing::warn!("Container daemon unreachable at start-up: {}", err);
    }

    let routing = RoutingService::new(
        &cfg.routing_dir,
        cfg.dev_mode(),
        &cfg.internal_host,
        cfg.port,
    );
    let deployer = DeployService::new(
        Arc::new(store),
        runtime,
        crypto,
        BuildLogBuffer::new(),
        routing.clone(),
        &cfg.network,
    );

    match deployer.reconcile().await {
        Ok(report) => tracing::info!(
            failed = report.failed,
            stopped = report.stopped,
            unchanged = report.unchanged,
            "Reconciled pod status"
        ),
        Err(err) => tracing::warn!("Pod status reconciliation failed: {}", err),
    }

    // --- Build router ---
    let app: Router =
        routes::routes::routes().with_state(state::AppState::new(
            deployer.clone(),
            routing,
            cfg.build_dir.clone(),
        ));

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Drain detached deploys ---
    deployer.shutdown(cfg.shutdown_grace).await;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Text logs by default, JSON when `LOG_FORMAT=json`. Logs go to stderr so
/// stdout stays clean for `--issue-token` and `--seal`.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Open the SQLite pool, creating the database file and its directory if needed.
async fn connect(db_url: &str) -> Result<Arc<SqlitePool>> {
    tracing::debug!("Connecting using raw URL => {}", db_url);
    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database URL `{}`", db_url))?
        .create_if_missing(true);

    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("opening database")?;
    Ok(Arc::new(pool))
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl-C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping server");
}
