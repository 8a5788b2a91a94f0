use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub build_dir: PathBuf,
    pub routing_dir: PathBuf,
    /// Raw key material; decoded by the crypto box.
    pub encryption_key: Option<String>,
    pub environment: Environment,
    pub network: String,
    pub internal_host: String,
    pub shutdown_grace: Duration,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("build_dir", &self.build_dir)
            .field("routing_dir", &self.routing_dir)
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "***"),
            )
            .field("environment", &self.environment)
            .field("network", &self.network)
            .field("internal_host", &self.internal_host)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!(
                "unknown environment `{}` (expected development or production)",
                other
            )),
        }
    }
}

/// One-shot administrative actions that run instead of the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Serve,
    /// Apply migrations and exit.
    Migrate,
    /// Mint a bearer token for a user (created if missing) and print it.
    IssueToken(String),
    /// Encrypt stdin with the configured key and print the result.
    Seal,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Self-hosted deployment control plane")]
pub struct Args {
    /// Host to bind to (overrides DEEPLOY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DEEPLOY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides DEEPLOY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Scratch directory for repository clones (overrides DEEPLOY_BUILD_DIR)
    #[arg(long)]
    pub build_dir: Option<PathBuf>,

    /// Directory the proxy watches for routing files (overrides DEEPLOY_ROUTING_DIR)
    #[arg(long)]
    pub routing_dir: Option<PathBuf>,

    /// development or production (overrides DEEPLOY_ENV)
    #[arg(long = "env")]
    pub environment: Option<Environment>,

    /// Shared container network (overrides DEEPLOY_NETWORK)
    #[arg(long)]
    pub network: Option<String>,

    /// Hostname the proxy uses to reach this server (overrides DEEPLOY_INTERNAL_HOST)
    #[arg(long)]
    pub internal_host: Option<String>,

    /// Seconds to wait for in-flight deploys on shutdown (overrides DEEPLOY_SHUTDOWN_GRACE_SECS)
    #[arg(long)]
    pub shutdown_grace_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Issue an API token for USERNAME and exit
    #[arg(long, value_name = "USERNAME", conflicts_with_all = ["migrate", "seal"])]
    pub issue_token: Option<String>,

    /// Encrypt a value read from stdin and exit
    #[arg(long, conflicts_with = "migrate")]
    pub seal: bool,
}

impl Args {
    fn command(&self) -> Command {
        if self.migrate {
            Command::Migrate
        } else if let Some(username) = &self.issue_token {
            Command::IssueToken(username.clone())
        } else if self.seal {
            Command::Seal
        } else {
            Command::Serve
        }
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command to run.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        // Parse CLI once
        let args = Args::parse();
        let command = args.command();
        let cfg = Self::merge(args, |key| env::var(key))?;
        Ok((cfg, command))
    }

    /// Merge `args` over values from `lookup` over defaults.
    fn merge<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|_| default.into());

        // --- Environment fallback ---
        let env_host = var("DEEPLOY_HOST", "0.0.0.0");
        let env_port: u16 = parse_var(&lookup, "DEEPLOY_PORT", 8090)?;
        let env_db = var("DEEPLOY_DATABASE_URL", "sqlite://./data/deeploy.db");
        let env_build = var("DEEPLOY_BUILD_DIR", "./data/builds");
        let env_routing = var("DEEPLOY_ROUTING_DIR", "./data/traefik");
        let env_environment: Environment =
            parse_var(&lookup, "DEEPLOY_ENV", Environment::Development)?;
        let env_network = var("DEEPLOY_NETWORK", "deeploy");
        let env_internal = var("DEEPLOY_INTERNAL_HOST", "deeploy");
        let env_grace: u64 = parse_var(&lookup, "DEEPLOY_SHUTDOWN_GRACE_SECS", 30)?;
        let encryption_key = lookup("DEEPLOY_ENCRYPTION_KEY")
            .ok()
            .filter(|k| !k.is_empty());

        // --- Merge ---
        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            build_dir: args.build_dir.unwrap_or_else(|| env_build.into()),
            routing_dir: args.routing_dir.unwrap_or_else(|| env_routing.into()),
            encryption_key,
            environment: args.environment.unwrap_or(env_environment),
            network: args.network.unwrap_or(env_network),
            internal_host: args.internal_host.unwrap_or(env_internal),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs.unwrap_or(env_grace)),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn dev_mode(&self) -> bool {
        self.environment == Environment::Development
    }
}

fn parse_var<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Result<String, env::VarError>,
{
    match lookup(key) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Result<String, env::VarError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned().ok_or(env::VarError::NotPresent)
    }

    fn args(argv: &[&str]) -> Args {
        Args::parse_from(std::iter::once("deeploy").chain(argv.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::merge(args(&[]), lookup(&[])).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:8090");
        assert_eq!(cfg.database_url, "sqlite://./data/deeploy.db");
        assert_eq!(cfg.build_dir, PathBuf::from("./data/builds"));
        assert_eq!(cfg.routing_dir, PathBuf::from("./data/traefik"));
        assert!(cfg.dev_mode());
        assert_eq!(cfg.network, "deeploy");
        assert_eq!(cfg.internal_host, "deeploy");
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(30));
        assert!(cfg.encryption_key.is_none());
    }

    #[test]
    fn test_cli_overrides_env() {
        let cfg = AppConfig::merge(
            args(&["--port", "9000", "--env", "production"]),
            lookup(&[
                ("DEEPLOY_PORT", "7000"),
                ("DEEPLOY_HOST", "127.0.0.1"),
                ("DEEPLOY_ENV", "development"),
                ("DEEPLOY_ENCRYPTION_KEY", "k"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:9000");
        assert!(!cfg.dev_mode());
        assert_eq!(cfg.encryption_key.as_deref(), Some("k"));
        assert!(!format!("{:?}", cfg).contains("\"k\""));
    }

    #[test]
    fn test_malformed_numbers_are_errors() {
        let err = AppConfig::merge(args(&[]), lookup(&[("DEEPLOY_PORT", "eighty")]))
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("DEEPLOY_PORT"));
        assert!(
            AppConfig::merge(args(&[]), lookup(&[("DEEPLOY_ENV", "staging")])).is_err()
        );
    }

    #[test]
    fn test_commands() {
        assert_eq!(args(&[]).command(), Command::Serve);
        assert_eq!(args(&["--migrate"]).command(), Command::Migrate);
        assert_eq!(
            args(&["--issue-token", "admin"]).command(),
            Command::IssueToken("admin".into())
        );
        assert_eq!(args(&["--seal"]).command(), Command::Seal);
    }
}
