//! Coordspace node
//!
//! Hosts one space on the in-process transport and serves requests until
//! interrupted.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use coordspace_common::SpaceConfig;
use coordspace_common::config::PersistenceProfile;
use coordspace_persistence::{PersistenceManager, open_backend};
use coordspace_remote::{LOCAL_SCHEME, LocalHub, MessageRouter, ResponseWaiters, SendManager};
use coordspace_runtime::{Space, SpaceRequestHandler};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "coordspace-node")]
#[command(about = "Coordspace space node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "COORDSPACE_CONFIG")]
    config: Option<PathBuf>,

    /// Space URI (overrides space.uri)
    #[arg(long)]
    uri: Option<String>,

    /// Persistence profile
    #[arg(long, value_enum)]
    profile: Option<Profile>,

    /// Database file for the redb profile
    #[arg(long)]
    data_path: Option<PathBuf>,

    /// Periodic deadlock scan interval in milliseconds
    #[arg(long)]
    scan_interval_ms: Option<u64>,

    /// Reject remote requests that carry no identity
    #[arg(long)]
    require_identity: bool,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Profile {
    InMemory,
    Redb,
}

impl From<Profile> for PersistenceProfile {
    fn from(p: Profile) -> Self {
        match p {
            Profile::InMemory => Self::InMemory,
            Profile::Redb => Self::Redb,
        }
    }
}

/// Config file values with command line overrides applied
fn load_config(args: &Args) -> Result<SpaceConfig> {
    let mut config = match &args.config {
        Some(path) => SpaceConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => SpaceConfig::default(),
    };

    if let Some(uri) = &args.uri {
        config.space.uri.clone_from(uri);
    }
    if let Some(profile) = args.profile {
        config.persistence.profile = profile.into();
    }
    if let Some(path) = &args.data_path {
        config.persistence.path = Some(path.clone());
    }
    if let Some(ms) = args.scan_interval_ms {
        config.deadlock.scan_interval_ms = Some(ms);
    }
    if args.require_identity {
        config.remote.require_identity = true;
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config.logging.level, args.json_logs);

    info!("Starting coordspace node '{}'", config.space.name);

    let backend = open_backend(&config.persistence).context("failed to open persistence backend")?;
    let persistence = PersistenceManager::new(backend, config.persistence.commit);
    let space = Space::new(&config, persistence)?;
    if let Some(scheme) = space.uri().scheme()
        && scheme != LOCAL_SCHEME
    {
        anyhow::bail!("no transport for scheme '{scheme}', only '{LOCAL_SCHEME}' is available");
    }

    let maintenance = config
        .deadlock
        .scan_interval_ms
        .map(|ms| space.spawn_maintenance(Duration::from_millis(ms)));

    let hub = LocalHub::new();
    let sends = SendManager::new(config.remote.default_scheme.clone());
    sends.register_sender(hub.sender());
    let router = Arc::new(MessageRouter::new(ResponseWaiters::new()));
    router.set_request_handler(SpaceRequestHandler::new(
        Arc::clone(&space),
        Arc::clone(&sends),
        config.remote.require_identity,
    ));
    sends.register_receiver(hub.bind(space.uri().authority(), router)?);

    info!("Space listening at {}", space.uri());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Some(task) = maintenance {
        task.abort();
    }
    sends.shutdown().await;
    space.close();

    info!("Coordspace node shut down gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordspace_common::config::VictimPolicyConfig;

    #[test]
    fn test_defaults_without_config_file() {
        let args = Args::parse_from(["coordspace-node"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.persistence.profile, PersistenceProfile::InMemory);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(
            &path,
            "[space]\nuri = \"mem://from-file\"\n\n[deadlock]\nvictim = \"oldest\"\n\n[logging]\nlevel = \"warn\"\n",
        )
        .unwrap();

        let args = Args::parse_from([
            "coordspace-node",
            "--config",
            path.to_str().unwrap(),
            "--uri",
            "mem://from-cli",
            "--profile",
            "redb",
            "--data-path",
            "/tmp/space.redb",
            "--require-identity",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.space.uri, "mem://from-cli");
        assert_eq!(config.persistence.profile, PersistenceProfile::Redb);
        assert_eq!(config.deadlock.victim, VictimPolicyConfig::Oldest);
        assert_eq!(config.logging.level, "warn");
        assert!(config.remote.require_identity);
    }

    #[test]
    fn test_redb_without_path_rejected() {
        let args = Args::parse_from(["coordspace-node", "--profile", "redb"]);
        assert!(load_config(&args).is_err());
    }
}
