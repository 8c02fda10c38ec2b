//! `packsync-server`: serves one pack's configured folders to connecting
//! clients until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use packsync::config::store::{default_base_dir, load_or_default, FsConfigStore};
use packsync::config::PackConfig;
use packsync::server::NetworkServer;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "packsync-server", version, about = "Serve a packsync pack to connecting clients")]
struct Args {
    /// Path to a pack configuration JSON file. If omitted, the pack
    /// currently selected in the config store (under --base-dir) is used.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the config store's base directory.
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Overrides the loaded config's listen address, e.g. "0.0.0.0:9000".
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let base_dir = args.base_dir.unwrap_or_else(default_base_dir);

    let mut config = load_config(args.config, &base_dir).await?;

    if let Some(listen) = args.listen {
        let (host, port) = listen
            .rsplit_once(':')
            .with_context(|| format!("--listen must be host:port, got '{listen}'"))?;
        config.host = host.to_string();
        config.port = port.parse().with_context(|| format!("invalid port in '{listen}'"))?;
    }

    config.validate().context("pack configuration is invalid")?;
    tracing::info!(pack = %config.id, host = %config.host, port = config.port, "starting server");

    let server = NetworkServer::bind(config).await?;
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            shutdown.stop();
        }
    });

    server.run().await?;
    tracing::info!("server stopped");
    Ok(())
}

async fn load_config(explicit: Option<PathBuf>, base_dir: &std::path::Path) -> Result<PackConfig> {
    if let Some(path) = explicit {
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading config file {}", path.display()))?;
        return serde_json::from_slice(&bytes).with_context(|| format!("parsing config file {}", path.display()));
    }

    let store = FsConfigStore::new(base_dir);
    match load_or_default(&store, None).await? {
        Some(config) => Ok(config),
        None => {
            tracing::info!(
                base_dir = %base_dir.display(),
                "no --config given and no pack selected; serving an empty in-memory config"
            );
            Ok(empty_config(base_dir))
        }
    }
}

/// The "no default" case from §6: no folders, nothing to distribute, but a
/// well-formed config so the listener can still bind and answer `init`.
fn empty_config(base_dir: &std::path::Path) -> PackConfig {
    PackConfig {
        id: "empty".into(),
        name: "(no pack selected)".into(),
        version: "0.0.0".into(),
        host: "127.0.0.1".into(),
        port: 9000,
        server_root: base_dir.display().to_string(),
        folders: Vec::new(),
        ignore_patterns: Vec::new(),
        redirects: Vec::new(),
    }
}
