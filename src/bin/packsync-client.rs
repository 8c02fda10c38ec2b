//! `packsync-client`: connects to a packsync server and reconciles the
//! local tree against its configured folders, either once (`sync`) or on a
//! repeating interval (`watch`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use packsync::progress::{Phase, ProgressEvent, ProgressSink};
use packsync::sync::client::SyncClient;
use packsync::sync::FolderReport;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const PEER_ID_FILE: &str = ".packsync-peer-id";

#[derive(Parser, Debug)]
#[command(name = "packsync-client", version, about = "Sync a local tree against a packsync server")]
struct Args {
    /// Server address, e.g. "pack.example.com:9000".
    #[arg(long)]
    server: String,

    /// This client's identifier. Generated once and persisted under
    /// `--local-root` if not given.
    #[arg(long)]
    peer_id: Option<String>,

    /// Base directory the server's folders are reconciled into (subject to
    /// each folder's path redirect).
    #[arg(long)]
    local_root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile every configured folder once, then exit.
    Sync,
    /// Keep the connection open and resync on a repeating interval until
    /// interrupted.
    Watch {
        #[arg(long, default_value_t = 300)]
        interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let peer_id = resolve_peer_id(args.peer_id, &args.local_root).await?;

    match args.command {
        Command::Sync => run_once(&args.server, &peer_id, &args.local_root).await,
        Command::Watch { interval_secs } => {
            run_watch(&args.server, &peer_id, &args.local_root, Duration::from_secs(interval_secs)).await
        }
    }
}

async fn resolve_peer_id(explicit: Option<String>, local_root: &Path) -> Result<String> {
    if let Some(id) = explicit {
        return Ok(id);
    }
    let marker = local_root.join(PEER_ID_FILE);
    if let Ok(existing) = tokio::fs::read_to_string(&marker).await {
        let id = existing.trim().to_string();
        if !id.is_empty() {
            return Ok(id);
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    tokio::fs::create_dir_all(local_root)
        .await
        .with_context(|| format!("creating local root {}", local_root.display()))?;
    tokio::fs::write(&marker, &id).await?;
    Ok(id)
}

async fn run_once(server: &str, peer_id: &str, local_root: &Path) -> Result<()> {
    let mut client = SyncClient::connect(server, peer_id, local_root).await?;
    client.set_progress_sink(Arc::new(CliProgressSink::new()));
    client.init().await.context("init handshake failed")?;
    let reports = client.sync_all().await?;
    print_reports(&reports);
    Ok(())
}

async fn run_watch(server: &str, peer_id: &str, local_root: &Path, interval: Duration) -> Result<()> {
    loop {
        let mut client = match SyncClient::connect(server, peer_id, local_root).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "connect failed, retrying");
                tokio::time::sleep(interval).await;
                continue;
            }
        };
        client.set_progress_sink(Arc::new(CliProgressSink::new()));
        if let Err(e) = client.init().await {
            tracing::warn!(error = %e, "init failed, retrying");
            tokio::time::sleep(interval).await;
            continue;
        }
        let watchdog = client.spawn_idle_watchdog();

        loop {
            match client.sync_all().await {
                Ok(reports) => print_reports(&reports),
                Err(e) => {
                    tracing::warn!(error = %e, "sync failed, reconnecting");
                    break;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    watchdog.abort();
                    return Ok(());
                }
            }
        }
        watchdog.abort();
    }
}

fn print_reports(reports: &[FolderReport]) {
    for r in reports {
        let line = format!(
            "{}: +{} downloaded, -{} deleted, {} failed, {} ignored",
            r.folder, r.downloaded, r.deleted, r.failed, r.ignored
        );
        if r.failed > 0 {
            println!("{}", line.red());
        } else {
            println!("{}", line.green());
        }
    }
}

/// Renders [`ProgressEvent`]s from the sync engine as an `indicatif` bar.
struct CliProgressSink {
    bar: ProgressBar,
}

impl CliProgressSink {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        Self { bar }
    }
}

impl ProgressSink for CliProgressSink {
    fn on_progress(&self, event: ProgressEvent) {
        self.bar.set_length(event.total_bytes.max(1));
        self.bar.set_position(event.current_bytes);
        self.bar.set_message(format!("{:?} {}", event.phase, event.current_file));
        if event.phase == Phase::Complete {
            self.bar.set_position(event.total_bytes);
        }
    }
}
