//! Client-side sync driver: connects to a server, performs the `init`
//! handshake, then reconciles each configured folder using the algorithm
//! its [`SyncMode`] names. One connection drives all folders sequentially;
//! there is no pipelining of requests, matching the server's one-at-a-time
//! dispatch.

use super::diff::{diff_mirror, diff_push, stale_dirs};
use super::FolderReport;
use crate::archive;
use crate::config::{redirect_to_client, PackConfig, SyncFolder, SyncMode};
use crate::error::{Result, SyncError};
use crate::progress::{NullProgressSink, Phase, ProgressSink, ProgressTracker};
use crate::protocol::framing::{write_envelope, EnvelopeReader};
use crate::protocol::{
    DataPayload, Envelope, FileDataPayload, FilePayload, InitPayload, InitResponsePayload,
    MessageType, PathPayload,
};
use crate::scan::ignore::IgnoreSet;
use crate::scan::{md5, scan};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WATCHDOG_CADENCE: Duration = Duration::from_secs(30);
const IDLE_THRESHOLD: Duration = Duration::from_secs(180);

/// Directory the pack-mode tie-break marker lives under, as a sibling of the
/// synced folders rather than inside any of them — so an extracted pack
/// folder contains only the archive's own entries (§8 scenario 5).
const PACK_CACHE_DIR: &str = ".packsync-cache";

/// Where the cached declared-MD5 marker for `folder_path` lives, rooted at
/// `local_root` rather than at the folder's (possibly redirected) local
/// path, since the folder itself gets wiped and replaced on every pack sync.
fn pack_marker_path(local_root: &Path, folder_path: &str) -> PathBuf {
    local_root.join(PACK_CACHE_DIR).join(format!("{folder_path}.md5"))
}

/// A single connection to a server, driving init and folder reconciliation.
/// Not `Clone` — one client owns one socket.
pub struct SyncClient {
    uuid: String,
    local_root: PathBuf,
    reader: EnvelopeReader<OwnedReadHalf>,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    config: Option<PackConfig>,
    last_active: Arc<std::sync::Mutex<Instant>>,
    is_syncing: Arc<AtomicBool>,
    progress: Arc<dyn ProgressSink>,
    connection_lost: Arc<dyn Fn() + Send + Sync>,
}

impl SyncClient {
    /// Dial `addr`, failing after [`CONNECT_TIMEOUT`] rather than hanging.
    pub async fn connect(addr: &str, uuid: impl Into<String>, local_root: impl Into<PathBuf>) -> Result<Self> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| SyncError::Transport(format!("connect to {addr} timed out")))?
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(Self::from_stream(stream, uuid, local_root))
    }

    fn from_stream(stream: TcpStream, uuid: impl Into<String>, local_root: impl Into<PathBuf>) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            uuid: uuid.into(),
            local_root: local_root.into(),
            reader: EnvelopeReader::new(read_half),
            writer: Arc::new(AsyncMutex::new(write_half)),
            config: None,
            last_active: Arc::new(std::sync::Mutex::new(Instant::now())),
            is_syncing: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(NullProgressSink),
            connection_lost: Arc::new(|| {}),
        }
    }

    pub fn config(&self) -> Option<&PackConfig> {
        self.config.as_ref()
    }

    /// Swap in a sink for [`crate::progress::ProgressEvent`]s (the CLI
    /// wires an `indicatif` bar here; tests and `watch` mode can leave the
    /// default no-op sink in place).
    pub fn set_progress_sink(&mut self, sink: Arc<dyn ProgressSink>) {
        self.progress = sink;
    }

    /// Install the callback invoked exactly once when the idle watchdog
    /// (or any other transport failure) ends the connection (§4.6).
    pub fn set_connection_lost_callback(&mut self, callback: impl Fn() + Send + Sync + 'static) {
        self.connection_lost = Arc::new(callback);
    }

    fn set_syncing(&self, syncing: bool) {
        self.is_syncing.store(syncing, Ordering::SeqCst);
    }

    fn touch(&self) {
        *self.last_active.lock().expect("last_active mutex poisoned") = Instant::now();
    }

    /// Spawn the idle watchdog with the default cadence/threshold (§4.6).
    pub fn spawn_idle_watchdog(&self) -> tokio::task::JoinHandle<()> {
        self.spawn_idle_watchdog_with(WATCHDOG_CADENCE, IDLE_THRESHOLD)
    }

    /// Spawn the idle watchdog with an explicit cadence/threshold. Every
    /// `cadence`, if the client isn't mid-sync and has been quiet for at
    /// least `threshold`, it shuts down the write half (unblocking any
    /// pending read with an error) and fires the connection-lost callback
    /// exactly once.
    pub fn spawn_idle_watchdog_with(&self, cadence: Duration, threshold: Duration) -> tokio::task::JoinHandle<()> {
        let writer = self.writer.clone();
        let last_active = self.last_active.clone();
        let is_syncing = self.is_syncing.clone();
        let connection_lost = self.connection_lost.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(cadence).await;
                if is_syncing.load(Ordering::SeqCst) {
                    continue;
                }
                let idle_for = last_active
                    .lock()
                    .expect("last_active mutex poisoned")
                    .elapsed();
                if idle_for >= threshold {
                    tracing::info!(idle_secs = idle_for.as_secs(), "idle timeout, closing connection");
                    let mut w = writer.lock().await;
                    let _ = w.shutdown().await;
                    drop(w);
                    connection_lost();
                    break;
                }
            }
        })
    }

    async fn send(&mut self, env: Envelope) -> Result<()> {
        let mut w = self.writer.lock().await;
        write_envelope(&mut *w, &env).await?;
        drop(w);
        self.touch();
        Ok(())
    }

    async fn recv(&mut self) -> Result<Envelope> {
        let env = self.reader.read_envelope().await?;
        self.touch();
        Ok(env)
    }

    async fn request_data(&mut self, kind: MessageType, path: &str) -> Result<DataPayload> {
        self.send(Envelope::new(kind, self.uuid.clone(), PathPayload { path: path.to_string() }))
            .await?;
        let resp = self.recv().await?;
        resp.decode_payload()
    }

    /// `init` handshake: send this client's identifier (and, if a config
    /// was cached from a previous connection, its local MD5 snapshot),
    /// then adopt whatever configuration the server hands back.
    pub async fn init(&mut self) -> Result<()> {
        self.set_syncing(true);
        let result = self.init_inner().await;
        self.set_syncing(false);
        result
    }

    async fn init_inner(&mut self) -> Result<()> {
        let md5_map = match self.config.clone() {
            Some(cfg) => self.local_snapshot(&cfg).await,
            None => crate::protocol::FolderMd5Map::new(),
        };
        self.send(Envelope::new(
            MessageType::Init,
            self.uuid.clone(),
            InitPayload {
                uuid: self.uuid.clone(),
                md5_map,
            },
        ))
        .await?;

        let resp = self.recv().await?;
        let payload: InitResponsePayload = resp.decode_payload()?;
        if !payload.success {
            return Err(SyncError::ServiceState(payload.message));
        }
        self.config = payload.config;
        Ok(())
    }

    async fn local_snapshot(&self, config: &PackConfig) -> crate::protocol::FolderMd5Map {
        let mut map = crate::protocol::FolderMd5Map::new();
        let ignore = IgnoreSet::new(&config.ignore_patterns);
        for folder in &config.folders {
            if !folder.enabled || folder.mode == SyncMode::Pack {
                continue;
            }
            let local_dir = local_folder_path(&self.local_root, &folder.path, &config.redirects);
            let result = scan(&local_dir, &ignore, Some(&config.redirects));
            map.insert(folder.path.clone(), result.md5_map());
        }
        map
    }

    /// Reconcile every enabled folder in the cached configuration. A
    /// failure in one folder is recorded in its report and does not stop
    /// the remaining folders from being attempted.
    pub async fn sync_all(&mut self) -> Result<Vec<FolderReport>> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| SyncError::ServiceState("init() must succeed before sync_all()".into()))?;

        let mut reports = Vec::new();
        for folder in config.folders.clone() {
            if !folder.enabled {
                continue;
            }
            let outcome = match folder.mode {
                SyncMode::Mirror => self.mirror_folder(&config, &folder).await,
                SyncMode::Push => self.push_folder(&config, &folder).await,
                SyncMode::Pack => self.pack_folder(&config, &folder).await,
            };
            match outcome {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::warn!(folder = %folder.path, error = %e, "folder sync failed");
                    reports.push(FolderReport {
                        folder: folder.path.clone(),
                        failed: 1,
                        ..Default::default()
                    });
                }
            }
        }
        Ok(reports)
    }

    async fn fetch_file(&mut self, server_path: &str) -> Result<(FilePayload, Vec<u8>)> {
        self.send(Envelope::new(
            MessageType::FileRequest,
            self.uuid.clone(),
            PathPayload {
                path: server_path.to_string(),
            },
        ))
        .await?;

        let meta_env = self.recv().await?;
        if meta_env.message_type() == Some(MessageType::Data) {
            let data: DataPayload = meta_env.decode_payload()?;
            return Err(SyncError::NotFound(data.message));
        }
        let meta: FilePayload = meta_env.decode_payload()?;

        let mut tracker = ProgressTracker::new(meta.size);
        let mut bytes = Vec::with_capacity(meta.size as usize);
        loop {
            let chunk_env = self.recv().await?;
            let chunk: FileDataPayload = chunk_env.decode_payload()?;
            if chunk.is_terminator() {
                break;
            }
            bytes.extend_from_slice(&chunk.data);
            tracker.advance(chunk.data.len() as u64);
            self.progress
                .on_progress(tracker.event(meta.path.clone(), Phase::Downloading));
        }
        self.progress
            .on_progress(tracker.event(meta.path.clone(), Phase::Complete));

        let actual = md5::hash_bytes(&bytes);
        if actual != meta.md5 {
            return Err(SyncError::TransferIntegrity {
                path: server_path.to_string(),
                expected: meta.md5.clone(),
                actual,
            });
        }
        Ok((meta, bytes))
    }

    async fn download_and_place(&mut self, config: &PackConfig, canonical_path: &str) -> Result<()> {
        let (_, bytes) = self.fetch_file(canonical_path).await?;
        let local_rel = redirect_to_client(&config.redirects, canonical_path);
        let dest = self.local_root.join(local_rel);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&dest, &bytes).await?;
        Ok(())
    }

    async fn mirror_folder(&mut self, config: &PackConfig, folder: &SyncFolder) -> Result<FolderReport> {
        self.set_syncing(true);
        let result = self.mirror_folder_inner(config, folder).await;
        self.set_syncing(false);
        result
    }

    async fn mirror_folder_inner(&mut self, config: &PackConfig, folder: &SyncFolder) -> Result<FolderReport> {
        let mut report = FolderReport {
            folder: folder.path.clone(),
            ..Default::default()
        };

        let server_md5 = self.request_data(MessageType::Md5Request, &folder.path).await?;
        let server_map = server_md5.md5_map.unwrap_or_default();

        let local_dir = local_folder_path(&self.local_root, &folder.path, &config.redirects);
        let ignore = IgnoreSet::new(&config.ignore_patterns);
        let local_scan = scan(&local_dir, &ignore, Some(&config.redirects));
        report.ignored = local_scan.ignored_count;
        let local_map = local_scan.md5_map();

        let diff = diff_mirror(&server_map, &local_map);

        for path in &diff.downloads {
            match self.download_and_place(config, path).await {
                Ok(()) => report.downloaded += 1,
                Err(e) => {
                    tracing::warn!(path, error = %e, "download failed, continuing folder");
                    report.failed += 1;
                }
            }
        }

        for path in &diff.deletions {
            let local_rel = redirect_to_client(&config.redirects, path);
            let dest = self.local_root.join(local_rel);
            match tokio::fs::remove_file(&dest).await {
                Ok(()) => report.deleted += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path, error = %e, "delete failed, continuing folder");
                    report.failed += 1;
                }
            }
        }

        let list = self.request_data(MessageType::ListRequest, &folder.path).await?;
        let server_dirs = list.dirs.unwrap_or_default();
        for canonical_dir in stale_dirs(&server_dirs, &local_scan.dirs) {
            let local_rel = redirect_to_client(&config.redirects, &canonical_dir);
            let dest = self.local_root.join(local_rel);
            let _ = tokio::fs::remove_dir(&dest).await;
        }

        Ok(report)
    }

    async fn push_folder(&mut self, config: &PackConfig, folder: &SyncFolder) -> Result<FolderReport> {
        self.set_syncing(true);
        let result = self.push_folder_inner(config, folder).await;
        self.set_syncing(false);
        result
    }

    async fn push_folder_inner(&mut self, config: &PackConfig, folder: &SyncFolder) -> Result<FolderReport> {
        let mut report = FolderReport {
            folder: folder.path.clone(),
            ..Default::default()
        };

        let server_md5 = self.request_data(MessageType::Md5Request, &folder.path).await?;
        let server_map = server_md5.md5_map.unwrap_or_default();

        let local_dir = local_folder_path(&self.local_root, &folder.path, &config.redirects);
        let ignore = IgnoreSet::new(&config.ignore_patterns);
        let local_scan = scan(&local_dir, &ignore, Some(&config.redirects));
        report.ignored = local_scan.ignored_count;
        let local_map = local_scan.md5_map();

        let diff = diff_push(&server_map, &local_map);
        for path in &diff.downloads {
            match self.download_and_place(config, path).await {
                Ok(()) => report.downloaded += 1,
                Err(e) => {
                    tracing::warn!(path, error = %e, "download failed, continuing folder");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn pack_folder(&mut self, config: &PackConfig, folder: &SyncFolder) -> Result<FolderReport> {
        self.set_syncing(true);
        let result = self.pack_folder_inner(config, folder).await;
        self.set_syncing(false);
        result
    }

    async fn pack_folder_inner(&mut self, config: &PackConfig, folder: &SyncFolder) -> Result<FolderReport> {
        let mut report = FolderReport {
            folder: folder.path.clone(),
            ..Default::default()
        };
        let declared_md5 = folder.pack_md5.clone().ok_or_else(|| {
            SyncError::ServiceState(format!("pack folder '{}' has no declared md5", folder.path))
        })?;

        let local_dir = local_folder_path(&self.local_root, &folder.path, &config.redirects);
        let marker_path = pack_marker_path(&self.local_root, &folder.path);
        if let Ok(existing) = tokio::fs::read_to_string(&marker_path).await {
            if existing.trim() == declared_md5 {
                return Ok(report);
            }
        }

        // Fetch and validate the archive entirely in a scratch directory
        // before touching `local_dir` at all, so a bad transfer or a
        // corrupt zip never leaves the target folder in a partial state.
        let zip_request_path = format!("{}.zip", folder.path);
        let (_, bytes) = self.fetch_file(&zip_request_path).await?;

        let staging = tempfile::tempdir()?;
        let zip_path = staging.path().join("pack.zip");
        tokio::fs::write(&zip_path, &bytes).await?;

        let verify_path = zip_path.clone();
        let verify_md5 = declared_md5.clone();
        tokio::task::spawn_blocking(move || archive::verify_declared_md5(&verify_path, &verify_md5))
            .await
            .map_err(|e| SyncError::ServiceState(format!("archive verify task panicked: {e}")))??;

        let validate_path = zip_path.clone();
        tokio::task::spawn_blocking(move || archive::validate(&validate_path))
            .await
            .map_err(|e| SyncError::ServiceState(format!("archive validate task panicked: {e}")))??;

        let extract_dir = staging.path().join("extracted");
        tokio::fs::create_dir_all(&extract_dir).await?;
        let extract_zip_path = zip_path.clone();
        let extract_dest = extract_dir.clone();
        let redirects = config.redirects.clone();
        let progress = self.progress.clone();
        tokio::task::spawn_blocking(move || {
            archive::extract(&extract_zip_path, &extract_dest, Some(&redirects), progress.as_ref())
        })
        .await
        .map_err(|e| SyncError::ServiceState(format!("archive extract task panicked: {e}")))??;

        if local_dir.exists() {
            tokio::fs::remove_dir_all(&local_dir).await?;
        }
        if let Some(parent) = local_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&extract_dir, &local_dir).await?;

        if let Some(parent) = marker_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&marker_path, &declared_md5).await?;

        report.downloaded = 1;
        Ok(report)
    }
}

/// Map a server-canonical folder path to where it lives on disk locally.
fn local_folder_path(local_root: &Path, folder_path: &str, redirects: &[crate::config::PathRedirect]) -> PathBuf {
    local_root.join(redirect_to_client(redirects, folder_path))
}
