//! Server-side per-connection state machine.
//!
//! A connection starts Unbound (no `init` seen yet), becomes Ready once it
//! has replied with the pack's configuration and MD5 snapshot, then serves
//! requests one at a time in strict arrival order until the client
//! disconnects. Heavier requests (`file_request`, and `md5_request`/
//! `list_request` on large folders) are handed to a sibling task so the
//! read loop can keep pulling the next request off the wire while a
//! response streams out; the shared write half is serialized behind a
//! mutex so two sibling tasks never interleave bytes on the wire.

use crate::config::{PackConfig, SyncMode};
use crate::error::{Result, SyncError};
use crate::protocol::framing::{write_envelope, EnvelopeReader};
use crate::protocol::{
    DataPayload, Envelope, FileDataPayload, FilePayload, InitPayload, InitResponsePayload,
    MessageType, PathPayload, FILE_CHUNK_SIZE,
};
use crate::scan::ignore::IgnoreSet;
use crate::scan::{md5, scan};
use indexmap::IndexMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncReadExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, RwLock};

/// Bookkeeping kept about one live connection, for status reporting and
/// graceful shutdown. Not the connection itself — just what an operator or
/// the accept loop needs to know about it.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: u64,
    pub peer_addr: SocketAddr,
    pub peer_uuid: Option<String>,
    pub connected_at: SystemTime,
}

/// One registry row: the reported metadata plus the signal that tells this
/// session's read loop to stop and drop its socket.
struct SessionEntry {
    info: SessionInfo,
    shutdown: Arc<Notify>,
}

/// `{session_id -> SessionEntry}`, shared between the accept loop and
/// whatever surfaces connection status (CLI `--verbose`, a future GUI).
#[derive(Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: RwLock<IndexMap<u64, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly accepted connection, returning its id and the
    /// per-session shutdown signal its read loop should race against.
    async fn register(&self, peer_addr: SocketAddr) -> (u64, Arc<Notify>) {
        let session_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let shutdown = Arc::new(Notify::new());
        let info = SessionInfo {
            session_id,
            peer_addr,
            peer_uuid: None,
            connected_at: SystemTime::now(),
        };
        self.sessions.write().await.insert(
            session_id,
            SessionEntry {
                info,
                shutdown: shutdown.clone(),
            },
        );
        (session_id, shutdown)
    }

    async fn bind_uuid(&self, session_id: u64, uuid: &str) {
        if let Some(entry) = self.sessions.write().await.get_mut(&session_id) {
            entry.info.peer_uuid = Some(uuid.to_string());
        }
    }

    async fn remove(&self, session_id: u64) {
        self.sessions.write().await.shift_remove(&session_id);
    }

    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        self.sessions.read().await.values().map(|e| e.info.clone()).collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Wake every live session's read loop so it observes shutdown and
    /// closes its socket (§4.7/§5: "the server closes all connections").
    pub async fn shutdown_all(&self) {
        for entry in self.sessions.read().await.values() {
            entry.shutdown.notify_waiters();
        }
    }
}

type SharedWriter = Arc<Mutex<WriteHalf<TcpStream>>>;

/// Drive one accepted connection end to end: Unbound -> Ready -> Serving.
/// Returns once the client disconnects or a transport error occurs; errors
/// from individual requests are handled inline and never propagate here.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<PackConfig>,
    registry: Arc<SessionRegistry>,
) -> Result<()> {
    let (session_id, shutdown) = registry.register(peer_addr).await;
    let result = serve(stream, &config, &registry, session_id, &shutdown).await;
    registry.remove(session_id).await;
    if let Err(ref e) = result {
        tracing::warn!(session_id, peer = %peer_addr, error = %e, "session ended with error");
    }
    result
}

async fn serve(
    stream: TcpStream,
    config: &Arc<PackConfig>,
    registry: &Arc<SessionRegistry>,
    session_id: u64,
    shutdown: &Notify,
) -> Result<()> {
    let (read_half, write_half): (ReadHalf<TcpStream>, WriteHalf<TcpStream>) = tokio::io::split(stream);
    let mut reader = EnvelopeReader::new(read_half);
    let writer: SharedWriter = Arc::new(Mutex::new(write_half));

    // Unbound: the only envelope a fresh connection may send is `init`.
    let env = tokio::select! {
        res = reader.read_envelope() => res?,
        _ = shutdown.notified() => {
            tracing::info!(session_id, "shutdown requested before init, closing");
            return Ok(());
        }
    };
    if env.message_type() != Some(MessageType::Init) {
        tracing::warn!(session_id, kind = %env.kind, "first envelope was not init, closing");
        return Err(SyncError::ProtocolUnknown(env.kind));
    }
    let init: InitPayload = env.decode_payload()?;
    registry.bind_uuid(session_id, &init.uuid).await;

    // Ready: compute this server's snapshot of every mirror/push folder and
    // hand back the effective configuration plus that snapshot in one shot.
    let md5_map = snapshot_md5_map(config).await;
    let response = Envelope::new(
        MessageType::InitResponse,
        init.uuid.clone(),
        InitResponsePayload {
            success: true,
            message: "ok".into(),
            config: Some((**config).clone()),
            md5_map,
        },
    );
    write_envelope(&mut *writer.lock().await, &response).await?;

    // Serving: one request read at a time, in arrival order; each request's
    // response may be produced on a sibling task so streaming a large file
    // doesn't stall the next request's arrival from being read off the wire.
    loop {
        let env = tokio::select! {
            res = reader.read_envelope() => match res {
                Ok(env) => env,
                Err(SyncError::Transport(_)) => break,
                Err(e) => return Err(e),
            },
            _ = shutdown.notified() => {
                tracing::info!(session_id, "shutdown requested, closing session");
                break;
            }
        };
        let uuid = env.uuid.clone();
        match env.message_type() {
            Some(MessageType::Md5Request) => {
                dispatch(writer.clone(), config.clone(), uuid, env, handle_md5_request);
            }
            Some(MessageType::ListRequest) => {
                dispatch(writer.clone(), config.clone(), uuid, env, handle_list_request);
            }
            Some(MessageType::FileRequest) => {
                let writer = writer.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_file_request(&writer, &config, &uuid, &env).await {
                        tracing::warn!(error = %e, "file_request failed");
                    }
                });
            }
            Some(MessageType::DeleteRequest) => {
                dispatch(writer.clone(), config.clone(), uuid, env, handle_delete_request);
            }
            Some(MessageType::SyncRequest) => {
                let resp = Envelope::new(
                    MessageType::SyncResponse,
                    uuid,
                    DataPayload::ok("sync_request is not used by this reconciliation model"),
                );
                let writer = writer.clone();
                tokio::spawn(async move {
                    let mut w = writer.lock().await;
                    let _ = write_envelope(&mut *w, &resp).await;
                });
            }
            None => {
                tracing::warn!(session_id, kind = %env.kind, "ignoring unknown message type");
            }
            _ => {
                tracing::warn!(session_id, kind = %env.kind, "ignoring out-of-place message type");
            }
        }
    }

    Ok(())
}

/// Spawn a sibling task that runs a synchronous-looking handler and writes
/// its single `data` response back through the shared writer.
fn dispatch<F>(writer: SharedWriter, config: Arc<PackConfig>, uuid: String, env: Envelope, handler: F)
where
    F: FnOnce(Arc<PackConfig>, Envelope) -> Result<DataPayload> + Send + 'static,
{
    tokio::spawn(async move {
        let payload = match handler(config, env) {
            Ok(p) => p,
            Err(e) => DataPayload::err(e.to_string()),
        };
        let response = Envelope::new(MessageType::Data, uuid, payload);
        let mut w = writer.lock().await;
        if let Err(e) = write_envelope(&mut *w, &response).await {
            tracing::warn!(error = %e, "failed to write response envelope");
        }
    });
}

fn handle_md5_request(config: Arc<PackConfig>, env: Envelope) -> Result<DataPayload> {
    let request: PathPayload = env.decode_payload()?;
    let folder = config
        .folder(&request.path)
        .ok_or_else(|| SyncError::NotFound(format!("folder '{}'", request.path)))?;
    let abs = super::resolve_scoped(std::path::Path::new(&config.server_root), &folder.path)?;
    let ignore = IgnoreSet::new(&config.ignore_patterns);
    let result = scan(&abs, &ignore, None);
    Ok(DataPayload {
        success: true,
        message: String::new(),
        md5_map: Some(result.md5_map()),
        files: None,
        dirs: None,
    })
}

fn handle_list_request(config: Arc<PackConfig>, env: Envelope) -> Result<DataPayload> {
    let request: PathPayload = env.decode_payload()?;
    let folder = config
        .folder(&request.path)
        .ok_or_else(|| SyncError::NotFound(format!("folder '{}'", request.path)))?;
    let abs = super::resolve_scoped(std::path::Path::new(&config.server_root), &folder.path)?;
    let ignore = IgnoreSet::new(&config.ignore_patterns);
    let result = scan(&abs, &ignore, None);
    Ok(DataPayload {
        success: true,
        message: String::new(),
        md5_map: None,
        files: Some(result.files.keys().cloned().collect()),
        dirs: Some(result.dirs),
    })
}

fn handle_delete_request(config: Arc<PackConfig>, env: Envelope) -> Result<DataPayload> {
    let request: PathPayload = env.decode_payload()?;
    // Path scope is still enforced before refusing, so a malicious client
    // learns nothing about what lies outside the root either way.
    super::resolve_scoped(std::path::Path::new(&config.server_root), &request.path)?;
    Ok(DataPayload::err(
        "delete_request is unsupported: sync direction is server-to-client only",
    ))
}

async fn handle_file_request(
    writer: &SharedWriter,
    config: &Arc<PackConfig>,
    uuid: &str,
    env: &Envelope,
) -> Result<()> {
    let request: PathPayload = env.decode_payload()?;
    let abs = match super::resolve_scoped(std::path::Path::new(&config.server_root), &request.path) {
        Ok(abs) => abs,
        Err(e) => {
            let response = Envelope::new(MessageType::Data, uuid, DataPayload::err(e.to_string()));
            write_envelope(&mut *writer.lock().await, &response).await?;
            return Ok(());
        }
    };

    if !abs.is_file() {
        let response = Envelope::new(
            MessageType::Data,
            uuid,
            DataPayload::err(format!("not found: {}", request.path)),
        );
        write_envelope(&mut *writer.lock().await, &response).await?;
        return Ok(());
    }

    let file_md5 = md5::hash_file(&abs)?;
    let size = std::fs::metadata(&abs)?.len();
    let name = abs
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let meta_env = Envelope::new(
        MessageType::File,
        uuid,
        FilePayload {
            name,
            size,
            md5: file_md5,
            path: request.path,
        },
    );

    let mut file = tokio::fs::File::open(&abs).await?;
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];

    // Held for the whole `file` + N*`file_data` + terminator sequence: a
    // file response is one logical record on the wire, and a sibling task
    // serving another file_request on this session must not interleave its
    // own envelopes into the middle of it (§9).
    let mut w = writer.lock().await;
    write_envelope(&mut *w, &meta_env).await?;
    loop {
        let n = file.read(&mut buf).await?;
        let chunk_env = Envelope::new(
            MessageType::FileData,
            uuid,
            FileDataPayload {
                data: buf[..n].to_vec(),
            },
        );
        write_envelope(&mut *w, &chunk_env).await?;
        if n == 0 {
            break;
        }
    }
    drop(w);

    Ok(())
}

/// Server-side MD5 snapshot for every enabled mirror/push folder. Pack-mode
/// folders are excluded: their integrity check is the declared `pack_md5`
/// on the zip artifact itself, not a per-file map.
async fn snapshot_md5_map(config: &PackConfig) -> crate::protocol::FolderMd5Map {
    let mut map = crate::protocol::FolderMd5Map::new();
    for folder in &config.folders {
        if !folder.enabled || folder.mode == SyncMode::Pack {
            continue;
        }
        let abs = match super::resolve_scoped(std::path::Path::new(&config.server_root), &folder.path) {
            Ok(abs) => abs,
            Err(_) => continue,
        };
        let ignore = IgnoreSet::new(&config.ignore_patterns);
        let path = folder.path.clone();
        let folders_map = tokio::task::spawn_blocking(move || scan(&abs, &ignore, None).md5_map())
            .await
            .unwrap_or_default();
        map.insert(path, folders_map);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncFolder;

    fn config_with_folder(server_root: &std::path::Path) -> PackConfig {
        PackConfig {
            id: "core".into(),
            name: "Core".into(),
            version: "1.0.0".into(),
            host: "127.0.0.1".into(),
            port: 9000,
            server_root: server_root.display().to_string(),
            folders: vec![SyncFolder {
                path: "mods".into(),
                mode: SyncMode::Mirror,
                pack_md5: None,
                enabled: true,
            }],
            ignore_patterns: vec![],
            redirects: vec![],
        }
    }

    #[tokio::test]
    async fn snapshot_md5_map_covers_mirror_folders() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("mods")).unwrap();
        std::fs::write(dir.path().join("mods/a.cfg"), "v1").unwrap();
        let config = config_with_folder(dir.path());
        let map = snapshot_md5_map(&config).await;
        assert!(map.contains_key("mods"));
        assert!(map["mods"].contains_key("a.cfg"));
    }

    #[tokio::test]
    async fn snapshot_md5_map_skips_pack_folders() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("pk")).unwrap();
        let mut config = config_with_folder(dir.path());
        config.folders[0].mode = SyncMode::Pack;
        config.folders[0].pack_md5 = Some("deadbeef".into());
        let map = snapshot_md5_map(&config).await;
        assert!(!map.contains_key("pk"));
    }

    #[test]
    fn delete_request_reports_unsupported_but_still_scope_checks() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(config_with_folder(dir.path()));
        let env = Envelope::new(
            MessageType::DeleteRequest,
            "u1",
            PathPayload {
                path: "../../escape".into(),
            },
        );
        let err = handle_delete_request(config, env).unwrap_err();
        assert!(matches!(err, SyncError::PathScope { .. }));
    }

    #[test]
    fn md5_request_for_unknown_folder_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(config_with_folder(dir.path()));
        let env = Envelope::new(
            MessageType::Md5Request,
            "u1",
            PathPayload {
                path: "nope".into(),
            },
        );
        let err = handle_md5_request(config, env).unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }
}
