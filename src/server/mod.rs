//! Network server: accepts connections on a pack's configured host/port and
//! hands each one to the sync engine's per-connection dispatcher. One
//! running server instance serves exactly one [`PackConfig`] at a time; an
//! operator switches packs by restarting with a different `--config`.

use crate::config::PackConfig;
use crate::error::{Result, SyncError};
use crate::sync::server::{handle_connection, SessionRegistry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinSet;

/// Listens for connections, spawns one task per accepted socket, and tracks
/// active sessions so a caller can ask how many clients are connected or
/// request a graceful shutdown.
pub struct NetworkServer {
    config: Arc<PackConfig>,
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl NetworkServer {
    /// Bind the listener for `config.host:config.port`. Does not start
    /// accepting connections yet; call [`NetworkServer::run`] for that.
    pub async fn bind(config: PackConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| SyncError::Transport(format!("bind {addr}: {e}")))?;
        tracing::info!(addr = %addr, pack = %config.id, "listening");
        Ok(Self {
            config: Arc::new(config),
            listener,
            registry: Arc::new(SessionRegistry::new()),
            running: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// The address actually bound, useful when `config.port` was 0.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// A handle that can be used to stop [`NetworkServer::run`] from
    /// another task (e.g. on SIGINT).
    pub fn shutdown_handle(&self) -> ServerShutdown {
        ServerShutdown {
            running: self.running.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Accept connections until told to stop. Each connection is handled on
    /// its own task; accept-level errors that look transient are logged and
    /// the loop continues, everything else (including errors observed after
    /// shutdown was requested) is swallowed so shutdown is always clean.
    ///
    /// Graceful stop (§4.7): once the accept loop breaks, every live session
    /// is woken so its read loop observes shutdown and drops its socket,
    /// and `run` does not return until every spawned handler task has
    /// actually exited.
    pub async fn run(self) -> Result<()> {
        let mut handlers = JoinSet::new();
        let mut fatal: Option<SyncError> = None;

        loop {
            let accept = tokio::select! {
                res = self.listener.accept() => res,
                _ = self.shutdown.notified() => break,
            };

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            match accept {
                Ok((stream, peer_addr)) => {
                    let config = self.config.clone();
                    let registry = self.registry.clone();
                    handlers.spawn(async move {
                        if let Err(e) = handle_connection(stream, peer_addr, config, registry).await {
                            tracing::warn!(peer = %peer_addr, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) if is_transient(&e) => {
                    tracing::warn!(error = %e, "transient accept error, continuing");
                }
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        fatal = Some(SyncError::Transport(e.to_string()));
                    }
                    break;
                }
            }
        }

        self.registry.shutdown_all().await;
        while handlers.join_next().await.is_some() {}

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted | std::io::ErrorKind::ConnectionAborted
    )
}

/// A cheap, cloneable handle a caller keeps around to stop a running
/// [`NetworkServer`] without owning it directly.
#[derive(Clone)]
pub struct ServerShutdown {
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl ServerShutdown {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SyncFolder, SyncMode};
    use crate::protocol::framing::{write_envelope, EnvelopeReader};
    use crate::protocol::{Envelope, InitPayload, MessageType};
    use tokio::net::TcpStream;

    fn sample_config(server_root: &std::path::Path, port: u16) -> PackConfig {
        PackConfig {
            id: "core".into(),
            name: "Core".into(),
            version: "1.0.0".into(),
            host: "127.0.0.1".into(),
            port,
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
    async fn accepts_connection_and_completes_init_handshake() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("mods")).unwrap();
        let server = NetworkServer::bind(sample_config(dir.path(), 0)).await.unwrap();
        let addr = server.listener.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let server_task = tokio::spawn(server.run());

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut reader = EnvelopeReader::new(read_half);
        let mut writer = write_half;

        let init = Envelope::new(
            MessageType::Init,
            "client-1",
            InitPayload {
                uuid: "client-1".into(),
                md5_map: Default::default(),
            },
        );
        write_envelope(&mut writer, &init).await.unwrap();
        let resp = reader.read_envelope().await.unwrap();
        assert_eq!(resp.message_type(), Some(MessageType::InitResponse));

        shutdown.stop();
        let _ = server_task.await;
    }

    #[tokio::test]
    async fn shutdown_stops_accept_loop() {
        let dir = tempfile::tempdir().unwrap();
        let server = NetworkServer::bind(sample_config(dir.path(), 0)).await.unwrap();
        let shutdown = server.shutdown_handle();
        let server_task = tokio::spawn(server.run());
        shutdown.stop();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), server_task).await;
        assert!(result.is_ok(), "server did not stop within timeout");
    }
}
