//! TCP server implementation.

use crate::auth::{Authenticator, TokenAuthenticator};
use crate::config::{Config, NetworkConfig, ProtocolConfig};
use crate::connection::{Connection, ConnectionContext};
use crate::engine::QueryEngine;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::pipeline::Pipeline;
use crate::stream::ClientStream;
use graphwire_protocol::version::encode_selection;
use graphwire_protocol::{ProtocolError, ProtocolVersion, HANDSHAKE_SIZE};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;

/// How long a client has to send its 20 handshake bytes.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    /// Versions offered during the handshake.
    pub versions: Vec<ProtocolVersion>,
    /// Agent string reported on INIT/HELLO.
    pub server_agent: String,
    /// How long RESET waits for in-flight execution to stop.
    pub reset_timeout: Duration,
    pub handshake_timeout: Duration,
    /// TLS acceptor (if TLS is enabled).
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.network.bind_addr)
            .field("max_connections", &self.network.max_connections)
            .field("versions", &self.versions)
            .field("server_agent", &self.server_agent)
            .field("tls_enabled", &self.tls_acceptor.is_some())
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        let protocol = ProtocolConfig::default();
        Self {
            network: NetworkConfig::default(),
            versions: ProtocolVersion::ALL.to_vec(),
            server_agent: protocol.server_agent.clone(),
            reset_timeout: protocol.reset_timeout(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            tls_acceptor: None,
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        let mut config = Self::default();
        config.network.bind_addr = bind_addr;
        config
    }

    /// Builds the server configuration from a loaded [`Config`]. TLS and
    /// metrics are attached separately.
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        Ok(Self {
            network: config.network.clone(),
            versions: config.protocol.versions()?,
            server_agent: config.protocol.server_agent.clone(),
            reset_timeout: config.protocol.reset_timeout(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            tls_acceptor: None,
            metrics: None,
        })
    }

    /// Restricts the versions offered during the handshake.
    pub fn with_versions(mut self, versions: impl Into<Vec<ProtocolVersion>>) -> Self {
        self.versions = versions.into();
        self
    }

    /// Sets the TLS acceptor.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(Arc::new(acceptor));
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether TLS is enabled.
    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub handshakes_refused: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Graph protocol server.
pub struct Server {
    config: Arc<ServerConfig>,
    context: Arc<ConnectionContext>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a server that accepts every client.
    pub fn new(config: ServerConfig, engine: Arc<dyn QueryEngine>) -> Self {
        Self::with_auth(config, engine, Arc::new(TokenAuthenticator::disabled()))
    }

    /// Creates a server checking INIT/HELLO auth tokens with `authenticator`.
    pub fn with_auth(
        config: ServerConfig,
        engine: Arc<dyn QueryEngine>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let context = Arc::new(ConnectionContext {
            engine,
            authenticator,
            metrics: config.metrics.clone(),
            server_agent: config.server_agent.clone(),
            idle_timeout: config.network.idle_timeout(),
            reset_timeout: config.reset_timeout,
        });
        Self {
            config: Arc::new(config),
            context,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.network.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);

        let tls_mode = if self.config.tls_enabled() {
            "TLS"
        } else {
            "plain"
        };
        let versions: Vec<u32> = self.config.versions.iter().map(|v| v.number()).collect();
        tracing::info!(
            "Server listening on {} ({}, protocol versions {:?})",
            listener.local_addr()?,
            tls_mode,
            versions
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.network.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                            if let Some(ref metrics) = self.config.metrics {
                                metrics.connections_total.inc();
                                metrics.connections_active.inc();
                            }

                            let config = self.config.clone();
                            let context = self.context.clone();
                            let stats = self.stats.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let result = Self::handle_connection(
                                    tcp_stream,
                                    addr,
                                    &config,
                                    context,
                                    &stats,
                                    &mut conn_shutdown,
                                )
                                .await;

                                match result {
                                    Ok(()) | Err(ServerError::ShuttingDown) => {}
                                    Err(e) if e.is_disconnect() => {
                                        tracing::debug!("[{}] Connection lost: {}", addr, e);
                                    }
                                    Err(e) => {
                                        tracing::debug!("Connection {} error: {}", addr, e);
                                        stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                    }
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                if let Some(ref metrics) = config.metrics {
                                    metrics.connections_active.dec();
                                }

                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Runs TLS, the version handshake, then the connection actor.
    async fn handle_connection(
        socket: TcpStream,
        addr: SocketAddr,
        config: &ServerConfig,
        context: Arc<ConnectionContext>,
        stats: &ServerStats,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let tls = config.tls_acceptor.as_deref();
        let mut stream = ClientStream::accept(socket, tls).await.map_err(|e| {
            if tls.is_some() {
                tracing::warn!("[{}] TLS handshake failed: {}", addr, e);
                ServerError::TlsHandshake(e.to_string())
            } else {
                ServerError::Io(e)
            }
        })?;
        tracing::info!(
            "[{}] Client connected{}",
            addr,
            if stream.is_tls() { " (TLS)" } else { "" }
        );

        let mut handshake = [0u8; HANDSHAKE_SIZE];
        tokio::time::timeout(config.handshake_timeout, stream.read_exact(&mut handshake))
            .await
            .map_err(|_| ServerError::Handshake("timed out waiting for version handshake".into()))??;

        let pipeline = match Pipeline::negotiate(&handshake, &config.versions, &config.network) {
            Ok(pipeline) => pipeline,
            Err(e @ ProtocolError::NoSupportedVersion(_)) => {
                Self::refuse(addr, config, stats, &e);
                stream.write_all(&encode_selection(None)).await?;
                stream.shutdown().await?;
                return Err(ServerError::Handshake(e.to_string()));
            }
            Err(e @ ProtocolError::InvalidPreamble(_)) => {
                Self::refuse(addr, config, stats, &e);
                return Err(ServerError::Handshake(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        stream
            .write_all(&encode_selection(Some(pipeline.version)))
            .await?;
        stream.flush().await?;
        tracing::debug!(
            "[{}] Negotiated protocol v{}",
            addr,
            pipeline.version.number()
        );

        Connection::new(stream, addr, pipeline, context)
            .run(shutdown)
            .await
    }

    fn refuse(addr: SocketAddr, config: &ServerConfig, stats: &ServerStats, reason: &ProtocolError) {
        tracing::warn!("[{}] Handshake refused: {}", addr, reason);
        stats.handshakes_refused.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = config.metrics {
            metrics.handshakes_refused.inc();
        }
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
