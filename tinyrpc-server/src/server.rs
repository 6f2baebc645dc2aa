//! TCP server implementation.
//!
//! Each connection goes through three phases: the handshake reads the
//! connection option and selects a codec, serving reads requests one at a
//! time and dispatches each on its own task, and closing waits for every
//! in-flight dispatch before shutting the stream down.

use crate::error::ServerError;
use crate::handler::{CallError, MethodInvoker};
use crate::metrics::{ErrorKind, Metrics};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tinyrpc_protocol::{
    Codec, CodecReader, CodecRegistry, CodecWriter, ConnectionOption, Header, ProtocolError,
};
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrently running dispatches per connection (0 = unlimited).
    pub max_inflight_requests: usize,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("max_inflight_requests", &self.max_inflight_requests)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], crate::DEFAULT_PORT)),
            max_inflight_requests: 0,
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Caps concurrently running dispatches per connection.
    pub fn with_max_inflight_requests(mut self, max: usize) -> Self {
        self.max_inflight_requests = max;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Everything a connection task needs, cloned per connection.
#[derive(Clone)]
struct ConnectionContext {
    codecs: Arc<CodecRegistry>,
    invoker: Arc<dyn MethodInvoker>,
    stats: Arc<ServerStats>,
    metrics: Option<Arc<Metrics>>,
    max_inflight_requests: usize,
}

type SharedWriter<S> = Arc<Mutex<CodecWriter<WriteHalf<S>>>>;

/// A request read off the wire.
enum Incoming {
    Call { header: Header, body: Value },
    BadBody { header: Header, error: ProtocolError },
}

/// TCP server for tinyrpc.
pub struct Server {
    config: ServerConfig,
    codecs: Arc<CodecRegistry>,
    invoker: Arc<dyn MethodInvoker>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server with the built-in codecs.
    pub fn new(config: ServerConfig, invoker: Arc<dyn MethodInvoker>) -> Self {
        Self::with_codecs(config, CodecRegistry::with_defaults(), invoker)
    }

    /// Creates a new server with an explicit codec registry.
    pub fn with_codecs(
        config: ServerConfig,
        codecs: CodecRegistry,
        invoker: Arc<dyn MethodInvoker>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            codecs: Arc::new(codecs),
            invoker,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs the accept loop.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Runs the accept loop on an already bound listener.
    ///
    /// Returns when the listener fails or the server is shut down.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Server listening on {} (codecs: {})",
            listener.local_addr()?,
            self.codecs
                .codec_types()
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let result = loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            tcp_stream.set_nodelay(true).ok();
                            self.spawn_connection(tcp_stream, addr.to_string());
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                            break Err(ServerError::Io(e));
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break Ok(());
                }
            }
        };

        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Serves a single connection over any byte stream until it closes.
    pub async fn serve_conn<S>(&self, stream: S, peer: &str) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let ctx = self.context();
        let mut shutdown = self.shutdown.subscribe();
        Self::handle_connection(stream, peer.to_string(), ctx, &mut shutdown).await
    }

    fn context(&self) -> ConnectionContext {
        ConnectionContext {
            codecs: self.codecs.clone(),
            invoker: self.invoker.clone(),
            stats: self.stats.clone(),
            metrics: self.config.metrics.clone(),
            max_inflight_requests: self.config.max_inflight_requests,
        }
    }

    fn spawn_connection<S>(&self, stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let ctx = self.context();
        let mut conn_shutdown = self.shutdown.subscribe();

        ctx.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        ctx.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = ctx.metrics {
            metrics.connection_opened();
        }

        tokio::spawn(async move {
            let stats = ctx.stats.clone();
            let metrics = ctx.metrics.clone();

            let result =
                Self::handle_connection(stream, peer.clone(), ctx, &mut conn_shutdown).await;
            if let Err(e) = result {
                tracing::debug!("Connection {} error: {}", peer, e);
                stats.errors_total.fetch_add(1, Ordering::Relaxed);
                if let Some(ref metrics) = metrics {
                    if e.is_handshake() {
                        metrics.error(ErrorKind::Handshake);
                    }
                }
            }

            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            if let Some(ref metrics) = metrics {
                metrics.connection_closed();
            }

            tracing::info!("Client disconnected: {}", peer);
        });
    }

    /// Reads the connection option and builds the codec.
    async fn handshake<S>(
        mut stream: S,
        peer: &str,
        codecs: &CodecRegistry,
    ) -> Result<Codec<S>, ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (option, leftover) = match ConnectionOption::read_from(&mut stream).await {
            Ok(read) => read,
            Err(e) => {
                tracing::warn!("[{}] Options error: {}", peer, e);
                return Err(e.into());
            }
        };

        if !option.has_valid_magic() {
            tracing::warn!("[{}] Invalid magic number {:#x}", peer, option.magic_number);
            return Err(ServerError::InvalidMagic(option.magic_number));
        }

        let Some(codec) = codecs.new_codec(&option.codec_type, stream, leftover) else {
            tracing::warn!("[{}] Invalid codec type {}", peer, option.codec_type);
            return Err(ServerError::UnknownCodec(option.codec_type));
        };

        tracing::debug!("[{}] Negotiated codec {}", peer, codec.codec_type());
        Ok(codec)
    }

    /// Handles a single connection: handshake, then the serving loop.
    async fn handle_connection<S>(
        stream: S,
        peer: String,
        ctx: ConnectionContext,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        tracing::info!("Client connected: {}", peer);

        let codec = Self::handshake(stream, &peer, &ctx.codecs).await?;
        if let Some(ref metrics) = ctx.metrics {
            metrics.handshake_completed(codec.codec_type());
        }
        let (mut reader, writer) = codec.into_split();
        let writer: SharedWriter<S> = Arc::new(Mutex::new(writer));
        let limiter = (ctx.max_inflight_requests > 0)
            .then(|| Arc::new(Semaphore::new(ctx.max_inflight_requests)));
        let mut inflight = JoinSet::new();

        loop {
            let incoming = tokio::select! {
                incoming = Self::read_request(&mut reader) => incoming,
                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", peer);
                    break;
                }
            };

            match incoming {
                Ok(Incoming::Call { header, body }) => {
                    tracing::debug!(
                        "[{}] Request: {} (seq={})",
                        peer,
                        header.service_method,
                        header.seq
                    );
                    ctx.stats.requests_total.fetch_add(1, Ordering::Relaxed);

                    let permit = match limiter {
                        Some(ref limiter) => limiter.clone().acquire_owned().await.ok(),
                        None => None,
                    };

                    inflight.spawn(Self::dispatch(
                        header,
                        body,
                        ctx.clone(),
                        writer.clone(),
                        peer.clone(),
                        permit,
                    ));
                }
                Ok(Incoming::BadBody { header, error }) => {
                    tracing::warn!("[{}] Read body error (seq={}): {}", peer, header.seq, error);
                    ctx.stats.requests_total.fetch_add(1, Ordering::Relaxed);
                    ctx.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                    if let Some(ref metrics) = ctx.metrics {
                        metrics.error(ErrorKind::Decode);
                    }
                    let header = header.with_error(error.to_string());
                    Self::send_response(&writer, &header, &invalid_body(), &peer, &ctx).await;
                }
                Err(e) => {
                    if e.is_eof() {
                        tracing::debug!("[{}] Connection closed by client", peer);
                    } else {
                        tracing::warn!("[{}] Read header error: {}", peer, e);
                    }
                    break;
                }
            }

            while let Some(done) = inflight.try_join_next() {
                if let Err(e) = done {
                    tracing::error!("[{}] Dispatch task failed: {}", peer, e);
                }
            }
        }

        while let Some(done) = inflight.join_next().await {
            if let Err(e) = done {
                tracing::error!("[{}] Dispatch task failed: {}", peer, e);
            }
        }

        if let Err(e) = writer.lock().await.close().await {
            tracing::debug!("[{}] Close error: {}", peer, e);
        }
        Ok(())
    }

    /// Reads one header and its body.
    async fn read_request<R>(reader: &mut CodecReader<R>) -> Result<Incoming, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let header = reader.read_header().await?;
        match reader.read_body::<Value>().await {
            Ok(body) => Ok(Incoming::Call { header, body }),
            Err(error) if error.is_recoverable() => Ok(Incoming::BadBody { header, error }),
            Err(e) => Err(e),
        }
    }

    /// Invokes the method and writes its response.
    async fn dispatch<S>(
        mut header: Header,
        body: Value,
        ctx: ConnectionContext,
        writer: SharedWriter<S>,
        peer: String,
        _permit: Option<OwnedSemaphorePermit>,
    ) where
        S: AsyncWrite + Send,
    {
        let timer = ctx.metrics.as_deref().map(Metrics::start_call);
        let (result, method_label) = match ctx.invoker.lookup(&header.service_method) {
            Some(handler) => (handler.call(body).await, header.service_method.as_str()),
            None => (
                Err(CallError::MethodNotFound(header.service_method.clone())),
                "unknown",
            ),
        };
        if let Some(timer) = timer {
            timer.finish(method_label, result.is_ok());
        }

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(
                    "[{}] Call {} (seq={}) failed: {}",
                    peer,
                    header.service_method,
                    header.seq,
                    e
                );
                ctx.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                if let Some(ref metrics) = ctx.metrics {
                    metrics.error(ErrorKind::Call);
                }
                header.error = e.to_string();
                invalid_body()
            }
        };

        Self::send_response(&writer, &header, &reply, &peer, &ctx).await;
    }

    /// Writes a response under the connection's write lock.
    async fn send_response<S>(
        writer: &SharedWriter<S>,
        header: &Header,
        body: &Value,
        peer: &str,
        ctx: &ConnectionContext,
    ) where
        S: AsyncWrite,
    {
        let mut writer = writer.lock().await;
        match writer.write(header, body).await {
            Ok(()) => tracing::debug!(
                "[{}] Response: {} (seq={})",
                peer,
                if header.is_error() { "ERROR" } else { "OK" },
                header.seq
            ),
            Err(e) => {
                tracing::error!("[{}] Write response error (seq={}): {}", peer, header.seq, e);
                ctx.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                if let Some(ref metrics) = ctx.metrics {
                    metrics.error(ErrorKind::Write);
                }
            }
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
}

/// Placeholder body sent alongside an error header.
fn invalid_body() -> Value {
    Value::Object(Default::default())
}

/// Serves connections accepted from `listener` with a default-configured server.
pub async fn serve(listener: TcpListener, invoker: Arc<dyn MethodInvoker>) -> Result<(), ServerError> {
    Server::new(ServerConfig::default(), invoker)
        .serve(listener)
        .await
}
