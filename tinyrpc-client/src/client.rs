//! Single-connection RPC client.
//!
//! Calls are pipelined: each one gets its own `seq`, is written under the
//! connection's write lock, and waits on a oneshot channel that the receive
//! task completes when the response with that `seq` arrives.

use crate::error::ClientError;
use bytes::BytesMut;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tinyrpc_protocol::{
    CodecReader, CodecRegistry, CodecType, CodecWriter, ConnectionOption, Header, ProtocolError,
};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A response handed from the receive task to the waiting call.
struct Reply {
    header: Header,
    body: Result<Value, ProtocolError>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connection option sent during the handshake.
    pub option: ConnectionOption,
    /// Connection timeout (zero = none).
    pub connect_timeout: Duration,
    /// Per-call timeout (zero = none).
    pub call_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            option: ConnectionOption::default(),
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::ZERO,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codec(mut self, codec_type: CodecType) -> Self {
        self.option.codec_type = codec_type;
        self
    }

    pub fn with_option(mut self, option: ConnectionOption) -> Self {
        self.option = option;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Strips an optional `tcp@` prefix from an address.
///
/// Registry entries use `protocol@host:port`; only `tcp` is supported.
pub fn parse_rpc_addr(addr: &str) -> Result<&str, ClientError> {
    let host_port = match addr.split_once('@') {
        Some(("tcp", host_port)) => host_port,
        Some(_) => return Err(ClientError::InvalidAddress(addr.to_string())),
        None => addr,
    };
    if host_port.is_empty() {
        return Err(ClientError::InvalidAddress(addr.to_string()));
    }
    Ok(host_port)
}

/// An RPC client bound to one server connection.
pub struct Client {
    addr: String,
    config: ClientConfig,
    writer: tokio::sync::Mutex<CodecWriter<WriteHalf<TcpStream>>>,
    pending: Pending,
    next_seq: AtomicU64,
    available: Arc<AtomicBool>,
    closing: AtomicBool,
    receiver: JoinHandle<()>,
}

impl Client {
    /// Connects with default settings.
    pub async fn dial(addr: &str) -> Result<Self, ClientError> {
        Self::connect(addr, ClientConfig::default()).await
    }

    /// Connects, sends the connection option, and starts the receive task.
    pub async fn connect(addr: &str, config: ClientConfig) -> Result<Self, ClientError> {
        let host_port = parse_rpc_addr(addr)?;
        let codecs = CodecRegistry::with_defaults();
        let codec_type = config.option.codec_type.clone();
        if !codecs.contains(&codec_type) {
            return Err(ClientError::UnknownCodec(codec_type));
        }

        tracing::debug!("Connecting to {}...", host_port);
        let connecting = TcpStream::connect(host_port);
        let mut stream = if config.connect_timeout.is_zero() {
            connecting.await?
        } else {
            tokio::time::timeout(config.connect_timeout, connecting)
                .await
                .map_err(|_| ClientError::Timeout)??
        };
        stream.set_nodelay(true).ok();

        config.option.write_to(&mut stream).await?;
        let codec = codecs
            .new_codec(&codec_type, stream, BytesMut::new())
            .ok_or_else(|| ClientError::UnknownCodec(codec_type.clone()))?;
        let (reader, writer) = codec.into_split();

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let available = Arc::new(AtomicBool::new(true));
        let receiver = tokio::spawn(receive_loop(
            reader,
            pending.clone(),
            available.clone(),
            addr.to_string(),
        ));

        tracing::debug!("Connected to {} ({})", addr, codec_type);
        Ok(Self {
            addr: addr.to_string(),
            config,
            writer: tokio::sync::Mutex::new(writer),
            pending,
            next_seq: AtomicU64::new(0),
            available,
            closing: AtomicBool::new(false),
            receiver,
        })
    }

    /// Calls `service_method` and waits for its reply.
    pub async fn call<A, R>(&self, service_method: &str, arg: &A) -> Result<R, ClientError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if !self.is_available() {
            return Err(ClientError::Shutdown);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(seq, tx);
        if !self.available.load(Ordering::SeqCst) {
            self.pending.lock().remove(&seq);
            return Err(ClientError::ConnectionClosed);
        }

        let header = Header::new(service_method, seq);
        let written = self.writer.lock().await.write(&header, arg).await;
        if let Err(e) = written {
            tracing::debug!("Call {} (seq={}) write failed: {}", service_method, seq, e);
            self.pending.lock().remove(&seq);
            return Err(e.into());
        }

        let reply = if self.config.call_timeout.is_zero() {
            rx.await
        } else {
            match tokio::time::timeout(self.config.call_timeout, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    tracing::debug!("Call {} (seq={}) timed out", service_method, seq);
                    self.pending.lock().remove(&seq);
                    return Err(ClientError::Timeout);
                }
            }
        }
        .map_err(|_| ClientError::ConnectionClosed)?;

        if reply.header.is_error() {
            return Err(ClientError::Server(reply.header.error));
        }
        Ok(serde_json::from_value(reply.body?)?)
    }

    /// Returns whether the connection can still carry calls.
    pub fn is_available(&self) -> bool {
        !self.closing.load(Ordering::SeqCst) && self.available.load(Ordering::SeqCst)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Returns the number of calls waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Closes the connection. Waiting calls fail with `ConnectionClosed`.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Err(ClientError::Shutdown);
        }
        tracing::debug!("Closing connection to {}", self.addr);

        self.available.store(false, Ordering::SeqCst);
        let closed = self.writer.lock().await.close().await;
        self.receiver.abort();
        self.pending.lock().clear();
        closed.map_err(ClientError::from)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

/// Reads responses until the stream ends, completing waiting calls by `seq`.
async fn receive_loop(
    mut reader: CodecReader<ReadHalf<TcpStream>>,
    pending: Pending,
    available: Arc<AtomicBool>,
    addr: String,
) {
    let ended = loop {
        let header = match reader.read_header().await {
            Ok(header) => header,
            Err(e) => break e,
        };
        let body = match reader.read_body::<Value>().await {
            Ok(body) => Ok(body),
            Err(e) if e.is_recoverable() => Err(e),
            Err(e) => break e,
        };

        let seq = header.seq;
        let waiter = pending.lock().remove(&seq);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Reply { header, body });
            }
            None => tracing::debug!("[{}] Discarding response for unknown seq={}", addr, seq),
        }
    };

    if ended.is_eof() {
        tracing::debug!("[{}] Connection closed by server", addr);
    } else {
        tracing::warn!("[{}] Receive error: {}", addr, ended);
    }

    available.store(false, Ordering::SeqCst);
    pending.lock().clear();
}
