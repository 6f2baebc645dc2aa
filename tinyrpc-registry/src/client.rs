//! HTTP client for the registry endpoint.
//!
//! Each request runs on a fresh HTTP/1 connection.

use crate::error::RegistryError;
use crate::{SERVERS_HEADER, SERVER_HEADER};
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::header::HOST;
use hyper::{Method, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::net::TcpStream;

/// Default timeout for one registry round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Talks to a registry at a fixed `http://host:port/path` URL.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    url: String,
    authority: String,
    path: String,
    timeout: Duration,
}

impl RegistryClient {
    pub fn new(url: &str) -> Result<Self, RegistryError> {
        let invalid = || RegistryError::InvalidUrl(url.to_string());
        let uri: Uri = url.parse().map_err(|_| invalid())?;
        if uri.scheme_str().is_some_and(|scheme| scheme != "http") {
            return Err(invalid());
        }
        let authority = uri.authority().ok_or_else(invalid)?;
        let authority = match authority.port_u16() {
            Some(_) => authority.to_string(),
            None => format!("{}:80", authority.host()),
        };
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self {
            url: url.to_string(),
            authority,
            path,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Announces `addr` as alive.
    pub async fn heartbeat(&self, addr: &str) -> Result<(), RegistryError> {
        self.send(Method::POST, Some(addr)).await?;
        Ok(())
    }

    /// Fetches the list of alive servers.
    pub async fn servers(&self) -> Result<Vec<String>, RegistryError> {
        let response = self.send(Method::GET, None).await?;
        let servers = response
            .headers()
            .get(SERVERS_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(parse_servers)
            .unwrap_or_default();
        Ok(servers)
    }

    async fn send(
        &self,
        method: Method,
        server: Option<&str>,
    ) -> Result<Response<hyper::body::Incoming>, RegistryError> {
        tokio::time::timeout(self.timeout, self.round_trip(method, server))
            .await
            .map_err(|_| RegistryError::Timeout)?
    }

    async fn round_trip(
        &self,
        method: Method,
        server: Option<&str>,
    ) -> Result<Response<hyper::body::Incoming>, RegistryError> {
        let stream = TcpStream::connect(&self.authority).await?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("Registry client connection error: {}", e);
            }
        });

        let mut request = Request::builder()
            .method(method)
            .uri(self.path.as_str())
            .header(HOST, self.authority.as_str());
        if let Some(addr) = server {
            request = request.header(SERVER_HEADER, addr);
        }
        let request = request.body(Empty::<Bytes>::new())?;

        let response = sender.send_request(request).await?;
        if !response.status().is_success() {
            return Err(RegistryError::Status(response.status().as_u16()));
        }
        Ok(response)
    }
}

/// Splits a comma-joined server list, dropping blank entries.
pub fn parse_servers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(str::to_string)
        .collect()
}
