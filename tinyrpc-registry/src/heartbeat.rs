//! Periodic registry announcements for one server.

use crate::client::RegistryClient;
use crate::error::RegistryError;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Keeps one server address announced to one registry.
///
/// The first announcement goes out immediately. The task stops for good
/// after the first failed announcement and returns that error; the server
/// then drops out of the registry once its entry expires.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    client: RegistryClient,
    addr: String,
    interval: Duration,
}

impl Heartbeat {
    /// A zero `interval` selects [`crate::DEFAULT_HEARTBEAT_INTERVAL`].
    pub fn new(
        registry_url: &str,
        addr: impl Into<String>,
        interval: Duration,
    ) -> Result<Self, RegistryError> {
        Ok(Self::with_client(
            RegistryClient::new(registry_url)?,
            addr,
            interval,
        ))
    }

    pub fn with_client(client: RegistryClient, addr: impl Into<String>, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            crate::DEFAULT_HEARTBEAT_INTERVAL
        } else {
            interval
        };
        Self {
            client,
            addr: addr.into(),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sends heartbeats until one fails or `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), RegistryError> {
        tracing::info!(
            "Heartbeat: announcing {} to {} every {:?}",
            self.addr,
            self.client.url(),
            self.interval
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.client.heartbeat(&self.addr).await {
                        tracing::error!("Heartbeat: {} stopped: {}", self.addr, e);
                        return Err(e);
                    }
                    tracing::debug!("Heartbeat: sent for {}", self.addr);
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Heartbeat: {} shutting down", self.addr);
                    return Ok(());
                }
            }
        }
    }

    /// Spawns [`Heartbeat::run`] on the current runtime.
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<(), RegistryError>> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use http_body_util::Full;
    use hyper::body::{Bytes, Incoming};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Answers 200 to the first `ok_count` requests and 500 afterwards.
    async fn flaky_registry(ok_count: usize) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/_gorpc_/registry", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |_req: Request<Incoming>| {
                        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        let status = if n <= ok_count {
                            StatusCode::OK
                        } else {
                            StatusCode::INTERNAL_SERVER_ERROR
                        };
                        async move {
                            Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::new()))
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (url, hits)
    }

    #[test]
    fn test_zero_interval_uses_default() {
        let heartbeat = Heartbeat::new("http://127.0.0.1:1/reg", "a:1", Duration::ZERO).unwrap();
        assert_eq!(heartbeat.interval(), crate::DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(
            crate::DEFAULT_HEARTBEAT_INTERVAL + Duration::from_secs(60),
            crate::DEFAULT_TIMEOUT
        );
    }

    #[tokio::test]
    async fn test_stops_after_first_failure() {
        let (url, hits) = flaky_registry(1).await;
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let heartbeat = Heartbeat::new(&url, "tcp@127.0.0.1:7001", Duration::from_millis(20)).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), heartbeat.run(shutdown_rx))
            .await
            .unwrap();
        assert!(matches!(result, Err(RegistryError::Status(500))));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_keeps_server_alive_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}{}", listener.local_addr().unwrap(), crate::DEFAULT_PATH);
        let registry = Arc::new(Registry::new(Duration::from_millis(300)));
        let (shutdown_tx, _) = broadcast::channel(1);
        tokio::spawn(crate::http::serve(
            listener,
            registry.clone(),
            crate::DEFAULT_PATH,
            shutdown_tx.subscribe(),
        ));

        let handle = Heartbeat::new(&url, "tcp@127.0.0.1:7001", Duration::from_millis(50))
            .unwrap()
            .spawn(shutdown_tx.subscribe());

        // Several timeouts long; only repeated heartbeats keep the entry alive.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(registry.alive_servers(), vec!["tcp@127.0.0.1:7001"]);

        shutdown_tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(registry.alive_servers().is_empty());
    }
}
