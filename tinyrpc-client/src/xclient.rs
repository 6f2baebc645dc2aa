//! Client that picks its server through a [`Discovery`].

use crate::client::{Client, ClientConfig};
use crate::discovery::{Discovery, SelectMode};
use crate::error::ClientError;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Cached connections keyed by server address.
///
/// The map lock is only held for lookups and inserts, never while dialing.
struct ClientPool {
    config: ClientConfig,
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl ClientPool {
    /// Returns a live client for `addr`, dialing a new one if needed.
    async fn dial(&self, addr: &str) -> Result<Arc<Client>, ClientError> {
        let stale = {
            let mut clients = self.clients.lock();
            if let Some(client) = clients.get(addr) {
                if client.is_available() {
                    return Ok(client.clone());
                }
            }
            clients.remove(addr)
        };
        if let Some(stale) = stale {
            tracing::debug!("XClient: dropping stale connection to {}", addr);
            let _ = stale.close().await;
        }

        let dialed = Arc::new(Client::connect(addr, self.config.clone()).await?);

        // Another caller may have connected while this one was dialing.
        let winner = {
            let mut clients = self.clients.lock();
            let existing = clients
                .get(addr)
                .filter(|existing| existing.is_available())
                .cloned();
            if existing.is_none() {
                clients.insert(addr.to_string(), dialed.clone());
            }
            existing
        };
        match winner {
            Some(existing) => {
                let _ = dialed.close().await;
                Ok(existing)
            }
            None => Ok(dialed),
        }
    }

    fn drain(&self) -> Vec<(String, Arc<Client>)> {
        self.clients.lock().drain().collect()
    }
}

/// Load-balanced client keeping one connection per server address.
pub struct XClient {
    discovery: Arc<dyn Discovery>,
    mode: SelectMode,
    pool: Arc<ClientPool>,
}

impl XClient {
    pub fn new(discovery: Arc<dyn Discovery>, mode: SelectMode, config: ClientConfig) -> Self {
        Self {
            discovery,
            mode,
            pool: Arc::new(ClientPool {
                config,
                clients: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Calls `service_method` on one server chosen by the select mode.
    pub async fn call<A, R>(&self, service_method: &str, arg: &A) -> Result<R, ClientError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let addr = self.discovery.get(self.mode).await?;
        let client = self.pool.dial(&addr).await?;
        client.call(service_method, arg).await
    }

    /// Calls `service_method` on every known server concurrently.
    ///
    /// Returns the first error if any call fails, remaining calls are
    /// abandoned. Otherwise returns the reply that arrived first.
    pub async fn broadcast<A, R>(&self, service_method: &str, arg: &A) -> Result<R, ClientError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let servers = self.discovery.get_all().await?;
        let arg = Arc::new(serde_json::to_value(arg)?);

        let mut calls = JoinSet::new();
        for addr in servers {
            let pool = self.pool.clone();
            let arg = arg.clone();
            let service_method = service_method.to_string();
            calls.spawn(async move {
                let client = pool.dial(&addr).await?;
                client.call::<_, R>(&service_method, &*arg).await
            });
        }

        let mut first = None;
        while let Some(done) = calls.join_next().await {
            match done {
                Ok(Ok(reply)) => {
                    if first.is_none() {
                        first = Some(reply);
                    }
                }
                Ok(Err(e)) => {
                    calls.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    calls.abort_all();
                    return Err(e.into());
                }
            }
        }

        first.ok_or_else(|| crate::error::DiscoveryError::NoAvailableServers.into())
    }

    /// Closes every cached connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        for (addr, client) in self.pool.drain() {
            if let Err(e) = client.close().await {
                tracing::debug!("XClient: closing {} failed: {}", addr, e);
            }
        }
        Ok(())
    }
}
