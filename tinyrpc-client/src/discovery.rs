//! Server discovery and load-balanced selection.

use crate::error::DiscoveryError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::str::FromStr;
use std::time::Duration;
use tinyrpc_registry::RegistryClient;
use tokio::time::Instant;

/// Default lifetime of a server list fetched from a registry.
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Load-balancing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SelectMode {
    #[default]
    Random,
    RoundRobin,
}

impl FromStr for SelectMode {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" | "0" => Ok(SelectMode::Random),
            "round_robin" | "roundrobin" | "1" => Ok(SelectMode::RoundRobin),
            other => Err(DiscoveryError::UnsupportedMode(other.to_string())),
        }
    }
}

impl TryFrom<u8> for SelectMode {
    type Error = DiscoveryError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SelectMode::Random),
            1 => Ok(SelectMode::RoundRobin),
            other => Err(DiscoveryError::UnsupportedMode(other.to_string())),
        }
    }
}

/// Source of server addresses.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Reloads the server list from its source, if it has one.
    async fn refresh(&self) -> Result<(), DiscoveryError>;

    /// Replaces the server list.
    async fn update(&self, servers: Vec<String>) -> Result<(), DiscoveryError>;

    /// Picks one server.
    async fn get(&self, mode: SelectMode) -> Result<String, DiscoveryError>;

    /// Returns every known server.
    async fn get_all(&self) -> Result<Vec<String>, DiscoveryError>;
}

/// Selection state shared by every pick.
struct Picker {
    rng: StdRng,
    index: usize,
}

/// Discovery over a list of servers given by the caller.
///
/// Lock order is `servers` then `picker`.
pub struct MultiServerDiscovery {
    servers: RwLock<Vec<String>>,
    picker: Mutex<Picker>,
}

impl MultiServerDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        let mut rng = StdRng::from_os_rng();
        let index = rng.random_range(0..i32::MAX as usize - 1);
        Self {
            servers: RwLock::new(servers),
            picker: Mutex::new(Picker { rng, index }),
        }
    }

    /// Replaces the server list. The round-robin cursor is kept.
    pub fn set_servers(&self, servers: Vec<String>) {
        *self.servers.write() = servers;
    }

    /// Picks one server.
    pub fn select(&self, mode: SelectMode) -> Result<String, DiscoveryError> {
        let servers = self.servers.read();
        let n = servers.len();
        if n == 0 {
            return Err(DiscoveryError::NoAvailableServers);
        }

        let mut picker = self.picker.lock();
        let picked = match mode {
            SelectMode::Random => picker.rng.random_range(0..n),
            SelectMode::RoundRobin => {
                let picked = picker.index % n;
                picker.index = (picked + 1) % n;
                picked
            }
        };
        Ok(servers[picked].clone())
    }

    /// Returns a copy of the server list.
    pub fn servers(&self) -> Result<Vec<String>, DiscoveryError> {
        let servers = self.servers.read();
        if servers.is_empty() {
            return Err(DiscoveryError::NoAvailableServers);
        }
        Ok(servers.clone())
    }
}

#[async_trait]
impl Discovery for MultiServerDiscovery {
    async fn refresh(&self) -> Result<(), DiscoveryError> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<(), DiscoveryError> {
        self.set_servers(servers);
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String, DiscoveryError> {
        self.select(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>, DiscoveryError> {
        self.servers()
    }
}

/// Discovery backed by a registry, caching its answer for a while.
pub struct RegistryDiscovery {
    servers: MultiServerDiscovery,
    registry: RegistryClient,
    timeout: Duration,
    last_update: Mutex<Option<Instant>>,
    refreshing: tokio::sync::Mutex<()>,
}

impl RegistryDiscovery {
    /// A zero `timeout` selects [`DEFAULT_UPDATE_TIMEOUT`].
    pub fn new(registry_url: &str, timeout: Duration) -> Result<Self, DiscoveryError> {
        Ok(Self::with_client(RegistryClient::new(registry_url)?, timeout))
    }

    pub fn with_client(registry: RegistryClient, timeout: Duration) -> Self {
        Self {
            servers: MultiServerDiscovery::new(Vec::new()),
            registry,
            timeout: if timeout.is_zero() {
                DEFAULT_UPDATE_TIMEOUT
            } else {
                timeout
            },
            last_update: Mutex::new(None),
            refreshing: tokio::sync::Mutex::new(()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn is_fresh(&self) -> bool {
        self.last_update
            .lock()
            .is_some_and(|at| at + self.timeout > Instant::now())
    }

    fn stamp(&self) {
        *self.last_update.lock() = Some(Instant::now());
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<(), DiscoveryError> {
        let _refreshing = self.refreshing.lock().await;
        if self.is_fresh() {
            return Ok(());
        }

        tracing::debug!("Discovery: refreshing from {}", self.registry.url());
        let servers = self.registry.servers().await?;
        tracing::debug!("Discovery: {} servers from registry", servers.len());
        self.servers.set_servers(servers);
        self.stamp();
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<(), DiscoveryError> {
        self.servers.set_servers(servers);
        self.stamp();
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String, DiscoveryError> {
        self.refresh().await?;
        self.servers.select(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>, DiscoveryError> {
        self.refresh().await?;
        self.servers.servers()
    }
}
