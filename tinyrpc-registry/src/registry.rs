//! In-memory server table.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct ServerItem {
    last_seen: Instant,
}

/// Tracks announced servers and evicts those not seen within `timeout`.
///
/// A zero timeout keeps servers forever.
#[derive(Debug)]
pub struct Registry {
    timeout: Duration,
    servers: Mutex<HashMap<String, ServerItem>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(crate::DEFAULT_TIMEOUT)
    }
}

impl Registry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            servers: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Inserts the address or refreshes its last-seen time.
    pub fn put_server(&self, addr: &str) {
        let now = Instant::now();
        let mut servers = self.servers.lock();
        match servers.get_mut(addr) {
            Some(item) => item.last_seen = now,
            None => {
                tracing::info!("Registry: new server {}", addr);
                servers.insert(addr.to_string(), ServerItem { last_seen: now });
            }
        }
    }

    /// Returns alive addresses in sorted order, evicting expired ones.
    pub fn alive_servers(&self) -> Vec<String> {
        let now = Instant::now();
        let mut servers = self.servers.lock();

        if !self.timeout.is_zero() {
            servers.retain(|addr, item| {
                let alive = item.last_seen + self.timeout > now;
                if !alive {
                    tracing::info!("Registry: evicted server {}", addr);
                }
                alive
            });
        }

        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    /// Number of entries, including ones not yet evicted.
    pub fn len(&self) -> usize {
        self.servers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_alive_servers_sorted_and_deduplicated() {
        let registry = Registry::default();
        registry.put_server("tcp@127.0.0.1:9002");
        registry.put_server("tcp@127.0.0.1:9001");
        registry.put_server("tcp@127.0.0.1:9002");

        assert_eq!(
            registry.alive_servers(),
            vec!["tcp@127.0.0.1:9001", "tcp@127.0.0.1:9002"]
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_empty_registry() {
        let registry = Registry::default();
        assert!(registry.alive_servers().is_empty());
        assert!(registry.is_empty());
        assert_eq!(registry.timeout(), crate::DEFAULT_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_servers_evicted() {
        let registry = Registry::new(Duration::from_secs(10));
        registry.put_server("a:1");
        tokio::time::advance(Duration::from_secs(6)).await;
        registry.put_server("b:2");

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(registry.alive_servers(), vec!["b:2"]);
        assert_eq!(registry.len(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(registry.alive_servers().is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_extends_lifetime() {
        let registry = Registry::new(Duration::from_secs(10));
        registry.put_server("a:1");
        tokio::time::advance(Duration::from_secs(8)).await;
        registry.put_server("a:1");
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(registry.alive_servers(), vec!["a:1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_never_expires() {
        let registry = Registry::new(Duration::ZERO);
        registry.put_server("a:1");
        tokio::time::advance(Duration::from_secs(24 * 60 * 60)).await;
        assert_eq!(registry.alive_servers(), vec!["a:1"]);
    }

    proptest! {
        #[test]
        fn prop_alive_servers_sorted_and_unique(addrs in prop::collection::vec("[a-z]{1,4}:[0-9]{1,4}", 0..20)) {
            let registry = Registry::default();
            for addr in &addrs {
                registry.put_server(addr);
            }

            let alive = registry.alive_servers();
            let mut expected = addrs.clone();
            expected.sort();
            expected.dedup();
            prop_assert_eq!(alive, expected);
        }
    }
}
