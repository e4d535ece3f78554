//! Linear cache of secrets keyed by full resource name.
//!
//! Writers bump a process-wide version and broadcast the updated name;
//! stream workers re-read the cache and resend to interested clients. The
//! cache itself is lock-cheap: snapshots are cloned out under a read lock.

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::Secret;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

#[derive(Clone, Debug)]
pub struct CachedSecret {
    pub secret: Secret,
    pub version: u64,
    pub expiry: Option<DateTime<Utc>>,
}

pub struct SecretCache {
    entries: RwLock<HashMap<String, CachedSecret>>,
    version: AtomicU64,
    updates: broadcast::Sender<String>,
}

impl Default for SecretCache {
    fn default() -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            entries: RwLock::new(HashMap::default()),
            version: AtomicU64::new(0),
            updates,
        }
    }
}

impl SecretCache {
    /// Inserts or replaces a secret, returning the new version. Streams
    /// subscribed to updates are notified of the name.
    pub fn insert(
        &self,
        name: impl ToString,
        secret: Secret,
        expiry: Option<DateTime<Utc>>,
    ) -> u64 {
        let name = name.to_string();
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.entries.write().insert(
            name.clone(),
            CachedSecret {
                secret,
                version,
                expiry,
            },
        );
        // Send failures just mean no stream is listening right now.
        let _ = self.updates.send(name);
        version
    }

    pub fn get(&self, name: &str) -> Option<CachedSecret> {
        self.entries.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn remove(&self, name: &str) -> bool {
        self.entries.write().remove(name).is_some()
    }

    /// The version of the most recent write; responses carry this so a
    /// client ACK can be matched against the state it acknowledged.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.updates.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(name: &str) -> Secret {
        Secret {
            name: name.to_string(),
            r#type: None,
        }
    }

    #[tokio::test]
    async fn versions_are_monotonic_and_published() {
        let cache = SecretCache::default();
        let mut updates = cache.subscribe();

        let v1 = cache.insert("k8s://default/cert", secret("k8s://default/cert"), None);
        let v2 = cache.insert("k8s://default/cert", secret("k8s://default/cert"), None);
        assert!(v2 > v1);
        assert_eq!(cache.version(), v2);
        assert_eq!(cache.get("k8s://default/cert").unwrap().version, v2);

        assert_eq!(updates.recv().await.unwrap(), "k8s://default/cert");
        assert_eq!(updates.recv().await.unwrap(), "k8s://default/cert");
    }

    #[test]
    fn remove_forgets_the_entry() {
        let cache = SecretCache::default();
        cache.insert("vault-kv://secret/tls#crt,key", secret("x"), None);
        assert!(cache.contains("vault-kv://secret/tls#crt,key"));
        assert!(cache.remove("vault-kv://secret/tls#crt,key"));
        assert!(!cache.contains("vault-kv://secret/tls#crt,key"));
    }
}
