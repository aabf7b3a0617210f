use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ring::digest;

use crate::config::ClientCacheRules;

struct Entry<C> {
    client: Arc<C>,
    created: Instant,
    last_used: Instant,
}

/// Provider clients keyed by credential.
///
/// Keys are SHA-256 fingerprints of the credential, so plaintext API keys are
/// never held as map keys. Entries live at most `ttl`; past `capacity` the
/// least recently used entry is evicted.
pub struct ClientCache<C> {
    entries: Mutex<HashMap<String, Entry<C>>>,
    capacity: usize,
    ttl: Duration,
}

impl<C> ClientCache<C> {
    pub fn new(rules: &ClientCacheRules) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: rules.capacity.max(1),
            ttl: Duration::from_secs(rules.ttl_secs),
        }
    }

    pub fn get_or_try_insert<E>(
        &self,
        credential: &str,
        make: impl FnOnce() -> Result<C, E>,
    ) -> Result<Arc<C>, E> {
        let key = fingerprint(credential);
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = entries.get_mut(&key) {
            if now.duration_since(entry.created) < self.ttl {
                entry.last_used = now;
                return Ok(entry.client.clone());
            }
            tracing::debug!("Provider client expired, rebuilding");
            entries.remove(&key);
        }

        let client = Arc::new(make()?);

        if entries.len() >= self.capacity {
            let ttl = self.ttl;
            entries.retain(|_, e| now.duration_since(e.created) < ttl);
        }

        if entries.len() >= self.capacity {
            let lru = entries.iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            if let Some(lru) = lru {
                entries.remove(&lru);
            }
        }

        entries.insert(key, Entry { client: client.clone(), created: now, last_used: now });
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn fingerprint(credential: &str) -> String {
    hex::encode(digest::digest(&digest::SHA256, credential.as_bytes()).as_ref())
}
