use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Ephemeral key-value store holding "already being worked on" markers.
///
/// Every method is atomic with respect to the others; `set_nx` and `hset_nx`
/// are the primitives the onboarding and ingestion paths use to claim work.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn setex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    /// Sets `key` only if it does not exist; returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    /// Sets `field` only if it does not exist in the hash; returns whether it was written.
    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool>;
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;
    async fn delete(&self, key: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// Process-local `KvStore` with lazy TTL expiry.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> Option<&'a mut Entry> {
        let now = Instant::now();
        if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn hash_mut<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> Result<&'a mut HashMap<String, String>> {
        if Self::live(entries, key).is_none() {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        match entries.get_mut(key).map(|entry| &mut entry.value) {
            Some(Value::Hash(hash)) => Ok(hash),
            _ => anyhow::bail!("key {key} holds a plain value, not a hash"),
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries();
        match Self::live(&mut entries, key).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::Text(value)) => Ok(Some(value.clone())),
            Some(Value::Hash(_)) => anyhow::bail!("key {key} holds a hash, not a plain value"),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries().insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn setex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries().insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut entries = self.entries();
        if Self::live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut entries = self.entries();
        match Self::live(&mut entries, key).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(Value::Text(_)) => anyhow::bail!("key {key} holds a plain value, not a hash"),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut entries = self.entries();
        Self::hash_mut(&mut entries, key)?.insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries();
        let hash = Self::hash_mut(&mut entries, key)?;
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut entries = self.entries();
        let removed = match Self::live(&mut entries, key).map(|entry| &mut entry.value) {
            Some(Value::Hash(hash)) => hash.remove(field).is_some(),
            _ => false,
        };
        if entries
            .get(key)
            .is_some_and(|entry| matches!(&entry.value, Value::Hash(hash) if hash.is_empty()))
        {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries();
        let existed = Self::live(&mut entries, key).is_some();
        entries.remove(key);
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn hset_nx_claims_a_field_once() {
        let kv = MemoryKv::new();
        assert!(kv.hset_nx("pending", "10.0.0.5", "a").await.unwrap());
        assert!(!kv.hset_nx("pending", "10.0.0.5", "b").await.unwrap());
        assert_eq!(
            kv.hget("pending", "10.0.0.5").await.unwrap().as_deref(),
            Some("a")
        );
        assert!(kv.hdel("pending", "10.0.0.5").await.unwrap());
        assert!(!kv.hdel("pending", "10.0.0.5").await.unwrap());
        assert!(kv.hset_nx("pending", "10.0.0.5", "c").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_hset_nx_has_one_winner() {
        let kv = Arc::new(MemoryKv::new());
        let attempts = (0..16).map(|idx| {
            let kv = kv.clone();
            async move { kv.hset_nx("pending", "10.0.0.9", &idx.to_string()).await }
        });
        let winners = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|result| matches!(result, Ok(true)))
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn set_nx_respects_ttl() {
        let kv = MemoryKv::new();
        assert!(kv
            .set_nx("lock", "1", Some(Duration::from_millis(20)))
            .await
            .unwrap());
        assert!(!kv.set_nx("lock", "2", None).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(kv.get("lock").await.unwrap(), None);
        assert!(kv.set_nx("lock", "3", None).await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap().as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn setex_and_delete() {
        let kv = MemoryKv::new();
        kv.setex("token", "abc", Duration::from_secs(60)).await.unwrap();
        assert_eq!(kv.get("token").await.unwrap().as_deref(), Some("abc"));
        assert!(kv.delete("token").await.unwrap());
        assert!(!kv.delete("token").await.unwrap());
    }

    #[tokio::test]
    async fn type_mismatch_is_an_error() {
        let kv = MemoryKv::new();
        kv.set("plain", "x").await.unwrap();
        assert!(kv.hset("plain", "f", "v").await.is_err());
        kv.hset("hash", "f", "v").await.unwrap();
        assert!(kv.get("hash").await.is_err());
    }
}
