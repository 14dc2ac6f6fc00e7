//! In-memory store with an optional persisted JSON image.
//!
//! The image is loaded once at startup and flushed on an interval by the
//! gateway (and on shutdown). TTL entries store absolute expiry so they
//! survive a restart; expired entries are dropped lazily on access and by
//! the periodic sweep.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sz_domain::{Error, Result};

use crate::kv::KvStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Entry {
    Value {
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
    },
    Set(Vec<String>),
    // member → score; ordering is derived on read.
    ZSet(BTreeMap<String, f64>),
    Hash(BTreeMap<String, String>),
}

impl Entry {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self,
            Entry::Value {
                expires_at: Some(at),
                ..
            } if *at <= now
        )
    }
}

/// The bundled [`KvStore`] implementation.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    image_path: Option<PathBuf>,
}

impl MemoryStore {
    /// Volatile store (tests, ephemeral runs).
    pub fn ephemeral() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            image_path: None,
        }
    }

    /// Store persisted at `dir/store.json`, loading any existing image.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(Error::Io)?;
        let image_path = dir.join("store.json");
        let entries = if image_path.exists() {
            let raw = std::fs::read_to_string(&image_path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };
        tracing::info!(
            keys = entries.len(),
            path = %image_path.display(),
            "store image loaded"
        );
        Ok(Self {
            entries: RwLock::new(entries),
            image_path: Some(image_path),
        })
    }

    /// Write the image to disk. No-op for ephemeral stores.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.image_path else {
            return Ok(());
        };
        let json = {
            let entries = self.entries.read();
            serde_json::to_string(&*entries).map_err(Error::Json)?
        };
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(Error::Io)?;
        std::fs::rename(&tmp, path).map_err(Error::Io)?;
        Ok(())
    }

    /// Drop every expired TTL entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| !e.expired(now));
        before - entries.len()
    }

    /// Remove everything (used by `clearAll` and project import).
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    fn read_live(&self, key: &str) -> Option<Entry> {
        let now = Utc::now();
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.expired(now) {
            return None;
        }
        Some(entry.clone())
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(match self.read_live(key) {
            Some(Entry::Value { value, .. }) => Some(value),
            _ => None,
        })
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.write().insert(
            key.to_owned(),
            Entry::Value {
                value: value.to_owned(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| Error::InvalidRequest(format!("ttl out of range: {e}")))?;
        self.entries.write().insert(
            key.to_owned(),
            Entry::Value {
                value: value.to_owned(),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let matches = match entries.get(key) {
            Some(e) if e.expired(now) => expected.is_none(),
            Some(Entry::Value { value, .. }) => expected == Some(value.as_str()),
            Some(_) => {
                return Err(Error::InvalidRequest(format!(
                    "cas on non-scalar key {key}"
                )))
            }
            None => expected.is_none(),
        };
        if !matches {
            return Ok(false);
        }
        match new {
            Some(value) => {
                entries.insert(
                    key.to_owned(),
                    Entry::Value {
                        value: value.to_owned(),
                        expires_at: None,
                    },
                );
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(true)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let entries = self.entries.read();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::Set(Vec::new()));
        match entry {
            Entry::Set(members) => {
                if members.iter().any(|m| m == member) {
                    Ok(false)
                } else {
                    members.push(member.to_owned());
                    Ok(true)
                }
            }
            _ => Err(Error::InvalidRequest(format!("{key} is not a set"))),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(Entry::Set(members)) => {
                let before = members.len();
                members.retain(|m| m != member);
                Ok(members.len() != before)
            }
            Some(_) => Err(Error::InvalidRequest(format!("{key} is not a set"))),
            None => Ok(false),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        match self.read_live(key) {
            Some(Entry::Set(members)) => Ok(members),
            Some(_) => Err(Error::InvalidRequest(format!("{key} is not a set"))),
            None => Ok(Vec::new()),
        }
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::ZSet(BTreeMap::new()));
        match entry {
            Entry::ZSet(map) => {
                map.insert(member.to_owned(), score);
                Ok(())
            }
            _ => Err(Error::InvalidRequest(format!("{key} is not a sorted set"))),
        }
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(Entry::ZSet(map)) => Ok(map.remove(member).is_some()),
            Some(_) => Err(Error::InvalidRequest(format!("{key} is not a sorted set"))),
            None => Ok(false),
        }
    }

    async fn zrevrange(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        match self.read_live(key) {
            Some(Entry::ZSet(map)) => {
                let mut pairs: Vec<(String, f64)> = map.into_iter().collect();
                // Score descending, member ascending as the tie-break.
                pairs.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.0.cmp(&b.0))
                });
                Ok(pairs.into_iter().take(limit).map(|(m, _)| m).collect())
            }
            Some(_) => Err(Error::InvalidRequest(format!("{key} is not a sorted set"))),
            None => Ok(Vec::new()),
        }
    }

    async fn ztrim_keep_recent(&self, key: &str, keep: usize) -> Result<Vec<String>> {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(Entry::ZSet(map)) => {
                if map.len() <= keep {
                    return Ok(Vec::new());
                }
                let mut pairs: Vec<(String, f64)> =
                    map.iter().map(|(m, s)| (m.clone(), *s)).collect();
                pairs.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.0.cmp(&b.0))
                });
                let removed: Vec<String> =
                    pairs.into_iter().skip(keep).map(|(m, _)| m).collect();
                for member in &removed {
                    map.remove(member);
                }
                Ok(removed)
            }
            Some(_) => Err(Error::InvalidRequest(format!("{key} is not a sorted set"))),
            None => Ok(Vec::new()),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::Hash(BTreeMap::new()));
        match entry {
            Entry::Hash(map) => {
                map.insert(field.to_owned(), value.to_owned());
                Ok(())
            }
            _ => Err(Error::InvalidRequest(format!("{key} is not a hash"))),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        match self.read_live(key) {
            Some(Entry::Hash(map)) => Ok(map.get(field).cloned()),
            Some(_) => Err(Error::InvalidRequest(format!("{key} is not a hash"))),
            None => Ok(None),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(Entry::Hash(map)) => Ok(map.remove(field).is_some()),
            Some(_) => Err(Error::InvalidRequest(format!("{key} is not a hash"))),
            None => Ok(false),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        match self.read_live(key) {
            Some(Entry::Hash(map)) => Ok(map.into_iter().collect()),
            Some(_) => Err(Error::InvalidRequest(format!("{key} is not a hash"))),
            None => Ok(Vec::new()),
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_set_del_roundtrip() {
        let store = MemoryStore::ephemeral();
        assert_eq!(store.get("k").await.unwrap(), None);
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".into()));
        assert!(store.del("k").await.unwrap());
        assert!(!store.del("k").await.unwrap());
    }

    #[tokio::test]
    async fn cas_from_absent_and_mismatch() {
        let store = MemoryStore::ephemeral();
        // None → Some succeeds only once.
        assert!(store.compare_and_swap("k", None, Some("a")).await.unwrap());
        assert!(!store.compare_and_swap("k", None, Some("b")).await.unwrap());
        // Wrong expectation does not write.
        assert!(!store
            .compare_and_swap("k", Some("x"), Some("b"))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("a".into()));
        // Matching expectation deletes.
        assert!(store.compare_and_swap("k", Some("a"), None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ttl_entries_expire() {
        let store = MemoryStore::ephemeral();
        store
            .set_with_ttl("k", "v", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.sweep_expired(), 1);
    }

    #[tokio::test]
    async fn set_membership_is_deduplicated() {
        let store = MemoryStore::ephemeral();
        assert!(store.sadd("s", "a").await.unwrap());
        assert!(!store.sadd("s", "a").await.unwrap());
        assert!(store.sadd("s", "b").await.unwrap());
        assert_eq!(store.smembers("s").await.unwrap(), vec!["a", "b"]);
        assert!(store.srem("s", "a").await.unwrap());
        assert_eq!(store.smembers("s").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn zset_orders_by_score_descending() {
        let store = MemoryStore::ephemeral();
        store.zadd("z", 1.0, "old").await.unwrap();
        store.zadd("z", 3.0, "new").await.unwrap();
        store.zadd("z", 2.0, "mid").await.unwrap();
        assert_eq!(
            store.zrevrange("z", 10).await.unwrap(),
            vec!["new", "mid", "old"]
        );
        assert_eq!(store.zrevrange("z", 2).await.unwrap(), vec!["new", "mid"]);
    }

    #[tokio::test]
    async fn ztrim_drops_lowest_scores() {
        let store = MemoryStore::ephemeral();
        for (i, m) in ["a", "b", "c", "d"].iter().enumerate() {
            store.zadd("z", i as f64, m).await.unwrap();
        }
        let removed = store.ztrim_keep_recent("z", 2).await.unwrap();
        assert_eq!(removed, vec!["b", "a"]);
        assert_eq!(store.zrevrange("z", 10).await.unwrap(), vec!["d", "c"]);
    }

    #[tokio::test]
    async fn hash_fields() {
        let store = MemoryStore::ephemeral();
        store.hset("h", "f1", "v1").await.unwrap();
        store.hset("h", "f2", "v2").await.unwrap();
        assert_eq!(store.hget("h", "f1").await.unwrap(), Some("v1".into()));
        assert_eq!(store.hgetall("h").await.unwrap().len(), 2);
        assert!(store.hdel("h", "f1").await.unwrap());
        assert_eq!(store.hget("h", "f1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_prefix_skips_expired() {
        let store = MemoryStore::ephemeral();
        store.set("sz:context:a", "{}").await.unwrap();
        store.set("sz:context:b", "{}").await.unwrap();
        store.set("sz:domain:x", "{}").await.unwrap();
        store
            .set_with_ttl("sz:context:tmp", "{}", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let keys = store.scan_prefix("sz:context:").await.unwrap();
        assert_eq!(keys, vec!["sz:context:a", "sz:context:b"]);
    }

    #[tokio::test]
    async fn cas_on_set_key_is_an_error() {
        let store = MemoryStore::ephemeral();
        store.sadd("s", "a").await.unwrap();
        assert!(store
            .compare_and_swap("s", None, Some("x"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn image_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MemoryStore::open(dir.path()).unwrap();
            store.set("k", "v").await.unwrap();
            store.sadd("s", "m").await.unwrap();
            store.flush().unwrap();
        }
        let store = MemoryStore::open(dir.path()).unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".into()));
        assert_eq!(store.smembers("s").await.unwrap(), vec!["m"]);
    }
}
