//! The store contract.

use std::time::Duration;

use sz_domain::Result;

/// Key-value capability the kernel is written against.
///
/// Values are strings (callers serialize JSON). Single-key operations are
/// atomic; `compare_and_swap` is the only cross-state primitive and is the
/// basis of the per-session lock.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    // ── Plain keys ────────────────────────────────────────────────
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    /// Returns true when the key existed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Atomic compare-and-swap. `expected = None` means "key absent";
    /// `new = None` deletes. Returns false (no write) on mismatch.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool>;

    /// All live keys starting with `prefix` (recovery and sweep scans).
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    // ── Sets ──────────────────────────────────────────────────────
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    // ── Sorted sets (score ascending) ─────────────────────────────
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;
    /// Members by score descending, up to `limit`.
    async fn zrevrange(&self, key: &str, limit: usize) -> Result<Vec<String>>;
    /// Keep only the `keep` highest-scored members; returns removed ones.
    async fn ztrim_keep_recent(&self, key: &str, keep: usize) -> Result<Vec<String>>;

    // ── Hashes ────────────────────────────────────────────────────
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>>;

    /// Liveness probe for the health endpoint.
    async fn ping(&self) -> Result<()>;
}
