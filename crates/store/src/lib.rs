//! Key-value store capability.
//!
//! The kernel assumes a store with atomic single-key operations, set /
//! sorted-set / hash primitives and TTL. [`KvStore`] is that contract;
//! [`MemoryStore`] is the bundled implementation (in-memory, optionally
//! persisted to a JSON image). Anything honoring the trait — a Redis
//! adapter, say — can be swapped in without touching the kernel.

mod kv;
mod memory;

pub use kv::KvStore;
pub use memory::MemoryStore;
