//! The context session machine: per-session locking, FIFO queueing,
//! cancellation signaling and idempotent crash recovery.
//!
//! The active-message lock is a compare-and-swap on the serialized
//! session record — the store is the only source of truth, so a crashed
//! worker can never leave a double-locked session behind.

mod store;

pub use store::ContextStore;
