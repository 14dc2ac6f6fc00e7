//! The vector indexer — keeps a semantic index synchronized with the
//! symbol registry and serves approximate-nearest-neighbor queries with
//! pre-filter support.
//!
//! Vectors come from the primary backend's `embed` capability. The index
//! itself is an in-process cosine index; the registry only ever talks to
//! the [`sz_registry::SymbolIndexer`] trait, so a remote vector store can
//! replace this without touching the kernel.

mod index;
mod reindex;

pub use index::VectorIndex;
pub use reindex::{ReindexProgress, ReindexReport};
