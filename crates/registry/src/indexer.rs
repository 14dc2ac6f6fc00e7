//! Observer contract between the registry and the vector index.
//!
//! The registry calls the indexer synchronously after each store write;
//! the index crate implements this trait. Keeping the trait here keeps
//! the crate graph acyclic (the index depends on the registry for
//! reindex walks, not the other way around).

use sz_domain::symbol::Symbol;
use sz_domain::Result;

/// Pre-filters applied before scoring.
#[derive(Debug, Clone, Default)]
pub struct IndexQuery {
    pub limit: usize,
    /// Restrict to these domain ids. `None` = no restriction.
    pub domains: Option<Vec<String>>,
    /// Restrict to symbols carrying this tag.
    pub tag: Option<String>,
    /// Inclusive lower bound, UTC days since epoch (updated time).
    pub day_gte: Option<i64>,
    /// Inclusive day range (updated time).
    pub day_between: Option<(i64, i64)>,
}

/// A search hit: symbol id plus similarity score.
#[derive(Debug, Clone)]
pub struct ScoredId {
    pub id: String,
    pub score: f32,
}

#[async_trait::async_trait]
pub trait SymbolIndexer: Send + Sync {
    /// Index (or re-index) a symbol. Returning `Ok(false)` marks the
    /// symbol unindexable; the registry deletes it to keep only symbols
    /// that are both storable and searchable.
    async fn index_symbol(&self, symbol: &Symbol) -> Result<bool>;

    /// Remove a symbol from the index. Idempotent.
    async fn remove_symbol(&self, id: &str) -> Result<()>;

    /// Approximate-nearest-neighbor search with pre-filters.
    async fn search(&self, query: &str, opts: &IndexQuery) -> Result<Vec<ScoredId>>;
}
