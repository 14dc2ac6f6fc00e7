//! The symbol registry — durable, queryable, authorized storage of
//! symbols and domains with invariant validation and referential
//! integrity.
//!
//! Every mutation notifies the attached [`SymbolIndexer`] after the store
//! write, keeping the vector index in step with registry state. The
//! registry is written to be idempotent under retry: re-running a rename
//! or compression on its own result is a no-op.

mod domains;
mod indexer;
mod keys;
mod migrate;
mod refactor;
mod registry;
mod search;
mod symbols;
mod validation;

pub use domains::DomainSummary;
pub use indexer::{IndexQuery, ScoredId, SymbolIndexer};
pub use refactor::{RefactorError, RefactorOutcome, RefactorUpdate};
pub use registry::SymbolRegistry;
pub use search::{ScoredSymbol, SearchOptions};
pub use symbols::{BulkFailure, BulkOutcome, QueryPage};
