//! Idempotent full rebuild with single-flight guarding and progress.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::Serialize;

use sz_domain::auth::AuthContext;
use sz_domain::{Error, Result};
use sz_registry::{SymbolIndexer, SymbolRegistry};

use crate::VectorIndex;

/// Rebuild progress, readable at any time.
#[derive(Debug, Clone, Serialize)]
pub struct ReindexProgress {
    pub pending: usize,
    pub total: usize,
    pub running: bool,
}

#[derive(Default)]
pub(crate) struct ReindexState {
    running: AtomicBool,
    total: AtomicUsize,
    pending: AtomicUsize,
}

/// Outcome of a completed rebuild.
#[derive(Debug, Clone, Serialize)]
pub struct ReindexReport {
    pub indexed: usize,
    pub skipped: usize,
}

impl VectorIndex {
    pub fn reindex_progress(&self) -> ReindexProgress {
        ReindexProgress {
            pending: self.reindex_state.pending.load(Ordering::Acquire),
            total: self.reindex_state.total.load(Ordering::Acquire),
            running: self.reindex_state.running.load(Ordering::Acquire),
        }
    }

    /// Reset the collection and re-walk every domain. Only one rebuild
    /// runs at a time: a second attempt gets `Busy("already-running")`.
    /// Disabled domains are skipped unless `include_disabled`.
    pub async fn reindex(
        &self,
        registry: &SymbolRegistry,
        include_disabled: bool,
    ) -> Result<ReindexReport> {
        if self
            .reindex_state
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Busy("already-running".into()));
        }
        let result = self.reindex_inner(registry, include_disabled).await;
        self.reindex_state.running.store(false, Ordering::Release);
        result
    }

    async fn reindex_inner(
        &self,
        registry: &SymbolRegistry,
        include_disabled: bool,
    ) -> Result<ReindexReport> {
        let internal = AuthContext::internal();

        // Collect the work list first so progress totals are stable.
        let mut symbols = Vec::new();
        for domain in registry.list_domains(&internal).await? {
            if !domain.enabled && !include_disabled {
                continue;
            }
            symbols.extend(registry.get_symbols(&domain.id, &internal).await?);
        }

        self.reindex_state.total.store(symbols.len(), Ordering::Release);
        self.reindex_state
            .pending
            .store(symbols.len(), Ordering::Release);
        self.reset_collection();

        let mut indexed = 0;
        let mut skipped = 0;
        for symbol in &symbols {
            match self.index_symbol(symbol).await {
                Ok(true) => indexed += 1,
                Ok(false) => {
                    skipped += 1;
                    tracing::warn!(symbol_id = %symbol.id, "unindexable symbol skipped during rebuild");
                }
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(symbol_id = %symbol.id, error = %e, "rebuild index failure, skipping");
                }
            }
            self.reindex_state.pending.fetch_sub(1, Ordering::AcqRel);
        }

        tracing::info!(indexed, skipped, "reindex complete");
        Ok(ReindexReport { indexed, skipped })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use sz_store::MemoryStore;

    use crate::index::tests::test_index;

    async fn seeded_registry() -> SymbolRegistry {
        use sz_domain::symbol::{Facets, Symbol, SymbolKind};
        let admin = AuthContext::admin("root", "root");
        let reg = SymbolRegistry::new(Arc::new(MemoryStore::ephemeral()));
        reg.create_domain("d1", "Core", "", vec![], None, &admin)
            .await
            .unwrap();
        reg.create_domain("d2", "Off", "", vec![], None, &admin)
            .await
            .unwrap();
        reg.toggle_domain("d2", false, &admin).await.unwrap();
        for (id, domain) in [("a", "d1"), ("b", "d1"), ("c", "d2")] {
            let symbol = Symbol {
                id: id.into(),
                kind: SymbolKind::Pattern,
                name: format!("gate {id}"),
                triad: String::new(),
                macro_phrase: String::new(),
                role: String::new(),
                symbol_domain: domain.into(),
                symbol_tag: None,
                facets: Facets::default(),
                failure_mode: None,
                activation_conditions: vec![],
                linked_patterns: vec![],
                lattice: None,
                persona: None,
                data: None,
                created_at: String::new(),
                updated_at: String::new(),
            };
            reg.upsert_symbol(domain, symbol, &admin).await.unwrap();
        }
        reg
    }

    #[tokio::test]
    async fn rebuild_walks_enabled_domains() {
        let registry = seeded_registry().await;
        let index = test_index();
        let report = index.reindex(&registry, false).await.unwrap();
        assert_eq!(report.indexed, 2);
        assert_eq!(index.count_collection(), 2);

        let progress = index.reindex_progress();
        assert!(!progress.running);
        assert_eq!(progress.pending, 0);
        assert_eq!(progress.total, 2);
    }

    #[tokio::test]
    async fn include_disabled_covers_everything() {
        let registry = seeded_registry().await;
        let index = test_index();
        let report = index.reindex(&registry, true).await.unwrap();
        assert_eq!(report.indexed, 3);
    }

    #[tokio::test]
    async fn rebuild_is_idempotent() {
        let registry = seeded_registry().await;
        let index = test_index();
        index.reindex(&registry, false).await.unwrap();
        index.reindex(&registry, false).await.unwrap();
        assert_eq!(index.count_collection(), 2);
    }

    #[tokio::test]
    async fn second_concurrent_rebuild_is_rejected() {
        let index = test_index();
        // Hold the flag as a running rebuild would.
        index
            .reindex_state
            .running
            .store(true, std::sync::atomic::Ordering::Release);
        let registry = seeded_registry().await;
        let err = index.reindex(&registry, false).await.unwrap_err();
        match err {
            Error::Busy(msg) => assert_eq!(msg, "already-running"),
            _ => panic!("wrong error"),
        }
    }
}
