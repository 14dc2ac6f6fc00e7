//! The cosine index and its `SymbolIndexer` implementation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use sz_domain::symbol::Symbol;
use sz_domain::{stamp, Error, Result};
use sz_providers::BackendRegistry;
use sz_registry::{IndexQuery, ScoredId, SymbolIndexer};

use crate::reindex::ReindexState;

/// What the index keeps per symbol: the vector plus the pre-filterable
/// attributes.
#[derive(Debug, Clone)]
pub(crate) struct IndexedSymbol {
    pub vector: Vec<f32>,
    pub domain: String,
    pub tag: Option<String>,
    pub updated_day: i64,
}

pub struct VectorIndex {
    backends: Arc<BackendRegistry>,
    entries: RwLock<HashMap<String, IndexedSymbol>>,
    pub(crate) reindex_state: ReindexState,
}

impl VectorIndex {
    pub fn new(backends: Arc<BackendRegistry>) -> Self {
        Self {
            backends,
            entries: RwLock::new(HashMap::new()),
            reindex_state: ReindexState::default(),
        }
    }

    pub fn count_collection(&self) -> usize {
        self.entries.read().len()
    }

    pub fn reset_collection(&self) {
        self.entries.write().clear();
        tracing::info!("vector collection reset");
    }

    /// The index is healthy when an embedding-capable backend answers.
    pub async fn health_check(&self) -> Result<()> {
        let backend = self.backends.primary()?;
        backend.embed("ping").await.map(|_| ())
    }

    pub(crate) async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let backend = self.backends.primary()?;
        let vector = backend.embed(text).await?;
        if vector.is_empty() {
            return Err(Error::Unavailable(format!(
                "backend {} returned an empty embedding",
                backend.backend_id()
            )));
        }
        Ok(vector)
    }

    pub(crate) fn insert_entry(&self, id: &str, entry: IndexedSymbol) {
        self.entries.write().insert(id.to_owned(), entry);
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn passes_filters(entry: &IndexedSymbol, opts: &IndexQuery) -> bool {
    if let Some(domains) = &opts.domains {
        if !domains.iter().any(|d| *d == entry.domain) {
            return false;
        }
    }
    if let Some(tag) = &opts.tag {
        if entry.tag.as_deref() != Some(tag.as_str()) {
            return false;
        }
    }
    if let Some(gte) = opts.day_gte {
        if entry.updated_day < gte {
            return false;
        }
    }
    if let Some((lo, hi)) = opts.day_between {
        if entry.updated_day < lo || entry.updated_day > hi {
            return false;
        }
    }
    true
}

#[async_trait::async_trait]
impl SymbolIndexer for VectorIndex {
    async fn index_symbol(&self, symbol: &Symbol) -> Result<bool> {
        let document = symbol.index_document();
        if document.is_empty() {
            // Nothing to embed: the symbol is unindexable.
            return Ok(false);
        }
        let vector = self.embed(&document).await?;
        self.insert_entry(
            &symbol.id,
            IndexedSymbol {
                vector,
                domain: symbol.symbol_domain.clone(),
                tag: symbol.symbol_tag.clone(),
                updated_day: stamp::decode_day(&symbol.updated_at).unwrap_or(0),
            },
        );
        Ok(true)
    }

    async fn remove_symbol(&self, id: &str) -> Result<()> {
        self.entries.write().remove(id);
        Ok(())
    }

    async fn search(&self, query: &str, opts: &IndexQuery) -> Result<Vec<ScoredId>> {
        let query_vector = self.embed(query).await?;
        let limit = if opts.limit == 0 { 20 } else { opts.limit };

        let mut hits: Vec<ScoredId> = {
            let entries = self.entries.read();
            entries
                .iter()
                .filter(|(_, entry)| passes_filters(entry, opts))
                .map(|(id, entry)| ScoredId {
                    id: id.clone(),
                    score: cosine(&query_vector, &entry.vector),
                })
                .collect()
        };
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sz_providers::traits::{ChatRequest, ChatResponse, LlmBackend};

    /// Deterministic embedder: maps known words onto axis vectors.
    pub(crate) struct FakeEmbedder;

    #[async_trait::async_trait]
    impl LlmBackend for FakeEmbedder {
        async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse> {
            Err(Error::Unavailable("chat not wired".into()))
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut v = vec![0.0f32; 3];
            for word in text.split_whitespace() {
                match word {
                    "gate" => v[0] += 1.0,
                    "mirror" => v[1] += 1.0,
                    _ => v[2] += 1.0,
                }
            }
            Ok(v)
        }
        fn backend_id(&self) -> &str {
            "fake-embedder"
        }
    }

    pub(crate) fn test_index() -> VectorIndex {
        VectorIndex::new(Arc::new(BackendRegistry::single(Arc::new(FakeEmbedder))))
    }

    fn symbol(id: &str, domain: &str, name: &str) -> Symbol {
        use sz_domain::symbol::{Facets, SymbolKind};
        Symbol {
            id: id.into(),
            kind: SymbolKind::Pattern,
            name: name.into(),
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
            created_at: stamp::now(),
            updated_at: stamp::now(),
        }
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn indexes_and_ranks_by_similarity() {
        let index = test_index();
        index
            .index_symbol(&symbol("g", "d1", "gate"))
            .await
            .unwrap();
        index
            .index_symbol(&symbol("m", "d1", "mirror"))
            .await
            .unwrap();

        let hits = index
            .search("gate", &IndexQuery::default())
            .await
            .unwrap();
        assert_eq!(hits[0].id, "g");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn empty_document_is_unindexable() {
        let index = test_index();
        let mut s = symbol("x", "d1", "");
        s.name = String::new();
        assert!(!index.index_symbol(&s).await.unwrap());
        assert_eq!(index.count_collection(), 0);
    }

    #[tokio::test]
    async fn domain_prefilter_applies() {
        let index = test_index();
        index
            .index_symbol(&symbol("a", "d1", "gate"))
            .await
            .unwrap();
        index
            .index_symbol(&symbol("b", "d2", "gate"))
            .await
            .unwrap();

        let hits = index
            .search(
                "gate",
                &IndexQuery {
                    domains: Some(vec!["d2".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "b");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let index = test_index();
        index
            .index_symbol(&symbol("a", "d1", "gate"))
            .await
            .unwrap();
        index.remove_symbol("a").await.unwrap();
        index.remove_symbol("a").await.unwrap();
        assert_eq!(index.count_collection(), 0);
    }

    #[tokio::test]
    async fn equal_scores_tie_break_by_id() {
        let index = test_index();
        index
            .index_symbol(&symbol("b", "d1", "gate"))
            .await
            .unwrap();
        index
            .index_symbol(&symbol("a", "d1", "gate"))
            .await
            .unwrap();
        let hits = index
            .search("gate", &IndexQuery::default())
            .await
            .unwrap();
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "b");
    }
}
