//! The search front-end: semantic queries through the vector index, and
//! time/metadata filtered scans when no query string is given.

use serde::Serialize;
use serde_json::Value;

use sz_domain::auth::AuthContext;
use sz_domain::symbol::Symbol;
use sz_domain::{stamp, Error, Result};

use crate::indexer::IndexQuery;
use crate::registry::SymbolRegistry;

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: usize,
    /// Base64-millisecond stamp; bucketed to UTC days.
    pub time_gte: Option<String>,
    /// Inclusive stamp range; bucketed to UTC days.
    pub time_between: Option<(String, String)>,
    /// Top-level field equality filters (name, role, kind, symbol_tag,
    /// triad).
    pub metadata_filter: Option<serde_json::Map<String, Value>>,
    /// Restrict to these domains (intersected with visibility).
    pub domains: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredSymbol {
    pub symbol: Symbol,
    pub score: f32,
}

impl SymbolRegistry {
    /// Semantic search when `query` is non-empty, filtered scan
    /// otherwise. An empty query with no time filter is an
    /// `InvalidRequest` (there is nothing to rank by).
    pub async fn search(
        &self,
        query: Option<&str>,
        auth: &AuthContext,
        opts: SearchOptions,
    ) -> Result<Vec<ScoredSymbol>> {
        let limit = if opts.limit == 0 { 20 } else { opts.limit.min(200) };
        let query = query.map(str::trim).filter(|q| !q.is_empty());

        let day_gte = match &opts.time_gte {
            Some(raw) => Some(stamp::decode_day(raw).ok_or_else(|| {
                Error::InvalidRequest(format!("time_gte is not a valid stamp: {raw}"))
            })?),
            None => None,
        };
        let day_between = match &opts.time_between {
            Some((lo, hi)) => {
                let lo = stamp::decode_day(lo).ok_or_else(|| {
                    Error::InvalidRequest(format!("time_between start is not a valid stamp: {lo}"))
                })?;
                let hi = stamp::decode_day(hi).ok_or_else(|| {
                    Error::InvalidRequest(format!("time_between end is not a valid stamp: {hi}"))
                })?;
                Some((lo.min(hi), lo.max(hi)))
            }
            None => None,
        };

        if query.is_none() && day_gte.is_none() && day_between.is_none() {
            return Err(Error::InvalidRequest(
                "search requires a query string or a time filter".into(),
            ));
        }

        // Scope to what the caller can see, intersected with any
        // requested restriction.
        let visible = self.visible_domain_ids(auth).await?;
        let scope: Vec<String> = match &opts.domains {
            Some(requested) => visible
                .into_iter()
                .filter(|d| requested.contains(d))
                .collect(),
            None => visible,
        };

        let mut hits = match query {
            Some(q) => {
                let index_query = IndexQuery {
                    limit,
                    domains: Some(scope.clone()),
                    tag: None,
                    day_gte,
                    day_between,
                };
                let indexer = self
                    .indexer()
                    .ok_or_else(|| Error::Unavailable("vector index not attached".into()))?;
                let mut hydrated = Vec::new();
                for hit in indexer.search(q, &index_query).await? {
                    if let Some(symbol) = self.load_symbol(&hit.id).await? {
                        if scope.contains(&symbol.symbol_domain) {
                            hydrated.push(ScoredSymbol {
                                symbol,
                                score: hit.score,
                            });
                        }
                    }
                }
                hydrated
            }
            None => {
                // Filtered scan, scored by recency (updated day) so the
                // ordering stays deterministic.
                let mut results = Vec::new();
                for domain_id in &scope {
                    for symbol in self.get_symbols(domain_id, auth).await? {
                        let day = stamp::decode_day(&symbol.updated_at).unwrap_or(0);
                        if let Some(gte) = day_gte {
                            if day < gte {
                                continue;
                            }
                        }
                        if let Some((lo, hi)) = day_between {
                            if day < lo || day > hi {
                                continue;
                            }
                        }
                        results.push(ScoredSymbol {
                            symbol,
                            score: day as f32,
                        });
                    }
                }
                results
            }
        };

        if let Some(filter) = &opts.metadata_filter {
            hits.retain(|hit| metadata_matches(&hit.symbol, filter));
        }

        // Score descending, id ascending: deterministic pagination.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.symbol.id.cmp(&b.symbol.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

fn metadata_matches(symbol: &Symbol, filter: &serde_json::Map<String, Value>) -> bool {
    filter.iter().all(|(key, expected)| {
        let actual: Option<String> = match key.as_str() {
            "name" => Some(symbol.name.clone()),
            "role" => Some(symbol.role.clone()),
            "triad" => Some(symbol.triad.clone()),
            "kind" => Some(symbol.kind.as_str().to_owned()),
            "symbol_tag" => symbol.symbol_tag.clone(),
            "symbol_domain" => Some(symbol.symbol_domain.clone()),
            _ => None,
        };
        match (actual, expected.as_str()) {
            (Some(actual), Some(expected)) => actual == expected,
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use sz_domain::symbol::{Facets, SymbolKind};
    use sz_store::MemoryStore;

    use crate::indexer::{ScoredId, SymbolIndexer};

    fn admin() -> AuthContext {
        AuthContext::admin("root", "root")
    }

    fn pattern(id: &str, domain: &str) -> Symbol {
        Symbol {
            id: id.into(),
            kind: SymbolKind::Pattern,
            name: format!("sym {id}"),
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
        }
    }

    /// Returns every id it was asked about with a fixed score ladder.
    struct FixedIndexer(Vec<(String, f32)>);

    #[async_trait::async_trait]
    impl SymbolIndexer for FixedIndexer {
        async fn index_symbol(&self, _symbol: &Symbol) -> Result<bool> {
            Ok(true)
        }
        async fn remove_symbol(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn search(&self, _query: &str, _opts: &IndexQuery) -> Result<Vec<ScoredId>> {
            Ok(self
                .0
                .iter()
                .map(|(id, score)| ScoredId {
                    id: id.clone(),
                    score: *score,
                })
                .collect())
        }
    }

    async fn seeded_registry() -> SymbolRegistry {
        let reg = SymbolRegistry::new(Arc::new(MemoryStore::ephemeral()));
        reg.create_domain("d1", "Core", "", vec![], None, &admin())
            .await
            .unwrap();
        for id in ["a", "b", "c"] {
            reg.upsert_symbol("d1", pattern(id, "d1"), &admin())
                .await
                .unwrap();
        }
        reg
    }

    #[tokio::test]
    async fn empty_query_without_time_filter_is_invalid() {
        let reg = seeded_registry().await;
        let err = reg
            .search(None, &admin(), SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        let err = reg
            .search(Some("   "), &admin(), SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn semantic_results_order_score_then_id() {
        let reg = seeded_registry().await;
        reg.attach_indexer(Arc::new(FixedIndexer(vec![
            ("b".into(), 0.5),
            ("a".into(), 0.9),
            ("c".into(), 0.5),
        ])));
        let hits = reg
            .search(Some("gate"), &admin(), SearchOptions::default())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.symbol.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn time_filter_scan_without_query() {
        let reg = seeded_registry().await;
        let today = stamp::now();
        let hits = reg
            .search(
                None,
                &admin(),
                SearchOptions {
                    time_gte: Some(today),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);

        // A lower bound in the far future excludes everything.
        let future = stamp::encode(chrono::Utc::now() + chrono::Duration::days(30));
        let hits = reg
            .search(
                None,
                &admin(),
                SearchOptions {
                    time_gte: Some(future),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn metadata_filter_applies() {
        let reg = seeded_registry().await;
        let mut tagged = pattern("t", "d1");
        tagged.symbol_tag = Some("gate".into());
        reg.upsert_symbol("d1", tagged, &admin()).await.unwrap();

        let mut filter = serde_json::Map::new();
        filter.insert("symbol_tag".into(), Value::String("gate".into()));
        let hits = reg
            .search(
                None,
                &admin(),
                SearchOptions {
                    time_gte: Some(stamp::encode(
                        chrono::Utc::now() - chrono::Duration::days(1),
                    )),
                    metadata_filter: Some(filter),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].symbol.id, "t");
    }

    #[tokio::test]
    async fn invalid_stamp_is_rejected() {
        let reg = seeded_registry().await;
        let err = reg
            .search(
                None,
                &admin(),
                SearchOptions {
                    time_gte: Some("!!".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn users_only_see_visible_domains() {
        let reg = seeded_registry().await;
        reg.create_domain("priv", "Private", "", vec![], Some("u1".into()), &admin())
            .await
            .unwrap();
        reg.upsert_symbol("priv", pattern("secret", "priv"), &admin())
            .await
            .unwrap();

        let hits = reg
            .search(
                None,
                &AuthContext::user("u2", "u2"),
                SearchOptions {
                    time_gte: Some(stamp::encode(
                        chrono::Utc::now() - chrono::Duration::days(1),
                    )),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(hits.iter().all(|h| h.symbol.symbol_domain != "priv"));
    }
}
