//! Symbol CRUD, bulk loads and the paginated tag query.

use serde::Serialize;

use sz_domain::auth::AuthContext;
use sz_domain::domain::Domain;
use sz_domain::symbol::Symbol;
use sz_domain::{stamp, Error, Result};

use crate::keys;
use crate::registry::SymbolRegistry;
use crate::validation;

/// Result of a bulk upsert: per-symbol failures do not abort the batch.
#[derive(Debug, Default, Serialize)]
pub struct BulkOutcome {
    pub upserted: Vec<String>,
    pub failed: Vec<BulkFailure>,
}

#[derive(Debug, Serialize)]
pub struct BulkFailure {
    pub id: String,
    pub error: String,
}

/// One page of a tag query.
#[derive(Debug, Serialize)]
pub struct QueryPage {
    pub symbols: Vec<Symbol>,
    /// Cursor for the next page; `None` when exhausted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_id: Option<String>,
}

impl SymbolRegistry {
    /// Upsert a single symbol. Always validates; bulk loads that need to
    /// carry external links use [`Self::bulk_upsert`] with
    /// `bypass_validation`.
    pub async fn upsert_symbol(
        &self,
        domain_id: &str,
        symbol: Symbol,
        auth: &AuthContext,
    ) -> Result<Symbol> {
        let domain = self.writable_domain(domain_id, auth).await?;
        self.upsert_validated(&domain, symbol, false).await
    }

    /// Bulk upsert. References may resolve against symbols earlier in the
    /// same batch; `bypass_validation` skips reference existence checks
    /// entirely (cross-domain/external links in project imports).
    pub async fn bulk_upsert(
        &self,
        domain_id: &str,
        symbols: Vec<Symbol>,
        bypass_validation: bool,
        auth: &AuthContext,
    ) -> Result<BulkOutcome> {
        let domain = self.writable_domain(domain_id, auth).await?;
        let mut outcome = BulkOutcome::default();
        for symbol in symbols {
            let id = symbol.id.clone();
            match self.upsert_validated(&domain, symbol, bypass_validation).await {
                Ok(saved) => outcome.upserted.push(saved.id),
                Err(e) => outcome.failed.push(BulkFailure {
                    id,
                    error: e.to_string(),
                }),
            }
        }
        Ok(outcome)
    }

    pub(crate) async fn upsert_validated(
        &self,
        domain: &Domain,
        mut symbol: Symbol,
        bypass_validation: bool,
    ) -> Result<Symbol> {
        validation::validate_fields(&symbol, domain)?;
        if !bypass_validation {
            for reference in validation::references_to_check(&symbol) {
                if self
                    .store
                    .get(&keys::symbol_key(&reference))
                    .await?
                    .is_none()
                {
                    return Err(Error::InvalidSymbol {
                        reason: format!("referenced symbol {reference} does not exist"),
                        field: "linked_patterns".into(),
                    });
                }
            }
        }

        // Preserve created_at across updates.
        let existing = self.load_symbol(&symbol.id).await?;
        let now = stamp::now();
        symbol.created_at = existing
            .as_ref()
            .map(|e| e.created_at.clone())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| now.clone());
        symbol.updated_at = now;

        self.save_symbol(&symbol).await?;
        self.store
            .sadd(&keys::domain_symbols_key(&domain.id), &symbol.id)
            .await?;
        self.sync_index_upsert(&symbol).await?;
        Ok(symbol)
    }

    /// Delete a symbol. With `cascade` the id is also stripped from every
    /// other symbol's reference arrays; without it, dangling references
    /// remain and are tolerated by readers.
    pub async fn delete_symbol(
        &self,
        domain_id: &str,
        id: &str,
        cascade: bool,
        auth: &AuthContext,
    ) -> Result<()> {
        self.writable_domain(domain_id, auth).await?;
        // The write grant covers this domain only; a symbol owned by
        // another domain is not deletable through it.
        match self.load_symbol(id).await? {
            Some(symbol) if symbol.symbol_domain == domain_id => {}
            _ => return Err(Error::NotFound(format!("symbol {id}"))),
        }
        self.store.del(&keys::symbol_key(id)).await?;
        self.store
            .srem(&keys::domain_symbols_key(domain_id), id)
            .await?;
        self.sync_index_remove(id).await;

        if cascade {
            self.strip_reference_everywhere(id).await?;
        }
        Ok(())
    }

    pub async fn delete_symbols(
        &self,
        domain_id: &str,
        ids: &[String],
        cascade: bool,
        auth: &AuthContext,
    ) -> Result<usize> {
        self.writable_domain(domain_id, auth).await?;
        let mut removed = 0;
        for id in ids {
            match self.load_symbol(id).await? {
                Some(symbol) if symbol.symbol_domain == domain_id => {}
                _ => continue,
            }
            if self.store.del(&keys::symbol_key(id)).await? {
                removed += 1;
                self.sync_index_remove(id).await;
            }
            self.store
                .srem(&keys::domain_symbols_key(domain_id), id)
                .await?;
        }
        if cascade {
            for id in ids {
                self.strip_reference_everywhere(id).await?;
            }
        }
        Ok(removed)
    }

    /// Remove `id` from every symbol's reference arrays, registry-wide.
    /// The write authorization already happened on the deletion itself.
    async fn strip_reference_everywhere(&self, id: &str) -> Result<()> {
        let internal = AuthContext::internal();
        for domain_id in self.visible_domain_ids(&internal).await? {
            let members = self
                .store
                .smembers(&keys::domain_symbols_key(&domain_id))
                .await?;
            for member in members {
                let Some(mut symbol) = self.load_symbol(&member).await? else {
                    continue;
                };
                if symbol.remove_reference(id) {
                    symbol.updated_at = stamp::now();
                    self.save_symbol(&symbol).await?;
                    if let Err(e) = self.sync_index_upsert(&symbol).await {
                        // Keep walking: cascade favors liveness.
                        tracing::warn!(symbol_id = %symbol.id, error = %e, "cascade index update failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Find a symbol by id, subject to its domain's read policy.
    pub async fn find_by_id(&self, id: &str, auth: &AuthContext) -> Result<Symbol> {
        let symbol = self
            .load_symbol(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("symbol {id}")))?;
        // Visibility follows the owning domain; a missing domain record
        // (registry-wide clears mid-flight) hides the symbol.
        match self.get_visible_domain(&symbol.symbol_domain, auth).await {
            Ok(_) => Ok(symbol),
            Err(_) => Err(Error::NotFound(format!("symbol {id}"))),
        }
    }

    pub async fn get_symbols(&self, domain_id: &str, auth: &AuthContext) -> Result<Vec<Symbol>> {
        self.get_visible_domain(domain_id, auth).await?;
        let mut members = self
            .store
            .smembers(&keys::domain_symbols_key(domain_id))
            .await?;
        members.sort();
        let mut symbols = Vec::with_capacity(members.len());
        for id in members {
            if let Some(symbol) = self.load_symbol(&id).await? {
                symbols.push(symbol);
            }
        }
        Ok(symbols)
    }

    /// Structured, paginated scan over one domain, id-ordered, optionally
    /// filtered by tag. `last_id` is the exclusive cursor.
    pub async fn query(
        &self,
        domain_id: &str,
        auth: &AuthContext,
        tag: Option<&str>,
        limit: usize,
        last_id: Option<&str>,
    ) -> Result<QueryPage> {
        self.get_visible_domain(domain_id, auth).await?;
        let limit = limit.clamp(1, 500);
        let mut members = self
            .store
            .smembers(&keys::domain_symbols_key(domain_id))
            .await?;
        members.sort();

        let mut page = Vec::new();
        for id in members
            .iter()
            .filter(|id| last_id.map_or(true, |cursor| id.as_str() > cursor))
        {
            let Some(symbol) = self.load_symbol(id).await? else {
                continue;
            };
            if let Some(tag) = tag {
                if symbol.symbol_tag.as_deref() != Some(tag) {
                    continue;
                }
            }
            page.push(symbol);
            if page.len() == limit {
                break;
            }
        }
        let last_id = if page.len() == limit {
            page.last().map(|s| s.id.clone())
        } else {
            None
        };
        Ok(QueryPage {
            symbols: page,
            last_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use sz_domain::symbol::{Facets, SymbolKind};
    use sz_store::MemoryStore;

    fn admin() -> AuthContext {
        AuthContext::admin("root", "root")
    }

    async fn registry_with_domain() -> SymbolRegistry {
        let reg = SymbolRegistry::new(Arc::new(MemoryStore::ephemeral()));
        reg.create_domain("d1", "Core", "", vec![], None, &admin())
            .await
            .unwrap();
        reg
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

    #[tokio::test]
    async fn upsert_stamps_and_persists() {
        let reg = registry_with_domain().await;
        let saved = reg
            .upsert_symbol("d1", pattern("a", "d1"), &admin())
            .await
            .unwrap();
        assert!(!saved.created_at.is_empty());
        assert_eq!(saved.created_at, saved.updated_at);

        let found = reg.find_by_id("a", &admin()).await.unwrap();
        assert_eq!(found.name, "sym a");
    }

    #[tokio::test]
    async fn update_preserves_created_at() {
        let reg = registry_with_domain().await;
        let first = reg
            .upsert_symbol("d1", pattern("a", "d1"), &admin())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut again = pattern("a", "d1");
        again.name = "renamed".into();
        let second = reg.upsert_symbol("d1", again, &admin()).await.unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert_ne!(second.updated_at, first.updated_at);
    }

    #[tokio::test]
    async fn dangling_reference_is_rejected_unless_bypassed() {
        let reg = registry_with_domain().await;
        let mut s = pattern("a", "d1");
        s.linked_patterns = vec!["ghost".into()];
        let err = reg
            .upsert_symbol("d1", s.clone(), &admin())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSymbol { .. }));

        let outcome = reg
            .bulk_upsert("d1", vec![s], true, &admin())
            .await
            .unwrap();
        assert_eq!(outcome.upserted, vec!["a"]);
        assert!(outcome.failed.is_empty());
    }

    #[tokio::test]
    async fn bulk_resolves_in_batch_order() {
        let reg = registry_with_domain().await;
        let mut b = pattern("b", "d1");
        b.linked_patterns = vec!["a".into()];
        // a first, then b referencing a: both validate.
        let outcome = reg
            .bulk_upsert("d1", vec![pattern("a", "d1"), b], false, &admin())
            .await
            .unwrap();
        assert_eq!(outcome.upserted.len(), 2);
    }

    #[tokio::test]
    async fn delete_with_cascade_strips_references() {
        let reg = registry_with_domain().await;
        reg.upsert_symbol("d1", pattern("b", "d1"), &admin())
            .await
            .unwrap();
        let mut a = pattern("a", "d1");
        a.linked_patterns = vec!["b".into()];
        reg.upsert_symbol("d1", a, &admin()).await.unwrap();

        reg.delete_symbol("d1", "b", true, &admin()).await.unwrap();
        assert!(matches!(
            reg.find_by_id("b", &admin()).await,
            Err(Error::NotFound(_))
        ));
        let a = reg.find_by_id("a", &admin()).await.unwrap();
        assert!(a.linked_patterns.is_empty());
    }

    #[tokio::test]
    async fn delete_without_cascade_leaves_dangling_refs() {
        let reg = registry_with_domain().await;
        reg.upsert_symbol("d1", pattern("b", "d1"), &admin())
            .await
            .unwrap();
        let mut a = pattern("a", "d1");
        a.linked_patterns = vec!["b".into()];
        reg.upsert_symbol("d1", a, &admin()).await.unwrap();

        reg.delete_symbol("d1", "b", false, &admin()).await.unwrap();
        let a = reg.find_by_id("a", &admin()).await.unwrap();
        assert_eq!(a.linked_patterns, vec!["b"]);
    }

    #[tokio::test]
    async fn query_pages_by_id_with_tag_filter() {
        let reg = registry_with_domain().await;
        for id in ["a", "b", "c", "d"] {
            let mut s = pattern(id, "d1");
            if id != "c" {
                s.symbol_tag = Some("gate".into());
            }
            reg.upsert_symbol("d1", s, &admin()).await.unwrap();
        }

        let page = reg
            .query("d1", &admin(), Some("gate"), 2, None)
            .await
            .unwrap();
        assert_eq!(
            page.symbols.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(page.last_id.as_deref(), Some("b"));

        let page = reg
            .query("d1", &admin(), Some("gate"), 2, page.last_id.as_deref())
            .await
            .unwrap();
        assert_eq!(
            page.symbols.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["d"]
        );
        assert!(page.last_id.is_none());
    }

    #[tokio::test]
    async fn writes_to_read_only_domain_carry_domain_id() {
        let reg = registry_with_domain().await;
        reg.update_domain_metadata("d1", None, None, None, Some(true), &admin())
            .await
            .unwrap();
        let err = reg
            .upsert_symbol("d1", pattern("a", "d1"), &admin())
            .await
            .unwrap_err();
        match err {
            Error::ReadOnlyDomain { domain_id, .. } => assert_eq!(domain_id, "d1"),
            _ => panic!("wrong error"),
        }
    }

    #[tokio::test]
    async fn non_owner_writes_are_rejected() {
        let reg = SymbolRegistry::new(Arc::new(MemoryStore::ephemeral()));
        reg.create_domain("d1", "Core", "", vec![], Some("u1".into()), &admin())
            .await
            .unwrap();
        let err = reg
            .upsert_symbol("d1", pattern("a", "d1"), &AuthContext::user("u2", "u2"))
            .await
            .unwrap_err();
        // u2 cannot even see the domain.
        assert!(matches!(err, Error::NotFound(_)));
    }
}
