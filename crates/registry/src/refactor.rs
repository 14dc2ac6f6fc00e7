//! Registry-wide ID-rewriting operations: rename, compression (merge)
//! and the batched refactor entry point.
//!
//! None of these are atomic across keys. Each step is a single-key write
//! ordered so that re-running the operation on the resulting state is a
//! no-op: already-substituted references do not match again, and deletes
//! of already-deleted ids are tolerated.

use serde::{Deserialize, Serialize};

use sz_domain::auth::AuthContext;
use sz_domain::symbol::Symbol;
use sz_domain::{stamp, Error, Result};

use crate::keys;
use crate::registry::SymbolRegistry;

/// One step of a batched refactor.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RefactorUpdate {
    Upsert {
        domain: String,
        symbol: Box<Symbol>,
    },
    Rename {
        domain: String,
        old_id: String,
        new_id: String,
    },
    Delete {
        domain: String,
        id: String,
        #[serde(default)]
        cascade: bool,
    },
}

#[derive(Debug, Serialize)]
pub struct RefactorOutcome {
    pub applied: usize,
    pub errors: Vec<RefactorError>,
}

#[derive(Debug, Serialize)]
pub struct RefactorError {
    pub index: usize,
    pub error: String,
}

impl SymbolRegistry {
    /// Rename a symbol and rewrite every reference to it.
    ///
    /// Tie-break: if `new_id` already exists alongside `old_id`, fail with
    /// `Conflict` before any write. If only `new_id` exists the rename
    /// already happened and this call is a no-op.
    pub async fn propagate_rename(
        &self,
        domain_id: &str,
        old_id: &str,
        new_id: &str,
        auth: &AuthContext,
    ) -> Result<Symbol> {
        if old_id == new_id {
            return Err(Error::InvalidRequest("old and new id are equal".into()));
        }
        self.writable_domain(domain_id, auth).await?;

        let old = self.load_symbol(old_id).await?;
        let new_exists = self.store.get(&keys::symbol_key(new_id)).await?.is_some();

        let renamed = match (old, new_exists) {
            // The rename grant covers this domain only.
            (Some(symbol), _) if symbol.symbol_domain != domain_id => {
                return Err(Error::NotFound(format!("symbol {old_id}")))
            }
            (Some(_), true) => {
                return Err(Error::Conflict(format!("symbol {new_id} already exists")))
            }
            (None, true) => {
                // Retry of an applied rename: finish any partial
                // substitutions and return the existing symbol.
                self.rewrite_references_everywhere(&[(old_id.to_owned(), new_id.to_owned())])
                    .await?;
                return self
                    .load_symbol(new_id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("symbol {new_id}")));
            }
            (None, false) => return Err(Error::NotFound(format!("symbol {old_id}"))),
            (Some(old), false) => {
                let mut renamed = old;
                renamed.id = new_id.to_owned();
                renamed.updated_at = stamp::now();
                renamed
            }
        };

        // Write the new record first so no reference ever points at
        // nothing, then substitute, then drop the old record.
        self.save_symbol(&renamed).await?;
        self.store
            .sadd(&keys::domain_symbols_key(domain_id), new_id)
            .await?;

        self.rewrite_references_everywhere(&[(old_id.to_owned(), new_id.to_owned())])
            .await?;

        self.store.del(&keys::symbol_key(old_id)).await?;
        self.store
            .srem(&keys::domain_symbols_key(domain_id), old_id)
            .await?;

        self.sync_index_remove(old_id).await;
        self.sync_index_upsert(&renamed).await?;
        tracing::info!(old_id, new_id, domain_id, "symbol renamed");
        Ok(renamed)
    }

    /// Merge `old_ids` into a freshly created symbol: create it, rewrite
    /// every reference from each old id to the new one, delete the olds.
    ///
    /// Validation of the merge symbol bypasses reference existence since
    /// it commonly links symbols that are themselves being replaced.
    pub async fn compress_symbols(
        &self,
        new_symbol: Symbol,
        old_ids: &[String],
        auth: &AuthContext,
    ) -> Result<Symbol> {
        let domain = self.writable_domain(&new_symbol.symbol_domain, auth).await?;
        if old_ids.iter().any(|id| *id == new_symbol.id) {
            return Err(Error::InvalidRequest(
                "compression target cannot be one of the compressed ids".into(),
            ));
        }

        let created = self.upsert_validated(&domain, new_symbol, true).await?;

        let substitutions: Vec<(String, String)> = old_ids
            .iter()
            .map(|old| (old.clone(), created.id.clone()))
            .collect();
        self.rewrite_references_everywhere(&substitutions).await?;

        for old_id in old_ids {
            // Old symbols may live in other domains; each deletion needs
            // its own write grant. Unauthorized ones are left in place
            // (their references now point at the merge symbol).
            if let Some(old) = self.load_symbol(old_id).await? {
                if self.writable_domain(&old.symbol_domain, auth).await.is_err() {
                    tracing::warn!(symbol_id = %old_id, "compression skipped delete in unwritable domain");
                    continue;
                }
                self.store
                    .srem(&keys::domain_symbols_key(&old.symbol_domain), old_id)
                    .await?;
            }
            self.store.del(&keys::symbol_key(old_id)).await?;
            self.sync_index_remove(old_id).await;
        }
        tracing::info!(new_id = %created.id, compressed = old_ids.len(), "symbols compressed");
        Ok(created)
    }

    /// Apply a batch of refactor steps in order. Individual failures are
    /// reported and do not abort the batch.
    pub async fn process_refactor_operation(
        &self,
        updates: Vec<RefactorUpdate>,
        auth: &AuthContext,
    ) -> Result<RefactorOutcome> {
        let mut outcome = RefactorOutcome {
            applied: 0,
            errors: Vec::new(),
        };
        for (index, update) in updates.into_iter().enumerate() {
            let result = match update {
                RefactorUpdate::Upsert { domain, symbol } => self
                    .upsert_symbol(&domain, *symbol, auth)
                    .await
                    .map(|_| ()),
                RefactorUpdate::Rename {
                    domain,
                    old_id,
                    new_id,
                } => self
                    .propagate_rename(&domain, &old_id, &new_id, auth)
                    .await
                    .map(|_| ()),
                RefactorUpdate::Delete {
                    domain,
                    id,
                    cascade,
                } => self.delete_symbol(&domain, &id, cascade, auth).await,
            };
            match result {
                Ok(()) => outcome.applied += 1,
                Err(e) => outcome.errors.push(RefactorError {
                    index,
                    error: e.to_string(),
                }),
            }
        }
        Ok(outcome)
    }

    /// Substitute each `(old, new)` pair in every symbol's reference
    /// arrays, registry-wide, reindexing touched symbols.
    async fn rewrite_references_everywhere(
        &self,
        substitutions: &[(String, String)],
    ) -> Result<()> {
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
                let mut changed = false;
                for (old, new) in substitutions {
                    changed |= symbol.rewrite_reference(old, new);
                }
                if changed {
                    symbol.updated_at = stamp::now();
                    self.save_symbol(&symbol).await?;
                    if let Err(e) = self.sync_index_upsert(&symbol).await {
                        tracing::warn!(symbol_id = %symbol.id, error = %e, "refactor index update failed");
                    }
                }
            }
        }
        Ok(())
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

    async fn registry_with_linked_pair() -> SymbolRegistry {
        let reg = SymbolRegistry::new(Arc::new(MemoryStore::ephemeral()));
        reg.create_domain("d1", "Core", "", vec![], None, &admin())
            .await
            .unwrap();
        reg.upsert_symbol("d1", pattern("b", "d1"), &admin())
            .await
            .unwrap();
        let mut a = pattern("a", "d1");
        a.linked_patterns = vec!["b".into()];
        reg.upsert_symbol("d1", a, &admin()).await.unwrap();
        reg
    }

    #[tokio::test]
    async fn rename_rewrites_references() {
        let reg = registry_with_linked_pair().await;
        reg.propagate_rename("d1", "b", "c", &admin()).await.unwrap();

        assert!(matches!(
            reg.find_by_id("b", &admin()).await,
            Err(Error::NotFound(_))
        ));
        assert!(reg.find_by_id("c", &admin()).await.is_ok());
        let a = reg.find_by_id("a", &admin()).await.unwrap();
        assert_eq!(a.linked_patterns, vec!["c"]);
    }

    #[tokio::test]
    async fn rename_to_existing_id_conflicts_without_writes() {
        let reg = registry_with_linked_pair().await;
        reg.upsert_symbol("d1", pattern("c", "d1"), &admin())
            .await
            .unwrap();
        let err = reg
            .propagate_rename("d1", "b", "c", &admin())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        // State unchanged: b still exists, a still links b.
        assert!(reg.find_by_id("b", &admin()).await.is_ok());
        let a = reg.find_by_id("a", &admin()).await.unwrap();
        assert_eq!(a.linked_patterns, vec!["b"]);
    }

    #[tokio::test]
    async fn rename_is_idempotent() {
        let reg = registry_with_linked_pair().await;
        reg.propagate_rename("d1", "b", "c", &admin()).await.unwrap();
        // Second application is a no-op, not an error.
        reg.propagate_rename("d1", "b", "c", &admin()).await.unwrap();
        let a = reg.find_by_id("a", &admin()).await.unwrap();
        assert_eq!(a.linked_patterns, vec!["c"]);
    }

    #[tokio::test]
    async fn rename_missing_symbol_is_not_found() {
        let reg = registry_with_linked_pair().await;
        let err = reg
            .propagate_rename("d1", "ghost", "g2", &admin())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn compression_merges_and_deletes() {
        let reg = registry_with_linked_pair().await;
        // x links both a and b; compressing a+b into n rewrites x twice.
        let mut x = pattern("x", "d1");
        x.linked_patterns = vec!["a".into(), "b".into()];
        reg.upsert_symbol("d1", x, &admin()).await.unwrap();

        let merged = reg
            .compress_symbols(
                pattern("n", "d1"),
                &["a".to_string(), "b".to_string()],
                &admin(),
            )
            .await
            .unwrap();
        assert_eq!(merged.id, "n");

        assert!(matches!(
            reg.find_by_id("a", &admin()).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            reg.find_by_id("b", &admin()).await,
            Err(Error::NotFound(_))
        ));
        let x = reg.find_by_id("x", &admin()).await.unwrap();
        assert_eq!(x.linked_patterns, vec!["n", "n"]);
    }

    #[tokio::test]
    async fn compression_is_idempotent() {
        let reg = registry_with_linked_pair().await;
        let olds = vec!["b".to_string()];
        reg.compress_symbols(pattern("n", "d1"), &olds, &admin())
            .await
            .unwrap();
        let first = reg.find_by_id("a", &admin()).await.unwrap();
        // Re-running on the resulting state changes nothing.
        reg.compress_symbols(pattern("n", "d1"), &olds, &admin())
            .await
            .unwrap();
        let second = reg.find_by_id("a", &admin()).await.unwrap();
        assert_eq!(first.linked_patterns, second.linked_patterns);
        assert!(reg.find_by_id("n", &admin()).await.is_ok());
    }

    #[tokio::test]
    async fn compress_into_own_id_is_rejected() {
        let reg = registry_with_linked_pair().await;
        let err = reg
            .compress_symbols(pattern("b", "d1"), &["b".to_string()], &admin())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn batch_refactor_reports_partial_failures() {
        let reg = registry_with_linked_pair().await;
        let outcome = reg
            .process_refactor_operation(
                vec![
                    RefactorUpdate::Rename {
                        domain: "d1".into(),
                        old_id: "b".into(),
                        new_id: "c".into(),
                    },
                    RefactorUpdate::Delete {
                        domain: "d1".into(),
                        id: "ghost".into(),
                        cascade: false,
                    },
                ],
                &admin(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].index, 1);
    }
}
