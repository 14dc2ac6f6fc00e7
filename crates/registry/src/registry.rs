//! The registry service struct and shared internals.

use std::sync::Arc;

use parking_lot::RwLock;

use sz_domain::auth::AuthContext;
use sz_domain::domain::Domain;
use sz_domain::symbol::Symbol;
use sz_domain::{Error, Result};
use sz_store::KvStore;

use crate::indexer::SymbolIndexer;
use crate::keys;
use crate::migrate;

/// Durable, authorized storage of symbols and domains.
///
/// The indexer slot is attached after construction (the index needs a
/// registry handle for reindex walks); until then mutations skip index
/// synchronization, which only happens during startup wiring and tests.
pub struct SymbolRegistry {
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) indexer: RwLock<Option<Arc<dyn SymbolIndexer>>>,
}

impl SymbolRegistry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            indexer: RwLock::new(None),
        }
    }

    pub fn attach_indexer(&self, indexer: Arc<dyn SymbolIndexer>) {
        *self.indexer.write() = Some(indexer);
    }

    pub(crate) fn indexer(&self) -> Option<Arc<dyn SymbolIndexer>> {
        self.indexer.read().clone()
    }

    // ── Shared loads ──────────────────────────────────────────────

    /// Load a domain record, or `NotFound`.
    pub(crate) async fn load_domain(&self, id: &str) -> Result<Domain> {
        let raw = self
            .store
            .get(&keys::domain_key(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("domain {id}")))?;
        serde_json::from_str(&raw).map_err(Error::Json)
    }

    pub(crate) async fn save_domain(&self, domain: &Domain) -> Result<()> {
        let raw = serde_json::to_string(domain)?;
        self.store.set(&keys::domain_key(&domain.id), &raw).await?;
        self.store.sadd(keys::DOMAINS_SET, &domain.id).await?;
        Ok(())
    }

    /// Load a symbol, opportunistically rewriting legacy shapes and
    /// persisting the migrated record.
    pub(crate) async fn load_symbol(&self, id: &str) -> Result<Option<Symbol>> {
        let Some(raw) = self.store.get(&keys::symbol_key(id)).await? else {
            return Ok(None);
        };
        let mut value: serde_json::Value = serde_json::from_str(&raw)?;
        if migrate::migrate_symbol_value(&mut value) {
            let migrated = serde_json::to_string(&value)?;
            self.store.set(&keys::symbol_key(id), &migrated).await?;
            tracing::debug!(symbol_id = %id, "migrated legacy symbol shape");
        }
        let symbol: Symbol = serde_json::from_value(value)?;
        Ok(Some(symbol))
    }

    pub(crate) async fn save_symbol(&self, symbol: &Symbol) -> Result<()> {
        let raw = serde_json::to_string(symbol)?;
        self.store.set(&keys::symbol_key(&symbol.id), &raw).await
    }

    /// Domain ids visible to `auth`: all for admins, global + owned for
    /// users.
    pub(crate) async fn visible_domain_ids(&self, auth: &AuthContext) -> Result<Vec<String>> {
        let mut ids = self.store.smembers(keys::DOMAINS_SET).await?;
        ids.sort();
        if auth.is_admin() {
            return Ok(ids);
        }
        let mut visible = Vec::new();
        for id in ids {
            if let Ok(domain) = self.load_domain(&id).await {
                if domain.readable_by(auth) {
                    visible.push(id);
                }
            }
        }
        Ok(visible)
    }

    /// Index-sync after an upsert. `Ok(false)` from the indexer means the
    /// symbol is unindexable: it is removed from the registry as well.
    /// Indexer transport errors are logged and tolerated (liveness over
    /// index freshness).
    pub(crate) async fn sync_index_upsert(&self, symbol: &Symbol) -> Result<()> {
        let Some(indexer) = self.indexer() else {
            return Ok(());
        };
        match indexer.index_symbol(symbol).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::warn!(symbol_id = %symbol.id, "symbol is unindexable, removing from registry");
                self.store.del(&keys::symbol_key(&symbol.id)).await?;
                self.store
                    .srem(&keys::domain_symbols_key(&symbol.symbol_domain), &symbol.id)
                    .await?;
                Err(Error::Unavailable(format!(
                    "symbol {} could not be indexed and was not kept",
                    symbol.id
                )))
            }
            Err(e) => {
                tracing::warn!(symbol_id = %symbol.id, error = %e, "index update failed, registry write kept");
                Ok(())
            }
        }
    }

    pub(crate) async fn sync_index_remove(&self, id: &str) {
        if let Some(indexer) = self.indexer() {
            if let Err(e) = indexer.remove_symbol(id).await {
                tracing::warn!(symbol_id = %id, error = %e, "index removal failed");
            }
        }
    }

    /// Run the startup migration over every domain.
    pub async fn migrate_all(&self) -> Result<usize> {
        let ids = self.store.smembers(keys::DOMAINS_SET).await?;
        let mut touched = 0;
        for domain_id in ids {
            let members = self
                .store
                .smembers(&keys::domain_symbols_key(&domain_id))
                .await?;
            for symbol_id in members {
                // load_symbol persists migrated shapes as a side effect.
                if self.load_symbol(&symbol_id).await?.is_some() {
                    touched += 1;
                }
            }
        }
        Ok(touched)
    }

    /// Write a domain record verbatim (project import; preserves
    /// ownership, flags and timestamps).
    pub async fn restore_domain(&self, domain: &Domain, auth: &AuthContext) -> Result<()> {
        if !auth.is_admin() {
            return Err(Error::Forbidden("restore requires admin".into()));
        }
        self.save_domain(domain).await
    }

    /// Write a symbol verbatim into its domain (project import; skips
    /// validation so cross-domain links restore in any order, keeps the
    /// original timestamps so relative ordering survives).
    pub async fn restore_symbol(&self, symbol: &Symbol, auth: &AuthContext) -> Result<()> {
        if !auth.is_admin() {
            return Err(Error::Forbidden("restore requires admin".into()));
        }
        self.save_symbol(symbol).await?;
        self.store
            .sadd(&keys::domain_symbols_key(&symbol.symbol_domain), &symbol.id)
            .await?;
        if let Err(e) = self.sync_index_upsert(symbol).await {
            tracing::warn!(symbol_id = %symbol.id, error = %e, "restored symbol not indexed");
        }
        Ok(())
    }

    /// Remove all registry state (domains, symbols, member sets).
    pub async fn clear_all(&self, auth: &AuthContext) -> Result<()> {
        if !auth.is_admin() {
            return Err(Error::Forbidden("clear_all requires admin".into()));
        }
        let ids = self.store.smembers(keys::DOMAINS_SET).await?;
        for domain_id in ids {
            let members = self
                .store
                .smembers(&keys::domain_symbols_key(&domain_id))
                .await?;
            for symbol_id in members {
                self.store.del(&keys::symbol_key(&symbol_id)).await?;
                self.sync_index_remove(&symbol_id).await;
            }
            self.store.del(&keys::domain_symbols_key(&domain_id)).await?;
            self.store.del(&keys::domain_key(&domain_id)).await?;
            self.store.srem(keys::DOMAINS_SET, &domain_id).await?;
        }
        Ok(())
    }
}
