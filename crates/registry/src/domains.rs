//! Domain lifecycle and metadata operations.

use serde::Serialize;

use sz_domain::auth::AuthContext;
use sz_domain::domain::Domain;
use sz_domain::{stamp, Error, Result};

use crate::keys;
use crate::registry::SymbolRegistry;

/// Summary row for `get_metadata`.
#[derive(Debug, Clone, Serialize)]
pub struct DomainSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub read_only: bool,
    pub symbol_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<String>,
}

impl SymbolRegistry {
    /// Create a domain. Non-admins always own what they create; admins
    /// may create global domains (`owner_user_id = None`).
    pub async fn create_domain(
        &self,
        id: &str,
        name: &str,
        description: &str,
        invariants: Vec<String>,
        owner_user_id: Option<String>,
        auth: &AuthContext,
    ) -> Result<Domain> {
        if id.is_empty() {
            return Err(Error::InvalidRequest("domain id must not be empty".into()));
        }
        if self.store.get(&keys::domain_key(id)).await?.is_some() {
            return Err(Error::Conflict(format!("domain {id} already exists")));
        }
        let owner = if auth.is_admin() {
            owner_user_id
        } else {
            // Users can only create domains they own.
            match auth.user_id.clone() {
                Some(uid) => Some(uid),
                None => return Err(Error::Unauthorized),
            }
        };
        let now = stamp::now();
        let domain = Domain {
            id: id.to_owned(),
            name: name.to_owned(),
            description: description.to_owned(),
            invariants,
            enabled: true,
            read_only: false,
            owner_user_id: owner,
            created_at: now.clone(),
            updated_at: now,
        };
        self.save_domain(&domain).await?;
        tracing::info!(domain_id = %id, "domain created");
        Ok(domain)
    }

    /// Delete a domain and all its symbols.
    pub async fn delete_domain(&self, id: &str, auth: &AuthContext) -> Result<()> {
        let domain = self.get_visible_domain(id, auth).await?;
        // Deleting a domain is an ownership operation, not a symbol
        // write, so read_only does not protect it — ownership does.
        if !auth.is_admin() && domain.owner_user_id.as_deref() != auth.user_id.as_deref() {
            return Err(Error::NotFound(format!("domain {id}")));
        }
        let members = self.store.smembers(&keys::domain_symbols_key(id)).await?;
        for symbol_id in members {
            self.store.del(&keys::symbol_key(&symbol_id)).await?;
            self.sync_index_remove(&symbol_id).await;
        }
        self.store.del(&keys::domain_symbols_key(id)).await?;
        self.store.del(&keys::domain_key(id)).await?;
        self.store.srem(keys::DOMAINS_SET, id).await?;
        tracing::info!(domain_id = %id, "domain deleted");
        Ok(())
    }

    /// Enable or disable a domain. Disabled domains stay readable but are
    /// skipped by default reindex walks.
    pub async fn toggle_domain(&self, id: &str, enabled: bool, auth: &AuthContext) -> Result<Domain> {
        let mut domain = self.get_visible_domain(id, auth).await?;
        if !auth.is_admin() && domain.owner_user_id.as_deref() != auth.user_id.as_deref() {
            return Err(Error::NotFound(format!("domain {id}")));
        }
        domain.enabled = enabled;
        domain.updated_at = stamp::now();
        self.save_domain(&domain).await?;
        Ok(domain)
    }

    /// Update name / description / invariants / read-only flag.
    /// `read_only` may be toggled only by admins.
    pub async fn update_domain_metadata(
        &self,
        id: &str,
        name: Option<String>,
        description: Option<String>,
        invariants: Option<Vec<String>>,
        read_only: Option<bool>,
        auth: &AuthContext,
    ) -> Result<Domain> {
        let mut domain = self.get_visible_domain(id, auth).await?;
        if !auth.is_admin() && domain.owner_user_id.as_deref() != auth.user_id.as_deref() {
            return Err(Error::NotFound(format!("domain {id}")));
        }
        if let Some(name) = name {
            domain.name = name;
        }
        if let Some(description) = description {
            domain.description = description;
        }
        if let Some(invariants) = invariants {
            domain.invariants = invariants;
        }
        if let Some(read_only) = read_only {
            if !auth.is_admin() {
                return Err(Error::Forbidden(
                    "only admins may change the read-only flag".into(),
                ));
            }
            domain.read_only = read_only;
        }
        domain.updated_at = stamp::now();
        self.save_domain(&domain).await?;
        Ok(domain)
    }

    /// Domains visible to the caller: global plus owned (all for admins).
    pub async fn list_domains(&self, auth: &AuthContext) -> Result<Vec<Domain>> {
        let ids = self.visible_domain_ids(auth).await?;
        let mut domains = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(domain) = self.load_domain(&id).await {
                domains.push(domain);
            }
        }
        Ok(domains)
    }

    /// Summaries with symbol counts, for the dashboard-facing endpoint.
    pub async fn get_metadata(&self, auth: &AuthContext) -> Result<Vec<DomainSummary>> {
        let domains = self.list_domains(auth).await?;
        let mut summaries = Vec::with_capacity(domains.len());
        for domain in domains {
            let count = self
                .store
                .smembers(&keys::domain_symbols_key(&domain.id))
                .await?
                .len();
            summaries.push(DomainSummary {
                id: domain.id,
                name: domain.name,
                description: domain.description,
                enabled: domain.enabled,
                read_only: domain.read_only,
                symbol_count: count,
                owner_user_id: domain.owner_user_id,
            });
        }
        Ok(summaries)
    }

    /// Load a domain the caller can read. `NotFound` covers both missing
    /// and forbidden so callers cannot probe for existence.
    pub async fn get_visible_domain(&self, id: &str, auth: &AuthContext) -> Result<Domain> {
        let domain = self.load_domain(id).await?;
        if !domain.readable_by(auth) {
            return Err(Error::NotFound(format!("domain {id}")));
        }
        Ok(domain)
    }

    pub async fn domain_exists(&self, id: &str, auth: &AuthContext) -> Result<bool> {
        match self.get_visible_domain(id, auth).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Writability gate shared by every symbol mutation.
    pub(crate) async fn writable_domain(&self, id: &str, auth: &AuthContext) -> Result<Domain> {
        let domain = self.get_visible_domain(id, auth).await?;
        if domain.read_only {
            return Err(Error::ReadOnlyDomain {
                domain_id: id.to_owned(),
                symbol_id: None,
            });
        }
        if !domain.writable_by(auth) {
            // Global domains are readable by everyone, so Forbidden here
            // leaks nothing new.
            return Err(Error::Forbidden(format!(
                "writes to domain {id} require admin or ownership"
            )));
        }
        Ok(domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use sz_domain::auth::AuthContext;
    use sz_store::MemoryStore;

    fn registry() -> SymbolRegistry {
        SymbolRegistry::new(Arc::new(MemoryStore::ephemeral()))
    }

    fn admin() -> AuthContext {
        AuthContext::admin("root", "root")
    }

    #[tokio::test]
    async fn create_and_list() {
        let reg = registry();
        reg.create_domain("d1", "Core", "", vec![], None, &admin())
            .await
            .unwrap();
        reg.create_domain("d2", "Aux", "", vec![], Some("u1".into()), &admin())
            .await
            .unwrap();

        let all = reg.list_domains(&admin()).await.unwrap();
        assert_eq!(all.len(), 2);

        // u2 sees only the global domain.
        let seen = reg.list_domains(&AuthContext::user("u2", "u2")).await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, "d1");

        // u1 sees global + own.
        let seen = reg.list_domains(&AuthContext::user("u1", "u1")).await.unwrap();
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_domain_conflicts() {
        let reg = registry();
        reg.create_domain("d1", "Core", "", vec![], None, &admin())
            .await
            .unwrap();
        let err = reg
            .create_domain("d1", "Again", "", vec![], None, &admin())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn non_admin_creations_are_owned() {
        let reg = registry();
        let u1 = AuthContext::user("u1", "u1");
        let domain = reg
            .create_domain("mine", "Mine", "", vec![], None, &u1)
            .await
            .unwrap();
        assert_eq!(domain.owner_user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn forbidden_reads_report_not_found() {
        let reg = registry();
        reg.create_domain("d1", "Core", "", vec![], Some("u1".into()), &admin())
            .await
            .unwrap();
        let err = reg
            .get_visible_domain("d1", &AuthContext::user("u2", "u2"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        // Identical to a genuinely missing domain.
        let err = reg
            .get_visible_domain("ghost", &AuthContext::user("u2", "u2"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn read_only_toggle_is_admin_only() {
        let reg = registry();
        let u1 = AuthContext::user("u1", "u1");
        reg.create_domain("d1", "Mine", "", vec![], None, &u1)
            .await
            .unwrap();
        let err = reg
            .update_domain_metadata("d1", None, None, None, Some(true), &u1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let domain = reg
            .update_domain_metadata("d1", None, None, None, Some(true), &admin())
            .await
            .unwrap();
        assert!(domain.read_only);
    }

    #[tokio::test]
    async fn writable_domain_rejects_read_only() {
        let reg = registry();
        reg.create_domain("d1", "Core", "", vec![], None, &admin())
            .await
            .unwrap();
        reg.update_domain_metadata("d1", None, None, None, Some(true), &admin())
            .await
            .unwrap();
        let err = reg.writable_domain("d1", &admin()).await.unwrap_err();
        assert!(matches!(err, Error::ReadOnlyDomain { .. }));
    }
}
