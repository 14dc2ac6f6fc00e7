//! Symbol domains — named sets of symbols with shared invariants,
//! ownership and access control.

use serde::{Deserialize, Serialize};

use crate::auth::AuthContext;

/// A named set of symbols.
///
/// A domain is **global** when `owner_user_id` is `None` (readable by all,
/// writable by admins) or **user-owned** (readable and writable by the
/// owner and admins). `read_only` rejects writes regardless of ownership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Free-form textual constraints validated at upsert time.
    #[serde(default)]
    pub invariants: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, rename = "readOnly")]
    pub read_only: bool,
    #[serde(default, rename = "ownerUserId", skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

fn default_true() -> bool {
    true
}

impl Domain {
    /// Whether `auth` may read this domain.
    pub fn readable_by(&self, auth: &AuthContext) -> bool {
        match &self.owner_user_id {
            None => true,
            Some(owner) => auth.is_admin() || auth.user_id.as_deref() == Some(owner.as_str()),
        }
    }

    /// Whether `auth` may write this domain. Read-only always wins for
    /// non-admins; admins bypass `read_only` only via the explicit toggle
    /// path, never through symbol writes.
    pub fn writable_by(&self, auth: &AuthContext) -> bool {
        if self.read_only {
            return false;
        }
        match &self.owner_user_id {
            None => auth.is_admin(),
            Some(owner) => auth.is_admin() || auth.user_id.as_deref() == Some(owner.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthContext, Role};

    fn domain(owner: Option<&str>, read_only: bool) -> Domain {
        Domain {
            id: "d1".into(),
            name: "test".into(),
            description: String::new(),
            invariants: vec![],
            enabled: true,
            read_only,
            owner_user_id: owner.map(String::from),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn user(id: &str) -> AuthContext {
        AuthContext::user(id, id)
    }

    fn admin() -> AuthContext {
        AuthContext {
            user_id: Some("root".into()),
            username: Some("root".into()),
            role: Role::Admin,
        }
    }

    #[test]
    fn global_domain_reads_open_writes_admin() {
        let d = domain(None, false);
        assert!(d.readable_by(&user("u1")));
        assert!(!d.writable_by(&user("u1")));
        assert!(d.writable_by(&admin()));
    }

    #[test]
    fn owned_domain_scoped_to_owner() {
        let d = domain(Some("u1"), false);
        assert!(d.readable_by(&user("u1")));
        assert!(d.writable_by(&user("u1")));
        assert!(!d.readable_by(&user("u2")));
        assert!(!d.writable_by(&user("u2")));
        assert!(d.readable_by(&admin()));
        assert!(d.writable_by(&admin()));
    }

    #[test]
    fn read_only_blocks_all_symbol_writes() {
        let d = domain(Some("u1"), true);
        assert!(!d.writable_by(&user("u1")));
        assert!(!d.writable_by(&admin()));
        assert!(d.readable_by(&user("u1")));
    }
}
