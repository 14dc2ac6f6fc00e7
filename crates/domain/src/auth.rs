//! Authorization context passed explicitly into every service call that
//! touches per-user state. There is no ambient "current user".

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

/// Identity attached to a request.
///
/// `user_id = None` with `role = Admin` is the synthetic service identity
/// minted for `x-internal-key` callers and internal recovery paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub role: Role,
}

impl AuthContext {
    pub fn user(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            username: Some(username.into()),
            role: Role::User,
        }
    }

    pub fn admin(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            username: Some(username.into()),
            role: Role::Admin,
        }
    }

    /// Synthetic admin context for service-to-service and recovery paths.
    pub fn internal() -> Self {
        Self {
            user_id: None,
            username: None,
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_context_is_admin_without_user() {
        let ctx = AuthContext::internal();
        assert!(ctx.is_admin());
        assert!(ctx.user_id.is_none());
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Admin).unwrap(), "\"admin\"");
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
    }
}
