//! User accounts, session tokens and API keys.
//!
//! Passwords are stored as `hex(sha256(salt || password))` with a random
//! per-user salt. Session tokens are opaque UUIDs with a store TTL; API
//! keys are long-lived per-user credentials for the MCP channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};

use sz_domain::auth::{AuthContext, Role};
use sz_domain::user::{User, UserView};
use sz_domain::{Error, Result};
use sz_store::KvStore;

const USERS_SET: &str = "sz:users";
const USERNAMES_HASH: &str = "sz:usernames";
const APIKEYS_HASH: &str = "sz:apikeys";

fn user_key(id: &str) -> String {
    format!("sz:user:{id}")
}

fn token_key(token: &str) -> String {
    format!("sz:token:{token}")
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn new_api_key() -> String {
    format!("szk_{}", uuid::Uuid::new_v4().simple())
}

pub struct UserStore {
    kv: Arc<dyn KvStore>,
    token_ttl: Duration,
}

impl UserStore {
    pub fn new(kv: Arc<dyn KvStore>, token_ttl: Duration) -> Self {
        Self { kv, token_ttl }
    }

    pub async fn is_initialized(&self) -> Result<bool> {
        Ok(!self.kv.smembers(USERS_SET).await?.is_empty())
    }

    /// First-run setup: create the initial admin. `Conflict` afterwards.
    pub async fn setup_admin(&self, username: &str, password: &str) -> Result<UserView> {
        if self.is_initialized().await? {
            return Err(Error::Conflict("already initialized".into()));
        }
        let user = self.insert_user(username, password, Role::Admin).await?;
        Ok(UserView::from(&user))
    }

    pub async fn create_user(
        &self,
        username: &str,
        password: &str,
        role: Role,
        auth: &AuthContext,
    ) -> Result<UserView> {
        if !auth.is_admin() {
            return Err(Error::Forbidden("user management requires admin".into()));
        }
        let user = self.insert_user(username, password, role).await?;
        Ok(UserView::from(&user))
    }

    async fn insert_user(&self, username: &str, password: &str, role: Role) -> Result<User> {
        let username = username.trim();
        if username.is_empty() || password.len() < 8 {
            return Err(Error::InvalidRequest(
                "username required and password must be at least 8 characters".into(),
            ));
        }
        if self.kv.hget(USERNAMES_HASH, username).await?.is_some() {
            return Err(Error::Conflict(format!("username {username} is taken")));
        }
        let now = Utc::now();
        let salt = hex::encode(uuid::Uuid::new_v4().as_bytes());
        let api_key = new_api_key();
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_owned(),
            password_hash: hash_password(&salt, password),
            salt,
            api_key: api_key.clone(),
            role,
            enabled: true,
            created_at: now,
            updated_at: now,
        };
        self.save(&user).await?;
        self.kv.sadd(USERS_SET, &user.id).await?;
        self.kv.hset(USERNAMES_HASH, username, &user.id).await?;
        self.kv.hset(APIKEYS_HASH, &api_key, &user.id).await?;
        tracing::info!(username, role = ?role, "user created");
        Ok(user)
    }

    pub async fn get(&self, id: &str) -> Result<User> {
        let raw = self
            .kv
            .get(&user_key(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
        serde_json::from_str(&raw).map_err(Error::Json)
    }

    pub async fn list(&self, auth: &AuthContext) -> Result<Vec<UserView>> {
        if !auth.is_admin() {
            return Err(Error::Forbidden("user management requires admin".into()));
        }
        let mut ids = self.kv.smembers(USERS_SET).await?;
        ids.sort();
        let mut views = Vec::new();
        for id in ids {
            if let Ok(user) = self.get(&id).await {
                views.push(UserView::from(&user));
            }
        }
        Ok(views)
    }

    /// Patch role/enabled. Admin-only.
    pub async fn update_user(
        &self,
        id: &str,
        role: Option<Role>,
        enabled: Option<bool>,
        auth: &AuthContext,
    ) -> Result<UserView> {
        if !auth.is_admin() {
            return Err(Error::Forbidden("user management requires admin".into()));
        }
        let mut user = self.get(id).await?;
        if let Some(role) = role {
            user.role = role;
        }
        if let Some(enabled) = enabled {
            user.enabled = enabled;
        }
        user.updated_at = Utc::now();
        self.save(&user).await?;
        Ok(UserView::from(&user))
    }

    pub async fn delete_user(&self, id: &str, auth: &AuthContext) -> Result<()> {
        if !auth.is_admin() {
            return Err(Error::Forbidden("user management requires admin".into()));
        }
        let user = self.get(id).await?;
        self.kv.del(&user_key(id)).await?;
        self.kv.srem(USERS_SET, id).await?;
        self.kv.hdel(USERNAMES_HASH, &user.username).await?;
        self.kv.hdel(APIKEYS_HASH, &user.api_key).await?;
        Ok(())
    }

    /// Rotate the API key. Admins may rotate anyone's; users their own.
    pub async fn mint_api_key(&self, id: &str, auth: &AuthContext) -> Result<String> {
        if !auth.is_admin() && auth.user_id.as_deref() != Some(id) {
            return Err(Error::Forbidden("cannot rotate another user's key".into()));
        }
        let mut user = self.get(id).await?;
        self.kv.hdel(APIKEYS_HASH, &user.api_key).await?;
        user.api_key = new_api_key();
        user.updated_at = Utc::now();
        self.kv.hset(APIKEYS_HASH, &user.api_key, id).await?;
        self.save(&user).await?;
        Ok(user.api_key)
    }

    pub async fn change_password(
        &self,
        auth: &AuthContext,
        current: &str,
        new: &str,
    ) -> Result<()> {
        let Some(user_id) = auth.user_id.as_deref() else {
            return Err(Error::Unauthorized);
        };
        let mut user = self.get(user_id).await?;
        if hash_password(&user.salt, current) != user.password_hash {
            return Err(Error::Unauthorized);
        }
        if new.len() < 8 {
            return Err(Error::InvalidRequest(
                "password must be at least 8 characters".into(),
            ));
        }
        user.salt = hex::encode(uuid::Uuid::new_v4().as_bytes());
        user.password_hash = hash_password(&user.salt, new);
        user.updated_at = Utc::now();
        self.save(&user).await
    }

    // ── Credentials ───────────────────────────────────────────────

    /// Verify a username/password pair and mint a session token.
    pub async fn login(&self, username: &str, password: &str) -> Result<(String, AuthContext)> {
        let user = match self.kv.hget(USERNAMES_HASH, username).await? {
            Some(id) => self.get(&id).await?,
            // Same error as a bad password: no username oracle.
            None => return Err(Error::Unauthorized),
        };
        if !user.enabled || hash_password(&user.salt, password) != user.password_hash {
            return Err(Error::Unauthorized);
        }
        let token = format!("szt_{}", uuid::Uuid::new_v4().simple());
        self.kv
            .set_with_ttl(&token_key(&token), &user.id, self.token_ttl)
            .await?;
        Ok((token, self.auth_context(&user)))
    }

    pub async fn resolve_token(&self, token: &str) -> Result<Option<AuthContext>> {
        let Some(user_id) = self.kv.get(&token_key(token)).await? else {
            return Ok(None);
        };
        match self.get(&user_id).await {
            Ok(user) if user.enabled => Ok(Some(self.auth_context(&user))),
            _ => Ok(None),
        }
    }

    pub async fn resolve_api_key(&self, api_key: &str) -> Result<Option<AuthContext>> {
        let Some(user_id) = self.kv.hget(APIKEYS_HASH, api_key).await? else {
            return Ok(None);
        };
        match self.get(&user_id).await {
            Ok(user) if user.enabled => Ok(Some(self.auth_context(&user))),
            _ => Ok(None),
        }
    }

    fn auth_context(&self, user: &User) -> AuthContext {
        AuthContext {
            user_id: Some(user.id.clone()),
            username: Some(user.username.clone()),
            role: user.role,
        }
    }

    async fn save(&self, user: &User) -> Result<()> {
        let raw = serde_json::to_string(user)?;
        self.kv.set(&user_key(&user.id), &raw).await
    }
}
