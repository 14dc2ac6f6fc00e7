//! Store-backed context sessions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use sz_domain::auth::AuthContext;
use sz_domain::context::{
    group_turns, ContextSession, QueuedMessage, SessionStatus, SessionType, Turn, TurnGroup,
    TurnRole,
};
use sz_domain::{Error, Result};
use sz_store::KvStore;

const SESSIONS_SET: &str = "sz:contexts";

fn session_key(id: &str) -> String {
    format!("sz:context:{id}")
}

fn history_key(id: &str) -> String {
    format!("sz:history:{id}")
}

/// How many times read-modify-write updates retry a lost CAS race before
/// reporting the store as contended. Lock acquisition never retries.
const UPDATE_RETRIES: usize = 16;

pub struct ContextStore {
    store: Arc<dyn KvStore>,
}

impl ContextStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    pub async fn create_session(
        &self,
        session_type: SessionType,
        metadata: Value,
        owner_user_id: Option<String>,
    ) -> Result<ContextSession> {
        let now = Utc::now();
        let session = ContextSession {
            id: uuid::Uuid::new_v4().to_string(),
            session_type,
            status: SessionStatus::Open,
            user_id: owner_user_id,
            active_message_id: None,
            cancellation_requested: false,
            queue: Vec::new(),
            metadata,
            created_at: now,
            updated_at: now,
        };
        let raw = serde_json::to_string(&session)?;
        self.store.set(&session_key(&session.id), &raw).await?;
        self.store.sadd(SESSIONS_SET, &session.id).await?;
        tracing::info!(session_id = %session.id, session_type = ?session_type, "context session created");
        Ok(session)
    }

    /// Create an agent session with a fixed id (one per agent), or return
    /// the existing one.
    pub async fn ensure_agent_session(&self, id: &str) -> Result<ContextSession> {
        if let Some(raw) = self.store.get(&session_key(id)).await? {
            return serde_json::from_str(&raw).map_err(Error::Json);
        }
        let now = Utc::now();
        let session = ContextSession {
            id: id.to_owned(),
            session_type: SessionType::Agent,
            status: SessionStatus::Open,
            user_id: None,
            active_message_id: None,
            cancellation_requested: false,
            queue: Vec::new(),
            metadata: Value::Null,
            created_at: now,
            updated_at: now,
        };
        let raw = serde_json::to_string(&session)?;
        self.store.set(&session_key(id), &raw).await?;
        self.store.sadd(SESSIONS_SET, id).await?;
        Ok(session)
    }

    /// Admins see every session; users only the ones they own.
    pub async fn list_sessions(&self, auth: &AuthContext) -> Result<Vec<ContextSession>> {
        let mut ids = self.store.smembers(SESSIONS_SET).await?;
        ids.sort();
        let mut sessions = Vec::new();
        for id in ids {
            let Some(raw) = self.store.get(&session_key(&id)).await? else {
                continue;
            };
            let session: ContextSession = serde_json::from_str(&raw)?;
            if auth.is_admin() || session.user_id.as_deref() == auth.user_id.as_deref() {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    /// `NotFound` for both missing and forbidden sessions, so callers
    /// cannot probe for existence.
    pub async fn get_session(&self, id: &str, auth: &AuthContext) -> Result<ContextSession> {
        let session = self.load(id).await?;
        if !auth.is_admin() && session.user_id.as_deref() != auth.user_id.as_deref() {
            return Err(Error::NotFound(format!("context {id}")));
        }
        Ok(session)
    }

    /// Close a session. Only allowed from idle; idempotent once closed.
    pub async fn close_session(&self, id: &str, auth: &AuthContext) -> Result<ContextSession> {
        self.get_session(id, auth).await?;
        self.update(id, |session| {
            if session.status == SessionStatus::Closed {
                return Ok(());
            }
            if session.active_message_id.is_some() {
                return Err(Error::Busy(id.to_owned()));
            }
            session.status = SessionStatus::Closed;
            session.queue.clear();
            Ok(())
        })
        .await
    }

    /// Delete a session and its history outright.
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        self.store.del(&session_key(id)).await?;
        self.store.del(&history_key(id)).await?;
        self.store.srem(SESSIONS_SET, id).await?;
        Ok(())
    }

    // ── Active-message lock ───────────────────────────────────────

    pub async fn has_active_message(&self, id: &str) -> Result<bool> {
        Ok(self.load(id).await?.active_message_id.is_some())
    }

    /// Acquire the lock: a single compare-and-swap from the observed
    /// idle record. Any failure — a racing writer or an already-held
    /// lock — surfaces as `Busy`. The expected value is the raw stored
    /// string, so the swap races only against real writers.
    pub async fn set_active_message(
        &self,
        id: &str,
        message_id: &str,
        auth: &AuthContext,
    ) -> Result<()> {
        self.get_session(id, auth).await?;
        let expected = self
            .store
            .get(&session_key(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("context {id}")))?;
        let mut locked: ContextSession = serde_json::from_str(&expected)?;
        if locked.status == SessionStatus::Closed {
            return Err(Error::Conflict(format!("context {id} is closed")));
        }
        if locked.active_message_id.is_some() {
            return Err(Error::Busy(id.to_owned()));
        }
        locked.active_message_id = Some(message_id.to_owned());
        locked.updated_at = Utc::now();
        let new = serde_json::to_string(&locked)?;
        let swapped = self
            .store
            .compare_and_swap(&session_key(id), Some(&expected), Some(&new))
            .await?;
        if !swapped {
            return Err(Error::Busy(id.to_owned()));
        }
        Ok(())
    }

    /// Release the lock and reset the cancellation flag. Idempotent.
    pub async fn clear_active_message(&self, id: &str, auth: &AuthContext) -> Result<()> {
        self.get_session(id, auth).await?;
        self.update(id, |session| {
            session.active_message_id = None;
            session.cancellation_requested = false;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Preserve a specific message id while re-entering Running state
    /// (crash recovery keeps the original id so client correlation holds).
    pub async fn force_active_message(&self, id: &str, message_id: &str) -> Result<()> {
        self.update(id, |session| {
            session.active_message_id = Some(message_id.to_owned());
            session.cancellation_requested = false;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn request_cancellation(&self, id: &str, auth: &AuthContext) -> Result<bool> {
        self.get_session(id, auth).await?;
        let session = self
            .update(id, |session| {
                if session.active_message_id.is_some() {
                    session.cancellation_requested = true;
                }
                Ok(())
            })
            .await?;
        Ok(session.cancellation_requested)
    }

    /// Polled by the inference loop at each suspension point.
    pub async fn is_cancellation_requested(&self, id: &str) -> Result<bool> {
        Ok(self.load(id).await?.cancellation_requested)
    }

    // ── Queue ─────────────────────────────────────────────────────

    pub async fn enqueue_message(
        &self,
        id: &str,
        message: &str,
        source_id: &str,
        auth: &AuthContext,
    ) -> Result<usize> {
        self.get_session(id, auth).await?;
        let session = self
            .update(id, |session| {
                if session.status == SessionStatus::Closed {
                    return Err(Error::Conflict(format!("context {id} is closed")));
                }
                session.queue.push(QueuedMessage {
                    message: message.to_owned(),
                    source_id: source_id.to_owned(),
                    enqueued_at: Utc::now(),
                });
                Ok(())
            })
            .await?;
        Ok(session.queue.len())
    }

    pub async fn pop_next_message(
        &self,
        id: &str,
        auth: &AuthContext,
    ) -> Result<Option<QueuedMessage>> {
        self.get_session(id, auth).await?;
        let mut popped = None;
        self.update(id, |session| {
            // Reset on every CAS retry so a lost race cannot leak a
            // message that stayed in the queue.
            popped = None;
            if !session.queue.is_empty() {
                popped = Some(session.queue.remove(0));
            }
            Ok(())
        })
        .await?;
        Ok(popped)
    }

    pub async fn has_queued_messages(&self, id: &str, auth: &AuthContext) -> Result<bool> {
        Ok(!self.get_session(id, auth).await?.queue.is_empty())
    }

    // ── History ───────────────────────────────────────────────────

    /// Append a turn. Closed sessions accept no further history.
    pub async fn record_message(&self, id: &str, turn: Turn, auth: &AuthContext) -> Result<()> {
        let session = self.get_session(id, auth).await?;
        if session.status == SessionStatus::Closed {
            return Err(Error::Conflict(format!("context {id} is closed")));
        }
        for _ in 0..UPDATE_RETRIES {
            let raw = self.store.get(&history_key(id)).await?;
            let mut turns: Vec<Turn> = match &raw {
                Some(raw) => serde_json::from_str(raw)?,
                None => Vec::new(),
            };
            turns.push(turn.clone());
            let new = serde_json::to_string(&turns)?;
            if self
                .store
                .compare_and_swap(&history_key(id), raw.as_deref(), Some(&new))
                .await?
            {
                return Ok(());
            }
        }
        Err(Error::Unavailable(format!(
            "history append for {id} kept losing the write race"
        )))
    }

    pub async fn get_history(&self, id: &str, auth: &AuthContext) -> Result<Vec<Turn>> {
        self.get_session(id, auth).await?;
        let raw = self.store.get(&history_key(id)).await?;
        match raw {
            Some(raw) => serde_json::from_str(&raw).map_err(Error::Json),
            None => Ok(Vec::new()),
        }
    }

    pub async fn get_history_grouped(
        &self,
        id: &str,
        since: Option<DateTime<Utc>>,
        auth: &AuthContext,
    ) -> Result<Vec<TurnGroup>> {
        let mut turns = self.get_history(id, auth).await?;
        if let Some(since) = since {
            turns.retain(|t| t.timestamp > since);
        }
        Ok(group_turns(&turns))
    }

    // ── Recovery & cleanup ────────────────────────────────────────

    /// Sessions that were mid-turn when the process died.
    pub async fn stale_open_sessions(&self) -> Result<Vec<ContextSession>> {
        let keys = self.store.scan_prefix("sz:context:").await?;
        let mut stale = Vec::new();
        for key in keys {
            // Skip sub-keys such as history (different prefix, but be
            // permissive about future additions).
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let Ok(session) = serde_json::from_str::<ContextSession>(&raw) else {
                continue;
            };
            if session.status == SessionStatus::Open && session.active_message_id.is_some() {
                stale.push(session);
            }
        }
        Ok(stale)
    }

    /// The most recent user turn, if any — the turn recovery re-runs.
    pub async fn last_user_turn(&self, id: &str) -> Result<Option<Turn>> {
        let raw = self.store.get(&history_key(id)).await?;
        let turns: Vec<Turn> = match raw {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };
        Ok(turns.into_iter().rev().find(|t| t.role == TurnRole::User))
    }

    /// Remove test-origin sessions idle past `ttl`. Returns how many were
    /// deleted.
    pub async fn cleanup_test_sessions(&self, ttl: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl)
                .map_err(|e| Error::InvalidRequest(format!("ttl out of range: {e}")))?;
        let internal = AuthContext::internal();
        let mut removed = 0;
        for session in self.list_sessions(&internal).await? {
            let is_test = session
                .metadata
                .get("test")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if is_test && session.updated_at < cutoff && session.active_message_id.is_none() {
                self.delete_session(&session.id).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "cleaned up stale test sessions");
        }
        Ok(removed)
    }

    // ── Internals ─────────────────────────────────────────────────

    async fn load(&self, id: &str) -> Result<ContextSession> {
        let raw = self
            .store
            .get(&session_key(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("context {id}")))?;
        serde_json::from_str(&raw).map_err(Error::Json)
    }

    /// Read-modify-write with CAS retries. `f` may veto with an error.
    async fn update(
        &self,
        id: &str,
        mut f: impl FnMut(&mut ContextSession) -> Result<()>,
    ) -> Result<ContextSession> {
        for _ in 0..UPDATE_RETRIES {
            let expected = self
                .store
                .get(&session_key(id))
                .await?
                .ok_or_else(|| Error::NotFound(format!("context {id}")))?;
            let mut session: ContextSession = serde_json::from_str(&expected)?;
            f(&mut session)?;
            session.updated_at = Utc::now();
            let new = serde_json::to_string(&session)?;
            if self
                .store
                .compare_and_swap(&session_key(id), Some(&expected), Some(&new))
                .await?
            {
                return Ok(session);
            }
        }
        Err(Error::Unavailable(format!(
            "session update for {id} kept losing the write race"
        )))
    }
}
