//! Trace persistence: `sz:trace:{id}` records with a time-ordered id set.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use sz_domain::trace::Trace;
use sz_domain::{stamp, Error, Result};
use sz_store::KvStore;

const TRACES_ZSET: &str = "sz:traces";

fn trace_key(id: &str) -> String {
    format!("sz:trace:{id}")
}

pub struct TraceStore {
    kv: Arc<dyn KvStore>,
}

impl TraceStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Persist a trace, assigning id and timestamp when absent.
    pub async fn record(&self, mut trace: Trace) -> Result<Trace> {
        if trace.id.is_empty() {
            trace.id = uuid::Uuid::new_v4().to_string();
        }
        if trace.created_at.is_empty() {
            trace.created_at = stamp::now();
        }
        let raw = serde_json::to_string(&trace)?;
        self.kv.set(&trace_key(&trace.id), &raw).await?;
        let score = stamp::decode(&trace.created_at)
            .map(|ts| ts.timestamp_millis() as f64)
            .unwrap_or(0.0);
        self.kv.zadd(TRACES_ZSET, score, &trace.id).await?;
        Ok(trace)
    }

    pub async fn get(&self, id: &str) -> Result<Trace> {
        let raw = self
            .kv
            .get(&trace_key(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("trace {id}")))?;
        serde_json::from_str(&raw).map_err(Error::Json)
    }

    /// Most recent traces, optionally bounded below by `since`.
    pub async fn list(&self, since: Option<DateTime<Utc>>, limit: usize) -> Result<Vec<Trace>> {
        let ids = self.kv.zrevrange(TRACES_ZSET, limit.max(1)).await?;
        let mut traces = Vec::new();
        for id in ids {
            let Ok(trace) = self.get(&id).await else {
                continue;
            };
            if let Some(since) = since {
                match stamp::decode(&trace.created_at) {
                    Some(ts) if ts > since => {}
                    _ => continue,
                }
            }
            traces.push(trace);
        }
        Ok(traces)
    }

    /// Traces tagged with a session, newest first.
    pub async fn for_session(
        &self,
        session_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Trace>> {
        let all = self.list(since, 500).await?;
        Ok(all
            .into_iter()
            .filter(|t| t.session_id.as_deref() == Some(session_id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sz_store::MemoryStore;

    fn trace(session: &str) -> Trace {
        Trace {
            id: String::new(),
            session_id: Some(session.into()),
            entry_node: "a".into(),
            activated_by: "prompt".into(),
            activation_path: vec![],
            source_context: Default::default(),
            output_node: "b".into(),
            status: "complete".into(),
            created_at: String::new(),
        }
    }

    #[tokio::test]
    async fn record_assigns_id_and_stamp() {
        let store = TraceStore::new(Arc::new(MemoryStore::ephemeral()));
        let recorded = store.record(trace("s1")).await.unwrap();
        assert!(!recorded.id.is_empty());
        assert!(!recorded.created_at.is_empty());

        let fetched = store.get(&recorded.id).await.unwrap();
        assert_eq!(fetched.entry_node, "a");
    }

    #[tokio::test]
    async fn session_filter_and_since() {
        let store = TraceStore::new(Arc::new(MemoryStore::ephemeral()));
        store.record(trace("s1")).await.unwrap();
        store.record(trace("s2")).await.unwrap();
        store.record(trace("s1")).await.unwrap();

        let s1 = store.for_session("s1", None).await.unwrap();
        assert_eq!(s1.len(), 2);

        let future = Utc::now() + chrono::Duration::seconds(5);
        let none = store.list(Some(future), 100).await.unwrap();
        assert!(none.is_empty());
    }
}
