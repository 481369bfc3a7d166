use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::identity::ActorIdentity;
use crate::jobs::now_ms;
use crate::ports::audit::AuditLogSink;

pub const DEFAULT_AUDIT_LIMIT: usize = 100;
pub const MAX_AUDIT_LIMIT: usize = 1_000;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub entry_id: String,
    pub gathering_id: Option<String>,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub actor_id: String,
    pub origin_ip: Option<String>,
    pub user_agent: Option<String>,
    pub details: serde_json::Value,
    pub created_at_ms: i64,
}

impl AuditEntry {
    pub fn new(entity_type: &str, entity_id: &str, action: &str, actor: &ActorIdentity) -> Self {
        Self {
            entry_id: crate::util::uuid_v7_without_dashes(),
            gathering_id: None,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            action: action.to_string(),
            actor_id: actor.user_id.clone(),
            origin_ip: actor.origin_ip.clone(),
            user_agent: actor.user_agent.clone(),
            details: serde_json::Value::Null,
            created_at_ms: now_ms(),
        }
    }

    pub fn in_gathering(mut self, gathering_id: &str) -> Self {
        self.gathering_id = Some(gathering_id.to_string());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Appends audit entries without ever failing the operation being audited.
#[derive(Clone)]
pub struct AuditTrail {
    sink: Arc<dyn AuditLogSink>,
}

impl AuditTrail {
    pub fn new(sink: Arc<dyn AuditLogSink>) -> Self {
        Self { sink }
    }

    pub async fn record(&self, entry: AuditEntry) {
        if let Err(err) = self.sink.append(&entry).await {
            tracing::warn!(
                entity_type = %entry.entity_type,
                entity_id = %entry.entity_id,
                action = %entry.action,
                error = %err,
                "audit append failed"
            );
        }
    }

    pub async fn list(
        &self,
        gathering_id: &str,
        limit: Option<usize>,
    ) -> DomainResult<Vec<AuditEntry>> {
        let limit = limit
            .filter(|limit| *limit > 0)
            .unwrap_or(DEFAULT_AUDIT_LIMIT)
            .min(MAX_AUDIT_LIMIT);
        self.sink.list_by_gathering(gathering_id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DomainError;
    use crate::ports::BoxFuture;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        fail: bool,
        entries: Mutex<Vec<AuditEntry>>,
        limits: Mutex<Vec<usize>>,
    }

    impl AuditLogSink for RecordingSink {
        fn append(&self, entry: &AuditEntry) -> BoxFuture<'_, DomainResult<()>> {
            let entry = entry.clone();
            Box::pin(async move {
                if self.fail {
                    return Err(DomainError::Collaborator("audit store down".into()));
                }
                self.entries.lock().expect("lock").push(entry);
                Ok(())
            })
        }

        fn list_by_gathering(
            &self,
            _gathering_id: &str,
            limit: usize,
        ) -> BoxFuture<'_, DomainResult<Vec<AuditEntry>>> {
            Box::pin(async move {
                self.limits.lock().expect("lock").push(limit);
                Ok(Vec::new())
            })
        }
    }

    #[tokio::test]
    async fn failing_sink_does_not_propagate() {
        let trail = AuditTrail::new(Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        }));
        let actor = ActorIdentity::with_user_id("manager-1");
        trail
            .record(AuditEntry::new("ballot", "b-1", "submitted", &actor))
            .await;
    }

    #[tokio::test]
    async fn entries_carry_actor_origin_and_details() {
        let sink = Arc::new(RecordingSink::default());
        let trail = AuditTrail::new(sink.clone());
        let actor = ActorIdentity::with_user_id("owner-9")
            .with_origin(Some("10.0.0.4".into()), Some("curl/8".into()));
        trail
            .record(
                AuditEntry::new("ballot", "b-1", "submitted", &actor)
                    .in_gathering("g-1")
                    .with_details(json!({"hash": "abc"})),
            )
            .await;

        let entries = sink.entries.lock().expect("lock");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].gathering_id.as_deref(), Some("g-1"));
        assert_eq!(entries[0].origin_ip.as_deref(), Some("10.0.0.4"));
        assert_eq!(entries[0].details["hash"], "abc");
    }

    #[tokio::test]
    async fn list_limit_defaults_and_caps() {
        let sink = Arc::new(RecordingSink::default());
        let trail = AuditTrail::new(sink.clone());
        trail.list("g-1", None).await.expect("list");
        trail.list("g-1", Some(0)).await.expect("list");
        trail.list("g-1", Some(50_000)).await.expect("list");
        trail.list("g-1", Some(5)).await.expect("list");
        assert_eq!(*sink.limits.lock().expect("lock"), vec![100, 100, 1_000, 5]);
    }
}
