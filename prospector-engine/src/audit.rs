//! Append-only audit trail
//!
//! Every operator command and engine-driven lifecycle change lands here.
//! Recording is best-effort relative to the command: a failed append is
//! logged loudly but never fails the operation that triggered it.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::Result;
use crate::model::AuditRecord;
use crate::store::EngineStore;

/// Writer/reader over the store's audit records
#[derive(Clone)]
pub struct AuditTrail {
    store: Arc<dyn EngineStore>,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }

    /// Record an action; errors are logged and swallowed
    pub async fn record(
        &self,
        actor: Option<&str>,
        action: &str,
        entity_kind: &str,
        entity_id: Option<Uuid>,
        details: serde_json::Value,
    ) {
        let record = AuditRecord {
            id: Uuid::new_v4(),
            actor: actor.map(str::to_string),
            action: action.to_string(),
            entity_kind: entity_kind.to_string(),
            entity_id,
            details,
            ts: Utc::now(),
        };
        if let Err(e) = self.store.append_audit(record).await {
            tracing::error!(action, error = %e, "Failed to append audit record");
        }
    }

    /// Most recent records, optionally scoped to one entity
    pub async fn list(&self, entity_id: Option<Uuid>, limit: usize) -> Result<Vec<AuditRecord>> {
        self.store.list_audit(entity_id, limit).await
    }
}
