//! Best-effort observability store.
//!
//! Error records from failed tasks and from in-VM agents land here. Writes
//! never fail the caller: a broken observability path must not take the
//! primary action down with it.

use crate::cms::CmsStore;
use crate::models::new_entity_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::warn;

/// One error entry reported by a node agent batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentErrorEntry {
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub id: String,
    pub source: String,
    pub level: String,
    pub task_id: Option<String>,
    pub node_id: Option<String>,
    pub message: String,
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ObservabilityStore {
    cms: CmsStore,
}

impl ObservabilityStore {
    pub fn new(cms: CmsStore) -> Self {
        Self { cms }
    }

    async fn insert(
        &self,
        source: &str,
        level: &str,
        task_id: Option<&str>,
        node_id: Option<&str>,
        message: &str,
        context: Option<&str>,
    ) -> crate::Result<()> {
        sqlx::query(
            "INSERT INTO error_records (id, source, level, task_id, node_id, message, context, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(new_entity_id())
        .bind(source)
        .bind(level)
        .bind(task_id)
        .bind(node_id)
        .bind(message)
        .bind(context)
        .bind(Utc::now())
        .execute(self.cms.pool())
        .await?;
        Ok(())
    }

    /// Record a task failure. Never propagates its own failure.
    pub async fn record_task_error(&self, task_id: &str, message: &str) {
        if let Err(e) = self
            .insert("task_runner", "error", Some(task_id), None, message, None)
            .await
        {
            warn!("Observability write failed for task {}: {}", task_id, e);
        }
    }

    /// Record a batch of agent-reported errors. Never propagates.
    pub async fn record_agent_errors(&self, node_id: &str, entries: &[AgentErrorEntry]) {
        for entry in entries {
            let context = entry
                .context
                .as_ref()
                .and_then(|c| serde_json::to_string(c).ok());
            if let Err(e) = self
                .insert(
                    "vm_agent",
                    &entry.level,
                    None,
                    Some(node_id),
                    &entry.message,
                    context.as_deref(),
                )
                .await
            {
                warn!("Observability write failed for node {}: {}", node_id, e);
            }
        }
    }

    pub async fn records_for_node(&self, node_id: &str) -> crate::Result<Vec<ErrorRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM error_records WHERE node_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )
        .bind(node_id)
        .fetch_all(self.cms.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| ErrorRecord {
                id: row.get("id"),
                source: row.get("source"),
                level: row.get("level"),
                task_id: row.get("task_id"),
                node_id: row.get("node_id"),
                message: row.get("message"),
                context: row.get("context"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    pub async fn records_for_task(&self, task_id: &str) -> crate::Result<Vec<ErrorRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM error_records WHERE task_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )
        .bind(task_id)
        .fetch_all(self.cms.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| ErrorRecord {
                id: row.get("id"),
                source: row.get("source"),
                level: row.get("level"),
                task_id: row.get("task_id"),
                node_id: row.get("node_id"),
                message: row.get("message"),
                context: row.get("context"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn task_errors_are_recorded() {
        let cms = CmsStore::connect_in_memory().await.unwrap();
        let store = ObservabilityStore::new(cms);

        store.record_task_error("t-1", "node_selection failed").await;
        let records = store.records_for_task("t-1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source, "task_runner");
        assert_eq!(records[0].message, "node_selection failed");
    }

    #[tokio::test]
    async fn agent_batches_preserve_context() {
        let cms = CmsStore::connect_in_memory().await.unwrap();
        let store = ObservabilityStore::new(cms);

        store
            .record_agent_errors(
                "n-1",
                &[
                    AgentErrorEntry {
                        level: "error".to_string(),
                        message: "git clone failed".to_string(),
                        context: Some(serde_json::json!({"exit_code": 128})),
                        timestamp: None,
                    },
                    AgentErrorEntry {
                        level: "warn".to_string(),
                        message: "low disk".to_string(),
                        context: None,
                        timestamp: None,
                    },
                ],
            )
            .await;

        let records = store.records_for_node("n-1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].context.as_deref().unwrap().contains("128"));
        assert_eq!(records[1].level, "warn");
    }
}
