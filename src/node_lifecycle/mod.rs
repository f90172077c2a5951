//! Node Lifecycle Manager.
//!
//! Per-node serialisation point for the three racy warm-state transitions:
//! claiming a warm node for a task, marking a drained node warm, and rolling
//! a claim back. Only one transition runs at a time for a given node; the
//! underlying CMS updates are conditional as a second line of defence.

use crate::cms::CmsStore;
use crate::models::NodeStatus;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimOutcome {
    pub claimed: bool,
}

#[derive(Clone)]
pub struct NodeLifecycleManager {
    cms: CmsStore,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl NodeLifecycleManager {
    pub fn new(cms: CmsStore) -> Self {
        Self {
            cms,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn node_lock(&self, node_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Atomically claim a warm node for a task.
    ///
    /// Claims succeed only when the node is running, warm, and hosts no live
    /// workspace. A lost race reports `claimed: false` rather than erroring
    /// so the caller can move on to the next candidate.
    pub async fn try_claim(&self, node_id: &str, task_id: &str) -> Result<ClaimOutcome> {
        let lock = self.node_lock(node_id).await;
        let _guard = lock.lock().await;

        let Some(node) = self.cms.get_node(node_id).await? else {
            debug!("Claim for task {} skipped missing node {}", task_id, node_id);
            return Ok(ClaimOutcome { claimed: false });
        };
        if node.status != NodeStatus::Running || node.warm_since.is_none() {
            return Ok(ClaimOutcome { claimed: false });
        }
        if self.cms.count_any_live_workspaces_on_node(node_id).await? > 0 {
            warn!(
                "Node {} is warm but has live workspaces, refusing claim",
                node_id
            );
            return Ok(ClaimOutcome { claimed: false });
        }

        let claimed = self.cms.claim_warm_node(node_id).await?;
        if claimed {
            info!("Task {} claimed warm node {}", task_id, node_id);
        }
        Ok(ClaimOutcome { claimed })
    }

    /// Mark a node warm once its last workspace is gone.
    ///
    /// Used when a workspace is destroyed, or when a failed auto-provisioned
    /// task never created one. A node that still hosts a live workspace is
    /// left untouched.
    pub async fn mark_idle(&self, node_id: &str, user_id: &str) -> Result<bool> {
        let lock = self.node_lock(node_id).await;
        let _guard = lock.lock().await;

        if self.cms.count_any_live_workspaces_on_node(node_id).await? > 0 {
            debug!(
                "Node {} still has live workspaces, not marking warm (requested by user {})",
                node_id, user_id
            );
            return Ok(false);
        }

        let marked = self.cms.mark_node_warm(node_id).await?;
        if marked {
            info!("Node {} marked warm", node_id);
        }
        Ok(marked)
    }

    /// Inverse of a claim, for rollback when a claimed node was never used.
    pub async fn release(&self, node_id: &str) -> Result<bool> {
        let lock = self.node_lock(node_id).await;
        let _guard = lock.lock().await;

        if self.cms.count_any_live_workspaces_on_node(node_id).await? > 0 {
            return Ok(false);
        }
        self.cms.mark_node_warm(node_id).await
    }
}
