//! Stuck-task sweeper.
//!
//! Periodic safety net for tasks whose orchestrator instance can no longer
//! resume. The sweeper never contacts the orchestrator: it flips stale task
//! rows to failed with conditional updates and lets the orchestrator's own
//! optimistic-lock misses silence any instance that later wakes up. Each
//! pass also reaps orphaned nodes back into the warm pool, restoring the
//! warm-node invariant no matter which actor abandoned them.

use crate::cms::CmsStore;
use crate::config::SweeperConfig;
use crate::models::{ActorType, TaskStatus};
use crate::node_lifecycle::NodeLifecycleManager;
use crate::Result;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{error, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub failed_tasks: usize,
    pub reaped_nodes: usize,
}

#[derive(Clone)]
pub struct StuckTaskSweeper {
    cms: CmsStore,
    nlm: NodeLifecycleManager,
    config: SweeperConfig,
}

impl StuckTaskSweeper {
    pub fn new(cms: CmsStore, nlm: NodeLifecycleManager, config: SweeperConfig) -> Self {
        Self { cms, nlm, config }
    }

    pub async fn run(&self) {
        info!(
            "Sweeper started (interval {}s, queued deadline {}m, in-progress deadline {}m)",
            self.config.interval_secs,
            self.config.stuck_queued_timeout_minutes,
            self.config.stuck_in_progress_timeout_minutes
        );
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            match self.sweep_once().await {
                Ok(report) => {
                    if report.failed_tasks > 0 || report.reaped_nodes > 0 {
                        info!(
                            "Sweep failed {} stuck tasks, reaped {} orphaned nodes",
                            report.failed_tasks, report.reaped_nodes
                        );
                    }
                }
                Err(e) => error!("Sweep pass failed: {}", e),
            }
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let now = Utc::now();
        let queued_cutoff =
            now - ChronoDuration::minutes(self.config.stuck_queued_timeout_minutes);
        let in_progress_cutoff =
            now - ChronoDuration::minutes(self.config.stuck_in_progress_timeout_minutes);

        for task in self.cms.stuck_tasks(queued_cutoff, in_progress_cutoff).await? {
            let reason = format!(
                "task stuck in {} past the sweep deadline",
                task.status.as_str()
            );
            // Conditional: a task that moved since the query is left alone
            if self.cms.fail_task_from(&task.id, task.status, &reason).await? {
                warn!("Sweeper failed stuck task {} (was {})", task.id, task.status);
                if let Err(e) = self
                    .cms
                    .append_status_event(
                        &task.id,
                        Some(task.status),
                        TaskStatus::Failed,
                        ActorType::System,
                        Some(&reason),
                    )
                    .await
                {
                    warn!("Failed to append sweep event for task {}: {}", task.id, e);
                }
                report.failed_tasks += 1;
            }
        }

        report.reaped_nodes = self.reap_orphaned_nodes().await?;
        Ok(report)
    }

    /// Running nodes with `warm_since` cleared and no live workspace are
    /// returned to the warm pool through the lifecycle manager.
    async fn reap_orphaned_nodes(&self) -> Result<usize> {
        let cutoff =
            Utc::now() - ChronoDuration::minutes(crate::constants::ORPHAN_NODE_GRACE_MINUTES);
        let mut reaped = 0;
        for node in self.cms.orphaned_cold_nodes(cutoff).await? {
            match self.nlm.mark_idle(&node.id, &node.user_id).await {
                Ok(true) => {
                    info!("Reaped orphaned node {} back into the warm pool", node.id);
                    reaped += 1;
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to reap node {}: {}", node.id, e),
            }
        }
        Ok(reaped)
    }
}
