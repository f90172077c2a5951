//! Task orchestration engine.
//!
//! For each submitted task a dedicated runner instance drives the node /
//! workspace / agent-session pipeline from `queued` to `in_progress` or
//! `failed`, surviving process restarts through its persisted state record.
//! The runtime here is the registry: it spawns instances on demand, routes
//! callbacks to them, and respawns incomplete instances at startup.

mod instance;
mod state;
mod steps;

#[cfg(test)]
mod tests;

pub use state::{StepResults, TaskRunConfig, TaskRunnerState, TaskStep, WorkspaceReadyStatus};

use crate::cms::CmsStore;
use crate::config::TaskRunnerConfig;
use crate::node_agent::NodeAgent;
use crate::node_lifecycle::NodeLifecycleManager;
use crate::observability::ObservabilityStore;
use crate::provider::CloudProvider;
use crate::{Result, StratoError};
use async_trait::async_trait;
use instance::{RunnerCommand, RunnerInstance};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

/// Link surface into the per-project session stores. Kept as a seam so the
/// orchestrator does not depend on the session-store runtime directly.
#[async_trait]
pub trait SessionLinker: Send + Sync {
    async fn link_workspace_to_session(
        &self,
        project_id: &str,
        session_id: &str,
        workspace_id: &str,
    ) -> Result<()>;
}

pub(crate) struct RunnerDeps {
    pub cms: CmsStore,
    pub nlm: NodeLifecycleManager,
    pub provider: Arc<dyn CloudProvider>,
    pub agent: Arc<dyn NodeAgent>,
    pub sessions: Option<Arc<dyn SessionLinker>>,
    pub observability: ObservabilityStore,
    pub config: TaskRunnerConfig,
    /// Base URL the node agent calls back on, e.g. `http://10.0.0.1:3100`.
    pub callback_base_url: String,
}

#[derive(Clone)]
pub struct TaskOrchestrator {
    deps: Arc<RunnerDeps>,
    instances: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<RunnerCommand>>>>,
}

impl TaskOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cms: CmsStore,
        nlm: NodeLifecycleManager,
        provider: Arc<dyn CloudProvider>,
        agent: Arc<dyn NodeAgent>,
        sessions: Option<Arc<dyn SessionLinker>>,
        config: TaskRunnerConfig,
        callback_base_url: String,
    ) -> Self {
        let observability = ObservabilityStore::new(cms.clone());
        Self {
            deps: Arc::new(RunnerDeps {
                cms,
                nlm,
                provider,
                agent,
                sessions,
                observability,
                config,
                callback_base_url,
            }),
            instances: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start driving a task. Idempotent: a task that already has a live
    /// instance or a persisted record is left to that instance.
    pub async fn start(
        &self,
        task_id: &str,
        project_id: &str,
        user_id: &str,
        config: TaskRunConfig,
    ) -> Result<()> {
        {
            let instances = self.instances.lock().await;
            if let Some(sender) = instances.get(task_id) {
                let _ = sender.send(RunnerCommand::Start);
                return Ok(());
            }
        }

        let state = match self.deps.cms.load_runner_state(task_id).await? {
            Some(json) => {
                info!("Task {} already has a persisted runner record", task_id);
                serde_json::from_str(&json)?
            }
            None => {
                let state = TaskRunnerState::new(task_id, project_id, user_id, config);
                self.deps
                    .cms
                    .save_runner_state(task_id, &serde_json::to_string(&state)?)
                    .await?;
                state
            }
        };

        if state.completed {
            info!("Task {} runner already completed, nothing to start", task_id);
            return Ok(());
        }

        self.spawn_instance(state).await;
        Ok(())
    }

    /// Route a workspace-ready callback to the owning instance. The signal
    /// is persisted by the instance; a terminal instance ignores it.
    pub async fn advance_workspace_ready(
        &self,
        task_id: &str,
        status: WorkspaceReadyStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        {
            let instances = self.instances.lock().await;
            if let Some(sender) = instances.get(task_id) {
                sender
                    .send(RunnerCommand::WorkspaceReady {
                        status,
                        error_message,
                    })
                    .map_err(|_| StratoError::TaskExecution {
                        task_id: task_id.to_string(),
                        message: "runner instance is shutting down".to_string(),
                    })?;
                return Ok(());
            }
        }

        // No live instance: revive from the persisted record so the signal
        // is not lost (the process may have restarted mid-pipeline)
        let Some(json) = self.deps.cms.load_runner_state(task_id).await? else {
            return Err(StratoError::NotFound(format!("runner for task {task_id}")));
        };
        let state: TaskRunnerState = serde_json::from_str(&json)?;
        if state.completed {
            info!(
                "Task {} is terminal, ignoring workspace-ready callback",
                task_id
            );
            return Ok(());
        }

        let sender = self.spawn_instance(state).await;
        let _ = sender.send(RunnerCommand::WorkspaceReady {
            status,
            error_message,
        });
        Ok(())
    }

    /// The persisted runner record, if any.
    pub async fn get_status(&self, task_id: &str) -> Result<Option<TaskRunnerState>> {
        let Some(json) = self.deps.cms.load_runner_state(task_id).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// Respawn every incomplete runner after a process restart. Each resumes
    /// at its persisted step with an immediate alarm.
    pub async fn resume_incomplete(&self) -> Result<usize> {
        let mut resumed = 0;
        for (task_id, json) in self.deps.cms.all_runner_states().await? {
            let state: TaskRunnerState = match serde_json::from_str(&json) {
                Ok(state) => state,
                Err(e) => {
                    warn!("Skipping unreadable runner record for task {}: {}", task_id, e);
                    continue;
                }
            };
            if state.completed {
                continue;
            }
            let instances = self.instances.lock().await;
            if instances.contains_key(&task_id) {
                continue;
            }
            drop(instances);
            info!(
                "Resuming task {} at step {} after restart",
                task_id, state.current_step
            );
            self.spawn_instance(state).await;
            resumed += 1;
        }
        Ok(resumed)
    }

    async fn spawn_instance(
        &self,
        state: TaskRunnerState,
    ) -> mpsc::UnboundedSender<RunnerCommand> {
        let task_id = state.task_id.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut instances = self.instances.lock().await;
        if let Some(existing) = instances.get(&task_id) {
            // Raced with another caller; keep the existing instance
            return existing.clone();
        }
        instances.insert(task_id.clone(), tx.clone());
        drop(instances);

        let runner = RunnerInstance::new(self.deps.clone(), state, rx);
        let registry = self.instances.clone();
        tokio::spawn(async move {
            runner.run().await;
            registry.lock().await.remove(&task_id);
        });

        tx
    }
}
