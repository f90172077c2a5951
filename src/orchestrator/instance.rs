//! Per-task runner instance.
//!
//! One instance owns one task. Commands and alarm ticks are serialised
//! through the instance loop: at most one of them runs at any moment, so
//! step handlers never interleave. The instance carries at most one pending
//! alarm; arming a new one replaces the old.

use super::state::{TaskRunnerState, TaskStep, WorkspaceReadyStatus};
use super::RunnerDeps;
use crate::error::ErrorClass;
use crate::models::{ActorType, TaskStatus};
use crate::{Result, StratoError};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub(crate) enum RunnerCommand {
    /// Duplicate start for an already-initialised instance.
    Start,
    WorkspaceReady {
        status: WorkspaceReadyStatus,
        error_message: Option<String>,
    },
}

pub(crate) struct RunnerInstance {
    pub(super) deps: Arc<RunnerDeps>,
    pub(super) state: TaskRunnerState,
    pub(super) alarm: Option<Instant>,
    rx: mpsc::UnboundedReceiver<RunnerCommand>,
}

async fn wait_for_alarm(alarm: Option<Instant>) {
    match alarm {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl RunnerInstance {
    pub(crate) fn new(
        deps: Arc<RunnerDeps>,
        state: TaskRunnerState,
        rx: mpsc::UnboundedReceiver<RunnerCommand>,
    ) -> Self {
        // A fresh or resumed instance always gets an immediate tick
        let alarm = (!state.completed).then(Instant::now);
        Self {
            deps,
            state,
            alarm,
            rx,
        }
    }

    pub(crate) async fn run(mut self) {
        let task_id = self.state.task_id.clone();
        debug!(
            "Runner instance for task {} starting at step {}",
            task_id, self.state.current_step
        );

        while !self.state.completed {
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        // All senders dropped: the runtime is shutting down
                        None => break,
                    }
                }
                _ = wait_for_alarm(self.alarm) => {
                    self.alarm = None;
                    self.tick().await;
                }
            }
        }

        debug!("Runner instance for task {} finished", task_id);
    }

    async fn handle_command(&mut self, command: RunnerCommand) {
        match command {
            RunnerCommand::Start => {
                // Start is idempotent: the instance already exists
                info!(
                    "Task {} already initialised at step {}, ignoring duplicate start",
                    self.state.task_id, self.state.current_step
                );
            }
            RunnerCommand::WorkspaceReady {
                status,
                error_message,
            } => self.handle_workspace_ready(status, error_message).await,
        }
    }

    /// Store the workspace-ready signal; fire the alarm immediately when the
    /// runner is already waiting on it.
    async fn handle_workspace_ready(
        &mut self,
        status: WorkspaceReadyStatus,
        error_message: Option<String>,
    ) {
        if self.state.completed {
            debug!(
                "Task {} is terminal, dropping workspace-ready callback",
                self.state.task_id
            );
            return;
        }

        // A stored error signal is final; later callbacks cannot soften it
        if self.state.workspace_ready_status == Some(WorkspaceReadyStatus::Error)
            && status != WorkspaceReadyStatus::Error
        {
            warn!(
                "Task {} already has an error signal, ignoring {:?} callback",
                self.state.task_id, status
            );
            return;
        }

        info!(
            "Task {} received workspace-ready callback: {:?}",
            self.state.task_id, status
        );
        self.state.workspace_ready_received = true;
        self.state.workspace_ready_status = Some(status);
        self.state.workspace_error_message = error_message;

        if let Err(e) = self.persist().await {
            // The signal survives in memory; the fallback CMS read covers a
            // crash before the next persist
            warn!(
                "Failed to persist workspace-ready signal for task {}: {}",
                self.state.task_id, e
            );
        }

        if self.state.current_step == TaskStep::WorkspaceReady {
            self.alarm = Some(Instant::now());
        }
    }

    /// One alarm tick: advance at most one step or schedule the next alarm.
    async fn tick(&mut self) {
        let step = self.state.current_step;
        let result = self.dispatch_step().await;

        match result {
            Ok(()) => {}
            Err(e) => self.handle_step_error(step, e).await,
        }
    }

    async fn dispatch_step(&mut self) -> Result<()> {
        match self.state.current_step {
            TaskStep::NodeSelection => self.step_node_selection().await,
            TaskStep::NodeProvisioning => self.step_node_provisioning().await,
            TaskStep::NodeAgentReady => self.step_node_agent_ready().await,
            TaskStep::WorkspaceCreation => self.step_workspace_creation().await,
            TaskStep::WorkspaceReady => self.step_workspace_ready().await,
            TaskStep::AgentSession => self.step_agent_session().await,
        }
    }

    async fn handle_step_error(&mut self, step: TaskStep, error: StratoError) {
        match error.classify() {
            ErrorClass::Transient => {
                self.state.retry_count += 1;
                if self.state.retry_count <= self.deps.config.step_max_retries {
                    let delay = self.backoff_delay();
                    warn!(
                        "Task {} step {} hit transient error (retry {}/{}), backing off {:?}: {}",
                        self.state.task_id,
                        step,
                        self.state.retry_count,
                        self.deps.config.step_max_retries,
                        delay,
                        error
                    );
                    if let Err(e) = self.persist().await {
                        warn!(
                            "Failed to persist retry count for task {}: {}",
                            self.state.task_id, e
                        );
                    }
                    self.alarm = Some(Instant::now() + delay);
                } else {
                    error!(
                        "Task {} step {} exhausted retries: {}",
                        self.state.task_id, step, error
                    );
                    self.fail_task(&format!("step {step} exhausted retries: {error}"))
                        .await;
                }
            }
            ErrorClass::Permanent => {
                error!(
                    "Task {} step {} failed permanently: {}",
                    self.state.task_id, step, error
                );
                self.fail_task(&format!("step {step} failed: {error}")).await;
            }
        }
    }

    fn backoff_delay(&self) -> Duration {
        let base = self.deps.config.retry_base_delay_ms;
        let max = self.deps.config.retry_max_delay_ms;
        let exp = base.saturating_mul(1u64 << self.state.retry_count.min(16));
        let jitter = rand::thread_rng().gen_range(0..250);
        Duration::from_millis(exp.min(max) + jitter)
    }

    // ---- state helpers used by the step handlers ----

    pub(super) async fn persist(&self) -> Result<()> {
        let json = serde_json::to_string(&self.state)?;
        self.deps
            .cms
            .save_runner_state(&self.state.task_id, &json)
            .await
    }

    /// Move to the next step and tick again immediately.
    pub(super) async fn advance_to(&mut self, next: TaskStep) -> Result<()> {
        if !self.state.current_step.can_advance_to(next) {
            return Err(StratoError::CorruptState(format!(
                "illegal step advance {} -> {} for task {}",
                self.state.current_step, next, self.state.task_id
            )));
        }
        info!(
            "Task {} advancing {} -> {}",
            self.state.task_id, self.state.current_step, next
        );
        self.state.current_step = next;
        self.state.retry_count = 0;
        self.state.last_step_at = chrono::Utc::now().timestamp_millis();
        self.persist().await?;
        self.alarm = Some(Instant::now());
        Ok(())
    }

    /// Re-run the current step after a delay.
    pub(super) fn rearm(&mut self, delay: Duration) {
        self.alarm = Some(Instant::now() + delay);
    }

    /// Successful terminal: the runner is done with this task.
    pub(super) async fn complete(&mut self) -> Result<()> {
        self.state.completed = true;
        self.persist().await
    }

    /// Another actor (usually the sweeper) won an optimistic lock on the
    /// task row; this runner abandons the task without cleanup.
    pub(super) async fn abort_preempted(&mut self, transition: &str) {
        warn!(
            "Task {} aborted_by_recovery at {}: optimistic lock miss",
            self.state.task_id, transition
        );
        self.state.completed = true;
        if let Err(e) = self.persist().await {
            warn!(
                "Failed to persist pre-empted state for task {}: {}",
                self.state.task_id, e
            );
        }
    }

    // ---- failure path ----

    /// Fail the task and clean up, idempotently. Every sub-action is
    /// best-effort: the task row is the authoritative outcome.
    pub(super) async fn fail_task(&mut self, message: &str) {
        let task_id = self.state.task_id.clone();

        let prior = match self
            .deps
            .cms
            .fail_task_if_not_terminal(&task_id, message)
            .await
        {
            Ok(prior) => prior,
            Err(e) => {
                error!("Failed to mark task {} failed: {}", task_id, e);
                None
            }
        };

        match prior {
            None => {
                // Already terminal (or gone): nothing more to own
                debug!("Task {} already terminal, skipping failure cleanup", task_id);
            }
            Some(prior_status) => {
                if let Err(e) = self
                    .deps
                    .cms
                    .append_status_event(
                        &task_id,
                        Some(prior_status),
                        TaskStatus::Failed,
                        ActorType::System,
                        Some(message),
                    )
                    .await
                {
                    warn!("Failed to append failure event for task {}: {}", task_id, e);
                }

                self.deps
                    .observability
                    .record_task_error(&task_id, message)
                    .await;

                self.cleanup_on_failure().await;
            }
        }

        self.state.completed = true;
        if let Err(e) = self.persist().await {
            warn!("Failed to persist failed state for task {}: {}", task_id, e);
        }
    }

    async fn cleanup_on_failure(&mut self) {
        let task_id = self.state.task_id.clone();

        if let Some(workspace_id) = self.state.step_results.workspace_id.clone() {
            // Stop the workspace on its node, then in the CMS
            match self.deps.cms.get_workspace(&workspace_id).await {
                Ok(Some(workspace)) => {
                    if let Some(node_id) = &workspace.node_id {
                        if let Ok(Some(node)) = self.deps.cms.get_node(node_id).await {
                            if let Some(ip) = &node.ip_address {
                                if let Err(e) =
                                    self.deps.agent.stop_workspace(ip, &workspace_id).await
                                {
                                    warn!(
                                        "Best-effort workspace stop failed for task {}: {}",
                                        task_id, e
                                    );
                                }
                            }
                        }
                    }
                    if let Err(e) = self
                        .deps
                        .cms
                        .set_workspace_status(&workspace_id, crate::models::WorkspaceStatus::Stopped)
                        .await
                    {
                        warn!(
                            "Best-effort workspace status update failed for task {}: {}",
                            task_id, e
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Cleanup workspace lookup failed for task {}: {}", task_id, e),
            }
        }

        // Auto-provisioned nodes return to the warm pool once drained
        if self.state.step_results.auto_provisioned {
            if let Some(node_id) = self.state.step_results.node_id.clone() {
                if let Err(e) = self
                    .deps
                    .nlm
                    .mark_idle(&node_id, &self.state.user_id)
                    .await
                {
                    warn!(
                        "Best-effort warm mark failed for node {} (task {}): {}",
                        node_id, task_id, e
                    );
                }
            }
        }
    }
}
