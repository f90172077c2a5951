//! Step handlers for the task runner.
//!
//! Each step performs at most one external side effect before persisting its
//! result, and is replayable from the persisted record plus the CMS: re-entry
//! after a crash observes prior side effects (by id or CMS lookup) instead of
//! repeating them.

use super::instance::RunnerInstance;
use super::state::{TaskStep, WorkspaceReadyStatus};
use crate::config::TaskRunnerConfig;
use crate::models::{ActorType, Node, NodeStatus, TaskStatus, WorkspaceStatus};
use crate::node_agent::{CreateWorkspaceRequest, SpawnSessionRequest};
use crate::provider::CreateInstanceRequest;
use crate::{Result, StratoError};
use tracing::{debug, info, warn};

/// Rank a warm candidate against the requested shape; lower is better.
fn warm_preference_rank(node: &Node, vm_size: &str, vm_location: &str) -> u8 {
    let size = node.vm_size == vm_size;
    let location = node.vm_location == vm_location;
    match (size, location) {
        (true, true) => 0,
        (false, true) => 1,
        (true, false) => 2,
        (false, false) => 3,
    }
}

/// Weighted load score for capacity placement; lower is better. Nodes that
/// never reported metrics sort to the back but stay eligible.
fn capacity_score(node: &Node) -> f64 {
    match &node.last_metrics {
        Some(m) => 0.4 * m.cpu_load_avg1 + 0.6 * m.memory_percent,
        None => 100.0,
    }
}

/// A node is over its metric thresholds only when metrics are present.
fn over_thresholds(node: &Node, config: &TaskRunnerConfig) -> bool {
    match &node.last_metrics {
        Some(m) => {
            m.cpu_load_avg1 >= config.node_cpu_threshold_percent
                || m.memory_percent >= config.node_memory_threshold_percent
        }
        None => false,
    }
}

fn order_capacity_candidates(candidates: &mut [Node], vm_size: &str, vm_location: &str) {
    candidates.sort_by(|a, b| {
        let a_key = (
            a.vm_location != vm_location,
            a.vm_size != vm_size,
            capacity_score(a),
        );
        let b_key = (
            b.vm_location != vm_location,
            b.vm_size != vm_size,
            capacity_score(b),
        );
        a_key
            .partial_cmp(&b_key)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

impl RunnerInstance {
    // ---- node_selection ----

    pub(super) async fn step_node_selection(&mut self) -> Result<()> {
        let task_id = self.state.task_id.clone();
        let user_id = self.state.user_id.clone();
        let vm_size = self.state.config.vm_size.clone();
        let vm_location = self.state.config.vm_location.clone();

        // Pinned node requested by the user
        if let Some(preferred) = self.state.config.preferred_node_id.clone() {
            let node = self
                .deps
                .cms
                .get_node(&preferred)
                .await?
                .ok_or_else(|| StratoError::NotFound(format!("preferred node {preferred}")))?;
            if node.status != NodeStatus::Running {
                return Err(StratoError::Validation(format!(
                    "preferred node {preferred} is {} rather than running",
                    node.status.as_str()
                )));
            }
            if node.warm_since.is_some() {
                // Keep the warm invariant: a pinned warm node must be claimed
                let _ = self.deps.nlm.try_claim(&preferred, &task_id).await?;
            }
            self.state.step_results.node_id = Some(preferred);
            return self.advance_to(TaskStep::WorkspaceCreation).await;
        }

        // Warm claim: cheapest path, first successful claim wins
        let mut warm = self.deps.cms.warm_nodes_for_user(&user_id).await?;
        warm.sort_by_key(|n| warm_preference_rank(n, &vm_size, &vm_location));
        for node in warm {
            if self.deps.nlm.try_claim(&node.id, &task_id).await?.claimed {
                info!("Task {} placed on warm node {}", task_id, node.id);
                self.state.step_results.node_id = Some(node.id);
                return self.advance_to(TaskStep::WorkspaceCreation).await;
            }
        }

        // Capacity search across busy nodes
        let mut candidates = Vec::new();
        for node in self.deps.cms.placeable_nodes_for_user(&user_id).await? {
            let live = self
                .deps
                .cms
                .count_live_workspaces_on_node(&node.id, &user_id)
                .await?;
            if live >= self.deps.config.max_workspaces_per_node {
                continue;
            }
            if over_thresholds(&node, &self.deps.config) {
                continue;
            }
            candidates.push(node);
        }
        order_capacity_candidates(&mut candidates, &vm_size, &vm_location);

        for node in candidates {
            if node.warm_since.is_some()
                && !self.deps.nlm.try_claim(&node.id, &task_id).await?.claimed
            {
                // Lost a race for a warm node that slipped into the
                // capacity list; move on
                continue;
            }
            info!("Task {} placed on node {} by capacity", task_id, node.id);
            self.state.step_results.node_id = Some(node.id);
            return self.advance_to(TaskStep::WorkspaceCreation).await;
        }

        debug!("Task {} found no placeable node, provisioning", task_id);
        self.advance_to(TaskStep::NodeProvisioning).await
    }

    // ---- node_provisioning ----

    pub(super) async fn step_node_provisioning(&mut self) -> Result<()> {
        if let Some(node_id) = self.state.step_results.node_id.clone() {
            return self.poll_provisioned_node(&node_id).await;
        }

        let user_id = self.state.user_id.clone();
        let owned = self.deps.cms.count_user_nodes(&user_id).await?;
        if owned >= self.deps.config.max_nodes_per_user {
            return Err(StratoError::LimitExceeded(format!(
                "user {user_id} already has {owned} nodes"
            )));
        }

        let node = self
            .deps
            .cms
            .insert_node(
                &user_id,
                &self.state.config.vm_size,
                &self.state.config.vm_location,
                NodeStatus::Pending,
            )
            .await?;

        // Persist the accumulated result before touching the provider so a
        // crash resumes into the poll path instead of double-provisioning
        self.state.step_results.node_id = Some(node.id.clone());
        self.state.step_results.auto_provisioned = true;
        self.persist().await?;
        self.deps
            .cms
            .set_task_auto_provisioned_node(&self.state.task_id, &node.id)
            .await?;

        let instance = self
            .deps
            .provider
            .create_instance(CreateInstanceRequest {
                name: node.id.clone(),
                size: self.state.config.vm_size.clone(),
                location: self.state.config.vm_location.clone(),
            })
            .await?;
        self.deps
            .cms
            .set_node_provider_instance(&node.id, &instance.id, instance.public_ip.as_deref())
            .await?;

        if instance.status == "running" {
            self.deps
                .cms
                .set_node_status(&node.id, NodeStatus::Running)
                .await?;
            return self.advance_to(TaskStep::NodeAgentReady).await;
        }

        self.rearm(self.deps.config.provision_poll_interval());
        Ok(())
    }

    async fn poll_provisioned_node(&mut self, node_id: &str) -> Result<()> {
        let node = self
            .deps
            .cms
            .get_node(node_id)
            .await?
            .ok_or_else(|| StratoError::CorruptState(format!("provisioning node {node_id} vanished")))?;

        match node.status {
            NodeStatus::Running => return self.advance_to(TaskStep::NodeAgentReady).await,
            NodeStatus::Error | NodeStatus::Stopped => {
                return Err(StratoError::ProvisioningFailed(format!(
                    "node {node_id} entered {} during provisioning",
                    node.status.as_str()
                )));
            }
            NodeStatus::Pending => {}
        }

        let Some(instance_id) = node.provider_instance_id.clone() else {
            // Crash landed between the node insert and the provider call.
            // Instance creation is idempotent by name, so ask again.
            let instance = self
                .deps
                .provider
                .create_instance(CreateInstanceRequest {
                    name: node_id.to_string(),
                    size: self.state.config.vm_size.clone(),
                    location: self.state.config.vm_location.clone(),
                })
                .await?;
            self.deps
                .cms
                .set_node_provider_instance(node_id, &instance.id, instance.public_ip.as_deref())
                .await?;
            self.rearm(self.deps.config.provision_poll_interval());
            return Ok(());
        };

        let instance = self.deps.provider.get_instance(&instance_id).await?;
        match instance.status.as_str() {
            "running" => {
                if let Some(ip) = instance.public_ip.as_deref() {
                    self.deps
                        .cms
                        .set_node_provider_instance(node_id, &instance_id, Some(ip))
                        .await?;
                }
                self.deps
                    .cms
                    .set_node_status(node_id, NodeStatus::Running)
                    .await?;
                self.advance_to(TaskStep::NodeAgentReady).await
            }
            "error" => {
                self.deps
                    .cms
                    .set_node_status(node_id, NodeStatus::Error)
                    .await?;
                Err(StratoError::ProvisioningFailed(format!(
                    "provider reported error for instance {instance_id}"
                )))
            }
            _ => {
                self.rearm(self.deps.config.provision_poll_interval());
                Ok(())
            }
        }
    }

    // ---- node_agent_ready ----

    pub(super) async fn step_node_agent_ready(&mut self) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        if self.state.agent_ready_started_at.is_none() {
            self.state.agent_ready_started_at = Some(now);
            self.persist().await?;
        }

        let started = self.state.agent_ready_started_at.unwrap_or(now);
        if now - started > self.deps.config.agent_ready_timeout_ms as i64 {
            return Err(StratoError::Timeout {
                message: format!(
                    "agent on node {:?} not ready within {}ms",
                    self.state.step_results.node_id, self.deps.config.agent_ready_timeout_ms
                ),
            });
        }

        let node = self.require_node().await?;
        match node.ip_address.as_deref() {
            Some(ip) => match self.deps.agent.health_check(ip).await {
                Ok(()) => return self.advance_to(TaskStep::WorkspaceCreation).await,
                Err(e) => {
                    debug!(
                        "Agent on node {} not ready yet for task {}: {}",
                        node.id, self.state.task_id, e
                    );
                }
            },
            None => debug!("Node {} has no address yet", node.id),
        }

        self.rearm(self.deps.config.agent_poll_interval());
        Ok(())
    }

    // ---- workspace_creation ----

    pub(super) async fn step_workspace_creation(&mut self) -> Result<()> {
        let task_id = self.state.task_id.clone();
        let task = self
            .deps
            .cms
            .get_task(&task_id)
            .await?
            .ok_or_else(|| StratoError::CorruptState(format!("task {task_id} vanished")))?;

        // Crash recovery: a workspace row inserted before the last persist
        // is adopted instead of duplicated
        if self.state.step_results.workspace_id.is_none() {
            if let Some(existing) = task.workspace_id.clone() {
                info!("Task {} adopting existing workspace {}", task_id, existing);
                self.state.step_results.workspace_id = Some(existing);
                self.persist().await?;
            }
        }

        // Fully replayed: creation and delegation both already happened
        if self.state.step_results.workspace_id.is_some() && task.status == TaskStatus::Delegated {
            return self.advance_to(TaskStep::WorkspaceReady).await;
        }

        let node_id = self.state.step_results.node_id.clone().ok_or_else(|| {
            StratoError::CorruptState(format!("task {task_id} reached workspace_creation without a node"))
        })?;
        let node = self.require_node().await?;
        let node_ip = node.ip_address.clone().ok_or_else(|| {
            StratoError::NodeAgent {
                message: format!("node {node_id} has no address"),
            }
        })?;

        let workspace = match self.state.step_results.workspace_id.clone() {
            Some(workspace_id) => self
                .deps
                .cms
                .get_workspace(&workspace_id)
                .await?
                .ok_or_else(|| {
                    StratoError::CorruptState(format!("workspace {workspace_id} vanished"))
                })?,
            None => {
                let token = crate::auth::generate_callback_token();
                let workspace = self
                    .deps
                    .cms
                    .insert_workspace(
                        &self.state.user_id,
                        &self.state.project_id,
                        &node_id,
                        &self.state.config.repository,
                        &self.state.config.branch,
                        &self.state.config.task_title,
                        &token,
                    )
                    .await?;
                self.state.step_results.workspace_id = Some(workspace.id.clone());
                self.persist().await?;
                self.deps
                    .cms
                    .set_task_workspace(&task_id, &workspace.id, &self.state.output_branch())
                    .await?;
                workspace
            }
        };

        let callback_token = workspace.callback_token.clone().unwrap_or_default();
        self.deps
            .agent
            .create_workspace(
                &node_ip,
                CreateWorkspaceRequest {
                    workspace_id: workspace.id.clone(),
                    repository: self.state.config.repository.clone(),
                    branch: self.state.config.branch.clone(),
                    output_branch: self.state.output_branch(),
                    callback_url: format!(
                        "{}/workspaces/{}/ready",
                        self.deps.callback_base_url, workspace.id
                    ),
                    callback_token,
                    git_user_name: self.state.config.git_user_name.clone(),
                    git_user_email: self.state.config.git_user_email.clone(),
                    installation_id: Some(self.state.config.installation_id.clone()),
                },
            )
            .await?;

        self.link_chat_session(&workspace.id).await;

        if !self.deps.cms.mark_task_delegated(&task_id).await? {
            // The sweeper failed this task while we were working
            self.abort_preempted("delegated").await;
            return Ok(());
        }
        if let Err(e) = self
            .deps
            .cms
            .append_status_event(
                &task_id,
                Some(TaskStatus::Queued),
                TaskStatus::Delegated,
                ActorType::System,
                Some("workspace created"),
            )
            .await
        {
            warn!("Failed to append delegation event for task {}: {}", task_id, e);
        }

        self.advance_to(TaskStep::WorkspaceReady).await
    }

    /// Best-effort links between the workspace row and the chat session.
    /// Failures are logged and never fail the step.
    async fn link_chat_session(&mut self, workspace_id: &str) {
        let Some(chat_session_id) = self.state.config.chat_session_id.clone() else {
            return;
        };
        self.state.step_results.chat_session_id = Some(chat_session_id.clone());

        if let Err(e) = self
            .deps
            .cms
            .set_workspace_chat_session(workspace_id, &chat_session_id)
            .await
        {
            warn!(
                "Best-effort chat link (CMS) failed for workspace {}: {}",
                workspace_id, e
            );
        }

        if let Some(sessions) = &self.deps.sessions {
            if let Err(e) = sessions
                .link_workspace_to_session(&self.state.project_id, &chat_session_id, workspace_id)
                .await
            {
                warn!(
                    "Best-effort chat link (session store) failed for workspace {}: {}",
                    workspace_id, e
                );
            }
        }
    }

    // ---- workspace_ready ----

    pub(super) async fn step_workspace_ready(&mut self) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        if self.state.workspace_ready_started_at.is_none() {
            self.state.workspace_ready_started_at = Some(now);
            self.persist().await?;
        }

        // Primary advancement: the callback signal
        if self.state.workspace_ready_received {
            match self.state.workspace_ready_status {
                Some(WorkspaceReadyStatus::Running) | Some(WorkspaceReadyStatus::Recovery) => {
                    return self.advance_to(TaskStep::AgentSession).await;
                }
                Some(WorkspaceReadyStatus::Error) => {
                    let message = self
                        .state
                        .workspace_error_message
                        .clone()
                        .unwrap_or_else(|| "workspace reported error".to_string());
                    return Err(StratoError::WorkspaceFailed(message));
                }
                None => {}
            }
        }

        // Fallback: the CMS row, in case the callback was lost
        if let Some(workspace_id) = self.state.step_results.workspace_id.clone() {
            if let Some(workspace) = self.deps.cms.get_workspace(&workspace_id).await? {
                match workspace.status {
                    WorkspaceStatus::Running | WorkspaceStatus::Recovery => {
                        return self.advance_to(TaskStep::AgentSession).await;
                    }
                    WorkspaceStatus::Error => {
                        return Err(StratoError::WorkspaceFailed(format!(
                            "workspace {workspace_id} entered error state"
                        )));
                    }
                    WorkspaceStatus::Stopped => {
                        return Err(StratoError::WorkspaceFailed(format!(
                            "workspace {workspace_id} stopped before becoming ready"
                        )));
                    }
                    WorkspaceStatus::Creating => {}
                }
            }
        }

        let started = self.state.workspace_ready_started_at.unwrap_or(now);
        if now - started > self.deps.config.workspace_ready_timeout_ms as i64 {
            return Err(StratoError::Timeout {
                message: format!(
                    "workspace not ready within {}ms",
                    self.deps.config.workspace_ready_timeout_ms
                ),
            });
        }

        self.rearm(self.deps.config.agent_poll_interval());
        Ok(())
    }

    // ---- agent_session ----

    pub(super) async fn step_agent_session(&mut self) -> Result<()> {
        let task_id = self.state.task_id.clone();
        let workspace_id = self.state.step_results.workspace_id.clone().ok_or_else(|| {
            StratoError::CorruptState(format!("task {task_id} reached agent_session without a workspace"))
        })?;

        let replayed = match self.state.step_results.agent_session_id.clone() {
            Some(session_id) => self.deps.cms.agent_session_exists(&session_id).await?,
            None => false,
        };

        if !replayed {
            let session_id = match self.state.step_results.agent_session_id.clone() {
                Some(existing) => existing,
                None => {
                    let session_id = crate::models::new_entity_id();
                    self.state.step_results.agent_session_id = Some(session_id.clone());
                    self.persist().await?;
                    session_id
                }
            };
            self.deps
                .cms
                .insert_agent_session(&session_id, &task_id, &workspace_id)
                .await?;

            let node = self.require_node().await?;
            let node_ip = node.ip_address.clone().ok_or_else(|| StratoError::NodeAgent {
                message: format!("node {} has no address", node.id),
            })?;
            self.deps
                .agent
                .spawn_session(
                    &node_ip,
                    SpawnSessionRequest {
                        workspace_id,
                        session_id,
                        task_title: self.state.config.task_title.clone(),
                        task_description: self.state.config.task_description.clone(),
                    },
                )
                .await?;
        }

        self.transition_to_in_progress().await
    }

    async fn transition_to_in_progress(&mut self) -> Result<()> {
        let task_id = self.state.task_id.clone();
        if !self.deps.cms.mark_task_in_progress(&task_id).await? {
            self.abort_preempted("in_progress").await;
            return Ok(());
        }
        if let Err(e) = self
            .deps
            .cms
            .append_status_event(
                &task_id,
                Some(TaskStatus::Delegated),
                TaskStatus::InProgress,
                ActorType::System,
                Some("agent session started"),
            )
            .await
        {
            warn!(
                "Failed to append in_progress event for task {}: {}",
                task_id, e
            );
        }
        info!("Task {} is in progress", task_id);
        self.complete().await
    }

    async fn require_node(&self) -> Result<Node> {
        let node_id = self.state.step_results.node_id.clone().ok_or_else(|| {
            StratoError::CorruptState(format!(
                "task {} has no node at step {}",
                self.state.task_id, self.state.current_step
            ))
        })?;
        self.deps
            .cms
            .get_node(&node_id)
            .await?
            .ok_or_else(|| StratoError::CorruptState(format!("node {node_id} vanished")))
    }
}
