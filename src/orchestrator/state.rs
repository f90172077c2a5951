//! Persisted task-runner state.
//!
//! Each runner instance persists exactly one opaque JSON record, rewritten
//! after every state change. The record is the sole source of truth when an
//! instance is respawned after a crash; every step must be replayable from
//! it plus what the CMS already shows.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const STATE_VERSION: u32 = 1;

/// Steps of the task runner, in advancement order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStep {
    NodeSelection,
    NodeProvisioning,
    NodeAgentReady,
    WorkspaceCreation,
    WorkspaceReady,
    AgentSession,
}

impl TaskStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStep::NodeSelection => "node_selection",
            TaskStep::NodeProvisioning => "node_provisioning",
            TaskStep::NodeAgentReady => "node_agent_ready",
            TaskStep::WorkspaceCreation => "workspace_creation",
            TaskStep::WorkspaceReady => "workspace_ready",
            TaskStep::AgentSession => "agent_session",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            TaskStep::NodeSelection => 0,
            TaskStep::NodeProvisioning => 1,
            TaskStep::NodeAgentReady => 2,
            TaskStep::WorkspaceCreation => 3,
            TaskStep::WorkspaceReady => 4,
            TaskStep::AgentSession => 5,
        }
    }

    /// Steps only ever move forward; failure jumps straight to terminal.
    pub fn can_advance_to(&self, next: TaskStep) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for TaskStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workspace readiness as reported by the node agent callback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceReadyStatus {
    Running,
    Recovery,
    Error,
}

impl FromStr for WorkspaceReadyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(WorkspaceReadyStatus::Running),
            "recovery" => Ok(WorkspaceReadyStatus::Recovery),
            "error" => Ok(WorkspaceReadyStatus::Error),
            _ => Err(format!("Unknown workspace ready status: {s}")),
        }
    }
}

/// Immutable task configuration captured at submission.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunConfig {
    pub vm_size: String,
    pub vm_location: String,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_node_id: Option<String>,
    pub task_title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_description: Option<String>,
    pub repository: String,
    pub installation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_user_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_user_id: Option<String>,
}

/// Ids accumulated by completed steps.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StepResults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default)]
    pub auto_provisioned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunnerState {
    pub version: u32,
    pub task_id: String,
    pub project_id: String,
    pub user_id: String,
    pub current_step: TaskStep,
    pub retry_count: u32,
    pub step_results: StepResults,
    pub config: TaskRunConfig,
    #[serde(default)]
    pub workspace_ready_received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_ready_status: Option<WorkspaceReadyStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_error_message: Option<String>,
    /// Epoch ms of first entry into node_agent_ready.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_ready_started_at: Option<i64>,
    /// Epoch ms of first entry into workspace_ready.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_ready_started_at: Option<i64>,
    #[serde(default)]
    pub completed: bool,
    pub created_at: i64,
    pub last_step_at: i64,
}

impl TaskRunnerState {
    pub fn new(task_id: &str, project_id: &str, user_id: &str, config: TaskRunConfig) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            version: STATE_VERSION,
            task_id: task_id.to_string(),
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            current_step: TaskStep::NodeSelection,
            retry_count: 0,
            step_results: StepResults::default(),
            config,
            workspace_ready_received: false,
            workspace_ready_status: None,
            workspace_error_message: None,
            agent_ready_started_at: None,
            workspace_ready_started_at: None,
            completed: false,
            created_at: now,
            last_step_at: now,
        }
    }

    /// Output branch with the `task/{taskId}` fallback applied.
    pub fn output_branch(&self) -> String {
        self.config
            .output_branch
            .clone()
            .unwrap_or_else(|| format!("task/{}", self.task_id))
    }
}
