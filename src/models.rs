use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A user-submitted unit of work on a project
///
/// Tasks are the fundamental unit of work in the Strato platform. Each task
/// drives exactly one workspace and agent-session lifecycle, and moves
/// through a restricted status graph recorded in `task_status_events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    /// Advisory label describing where the runner currently is.
    pub execution_step: Option<String>,
    pub workspace_id: Option<String>,
    pub auto_provisioned_node_id: Option<String>,
    pub output_branch: Option<String>,
    pub output_pr_url: Option<String>,
    pub error_message: Option<String>,
    pub finalized_at: Option<chrono::DateTime<chrono::Utc>>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Draft,
    Queued,
    Delegated,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    AwaitingFollowup,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Draft => "draft",
            TaskStatus::Queued => "queued",
            TaskStatus::Delegated => "delegated",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::AwaitingFollowup => "awaiting_followup",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self -> to` is a legal transition.
    ///
    /// Transitions appear only via the orchestrator's optimistic-locked
    /// updates, agent callbacks, or the sweeper; all three must stay within
    /// this graph.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Draft => matches!(to, Queued),
            Queued => matches!(to, Delegated | Failed | Cancelled),
            Delegated => matches!(to, InProgress | Failed | Cancelled),
            InProgress => matches!(to, AwaitingFollowup | Completed | Failed | Cancelled),
            AwaitingFollowup => matches!(to, InProgress | Completed | Failed | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(TaskStatus::Draft),
            "queued" => Ok(TaskStatus::Queued),
            "delegated" => Ok(TaskStatus::Delegated),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "awaiting_followup" => Ok(TaskStatus::AwaitingFollowup),
            _ => Err(format!("Unknown task status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
        }
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            _ => Err(format!("Unknown task priority: {s}")),
        }
    }
}

/// Append-only audit record of a task status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusEvent {
    pub id: String,
    pub task_id: String,
    pub from_status: Option<TaskStatus>,
    pub to_status: TaskStatus,
    pub actor_type: ActorType,
    pub reason: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    System,
    Agent,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::System => "system",
            ActorType::Agent => "agent",
        }
    }
}

impl FromStr for ActorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(ActorType::User),
            "system" => Ok(ActorType::System),
            "agent" => Ok(ActorType::Agent),
            _ => Err(format!("Unknown actor type: {s}")),
        }
    }
}

/// A VM on the external cloud provider, hosting workspaces for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub user_id: String,
    pub vm_size: String,
    pub vm_location: String,
    pub status: NodeStatus,
    pub health_status: NodeHealth,
    pub last_heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,
    /// NULL while the node hosts at least one live workspace.
    pub warm_since: Option<chrono::DateTime<chrono::Utc>>,
    pub last_metrics: Option<NodeMetrics>,
    pub provider_instance_id: Option<String>,
    pub ip_address: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Error,
    Stopped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Error => "error",
            NodeStatus::Stopped => "stopped",
        }
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NodeStatus::Pending),
            "running" => Ok(NodeStatus::Running),
            "error" => Ok(NodeStatus::Error),
            "stopped" => Ok(NodeStatus::Stopped),
            _ => Err(format!("Unknown node status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl NodeHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeHealth::Healthy => "healthy",
            NodeHealth::Degraded => "degraded",
            NodeHealth::Unhealthy => "unhealthy",
        }
    }
}

impl FromStr for NodeHealth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(NodeHealth::Healthy),
            "degraded" => Ok(NodeHealth::Degraded),
            "unhealthy" => Ok(NodeHealth::Unhealthy),
            _ => Err(format!("Unknown node health: {s}")),
        }
    }
}

/// Point-in-time resource metrics reported by the node heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeMetrics {
    #[serde(rename = "cpuLoadAvg1")]
    pub cpu_load_avg1: f64,
    #[serde(rename = "memoryPercent")]
    pub memory_percent: f64,
    #[serde(rename = "diskPercent")]
    pub disk_percent: f64,
}

/// An ephemeral development environment on a node, bound to one repo/branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub user_id: String,
    pub project_id: String,
    pub node_id: Option<String>,
    pub repository: String,
    pub branch: String,
    pub status: WorkspaceStatus,
    pub chat_session_id: Option<String>,
    pub display_name: String,
    pub normalized_display_name: String,
    pub callback_token: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Creating,
    Running,
    Recovery,
    Error,
    Stopped,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Creating => "creating",
            WorkspaceStatus::Running => "running",
            WorkspaceStatus::Recovery => "recovery",
            WorkspaceStatus::Error => "error",
            WorkspaceStatus::Stopped => "stopped",
        }
    }

    /// Live workspaces count against node capacity and keep `warm_since`
    /// cleared on their node.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            WorkspaceStatus::Running | WorkspaceStatus::Creating | WorkspaceStatus::Recovery
        )
    }
}

impl FromStr for WorkspaceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(WorkspaceStatus::Creating),
            "running" => Ok(WorkspaceStatus::Running),
            "recovery" => Ok(WorkspaceStatus::Recovery),
            "error" => Ok(WorkspaceStatus::Error),
            "stopped" => Ok(WorkspaceStatus::Stopped),
            _ => Err(format!("Unknown workspace status: {s}")),
        }
    }
}

/// A project groups tasks and sessions around one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub user_id: String,
    /// Stable numeric repository id; `(user_id, github_repo_id)` is unique
    /// when set.
    pub github_repo_id: Option<i64>,
    pub repository: String,
    pub status: ProjectStatus,
    pub last_activity_at: Option<chrono::DateTime<chrono::Utc>>,
    pub active_session_count: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    Detached,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Active => "active",
            ProjectStatus::Detached => "detached",
        }
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ProjectStatus::Active),
            "detached" => Ok(ProjectStatus::Detached),
            _ => Err(format!("Unknown project status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub role: UserRole,
    pub status: UserStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    User,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::User => "user",
            UserRole::Admin => "admin",
        }
    }
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(UserRole::User),
            "admin" => Ok(UserRole::Admin),
            _ => Err(format!("Unknown user role: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Suspended,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Suspended => "suspended",
        }
    }
}

impl FromStr for UserStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(UserStatus::Active),
            "suspended" => Ok(UserStatus::Suspended),
            _ => Err(format!("Unknown user status: {s}")),
        }
    }
}

/// Lowercase a display name and collapse non-alphanumeric runs to `-`.
pub fn normalize_display_name(display_name: &str) -> String {
    let mut out = String::with_capacity(display_name.len());
    let mut pending_dash = false;
    for c in display_name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

pub fn new_entity_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trip() {
        for status in [
            TaskStatus::Draft,
            TaskStatus::Queued,
            TaskStatus::Delegated,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::AwaitingFollowup,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn legal_transition_graph() {
        use TaskStatus::*;

        assert!(Draft.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Delegated));
        assert!(Queued.can_transition_to(Failed));
        assert!(Delegated.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(AwaitingFollowup));
        assert!(AwaitingFollowup.can_transition_to(InProgress));
        assert!(AwaitingFollowup.can_transition_to(Completed));

        // Illegal jumps
        assert!(!Draft.can_transition_to(InProgress));
        assert!(!Queued.can_transition_to(InProgress));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Delegated.can_transition_to(AwaitingFollowup));

        // Terminal states never leave
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for to in [Draft, Queued, Delegated, InProgress, Completed, Failed] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn workspace_liveness() {
        assert!(WorkspaceStatus::Creating.is_live());
        assert!(WorkspaceStatus::Running.is_live());
        assert!(WorkspaceStatus::Recovery.is_live());
        assert!(!WorkspaceStatus::Error.is_live());
        assert!(!WorkspaceStatus::Stopped.is_live());
    }

    #[test]
    fn display_name_normalization() {
        assert_eq!(normalize_display_name("My Fancy Repo"), "my-fancy-repo");
        assert_eq!(normalize_display_name("  fix/login--bug "), "fix-login-bug");
        assert_eq!(normalize_display_name("CamelCase123"), "camelcase123");
        assert_eq!(normalize_display_name("***"), "");
    }

    #[test]
    fn node_metrics_wire_names() {
        let metrics: NodeMetrics = serde_json::from_str(
            r#"{"cpuLoadAvg1": 1.5, "memoryPercent": 42.0, "diskPercent": 10.0}"#,
        )
        .unwrap();
        assert_eq!(metrics.cpu_load_avg1, 1.5);
        assert_eq!(metrics.memory_percent, 42.0);
    }
}
