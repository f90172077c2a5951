//! Central Metadata Store.
//!
//! Durable relational store of users, projects, nodes, workspaces, tasks and
//! task status events. Shared across orchestrator instances and the sweeper:
//! every cross-actor mutation is a conditional UPDATE on the expected status,
//! readers tolerate stale reads, writers never lock.

use crate::models::{
    new_entity_id, ActorType, Node, NodeHealth, NodeMetrics, NodeStatus, Project, ProjectStatus,
    Task, TaskPriority, TaskStatus, TaskStatusEvent, User, UserRole, UserStatus, Workspace,
    WorkspaceStatus,
};
use crate::{Result, StratoError};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{migrate::MigrateDatabase, Row, SqlitePool};
use std::str::FromStr;
use tracing::info;

mod schema;

pub use schema::SCHEMA_STATEMENTS;

/// Handle to the shared metadata database.
#[derive(Clone)]
pub struct CmsStore {
    pool: SqlitePool,
}

fn parse_enum<T: FromStr<Err = String>>(raw: &str) -> Result<T> {
    raw.parse().map_err(StratoError::CorruptState)
}

impl CmsStore {
    /// Open (creating if necessary) the metadata database and apply schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        if !sqlx::Sqlite::database_exists(database_url)
            .await
            .unwrap_or(false)
        {
            info!("Creating metadata database at {}", database_url);
            sqlx::Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests. A single pooled connection keeps every
    /// caller on the same in-memory database.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- users ----

    pub async fn create_user(&self, email: &str, role: UserRole) -> Result<User> {
        let user = User {
            id: new_entity_id(),
            email: email.to_string(),
            role,
            status: UserStatus::Active,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO users (id, email, role, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(user.role.as_str())
        .bind(user.status.as_str())
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(user)
    }

    // ---- projects ----

    pub async fn create_project(
        &self,
        user_id: &str,
        repository: &str,
        github_repo_id: Option<i64>,
    ) -> Result<Project> {
        let now = Utc::now();
        let project = Project {
            id: new_entity_id(),
            user_id: user_id.to_string(),
            github_repo_id,
            repository: repository.to_string(),
            status: ProjectStatus::Active,
            last_activity_at: None,
            active_session_count: 0,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO projects \
             (id, user_id, github_repo_id, repository, status, active_session_count, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)",
        )
        .bind(&project.id)
        .bind(&project.user_id)
        .bind(project.github_repo_id)
        .bind(&project.repository)
        .bind(project.status.as_str())
        .bind(project.created_at)
        .bind(project.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(project)
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| project_from_row(&r)).transpose()
    }

    /// Summary syncback from a project session store. Best-effort at the
    /// caller; this update itself is unconditional.
    pub async fn update_project_summary(
        &self,
        project_id: &str,
        last_activity_at: Option<DateTime<Utc>>,
        active_session_count: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE projects SET last_activity_at = ?2, active_session_count = ?3, updated_at = ?4 \
             WHERE id = ?1",
        )
        .bind(project_id)
        .bind(last_activity_at)
        .bind(active_session_count)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- nodes ----

    pub async fn insert_node(
        &self,
        user_id: &str,
        vm_size: &str,
        vm_location: &str,
        status: NodeStatus,
    ) -> Result<Node> {
        let now = Utc::now();
        let node = Node {
            id: new_entity_id(),
            user_id: user_id.to_string(),
            vm_size: vm_size.to_string(),
            vm_location: vm_location.to_string(),
            status,
            health_status: NodeHealth::Healthy,
            last_heartbeat_at: None,
            warm_since: None,
            last_metrics: None,
            provider_instance_id: None,
            ip_address: None,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO nodes \
             (id, user_id, vm_size, vm_location, status, health_status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&node.id)
        .bind(&node.user_id)
        .bind(&node.vm_size)
        .bind(&node.vm_location)
        .bind(node.status.as_str())
        .bind(node.health_status.as_str())
        .bind(node.created_at)
        .bind(node.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(node)
    }

    pub async fn get_node(&self, node_id: &str) -> Result<Option<Node>> {
        let row = sqlx::query("SELECT * FROM nodes WHERE id = ?1")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| node_from_row(&r)).transpose()
    }

    pub async fn set_node_status(&self, node_id: &str, status: NodeStatus) -> Result<()> {
        sqlx::query("UPDATE nodes SET status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(node_id)
            .bind(status.as_str())
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_node_provider_instance(
        &self,
        node_id: &str,
        provider_instance_id: &str,
        ip_address: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE nodes SET provider_instance_id = ?2, ip_address = ?3, updated_at = ?4 \
             WHERE id = ?1",
        )
        .bind(node_id)
        .bind(provider_instance_id)
        .bind(ip_address)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_node_heartbeat(
        &self,
        node_id: &str,
        metrics: Option<&NodeMetrics>,
    ) -> Result<bool> {
        let metrics_json = metrics.map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            "UPDATE nodes SET last_heartbeat_at = ?2, last_metrics = COALESCE(?3, last_metrics), \
             updated_at = ?2 WHERE id = ?1",
        )
        .bind(node_id)
        .bind(Utc::now())
        .bind(metrics_json)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Count nodes a user currently holds (anything not stopped).
    pub async fn count_user_nodes(&self, user_id: &str) -> Result<u32> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM nodes WHERE user_id = ?1 AND status != 'stopped'")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.get::<i64, _>("n") as u32)
    }

    /// Warm candidates for the claim path: running nodes with `warm_since`
    /// set, owned by the user.
    pub async fn warm_nodes_for_user(&self, user_id: &str) -> Result<Vec<Node>> {
        let rows = sqlx::query(
            "SELECT * FROM nodes \
             WHERE user_id = ?1 AND status = 'running' AND warm_since IS NOT NULL \
             ORDER BY warm_since ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    /// Capacity-search candidates: running, non-unhealthy nodes of the user.
    pub async fn placeable_nodes_for_user(&self, user_id: &str) -> Result<Vec<Node>> {
        let rows = sqlx::query(
            "SELECT * FROM nodes \
             WHERE user_id = ?1 AND status = 'running' AND health_status != 'unhealthy'",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    /// Live workspaces a user has on a node (running/creating/recovery).
    pub async fn count_live_workspaces_on_node(
        &self,
        node_id: &str,
        user_id: &str,
    ) -> Result<u32> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM workspaces \
             WHERE node_id = ?1 AND user_id = ?2 AND status IN ('running', 'creating', 'recovery')",
        )
        .bind(node_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") as u32)
    }

    pub async fn count_any_live_workspaces_on_node(&self, node_id: &str) -> Result<u32> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM workspaces \
             WHERE node_id = ?1 AND status IN ('running', 'creating', 'recovery')",
        )
        .bind(node_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") as u32)
    }

    /// Conditional warm claim: clears `warm_since` only if the node is still
    /// running and warm. Returns false on an optimistic-lock miss.
    pub async fn claim_warm_node(&self, node_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE nodes SET warm_since = NULL, updated_at = ?2 \
             WHERE id = ?1 AND status = 'running' AND warm_since IS NOT NULL",
        )
        .bind(node_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Conditional warm mark: sets `warm_since` only if currently cleared.
    pub async fn mark_node_warm(&self, node_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE nodes SET warm_since = ?2, updated_at = ?2 \
             WHERE id = ?1 AND warm_since IS NULL",
        )
        .bind(node_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Running nodes violating the warm invariant: `warm_since` cleared but
    /// no live workspace remains. Input to the sweeper's node reaper. The
    /// cutoff excludes recently-touched nodes, which may sit between a warm
    /// claim and their first workspace insert.
    pub async fn orphaned_cold_nodes(&self, touched_before: DateTime<Utc>) -> Result<Vec<Node>> {
        let rows = sqlx::query(
            "SELECT n.* FROM nodes n \
             WHERE n.status = 'running' AND n.warm_since IS NULL AND n.updated_at < ?1 \
             AND NOT EXISTS (\
                 SELECT 1 FROM workspaces w \
                 WHERE w.node_id = n.id AND w.status IN ('running', 'creating', 'recovery')\
             )",
        )
        .bind(touched_before)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    // ---- workspaces ----

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_workspace(
        &self,
        user_id: &str,
        project_id: &str,
        node_id: &str,
        repository: &str,
        branch: &str,
        display_name: &str,
        callback_token: &str,
    ) -> Result<Workspace> {
        let now = Utc::now();
        let workspace = Workspace {
            id: new_entity_id(),
            user_id: user_id.to_string(),
            project_id: project_id.to_string(),
            node_id: Some(node_id.to_string()),
            repository: repository.to_string(),
            branch: branch.to_string(),
            status: WorkspaceStatus::Creating,
            chat_session_id: None,
            display_name: display_name.to_string(),
            normalized_display_name: crate::models::normalize_display_name(display_name),
            callback_token: Some(callback_token.to_string()),
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO workspaces \
             (id, user_id, project_id, node_id, repository, branch, status, display_name, \
              normalized_display_name, callback_token, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(&workspace.id)
        .bind(&workspace.user_id)
        .bind(&workspace.project_id)
        .bind(&workspace.node_id)
        .bind(&workspace.repository)
        .bind(&workspace.branch)
        .bind(workspace.status.as_str())
        .bind(&workspace.display_name)
        .bind(&workspace.normalized_display_name)
        .bind(&workspace.callback_token)
        .bind(workspace.created_at)
        .bind(workspace.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(workspace)
    }

    pub async fn get_workspace(&self, workspace_id: &str) -> Result<Option<Workspace>> {
        let row = sqlx::query("SELECT * FROM workspaces WHERE id = ?1")
            .bind(workspace_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| workspace_from_row(&r)).transpose()
    }

    pub async fn set_workspace_status(
        &self,
        workspace_id: &str,
        status: WorkspaceStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE workspaces SET status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(workspace_id)
            .bind(status.as_str())
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Conditional stop used by idle cleanup: only live running/recovery
    /// workspaces are stopped.
    pub async fn stop_workspace_if_active(&self, workspace_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workspaces SET status = 'stopped', updated_at = ?2 \
             WHERE id = ?1 AND status IN ('running', 'recovery')",
        )
        .bind(workspace_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Weak back-reference from workspace to chat session; never fatal at
    /// call sites.
    pub async fn set_workspace_chat_session(
        &self,
        workspace_id: &str,
        chat_session_id: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE workspaces SET chat_session_id = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(workspace_id)
            .bind(chat_session_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- tasks ----

    pub async fn insert_task(
        &self,
        project_id: &str,
        user_id: &str,
        priority: TaskPriority,
    ) -> Result<Task> {
        let now = Utc::now();
        let task = Task {
            id: new_entity_id(),
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            status: TaskStatus::Queued,
            priority,
            execution_step: None,
            workspace_id: None,
            auto_provisioned_node_id: None,
            output_branch: None,
            output_pr_url: None,
            error_message: None,
            finalized_at: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO tasks (id, project_id, user_id, status, priority, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&task.id)
        .bind(&task.project_id)
        .bind(&task.user_id)
        .bind(task.status.as_str())
        .bind(task.priority.as_str())
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    pub async fn find_task_by_workspace(&self, workspace_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE workspace_id = ?1")
            .bind(workspace_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    /// Atomically attach a workspace and output branch to a task.
    pub async fn set_task_workspace(
        &self,
        task_id: &str,
        workspace_id: &str,
        output_branch: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET workspace_id = ?2, output_branch = ?3, updated_at = ?4 WHERE id = ?1",
        )
        .bind(task_id)
        .bind(workspace_id)
        .bind(output_branch)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_task_auto_provisioned_node(&self, task_id: &str, node_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET auto_provisioned_node_id = ?2, updated_at = ?3 WHERE id = ?1",
        )
        .bind(task_id)
        .bind(node_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Optimistic lock: queued -> delegated. A miss means another actor
    /// (usually the sweeper) owns the outcome.
    pub async fn mark_task_delegated(&self, task_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'delegated', execution_step = 'delegating', updated_at = ?2 \
             WHERE id = ?1 AND status = 'queued'",
        )
        .bind(task_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Optimistic lock: delegated -> in_progress.
    pub async fn mark_task_in_progress(&self, task_id: &str) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE tasks SET status = 'in_progress', started_at = ?2, execution_step = 'running', \
             updated_at = ?2 WHERE id = ?1 AND status = 'delegated'",
        )
        .bind(task_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Conditional completion used by idle cleanup: only in-flight tasks.
    /// `finalized_at` is written once, on the first successful completion.
    pub async fn complete_task_if_in_flight(&self, task_id: &str) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE tasks SET status = 'completed', completed_at = ?2, \
             finalized_at = COALESCE(finalized_at, ?2), execution_step = NULL, updated_at = ?2 \
             WHERE id = ?1 AND status IN ('in_progress', 'delegated')",
        )
        .bind(task_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Conditional failure from an expected status; used by the sweeper.
    pub async fn fail_task_from(
        &self,
        task_id: &str,
        expected: TaskStatus,
        error_message: &str,
    ) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE tasks SET status = 'failed', error_message = ?3, completed_at = ?4, \
             execution_step = NULL, updated_at = ?4 WHERE id = ?1 AND status = ?2",
        )
        .bind(task_id)
        .bind(expected.as_str())
        .bind(error_message)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Failure path for the orchestrator: fails the task unless it is
    /// already terminal. Returns the prior status when a row changed.
    pub async fn fail_task_if_not_terminal(
        &self,
        task_id: &str,
        error_message: &str,
    ) -> Result<Option<TaskStatus>> {
        let Some(task) = self.get_task(task_id).await? else {
            return Ok(None);
        };
        if task.status.is_terminal() {
            return Ok(None);
        }
        let changed = self
            .fail_task_from(task_id, task.status, error_message)
            .await?;
        Ok(changed.then_some(task.status))
    }

    /// Tasks stuck past their deadlines, for the sweeper.
    pub async fn stuck_tasks(
        &self,
        queued_cutoff: DateTime<Utc>,
        in_progress_cutoff: DateTime<Utc>,
    ) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE \
             (status IN ('queued', 'delegated') AND updated_at < ?1) \
             OR (status = 'in_progress' AND updated_at < ?2)",
        )
        .bind(queued_cutoff)
        .bind(in_progress_cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    // ---- agent sessions ----

    pub async fn insert_agent_session(
        &self,
        session_id: &str,
        task_id: &str,
        workspace_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_sessions (id, task_id, workspace_id, status, created_at) \
             VALUES (?1, ?2, ?3, 'running', ?4)",
        )
        .bind(session_id)
        .bind(task_id)
        .bind(workspace_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn agent_session_exists(&self, session_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS x FROM agent_sessions WHERE id = ?1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    // ---- task status events ----

    pub async fn append_status_event(
        &self,
        task_id: &str,
        from_status: Option<TaskStatus>,
        to_status: TaskStatus,
        actor_type: ActorType,
        reason: Option<&str>,
    ) -> Result<TaskStatusEvent> {
        let event = TaskStatusEvent {
            id: new_entity_id(),
            task_id: task_id.to_string(),
            from_status,
            to_status,
            actor_type,
            reason: reason.map(|s| s.to_string()),
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO task_status_events (id, task_id, from_status, to_status, actor_type, reason, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&event.id)
        .bind(&event.task_id)
        .bind(event.from_status.map(|s| s.as_str()))
        .bind(event.to_status.as_str())
        .bind(event.actor_type.as_str())
        .bind(&event.reason)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(event)
    }

    pub async fn status_events_for_task(&self, task_id: &str) -> Result<Vec<TaskStatusEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM task_status_events WHERE task_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(status_event_from_row).collect()
    }

    // ---- orchestrator state records ----

    /// Persist the single opaque state record for a task runner instance.
    pub async fn save_runner_state(&self, task_id: &str, state_json: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO runner_state (task_id, state, updated_at) VALUES (?1, ?2, ?3)",
        )
        .bind(task_id)
        .bind(state_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_runner_state(&self, task_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT state FROM runner_state WHERE task_id = ?1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("state")))
    }

    /// All persisted runner records, for the crash-resume scan at startup.
    pub async fn all_runner_states(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT task_id, state FROM runner_state")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("task_id"), r.get("state")))
            .collect())
    }
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    Ok(Task {
        id: row.get("id"),
        project_id: row.get("project_id"),
        user_id: row.get("user_id"),
        status: parse_enum(row.get::<String, _>("status").as_str())?,
        priority: parse_enum(row.get::<String, _>("priority").as_str())?,
        execution_step: row.get("execution_step"),
        workspace_id: row.get("workspace_id"),
        auto_provisioned_node_id: row.get("auto_provisioned_node_id"),
        output_branch: row.get("output_branch"),
        output_pr_url: row.get("output_pr_url"),
        error_message: row.get("error_message"),
        finalized_at: row.get("finalized_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn node_from_row(row: &SqliteRow) -> Result<Node> {
    let metrics_json: Option<String> = row.get("last_metrics");
    let last_metrics = metrics_json
        .as_deref()
        .map(serde_json::from_str::<NodeMetrics>)
        .transpose()?;
    Ok(Node {
        id: row.get("id"),
        user_id: row.get("user_id"),
        vm_size: row.get("vm_size"),
        vm_location: row.get("vm_location"),
        status: parse_enum(row.get::<String, _>("status").as_str())?,
        health_status: parse_enum(row.get::<String, _>("health_status").as_str())?,
        last_heartbeat_at: row.get("last_heartbeat_at"),
        warm_since: row.get("warm_since"),
        last_metrics,
        provider_instance_id: row.get("provider_instance_id"),
        ip_address: row.get("ip_address"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn workspace_from_row(row: &SqliteRow) -> Result<Workspace> {
    Ok(Workspace {
        id: row.get("id"),
        user_id: row.get("user_id"),
        project_id: row.get("project_id"),
        node_id: row.get("node_id"),
        repository: row.get("repository"),
        branch: row.get("branch"),
        status: parse_enum(row.get::<String, _>("status").as_str())?,
        chat_session_id: row.get("chat_session_id"),
        display_name: row.get("display_name"),
        normalized_display_name: row.get("normalized_display_name"),
        callback_token: row.get("callback_token"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn project_from_row(row: &SqliteRow) -> Result<Project> {
    Ok(Project {
        id: row.get("id"),
        user_id: row.get("user_id"),
        github_repo_id: row.get("github_repo_id"),
        repository: row.get("repository"),
        status: parse_enum(row.get::<String, _>("status").as_str())?,
        last_activity_at: row.get("last_activity_at"),
        active_session_count: row.get("active_session_count"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn status_event_from_row(row: &SqliteRow) -> Result<TaskStatusEvent> {
    let from_raw: Option<String> = row.get("from_status");
    Ok(TaskStatusEvent {
        id: row.get("id"),
        task_id: row.get("task_id"),
        from_status: from_raw.as_deref().map(parse_enum).transpose()?,
        to_status: parse_enum(row.get::<String, _>("to_status").as_str())?,
        actor_type: parse_enum(row.get::<String, _>("actor_type").as_str())?,
        reason: row.get("reason"),
        created_at: row.get("created_at"),
    })
}
