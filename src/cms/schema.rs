//! Metadata-store schema, applied idempotently at startup.

pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        role TEXT NOT NULL DEFAULT 'user',
        status TEXT NOT NULL DEFAULT 'active',
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        github_repo_id INTEGER,
        repository TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        last_activity_at TEXT,
        active_session_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    // One project per repository per user, when the repo id is known
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_projects_user_repo
     ON projects(user_id, github_repo_id) WHERE github_repo_id IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS nodes (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        vm_size TEXT NOT NULL,
        vm_location TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        health_status TEXT NOT NULL DEFAULT 'healthy',
        last_heartbeat_at TEXT,
        warm_since TEXT,
        last_metrics TEXT,
        provider_instance_id TEXT,
        ip_address TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_nodes_user_status ON nodes(user_id, status)",
    "CREATE TABLE IF NOT EXISTS workspaces (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        project_id TEXT NOT NULL REFERENCES projects(id),
        node_id TEXT REFERENCES nodes(id),
        repository TEXT NOT NULL,
        branch TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'creating',
        chat_session_id TEXT,
        display_name TEXT NOT NULL,
        normalized_display_name TEXT NOT NULL,
        callback_token TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_workspaces_node_status ON workspaces(node_id, status)",
    "CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL REFERENCES projects(id),
        user_id TEXT NOT NULL REFERENCES users(id),
        status TEXT NOT NULL DEFAULT 'queued',
        priority TEXT NOT NULL DEFAULT 'medium',
        execution_step TEXT,
        workspace_id TEXT REFERENCES workspaces(id),
        auto_provisioned_node_id TEXT REFERENCES nodes(id),
        output_branch TEXT,
        output_pr_url TEXT,
        error_message TEXT,
        finalized_at TEXT,
        started_at TEXT,
        completed_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status_updated ON tasks(status, updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_workspace ON tasks(workspace_id)",
    "CREATE TABLE IF NOT EXISTS task_status_events (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL REFERENCES tasks(id),
        from_status TEXT,
        to_status TEXT NOT NULL,
        actor_type TEXT NOT NULL,
        reason TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_status_events_task ON task_status_events(task_id)",
    // Coding-agent processes spawned inside workspaces
    "CREATE TABLE IF NOT EXISTS agent_sessions (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL REFERENCES tasks(id),
        workspace_id TEXT NOT NULL REFERENCES workspaces(id),
        status TEXT NOT NULL DEFAULT 'running',
        created_at TEXT NOT NULL
    )",
    // One opaque persisted record per task-runner instance
    "CREATE TABLE IF NOT EXISTS runner_state (
        task_id TEXT PRIMARY KEY,
        state TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    // Best-effort observability records; writes here never fail callers
    "CREATE TABLE IF NOT EXISTS error_records (
        id TEXT PRIMARY KEY,
        source TEXT NOT NULL,
        level TEXT NOT NULL DEFAULT 'error',
        task_id TEXT,
        node_id TEXT,
        message TEXT NOT NULL,
        context TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_error_records_node ON error_records(node_id)",
];
