use crate::cms::CmsStore;
use crate::config::SessionStoreConfig;
use crate::models::{TaskPriority, TaskStatus, UserRole, WorkspaceStatus};
use crate::session_store::{IncomingMessage, MessageRole, SessionStatus, SessionStoreRuntime};
use crate::tests::test_helpers::wait_until;
use crate::StratoError;
use tokio::sync::mpsc;

fn fast_config() -> SessionStoreConfig {
    SessionStoreConfig {
        max_sessions_per_project: 1_000,
        max_messages_per_session: 10_000,
        summary_sync_debounce_ms: 40,
        idle_timeout_minutes: 0,
        idle_cleanup_retry_delay_ms: 60,
        idle_cleanup_max_retries: 1,
    }
}

async fn runtime() -> (CmsStore, SessionStoreRuntime, String) {
    let cms = CmsStore::connect_in_memory().await.unwrap();
    let user = cms.create_user("dev@example.com", UserRole::User).await.unwrap();
    let project = cms.create_project(&user.id, "acme/widgets", None).await.unwrap();
    let runtime = SessionStoreRuntime::in_memory(cms.clone(), fast_config());
    (cms, runtime, project.id)
}

#[tokio::test]
async fn session_lifecycle_and_filters() {
    let (_cms, runtime, project_id) = runtime().await;
    let handle = runtime.handle_for(&project_id).await.unwrap();

    let session = handle
        .create_session(Some("ws-1".to_string()), None, Some("t-1".to_string()))
        .await
        .unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.message_count, 0);

    assert!(handle.stop_session(&session.id).await.unwrap());
    assert!(!handle.stop_session(&session.id).await.unwrap());

    let stopped = handle
        .list_sessions(Some(SessionStatus::Stopped), None, 10, 0)
        .await
        .unwrap();
    assert_eq!(stopped.len(), 1);

    // session.started and session.stopped both left an activity trail
    let activity = handle.list_activity(None, 10, None).await.unwrap();
    let types: Vec<_> = activity.iter().map(|e| e.event_type.as_str()).collect();
    assert!(types.contains(&"session.started"));
    assert!(types.contains(&"session.stopped"));
}

#[tokio::test]
async fn session_cap_is_enforced() {
    let (cms, _ignored, project_id) = runtime().await;
    let mut config = fast_config();
    config.max_sessions_per_project = 2;
    let runtime = SessionStoreRuntime::in_memory(cms, config);
    let handle = runtime.handle_for(&project_id).await.unwrap();

    handle.create_session(None, None, None).await.unwrap();
    handle.create_session(None, None, None).await.unwrap();
    let err = handle.create_session(None, None, None).await.unwrap_err();
    assert!(matches!(err, StratoError::LimitExceeded(_)));
}

#[tokio::test]
async fn message_persistence_requires_session() {
    let (_cms, runtime, project_id) = runtime().await;
    let handle = runtime.handle_for(&project_id).await.unwrap();

    let err = handle
        .persist_message("ghost", MessageRole::User, "hello", None)
        .await
        .unwrap_err();
    assert!(matches!(err, StratoError::NotFound(_)));
}

#[tokio::test]
async fn batch_replay_dedupes_by_client_id() {
    let (_cms, runtime, project_id) = runtime().await;
    let handle = runtime.handle_for(&project_id).await.unwrap();
    let session = handle.create_session(None, None, None).await.unwrap();

    let batch: Vec<IncomingMessage> = (0..3)
        .map(|i| IncomingMessage {
            message_id: format!("client-{i}"),
            role: if i == 0 { MessageRole::User } else { MessageRole::Assistant },
            content: format!("message {i}"),
            tool_metadata: None,
            timestamp: Some("2026-07-01T10:00:00Z".to_string()),
        })
        .collect();

    let outcome = handle
        .persist_message_batch(&session.id, batch.clone())
        .await
        .unwrap();
    assert_eq!(outcome.persisted, 3);
    assert_eq!(outcome.duplicates, 0);

    // Replaying the identical batch persists nothing new
    let outcome = handle
        .persist_message_batch(&session.id, batch.clone())
        .await
        .unwrap();
    assert_eq!(outcome.persisted, 0);
    assert_eq!(outcome.duplicates, 3);
    assert_eq!(outcome.persisted + outcome.duplicates, batch.len());

    let page = handle.get_messages(&session.id, 50, None).await.unwrap();
    assert_eq!(page.messages.len(), 3);
    assert!(!page.has_more);

    // Topic was captured from the first user message in the batch
    let session = handle.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(session.topic.as_deref(), Some("message 0"));
}

#[tokio::test]
async fn broadcasts_follow_persistence_order() {
    let (_cms, runtime, project_id) = runtime().await;
    let handle = runtime.handle_for(&project_id).await.unwrap();
    let session = handle.create_session(None, None, None).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let viewer = handle.attach_viewer(tx).await.unwrap();

    handle
        .persist_message(&session.id, MessageRole::User, "first", None)
        .await
        .unwrap();
    handle
        .persist_message(&session.id, MessageRole::Assistant, "second", None)
        .await
        .unwrap();
    handle.mark_agent_completed(&session.id).await.unwrap();

    let mut types = Vec::new();
    let mut contents = Vec::new();
    for _ in 0..3 {
        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        types.push(value["type"].as_str().unwrap().to_string());
        if value["type"] == "message.new" {
            contents.push(value["payload"]["content"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(types, vec!["message.new", "message.new", "session.agent_completed"]);
    assert_eq!(contents, vec!["first", "second"]);

    handle.detach_viewer(viewer);
}

#[tokio::test]
async fn idle_cleanup_completes_task_and_stops_workspace() {
    let (cms, runtime, project_id) = runtime().await;
    let user = cms.create_user("dev2@example.com", UserRole::User).await.unwrap();
    let task = cms.insert_task(&project_id, &user.id, TaskPriority::Medium).await.unwrap();
    cms.mark_task_delegated(&task.id).await.unwrap();
    cms.mark_task_in_progress(&task.id).await.unwrap();

    let node = cms
        .insert_node(&user.id, "medium", "nbg1", crate::models::NodeStatus::Running)
        .await
        .unwrap();
    let workspace = cms
        .insert_workspace(&user.id, &project_id, &node.id, "acme/widgets", "main", "ws", "tok")
        .await
        .unwrap();
    cms.set_workspace_status(&workspace.id, WorkspaceStatus::Running)
        .await
        .unwrap();

    let handle = runtime.handle_for(&project_id).await.unwrap();
    let session = handle
        .create_session(Some(workspace.id.clone()), None, Some(task.id.clone()))
        .await
        .unwrap();
    handle.mark_agent_completed(&session.id).await.unwrap();

    // Idle timeout of zero: the alarm fires immediately
    handle
        .schedule_idle_cleanup(&session.id, &workspace.id, Some(task.id.clone()))
        .await
        .unwrap();

    let cms_poll = cms.clone();
    let task_id = task.id.clone();
    wait_until("idle cleanup completes the task", move || {
        let cms = cms_poll.clone();
        let task_id = task_id.clone();
        async move { cms.get_task(&task_id).await.unwrap().unwrap().status == TaskStatus::Completed }
    })
    .await;

    let workspace = cms.get_workspace(&workspace.id).await.unwrap().unwrap();
    assert_eq!(workspace.status, WorkspaceStatus::Stopped);

    let task_row = cms.get_task(&task.id).await.unwrap().unwrap();
    assert!(task_row.execution_step.is_none());
    assert!(task_row.finalized_at.is_some());

    let session_row = handle.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(session_row.status, SessionStatus::Stopped);

    let handle_poll = handle.clone();
    wait_until("idle cleanup activity recorded", move || {
        let handle = handle_poll.clone();
        async move {
            handle
                .list_activity(Some("session.idle_cleanup".to_string()), 10, None)
                .await
                .unwrap()
                .len()
                == 1
        }
    })
    .await;
}

#[tokio::test]
async fn cancel_and_reset_change_the_schedule() {
    let (cms, _ignored, project_id) = runtime().await;
    let mut config = fast_config();
    // Long timeout so nothing fires during the test
    config.idle_timeout_minutes = 60;
    let runtime = SessionStoreRuntime::in_memory(cms, config);
    let handle = runtime.handle_for(&project_id).await.unwrap();
    let session = handle.create_session(None, None, None).await.unwrap();

    assert!(!handle.reset_idle_cleanup(&session.id).await.unwrap());

    handle
        .schedule_idle_cleanup(&session.id, "ws-1", None)
        .await
        .unwrap();
    assert!(handle.reset_idle_cleanup(&session.id).await.unwrap());
    assert!(handle.cancel_idle_cleanup(&session.id).await.unwrap());
    assert!(!handle.cancel_idle_cleanup(&session.id).await.unwrap());

    // Session remains active: the schedule never fired
    let session = handle.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Active);
}

#[tokio::test]
async fn idle_cleanup_retries_once_then_succeeds() {
    let (cms, runtime, project_id) = runtime().await;
    let handle = runtime.handle_for(&project_id).await.unwrap();
    let session = handle.create_session(None, None, None).await.unwrap();

    // Break the CMS workspace table so the first cleanup attempt throws
    sqlx::query("ALTER TABLE workspaces RENAME TO workspaces_hidden")
        .execute(cms.pool())
        .await
        .unwrap();

    handle
        .schedule_idle_cleanup(&session.id, "ws-flap", None)
        .await
        .unwrap();

    // First attempt stops the session, then throws on the CMS update
    let handle_poll = handle.clone();
    let session_id = session.id.clone();
    wait_until("first attempt stops the session", move || {
        let handle = handle_poll.clone();
        let session_id = session_id.clone();
        async move {
            handle.get_session(&session_id).await.unwrap().unwrap().status
                == SessionStatus::Stopped
        }
    })
    .await;

    // Heal the CMS before the retry fires
    sqlx::query("ALTER TABLE workspaces_hidden RENAME TO workspaces")
        .execute(cms.pool())
        .await
        .unwrap();

    let handle_poll = handle.clone();
    wait_until("cleanup succeeds on retry", move || {
        let handle = handle_poll.clone();
        async move {
            handle
                .list_activity(Some("session.idle_cleanup".to_string()), 10, None)
                .await
                .unwrap()
                .len()
                == 1
        }
    })
    .await;
}

#[tokio::test]
async fn idle_cleanup_exhaustion_informs_the_user() {
    let (cms, runtime, project_id) = runtime().await;
    let handle = runtime.handle_for(&project_id).await.unwrap();
    let session = handle.create_session(None, None, None).await.unwrap();

    // Permanently broken CMS: the retry budget runs out
    sqlx::query("ALTER TABLE workspaces RENAME TO workspaces_hidden")
        .execute(cms.pool())
        .await
        .unwrap();

    handle
        .schedule_idle_cleanup(&session.id, "ws-dead", None)
        .await
        .unwrap();

    let handle_poll = handle.clone();
    wait_until("exhaustion activity recorded", move || {
        let handle = handle_poll.clone();
        async move {
            handle
                .list_activity(Some("session.idle_cleanup_failed".to_string()), 10, None)
                .await
                .unwrap()
                .len()
                == 1
        }
    })
    .await;

    // A system message explains the failure in the conversation
    let page = handle.get_messages(&session.id, 10, None).await.unwrap();
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].role, MessageRole::System);
    assert!(page.messages[0].content.contains("idle cleanup failed"));
}

#[tokio::test]
async fn summary_syncback_updates_the_project_row() {
    let (cms, runtime, project_id) = runtime().await;
    let handle = runtime.handle_for(&project_id).await.unwrap();

    handle.create_session(None, None, None).await.unwrap();
    handle.create_session(None, None, None).await.unwrap();

    let cms_poll = cms.clone();
    let project = project_id.clone();
    wait_until("summary synced to CMS", move || {
        let cms = cms_poll.clone();
        let project = project.clone();
        async move {
            let row = cms.get_project(&project).await.unwrap().unwrap();
            row.active_session_count == 2 && row.last_activity_at.is_some()
        }
    })
    .await;
}

#[tokio::test]
async fn project_database_survives_runtime_restart() {
    let cms = CmsStore::connect_in_memory().await.unwrap();
    let user = cms.create_user("dev@example.com", UserRole::User).await.unwrap();
    let project = cms.create_project(&user.id, "acme/widgets", None).await.unwrap();
    let dir = tempfile::tempdir().unwrap();

    let session_id = {
        let runtime =
            SessionStoreRuntime::new(cms.clone(), fast_config(), dir.path().to_path_buf());
        let handle = runtime.handle_for(&project.id).await.unwrap();
        let session = handle.create_session(None, None, None).await.unwrap();
        handle
            .persist_message(&session.id, MessageRole::User, "Add dark mode", None)
            .await
            .unwrap();
        session.id
    };

    // A new runtime over the same data dir replays migrations as a no-op
    // and serves the persisted rows
    let runtime = SessionStoreRuntime::new(cms, fast_config(), dir.path().to_path_buf());
    let handle = runtime.handle_for(&project.id).await.unwrap();

    let session = handle.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.message_count, 1);
    assert_eq!(session.topic.as_deref(), Some("Add dark mode"));

    let page = handle.get_messages(&session_id, 10, None).await.unwrap();
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].content, "Add dark mode");
}

#[tokio::test]
async fn workspace_link_updates_session_row() {
    let (_cms, runtime, project_id) = runtime().await;
    let handle = runtime.handle_for(&project_id).await.unwrap();
    let session = handle.create_session(None, None, None).await.unwrap();

    use crate::orchestrator::SessionLinker;
    runtime
        .link_workspace_to_session(&project_id, &session.id, "ws-42")
        .await
        .unwrap();

    let session = handle.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(session.workspace_id.as_deref(), Some("ws-42"));
}
