use crate::models::TaskStatus;
use crate::orchestrator::{TaskStep, WorkspaceReadyStatus};
use crate::tests::test_helpers::{fast_runner_config, wait_until, TestHarness};

#[tokio::test]
async fn start_is_idempotent() {
    let harness = TestHarness::new().await;
    harness.warm_node().await;
    let task = harness.submit_task().await;

    // Duplicate starts are absorbed without spawning a second pipeline
    harness
        .orchestrator
        .start(&task.id, &harness.project.id, &harness.user.id, harness.run_config())
        .await
        .unwrap();
    harness
        .orchestrator
        .start(&task.id, &harness.project.id, &harness.user.id, harness.run_config())
        .await
        .unwrap();

    let cms = harness.cms.clone();
    let task_id = task.id.clone();
    wait_until("task delegated", || {
        let cms = cms.clone();
        let task_id = task_id.clone();
        async move {
            cms.get_task(&task_id).await.unwrap().unwrap().status == TaskStatus::Delegated
        }
    })
    .await;

    // Exactly one workspace despite the duplicate starts
    let task_row = harness.cms.get_task(&task.id).await.unwrap().unwrap();
    assert!(task_row.workspace_id.is_some());
    assert_eq!(harness.agent.created_workspaces.lock().await.len(), 1);
}

#[tokio::test]
async fn get_status_reflects_persisted_record() {
    let harness = TestHarness::new().await;
    assert!(harness.orchestrator.get_status("missing").await.unwrap().is_none());

    harness.warm_node().await;
    let task = harness.submit_task().await;

    let orchestrator = harness.orchestrator.clone();
    let task_id = task.id.clone();
    wait_until("runner record", || {
        let orchestrator = orchestrator.clone();
        let task_id = task_id.clone();
        async move { orchestrator.get_status(&task_id).await.unwrap().is_some() }
    })
    .await;

    let status = harness.orchestrator.get_status(&task.id).await.unwrap().unwrap();
    assert_eq!(status.task_id, task.id);
    assert_eq!(status.version, 1);
}

#[tokio::test]
async fn missing_preferred_node_fails_permanently() {
    let harness = TestHarness::new().await;
    let task = harness
        .cms
        .insert_task(&harness.project.id, &harness.user.id, crate::models::TaskPriority::High)
        .await
        .unwrap();
    let mut config = harness.run_config();
    config.preferred_node_id = Some("no-such-node".to_string());
    harness
        .orchestrator
        .start(&task.id, &harness.project.id, &harness.user.id, config)
        .await
        .unwrap();

    let cms = harness.cms.clone();
    let task_id = task.id.clone();
    wait_until("task failed", || {
        let cms = cms.clone();
        let task_id = task_id.clone();
        async move { cms.get_task(&task_id).await.unwrap().unwrap().status == TaskStatus::Failed }
    })
    .await;

    let task_row = harness.cms.get_task(&task.id).await.unwrap().unwrap();
    assert!(task_row.error_message.unwrap().contains("node_selection"));

    let events = harness.cms.status_events_for_task(&task.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].from_status, Some(TaskStatus::Queued));
    assert_eq!(events[0].to_status, TaskStatus::Failed);

    // Failure lands in the observability store as well
    let observability = crate::observability::ObservabilityStore::new(harness.cms.clone());
    let records = observability.records_for_task(&task.id).await.unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn node_limit_is_a_permanent_failure() {
    let mut config = fast_runner_config();
    config.max_nodes_per_user = 0;
    let harness = TestHarness::with_config(config).await;
    let task = harness.submit_task().await;

    let cms = harness.cms.clone();
    let task_id = task.id.clone();
    wait_until("task failed on limit", || {
        let cms = cms.clone();
        let task_id = task_id.clone();
        async move { cms.get_task(&task_id).await.unwrap().unwrap().status == TaskStatus::Failed }
    })
    .await;

    // No provider call was made for an over-limit user
    assert_eq!(
        harness.provider.create_calls.load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn error_callback_fails_task_and_returns_node_to_warm_pool() {
    let harness = TestHarness::new().await;
    let task = harness.submit_task().await;

    // Cold start: a node gets auto-provisioned
    let cms = harness.cms.clone();
    let task_id = task.id.clone();
    wait_until("task delegated", || {
        let cms = cms.clone();
        let task_id = task_id.clone();
        async move { cms.get_task(&task_id).await.unwrap().unwrap().status == TaskStatus::Delegated }
    })
    .await;

    harness
        .orchestrator
        .advance_workspace_ready(
            &task.id,
            WorkspaceReadyStatus::Error,
            Some("git clone failed: repository not found".to_string()),
        )
        .await
        .unwrap();

    let cms = harness.cms.clone();
    let task_id = task.id.clone();
    wait_until("task failed", || {
        let cms = cms.clone();
        let task_id = task_id.clone();
        async move { cms.get_task(&task_id).await.unwrap().unwrap().status == TaskStatus::Failed }
    })
    .await;

    let task_row = harness.cms.get_task(&task.id).await.unwrap().unwrap();
    assert!(task_row
        .error_message
        .as_deref()
        .unwrap()
        .contains("git clone failed"));

    // Cleanup stopped the workspace and marked the auto-provisioned node warm
    let workspace_id = task_row.workspace_id.unwrap();
    let workspace = harness.cms.get_workspace(&workspace_id).await.unwrap().unwrap();
    assert_eq!(workspace.status, crate::models::WorkspaceStatus::Stopped);
    assert_eq!(
        harness.agent.stopped_workspaces.lock().await.as_slice(),
        &[workspace_id]
    );

    let node_id = task_row.auto_provisioned_node_id.unwrap();
    let node = harness.cms.get_node(&node_id).await.unwrap().unwrap();
    assert!(node.warm_since.is_some());
}

#[tokio::test]
async fn error_signal_is_not_softened_by_later_callbacks() {
    let harness = TestHarness::new().await;
    harness.warm_node().await;
    let task = harness.submit_task().await;

    let cms = harness.cms.clone();
    let task_id = task.id.clone();
    wait_until("task delegated", || {
        let cms = cms.clone();
        let task_id = task_id.clone();
        async move { cms.get_task(&task_id).await.unwrap().unwrap().status == TaskStatus::Delegated }
    })
    .await;

    // Error first, then a contradictory running signal right behind it
    harness
        .orchestrator
        .advance_workspace_ready(
            &task.id,
            WorkspaceReadyStatus::Error,
            Some("provision script crashed".to_string()),
        )
        .await
        .unwrap();
    harness
        .orchestrator
        .advance_workspace_ready(&task.id, WorkspaceReadyStatus::Running, None)
        .await
        .unwrap();

    let cms = harness.cms.clone();
    let task_id = task.id.clone();
    wait_until("task failed", || {
        let cms = cms.clone();
        let task_id = task_id.clone();
        async move { cms.get_task(&task_id).await.unwrap().unwrap().status == TaskStatus::Failed }
    })
    .await;

    let task_row = harness.cms.get_task(&task.id).await.unwrap().unwrap();
    assert!(task_row
        .error_message
        .unwrap()
        .contains("provision script crashed"));
}

#[tokio::test]
async fn agent_ready_deadline_fails_permanently() {
    let mut config = fast_runner_config();
    config.agent_ready_timeout_ms = 150;
    config.agent_poll_interval_ms = 20;
    let harness = TestHarness::with_config(config).await;

    // The agent never becomes healthy
    harness.agent.script_health(&[false; 64]).await;
    let task = harness.submit_task().await;

    let cms = harness.cms.clone();
    let task_id = task.id.clone();
    wait_until("task failed on deadline", || {
        let cms = cms.clone();
        let task_id = task_id.clone();
        async move { cms.get_task(&task_id).await.unwrap().unwrap().status == TaskStatus::Failed }
    })
    .await;

    let task_row = harness.cms.get_task(&task.id).await.unwrap().unwrap();
    assert!(task_row.error_message.unwrap().contains("node_agent_ready"));

    let state = harness.orchestrator.get_status(&task.id).await.unwrap().unwrap();
    assert!(state.completed);
    assert_eq!(state.current_step, TaskStep::NodeAgentReady);
}

#[tokio::test]
async fn terminal_runner_ignores_late_callbacks() {
    let harness = TestHarness::new().await;
    let task = harness
        .cms
        .insert_task(&harness.project.id, &harness.user.id, crate::models::TaskPriority::Low)
        .await
        .unwrap();
    let mut config = harness.run_config();
    config.preferred_node_id = Some("no-such-node".to_string());
    harness
        .orchestrator
        .start(&task.id, &harness.project.id, &harness.user.id, config)
        .await
        .unwrap();

    let cms = harness.cms.clone();
    let task_id = task.id.clone();
    wait_until("task failed", || {
        let cms = cms.clone();
        let task_id = task_id.clone();
        async move { cms.get_task(&task_id).await.unwrap().unwrap().status == TaskStatus::Failed }
    })
    .await;

    // The late callback is absorbed without changing the outcome
    harness
        .orchestrator
        .advance_workspace_ready(&task.id, WorkspaceReadyStatus::Running, None)
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let task_row = harness.cms.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(task_row.status, TaskStatus::Failed);
}
