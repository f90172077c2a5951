//! Per-project session-store instance.
//!
//! One actor per project. RPC calls, viewer attachment, the idle-cleanup
//! alarm and the summary-sync timer all run on this loop, one at a time, in
//! arrival order: message persistence order is broadcast order by
//! construction. If the surrounding runtime ever allowed parallel calls into
//! one instance this ordering guarantee would need an explicit per-session
//! sequence counter instead.

use super::broadcast::{ViewerHub, ViewerId};
use super::storage::{
    ActivityEvent, BatchOutcome, ChatMessage, ChatSession, IncomingMessage, MessagePage,
    MessageRole, SessionDb, SessionStatus,
};
use crate::cms::CmsStore;
use crate::config::SessionStoreConfig;
use crate::{Result, StratoError};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const META_PROJECT_ID: &str = "projectId";

pub(crate) enum SessionCommand {
    EnsureProjectId {
        reply: oneshot::Sender<Result<()>>,
    },
    CreateSession {
        workspace_id: Option<String>,
        topic: Option<String>,
        task_id: Option<String>,
        reply: oneshot::Sender<Result<ChatSession>>,
    },
    StopSession {
        session_id: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    PersistMessage {
        session_id: String,
        role: MessageRole,
        content: String,
        tool_metadata: Option<String>,
        reply: oneshot::Sender<Result<ChatMessage>>,
    },
    PersistMessageBatch {
        session_id: String,
        messages: Vec<IncomingMessage>,
        reply: oneshot::Sender<Result<BatchOutcome>>,
    },
    ListSessions {
        status: Option<SessionStatus>,
        task_id: Option<String>,
        limit: i64,
        offset: i64,
        reply: oneshot::Sender<Result<Vec<ChatSession>>>,
    },
    GetSession {
        session_id: String,
        reply: oneshot::Sender<Result<Option<ChatSession>>>,
    },
    GetMessages {
        session_id: String,
        limit: i64,
        before: Option<i64>,
        reply: oneshot::Sender<Result<MessagePage>>,
    },
    RecordActivity {
        event_type: String,
        actor_type: String,
        actor_id: Option<String>,
        workspace_id: Option<String>,
        session_id: Option<String>,
        task_id: Option<String>,
        payload: Option<String>,
        reply: oneshot::Sender<Result<ActivityEvent>>,
    },
    ListActivity {
        event_type: Option<String>,
        limit: i64,
        before: Option<i64>,
        reply: oneshot::Sender<Result<Vec<ActivityEvent>>>,
    },
    MarkAgentCompleted {
        session_id: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    ScheduleIdleCleanup {
        session_id: String,
        workspace_id: String,
        task_id: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    CancelIdleCleanup {
        session_id: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    ResetIdleCleanup {
        session_id: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    LinkWorkspace {
        session_id: String,
        workspace_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    AttachViewer {
        sender: mpsc::UnboundedSender<String>,
        reply: oneshot::Sender<ViewerId>,
    },
    DetachViewer {
        viewer_id: ViewerId,
    },
}

pub(crate) struct SessionStoreInstance {
    project_id: String,
    db: SessionDb,
    cms: CmsStore,
    config: SessionStoreConfig,
    hub: ViewerHub,
    rx: mpsc::UnboundedReceiver<SessionCommand>,
    cleanup_alarm: Option<Instant>,
    summary_due: Option<Instant>,
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl SessionStoreInstance {
    pub(crate) fn new(
        project_id: String,
        db: SessionDb,
        cms: CmsStore,
        config: SessionStoreConfig,
        rx: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Self {
        Self {
            project_id,
            db,
            cms,
            config,
            hub: ViewerHub::new(),
            rx,
            cleanup_alarm: None,
            summary_due: None,
        }
    }

    pub(crate) async fn run(mut self) {
        // Schedules from a previous process incarnation re-arm immediately
        if let Err(e) = self.recompute_cleanup_alarm().await {
            warn!(
                "Session store {} failed to restore cleanup alarm: {}",
                self.project_id, e
            );
        }

        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                _ = wait_for(self.cleanup_alarm) => {
                    self.cleanup_alarm = None;
                    self.run_idle_cleanups().await;
                }
                _ = wait_for(self.summary_due) => {
                    self.summary_due = None;
                    self.sync_summary().await;
                }
            }
        }

        debug!("Session store instance {} finished", self.project_id);
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::EnsureProjectId { reply } => {
                let result = self.db.set_meta(META_PROJECT_ID, &self.project_id).await;
                let _ = reply.send(result);
            }
            SessionCommand::CreateSession {
                workspace_id,
                topic,
                task_id,
                reply,
            } => {
                let result = self
                    .create_session(workspace_id.as_deref(), topic.as_deref(), task_id.as_deref())
                    .await;
                let _ = reply.send(result);
            }
            SessionCommand::StopSession { session_id, reply } => {
                let result = self.stop_session(&session_id).await;
                let _ = reply.send(result);
            }
            SessionCommand::PersistMessage {
                session_id,
                role,
                content,
                tool_metadata,
                reply,
            } => {
                let result = self
                    .persist_message(&session_id, role, &content, tool_metadata.as_deref())
                    .await;
                let _ = reply.send(result);
            }
            SessionCommand::PersistMessageBatch {
                session_id,
                messages,
                reply,
            } => {
                let result = self.persist_message_batch(&session_id, messages).await;
                let _ = reply.send(result);
            }
            SessionCommand::ListSessions {
                status,
                task_id,
                limit,
                offset,
                reply,
            } => {
                let result = self
                    .db
                    .list_sessions(status, task_id.as_deref(), limit, offset)
                    .await;
                let _ = reply.send(result);
            }
            SessionCommand::GetSession { session_id, reply } => {
                let _ = reply.send(self.db.get_session(&session_id).await);
            }
            SessionCommand::GetMessages {
                session_id,
                limit,
                before,
                reply,
            } => {
                let _ = reply.send(self.db.get_messages(&session_id, limit, before).await);
            }
            SessionCommand::RecordActivity {
                event_type,
                actor_type,
                actor_id,
                workspace_id,
                session_id,
                task_id,
                payload,
                reply,
            } => {
                let result = self
                    .record_activity(
                        &event_type,
                        &actor_type,
                        actor_id.as_deref(),
                        workspace_id.as_deref(),
                        session_id.as_deref(),
                        task_id.as_deref(),
                        payload.as_deref(),
                    )
                    .await;
                let _ = reply.send(result);
            }
            SessionCommand::ListActivity {
                event_type,
                limit,
                before,
                reply,
            } => {
                let _ = reply.send(
                    self.db
                        .list_activity(event_type.as_deref(), limit, before)
                        .await,
                );
            }
            SessionCommand::MarkAgentCompleted { session_id, reply } => {
                let result = self.mark_agent_completed(&session_id).await;
                let _ = reply.send(result);
            }
            SessionCommand::ScheduleIdleCleanup {
                session_id,
                workspace_id,
                task_id,
                reply,
            } => {
                let result = self
                    .schedule_idle_cleanup(&session_id, &workspace_id, task_id.as_deref())
                    .await;
                let _ = reply.send(result);
            }
            SessionCommand::CancelIdleCleanup { session_id, reply } => {
                let result = self.cancel_idle_cleanup(&session_id).await;
                let _ = reply.send(result);
            }
            SessionCommand::ResetIdleCleanup { session_id, reply } => {
                let result = self.reset_idle_cleanup(&session_id).await;
                let _ = reply.send(result);
            }
            SessionCommand::LinkWorkspace {
                session_id,
                workspace_id,
                reply,
            } => {
                let result = self
                    .db
                    .set_session_workspace(&session_id, &workspace_id)
                    .await
                    .map(|_| ());
                let _ = reply.send(result);
            }
            SessionCommand::AttachViewer { sender, reply } => {
                let _ = reply.send(self.hub.attach(sender));
            }
            SessionCommand::DetachViewer { viewer_id } => {
                self.hub.detach(viewer_id);
            }
        }
    }

    // ---- session operations ----

    async fn create_session(
        &mut self,
        workspace_id: Option<&str>,
        topic: Option<&str>,
        task_id: Option<&str>,
    ) -> Result<ChatSession> {
        let total = self.db.count_sessions().await?;
        if total >= self.config.max_sessions_per_project as i64 {
            return Err(StratoError::LimitExceeded(format!(
                "project {} reached {} sessions",
                self.project_id, total
            )));
        }

        let session = self.db.insert_session(workspace_id, topic, task_id).await?;
        info!(
            "Session {} created in project {}",
            session.id, self.project_id
        );

        self.record_activity(
            "session.started",
            "system",
            None,
            workspace_id,
            Some(&session.id),
            task_id,
            None,
        )
        .await?;
        self.hub.broadcast("session.created", &session);
        self.schedule_summary_sync();
        Ok(session)
    }

    async fn stop_session(&mut self, session_id: &str) -> Result<bool> {
        let stopped = self.db.stop_session(session_id).await?;
        if stopped {
            self.record_activity(
                "session.stopped",
                "system",
                None,
                None,
                Some(session_id),
                None,
                None,
            )
            .await?;
            self.hub
                .broadcast("session.stopped", &json!({ "sessionId": session_id }));
            self.schedule_summary_sync();
        }
        Ok(stopped)
    }

    async fn require_session(&self, session_id: &str) -> Result<ChatSession> {
        self.db
            .get_session(session_id)
            .await?
            .ok_or_else(|| StratoError::NotFound(format!("session {session_id}")))
    }

    async fn persist_message(
        &mut self,
        session_id: &str,
        role: MessageRole,
        content: &str,
        tool_metadata: Option<&str>,
    ) -> Result<ChatMessage> {
        self.require_session(session_id).await?;

        let count = self.db.count_messages(session_id).await?;
        if count >= self.config.max_messages_per_session as i64 {
            return Err(StratoError::LimitExceeded(format!(
                "session {session_id} reached {count} messages"
            )));
        }

        let message = self
            .db
            .insert_message(session_id, None, role, content, tool_metadata, None)
            .await?;
        self.hub.broadcast("message.new", &message);
        Ok(message)
    }

    /// Batch persistence with client-id dedupe. A replayed batch reports
    /// its already-stored entries as duplicates; `persisted + duplicates`
    /// always equals the input size unless the session cap cuts it short.
    async fn persist_message_batch(
        &mut self,
        session_id: &str,
        messages: Vec<IncomingMessage>,
    ) -> Result<BatchOutcome> {
        self.require_session(session_id).await?;

        let mut persisted: Vec<ChatMessage> = Vec::new();
        let mut duplicates = 0usize;
        let mut count = self.db.count_messages(session_id).await?;

        for incoming in messages {
            if self.db.message_exists(session_id, &incoming.message_id).await? {
                duplicates += 1;
                continue;
            }
            if count >= self.config.max_messages_per_session as i64 {
                warn!(
                    "Session {} hit the message cap mid-batch, truncating",
                    session_id
                );
                break;
            }
            let created_at = incoming
                .timestamp
                .as_deref()
                .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
                .map(|dt| dt.timestamp_millis());
            let message = self
                .db
                .insert_message(
                    session_id,
                    Some(&incoming.message_id),
                    incoming.role,
                    &incoming.content,
                    incoming.tool_metadata.as_deref(),
                    created_at,
                )
                .await?;
            count += 1;
            persisted.push(message);
        }

        let outcome = BatchOutcome {
            persisted: persisted.len(),
            duplicates,
        };
        self.hub.broadcast(
            "messages.batch",
            &json!({
                "sessionId": session_id,
                "messages": persisted,
                "duplicates": duplicates,
            }),
        );
        Ok(outcome)
    }

    async fn mark_agent_completed(&mut self, session_id: &str) -> Result<bool> {
        self.require_session(session_id).await?;
        let changed = self.db.mark_agent_completed(session_id).await?;
        if changed {
            self.hub.broadcast(
                "session.agent_completed",
                &json!({ "sessionId": session_id }),
            );
        }
        Ok(changed)
    }

    // ---- activity ----

    #[allow(clippy::too_many_arguments)]
    async fn record_activity(
        &mut self,
        event_type: &str,
        actor_type: &str,
        actor_id: Option<&str>,
        workspace_id: Option<&str>,
        session_id: Option<&str>,
        task_id: Option<&str>,
        payload: Option<&str>,
    ) -> Result<ActivityEvent> {
        let event = self
            .db
            .insert_activity(
                event_type,
                actor_type,
                actor_id,
                workspace_id,
                session_id,
                task_id,
                payload,
            )
            .await?;
        self.hub.broadcast("activity.new", &event);
        self.schedule_summary_sync();
        Ok(event)
    }

    // ---- idle cleanup ----

    async fn schedule_idle_cleanup(
        &mut self,
        session_id: &str,
        workspace_id: &str,
        task_id: Option<&str>,
    ) -> Result<()> {
        let cleanup_at = now_ms() + self.config.idle_timeout().as_millis() as i64;
        self.db
            .upsert_cleanup_schedule(session_id, workspace_id, task_id, cleanup_at)
            .await?;
        self.recompute_cleanup_alarm().await
    }

    async fn cancel_idle_cleanup(&mut self, session_id: &str) -> Result<bool> {
        let removed = self.db.delete_cleanup_schedule(session_id).await?;
        self.recompute_cleanup_alarm().await?;
        Ok(removed)
    }

    async fn reset_idle_cleanup(&mut self, session_id: &str) -> Result<bool> {
        let cleanup_at = now_ms() + self.config.idle_timeout().as_millis() as i64;
        let reset = self.db.reset_cleanup_schedule(session_id, cleanup_at).await?;
        self.recompute_cleanup_alarm().await?;
        Ok(reset)
    }

    /// Point the single alarm at the earliest scheduled cleanup, or clear it.
    async fn recompute_cleanup_alarm(&mut self) -> Result<()> {
        self.cleanup_alarm = self.db.next_cleanup_at().await?.map(|at| {
            let delta_ms = (at - now_ms()).max(0) as u64;
            Instant::now() + std::time::Duration::from_millis(delta_ms)
        });
        Ok(())
    }

    async fn run_idle_cleanups(&mut self) {
        let now = now_ms();
        let expired = match self.db.expired_cleanup_schedules(now).await {
            Ok(expired) => expired,
            Err(e) => {
                error!(
                    "Session store {} failed to read cleanup schedules: {}",
                    self.project_id, e
                );
                return;
            }
        };

        for schedule in expired {
            match self.cleanup_idle_session(&schedule).await {
                Ok(()) => {
                    info!(
                        "Idle cleanup completed for session {} (project {})",
                        schedule.session_id, self.project_id
                    );
                }
                Err(e) => {
                    self.handle_cleanup_failure(&schedule, &e).await;
                }
            }
        }

        if let Err(e) = self.recompute_cleanup_alarm().await {
            warn!(
                "Session store {} failed to recompute cleanup alarm: {}",
                self.project_id, e
            );
        }
    }

    async fn cleanup_idle_session(
        &mut self,
        schedule: &super::storage::IdleCleanupSchedule,
    ) -> Result<()> {
        // Stop the session quietly; the idle_cleanup broadcast below is the
        // viewer-facing signal
        self.db.stop_session(&schedule.session_id).await?;

        if let Some(task_id) = &schedule.task_id {
            self.cms.complete_task_if_in_flight(task_id).await?;
        }
        self.cms
            .stop_workspace_if_active(&schedule.workspace_id)
            .await?;

        self.db.delete_cleanup_schedule(&schedule.session_id).await?;
        self.record_activity(
            "session.idle_cleanup",
            "system",
            None,
            Some(&schedule.workspace_id),
            Some(&schedule.session_id),
            schedule.task_id.as_deref(),
            None,
        )
        .await?;
        self.hub.broadcast(
            "session.idle_cleanup",
            &json!({
                "sessionId": schedule.session_id,
                "workspaceId": schedule.workspace_id,
            }),
        );
        Ok(())
    }

    async fn handle_cleanup_failure(
        &mut self,
        schedule: &super::storage::IdleCleanupSchedule,
        error: &StratoError,
    ) {
        if schedule.retry_count >= self.config.idle_cleanup_max_retries as i64 {
            error!(
                "Idle cleanup for session {} exhausted retries: {}",
                schedule.session_id, error
            );
            let _ = self.db.delete_cleanup_schedule(&schedule.session_id).await;
            let _ = self
                .record_activity(
                    "session.idle_cleanup_failed",
                    "system",
                    None,
                    Some(&schedule.workspace_id),
                    Some(&schedule.session_id),
                    schedule.task_id.as_deref(),
                    None,
                )
                .await;
            // Leave a trace in the conversation so the user knows the
            // workspace may still be running
            let _ = self
                .db
                .insert_message(
                    &schedule.session_id,
                    None,
                    MessageRole::System,
                    "Automatic idle cleanup failed repeatedly; the workspace may still be running and can be stopped manually.",
                    None,
                    None,
                )
                .await;
        } else {
            let retry_at = now_ms() + self.config.idle_cleanup_retry_delay_ms as i64;
            warn!(
                "Idle cleanup for session {} failed (attempt {}), retrying: {}",
                schedule.session_id,
                schedule.retry_count + 1,
                error
            );
            if let Err(e) = self
                .db
                .record_cleanup_retry(&schedule.session_id, retry_at)
                .await
            {
                error!(
                    "Failed to record cleanup retry for session {}: {}",
                    schedule.session_id, e
                );
            }
        }
    }

    // ---- summary syncback ----

    /// Arm the coalescing window unless one is already pending.
    fn schedule_summary_sync(&mut self) {
        if self.summary_due.is_none() {
            self.summary_due = Some(
                Instant::now()
                    + std::time::Duration::from_millis(self.config.summary_sync_debounce_ms),
            );
        }
    }

    /// Push activity/session counters up to the CMS project row. Failures
    /// are logged and never retried; the next activity re-arms the timer.
    async fn sync_summary(&mut self) {
        let project_id = match self.db.get_meta(META_PROJECT_ID).await {
            Ok(Some(bound)) => bound,
            _ => self.project_id.clone(),
        };

        let latest = match self.db.latest_activity_at().await {
            Ok(latest) => latest,
            Err(e) => {
                warn!("Summary sync read failed for project {}: {}", project_id, e);
                return;
            }
        };
        let active = match self.db.count_active_sessions().await {
            Ok(active) => active,
            Err(e) => {
                warn!("Summary sync read failed for project {}: {}", project_id, e);
                return;
            }
        };

        let last_activity_at =
            latest.and_then(|ms| chrono::DateTime::from_timestamp_millis(ms));
        if let Err(e) = self
            .cms
            .update_project_summary(&project_id, last_activity_at, active)
            .await
        {
            warn!("Summary sync to CMS failed for project {}: {}", project_id, e);
        } else {
            debug!(
                "Summary synced for project {} (active sessions: {})",
                project_id, active
            );
        }
    }
}
