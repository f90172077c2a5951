//! Per-project session store.
//!
//! Persistent chat history and activity feeds with real-time fan-out to
//! browser viewers. One isolated instance per project: its own SQLite
//! database file, its own actor loop, its own idle-cleanup alarm. The
//! runtime below is the registry that opens instances on demand and keeps
//! the RPC surface typed.

mod broadcast;
mod instance;
pub mod migrations;
mod storage;

#[cfg(test)]
mod tests;

pub use broadcast::ViewerId;
pub use storage::{
    capture_topic, ActivityEvent, BatchOutcome, ChatMessage, ChatSession, IncomingMessage,
    MessagePage, MessageRole, SessionStatus,
};

use crate::cms::CmsStore;
use crate::config::SessionStoreConfig;
use crate::orchestrator::SessionLinker;
use crate::{Result, StratoError};
use async_trait::async_trait;
use instance::{SessionCommand, SessionStoreInstance};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use storage::SessionDb;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::info;

#[derive(Clone)]
pub struct SessionStoreRuntime {
    cms: CmsStore,
    config: SessionStoreConfig,
    /// Root for `sessions/{project_id}.db`; None keeps stores in memory.
    data_dir: Option<PathBuf>,
    instances: Arc<Mutex<HashMap<String, SessionStoreHandle>>>,
}

impl SessionStoreRuntime {
    pub fn new(cms: CmsStore, config: SessionStoreConfig, data_dir: PathBuf) -> Self {
        Self {
            cms,
            config,
            data_dir: Some(data_dir),
            instances: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Test constructor: every project store lives in memory.
    pub fn in_memory(cms: CmsStore, config: SessionStoreConfig) -> Self {
        Self {
            cms,
            config,
            data_dir: None,
            instances: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The live handle for a project, opening and migrating its database
    /// under the startup barrier on first use.
    pub async fn handle_for(&self, project_id: &str) -> Result<SessionStoreHandle> {
        let mut instances = self.instances.lock().await;
        if let Some(handle) = instances.get(project_id) {
            return Ok(handle.clone());
        }

        let db = match &self.data_dir {
            Some(root) => {
                let dir = root.join("sessions");
                tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                    StratoError::SessionStore {
                        message: format!("cannot create session data dir: {e}"),
                    }
                })?;
                SessionDb::open(&dir.join(format!("{project_id}.db"))).await?
            }
            None => SessionDb::open_in_memory().await?,
        };

        // Startup barrier: no command is accepted until the schema is current
        migrations::apply_migrations(db.pool()).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let actor = SessionStoreInstance::new(
            project_id.to_string(),
            db,
            self.cms.clone(),
            self.config.clone(),
            rx,
        );
        tokio::spawn(actor.run());

        let handle = SessionStoreHandle { tx };
        handle.ensure_project_id().await?;
        instances.insert(project_id.to_string(), handle.clone());
        info!("Session store instance opened for project {}", project_id);
        Ok(handle)
    }
}

#[async_trait]
impl SessionLinker for SessionStoreRuntime {
    async fn link_workspace_to_session(
        &self,
        project_id: &str,
        session_id: &str,
        workspace_id: &str,
    ) -> Result<()> {
        self.handle_for(project_id)
            .await?
            .link_workspace(session_id, workspace_id)
            .await
    }
}

/// Typed RPC surface onto one project's instance. Cheap to clone; all calls
/// serialise through the instance mailbox.
#[derive(Clone)]
pub struct SessionStoreHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionStoreHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> SessionCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| StratoError::SessionStore {
            message: "session store instance is gone".to_string(),
        })?;
        rx.await.map_err(|_| StratoError::SessionStore {
            message: "session store instance dropped the request".to_string(),
        })?
    }

    pub async fn ensure_project_id(&self) -> Result<()> {
        self.call(|reply| SessionCommand::EnsureProjectId { reply }).await
    }

    pub async fn create_session(
        &self,
        workspace_id: Option<String>,
        topic: Option<String>,
        task_id: Option<String>,
    ) -> Result<ChatSession> {
        self.call(|reply| SessionCommand::CreateSession {
            workspace_id,
            topic,
            task_id,
            reply,
        })
        .await
    }

    pub async fn stop_session(&self, session_id: &str) -> Result<bool> {
        let session_id = session_id.to_string();
        self.call(|reply| SessionCommand::StopSession { session_id, reply })
            .await
    }

    pub async fn persist_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
        tool_metadata: Option<String>,
    ) -> Result<ChatMessage> {
        let session_id = session_id.to_string();
        let content = content.to_string();
        self.call(|reply| SessionCommand::PersistMessage {
            session_id,
            role,
            content,
            tool_metadata,
            reply,
        })
        .await
    }

    pub async fn persist_message_batch(
        &self,
        session_id: &str,
        messages: Vec<IncomingMessage>,
    ) -> Result<BatchOutcome> {
        let session_id = session_id.to_string();
        self.call(|reply| SessionCommand::PersistMessageBatch {
            session_id,
            messages,
            reply,
        })
        .await
    }

    pub async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        task_id: Option<String>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChatSession>> {
        self.call(|reply| SessionCommand::ListSessions {
            status,
            task_id,
            limit,
            offset,
            reply,
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>> {
        let session_id = session_id.to_string();
        self.call(|reply| SessionCommand::GetSession { session_id, reply })
            .await
    }

    pub async fn get_messages(
        &self,
        session_id: &str,
        limit: i64,
        before: Option<i64>,
    ) -> Result<MessagePage> {
        let session_id = session_id.to_string();
        self.call(|reply| SessionCommand::GetMessages {
            session_id,
            limit,
            before,
            reply,
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_activity(
        &self,
        event_type: &str,
        actor_type: &str,
        actor_id: Option<String>,
        workspace_id: Option<String>,
        session_id: Option<String>,
        task_id: Option<String>,
        payload: Option<String>,
    ) -> Result<ActivityEvent> {
        let event_type = event_type.to_string();
        let actor_type = actor_type.to_string();
        self.call(|reply| SessionCommand::RecordActivity {
            event_type,
            actor_type,
            actor_id,
            workspace_id,
            session_id,
            task_id,
            payload,
            reply,
        })
        .await
    }

    pub async fn list_activity(
        &self,
        event_type: Option<String>,
        limit: i64,
        before: Option<i64>,
    ) -> Result<Vec<ActivityEvent>> {
        self.call(|reply| SessionCommand::ListActivity {
            event_type,
            limit,
            before,
            reply,
        })
        .await
    }

    pub async fn mark_agent_completed(&self, session_id: &str) -> Result<bool> {
        let session_id = session_id.to_string();
        self.call(|reply| SessionCommand::MarkAgentCompleted { session_id, reply })
            .await
    }

    pub async fn schedule_idle_cleanup(
        &self,
        session_id: &str,
        workspace_id: &str,
        task_id: Option<String>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        let workspace_id = workspace_id.to_string();
        self.call(|reply| SessionCommand::ScheduleIdleCleanup {
            session_id,
            workspace_id,
            task_id,
            reply,
        })
        .await
    }

    pub async fn cancel_idle_cleanup(&self, session_id: &str) -> Result<bool> {
        let session_id = session_id.to_string();
        self.call(|reply| SessionCommand::CancelIdleCleanup { session_id, reply })
            .await
    }

    pub async fn reset_idle_cleanup(&self, session_id: &str) -> Result<bool> {
        let session_id = session_id.to_string();
        self.call(|reply| SessionCommand::ResetIdleCleanup { session_id, reply })
            .await
    }

    pub async fn link_workspace(&self, session_id: &str, workspace_id: &str) -> Result<()> {
        let session_id = session_id.to_string();
        let workspace_id = workspace_id.to_string();
        self.call(|reply| SessionCommand::LinkWorkspace {
            session_id,
            workspace_id,
            reply,
        })
        .await
    }

    /// Attach a viewer socket; returned id is used to detach.
    pub async fn attach_viewer(&self, sender: mpsc::UnboundedSender<String>) -> Result<ViewerId> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::AttachViewer { sender, reply })
            .map_err(|_| StratoError::SessionStore {
                message: "session store instance is gone".to_string(),
            })?;
        rx.await.map_err(|_| StratoError::SessionStore {
            message: "session store instance dropped the request".to_string(),
        })
    }

    pub fn detach_viewer(&self, viewer_id: ViewerId) {
        let _ = self.tx.send(SessionCommand::DetachViewer { viewer_id });
    }
}
