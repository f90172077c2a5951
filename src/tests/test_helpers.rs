//! Shared harness for orchestration tests: an in-memory CMS plus scripted
//! provider and agent doubles with fast timers.

use crate::cms::CmsStore;
use crate::config::TaskRunnerConfig;
use crate::models::{Node, NodeStatus, Project, Task, TaskPriority, User, UserRole};
use crate::node_agent::{CreateWorkspaceRequest, NodeAgent, SpawnSessionRequest};
use crate::node_lifecycle::NodeLifecycleManager;
use crate::orchestrator::{TaskOrchestrator, TaskRunConfig};
use crate::provider::{CloudProvider, CreateInstanceRequest, ProviderInstance};
use crate::{Result, StratoError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Runner config with millisecond timers so pipelines finish in test time.
pub(crate) fn fast_runner_config() -> TaskRunnerConfig {
    TaskRunnerConfig {
        step_max_retries: 3,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 50,
        agent_poll_interval_ms: 20,
        agent_ready_timeout_ms: 2_000,
        workspace_ready_timeout_ms: 2_000,
        provision_poll_interval_ms: 20,
        max_nodes_per_user: 10,
        max_workspaces_per_node: 10,
        node_cpu_threshold_percent: 80.0,
        node_memory_threshold_percent: 85.0,
    }
}

/// Scripted cloud provider. Instances are held in memory; queued statuses
/// drive creation and polling outcomes, defaulting to immediately running.
pub(crate) struct ScriptedProvider {
    instances: Mutex<HashMap<String, ProviderInstance>>,
    create_statuses: Mutex<VecDeque<String>>,
    poll_statuses: Mutex<VecDeque<String>>,
    pub create_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            create_statuses: Mutex::new(VecDeque::new()),
            poll_statuses: Mutex::new(VecDeque::new()),
            create_calls: AtomicUsize::new(0),
        }
    }

    pub async fn script_create_status(&self, status: &str) {
        self.create_statuses
            .lock()
            .await
            .push_back(status.to_string());
    }

    pub async fn script_poll_statuses(&self, statuses: &[&str]) {
        let mut queue = self.poll_statuses.lock().await;
        for status in statuses {
            queue.push_back(status.to_string());
        }
    }
}

#[async_trait]
impl CloudProvider for ScriptedProvider {
    async fn create_instance(&self, request: CreateInstanceRequest) -> Result<ProviderInstance> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let status = self
            .create_statuses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| "running".to_string());
        let instance = ProviderInstance {
            id: format!("prov-{}", request.name),
            status,
            public_ip: Some("10.0.0.9".to_string()),
        };
        self.instances
            .lock()
            .await
            .insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, instance_id: &str) -> Result<ProviderInstance> {
        let mut instances = self.instances.lock().await;
        let Some(instance) = instances.get_mut(instance_id) else {
            return Err(StratoError::NotFound(format!(
                "provider instance {instance_id}"
            )));
        };
        if let Some(next) = self.poll_statuses.lock().await.pop_front() {
            instance.status = next;
        }
        Ok(instance.clone())
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        self.instances.lock().await.remove(instance_id);
        Ok(())
    }
}

/// Scripted in-VM agent. Health answers pop from a queue (empty = healthy);
/// workspace and session calls are recorded for assertions.
pub(crate) struct ScriptedAgent {
    health_script: Mutex<VecDeque<bool>>,
    pub health_calls: AtomicUsize,
    pub created_workspaces: Mutex<Vec<CreateWorkspaceRequest>>,
    pub spawned_sessions: Mutex<Vec<SpawnSessionRequest>>,
    pub stopped_workspaces: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self {
            health_script: Mutex::new(VecDeque::new()),
            health_calls: AtomicUsize::new(0),
            created_workspaces: Mutex::new(Vec::new()),
            spawned_sessions: Mutex::new(Vec::new()),
            stopped_workspaces: Mutex::new(Vec::new()),
        }
    }

    pub async fn script_health(&self, answers: &[bool]) {
        let mut queue = self.health_script.lock().await;
        for answer in answers {
            queue.push_back(*answer);
        }
    }
}

#[async_trait]
impl NodeAgent for ScriptedAgent {
    async fn health_check(&self, _node_ip: &str) -> Result<()> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        match self.health_script.lock().await.pop_front() {
            Some(false) => Err(StratoError::NodeAgent {
                message: "agent health returned 503".to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn create_workspace(&self, _node_ip: &str, request: CreateWorkspaceRequest) -> Result<()> {
        self.created_workspaces.lock().await.push(request);
        Ok(())
    }

    async fn spawn_session(&self, _node_ip: &str, request: SpawnSessionRequest) -> Result<()> {
        self.spawned_sessions.lock().await.push(request);
        Ok(())
    }

    async fn stop_workspace(&self, _node_ip: &str, workspace_id: &str) -> Result<()> {
        self.stopped_workspaces
            .lock()
            .await
            .push(workspace_id.to_string());
        Ok(())
    }
}

pub(crate) struct TestHarness {
    pub cms: CmsStore,
    pub nlm: NodeLifecycleManager,
    pub provider: Arc<ScriptedProvider>,
    pub agent: Arc<ScriptedAgent>,
    pub orchestrator: TaskOrchestrator,
    pub user: User,
    pub project: Project,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(fast_runner_config()).await
    }

    pub async fn with_config(config: TaskRunnerConfig) -> Self {
        let cms = CmsStore::connect_in_memory().await.unwrap();
        let nlm = NodeLifecycleManager::new(cms.clone());
        let provider = Arc::new(ScriptedProvider::new());
        let agent = Arc::new(ScriptedAgent::new());
        let orchestrator = TaskOrchestrator::new(
            cms.clone(),
            nlm.clone(),
            provider.clone(),
            agent.clone(),
            None,
            config,
            "http://orchestrator.test".to_string(),
        );
        let user = cms.create_user("dev@example.com", UserRole::User).await.unwrap();
        let project = cms
            .create_project(&user.id, "acme/widgets", Some(4242))
            .await
            .unwrap();
        Self {
            cms,
            nlm,
            provider,
            agent,
            orchestrator,
            user,
            project,
        }
    }

    pub fn run_config(&self) -> TaskRunConfig {
        TaskRunConfig {
            vm_size: "medium".to_string(),
            vm_location: "nbg1".to_string(),
            branch: "main".to_string(),
            preferred_node_id: None,
            task_title: "Fix the login flow".to_string(),
            task_description: Some("Users get logged out on refresh".to_string()),
            repository: "acme/widgets".to_string(),
            installation_id: "install-1".to_string(),
            output_branch: None,
            chat_session_id: None,
            git_user_name: Some("Dev".to_string()),
            git_user_email: Some("dev@example.com".to_string()),
            git_user_id: None,
        }
    }

    pub async fn submit_task(&self) -> Task {
        let task = self
            .cms
            .insert_task(&self.project.id, &self.user.id, TaskPriority::Medium)
            .await
            .unwrap();
        self.orchestrator
            .start(&task.id, &self.project.id, &self.user.id, self.run_config())
            .await
            .unwrap();
        task
    }

    pub async fn warm_node(&self) -> Node {
        let node = self
            .cms
            .insert_node(&self.user.id, "medium", "nbg1", NodeStatus::Running)
            .await
            .unwrap();
        self.cms
            .set_node_provider_instance(&node.id, "prov-seeded", Some("10.0.0.5"))
            .await
            .unwrap();
        self.cms.mark_node_warm(&node.id).await.unwrap();
        self.cms.get_node(&node.id).await.unwrap().unwrap()
    }
}

/// Poll a condition until it holds or the test deadline passes.
pub(crate) async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
