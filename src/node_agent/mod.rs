//! HTTP client for the long-lived agent process inside each VM.
//!
//! The agent is opaque to the orchestrator: it exposes a health endpoint, a
//! workspace lifecycle surface, and a session spawn call. Workspace creation
//! is asynchronous on the agent side; completion arrives later through the
//! `/workspaces/{id}/ready` callback carrying the token issued here.

use crate::config::NodeAgentConfig;
use crate::{Result, StratoError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkspaceRequest {
    pub workspace_id: String,
    pub repository: String,
    pub branch: String,
    pub output_branch: String,
    pub callback_url: String,
    pub callback_token: String,
    pub git_user_name: Option<String>,
    pub git_user_email: Option<String>,
    pub installation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnSessionRequest {
    pub workspace_id: String,
    pub session_id: String,
    pub task_title: String,
    pub task_description: Option<String>,
}

/// Node-agent seam; tests substitute a scripted agent.
#[async_trait]
pub trait NodeAgent: Send + Sync {
    /// Probe the agent health endpoint. `Ok(())` only on HTTP 200.
    async fn health_check(&self, node_ip: &str) -> Result<()>;

    /// Ask the agent to create a workspace. The agent acknowledges and
    /// reports readiness later via the signed callback.
    async fn create_workspace(&self, node_ip: &str, request: CreateWorkspaceRequest) -> Result<()>;

    /// Spawn the coding-agent session inside a ready workspace.
    async fn spawn_session(&self, node_ip: &str, request: SpawnSessionRequest) -> Result<()>;

    /// Tear down a workspace. Used by best-effort cleanup.
    async fn stop_workspace(&self, node_ip: &str, workspace_id: &str) -> Result<()>;
}

pub struct HttpNodeAgent {
    config: NodeAgentConfig,
    client: reqwest::Client,
    health_client: reqwest::Client,
}

impl HttpNodeAgent {
    pub fn new(config: NodeAgentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        // The health probe carries its own short deadline
        let health_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.health_probe_timeout_secs))
            .build()?;
        Ok(Self {
            config,
            client,
            health_client,
        })
    }

    fn url(&self, node_ip: &str, path: &str) -> String {
        format!("http://{}:{}/{}", node_ip, self.config.port, path)
    }

    async fn expect_success(&self, response: reqwest::Response, what: &str) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        Err(StratoError::NodeAgent {
            message: format!("{what} returned {status}: {snippet}"),
        })
    }
}

#[async_trait]
impl NodeAgent for HttpNodeAgent {
    async fn health_check(&self, node_ip: &str) -> Result<()> {
        let response = self
            .health_client
            .get(self.url(node_ip, "health"))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::OK {
            debug!("Agent on {} reports healthy", node_ip);
            Ok(())
        } else {
            Err(StratoError::NodeAgent {
                message: format!("agent health returned {}", response.status()),
            })
        }
    }

    async fn create_workspace(&self, node_ip: &str, request: CreateWorkspaceRequest) -> Result<()> {
        info!(
            "Requesting workspace {} on node {}",
            request.workspace_id, node_ip
        );
        let response = self
            .client
            .post(self.url(node_ip, "workspaces"))
            .json(&request)
            .send()
            .await?;
        self.expect_success(response, "workspace creation").await
    }

    async fn spawn_session(&self, node_ip: &str, request: SpawnSessionRequest) -> Result<()> {
        info!(
            "Spawning agent session {} in workspace {}",
            request.session_id, request.workspace_id
        );
        let response = self
            .client
            .post(self.url(
                node_ip,
                &format!("workspaces/{}/sessions", request.workspace_id),
            ))
            .json(&request)
            .send()
            .await?;
        self.expect_success(response, "session spawn").await
    }

    async fn stop_workspace(&self, node_ip: &str, workspace_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(node_ip, &format!("workspaces/{workspace_id}")))
            .send()
            .await?;
        // A workspace the agent no longer knows is already stopped
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        self.expect_success(response, "workspace stop").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_for(server: &mockito::Server) -> (HttpNodeAgent, String) {
        // mockito binds 127.0.0.1:<port>; point the agent client at it
        let addr = server.host_with_port();
        let (host, port) = addr.rsplit_once(':').unwrap();
        let agent = HttpNodeAgent::new(NodeAgentConfig {
            port: port.parse().unwrap(),
            health_probe_timeout_secs: 5,
        })
        .unwrap();
        (agent, host.to_string())
    }

    #[tokio::test]
    async fn health_check_requires_200() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .with_status(503)
            .create_async()
            .await;

        let (agent, host) = agent_for(&server);
        let err = agent.health_check(&host).await.unwrap_err();
        assert_eq!(err.classify(), crate::error::ErrorClass::Transient);
        mock.assert_async().await;

        server
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;
        agent.health_check(&host).await.unwrap();
    }

    #[tokio::test]
    async fn workspace_create_posts_callback_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/workspaces")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"workspace_id": "ws-1", "callback_token": "secret-token"}"#.to_string(),
            ))
            .with_status(202)
            .create_async()
            .await;

        let (agent, host) = agent_for(&server);
        agent
            .create_workspace(
                &host,
                CreateWorkspaceRequest {
                    workspace_id: "ws-1".to_string(),
                    repository: "acme/widgets".to_string(),
                    branch: "main".to_string(),
                    output_branch: "task/t-1".to_string(),
                    callback_url: "http://orchestrator/workspaces/ws-1/ready".to_string(),
                    callback_token: "secret-token".to_string(),
                    git_user_name: None,
                    git_user_email: None,
                    installation_id: None,
                },
            )
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn stop_workspace_tolerates_unknown() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/workspaces/ws-9")
            .with_status(404)
            .create_async()
            .await;

        let (agent, host) = agent_for(&server);
        agent.stop_workspace(&host, "ws-9").await.unwrap();
    }
}
