//! Opaque REST client for the external cloud provider.
//!
//! The provider owns VM lifecycle; this module only creates, inspects and
//! deletes instances. All calls go through a circuit breaker so a failing
//! provider degrades into fast transient errors instead of piled-up
//! timeouts.

pub mod circuit_breaker;

use crate::config::ProviderConfig;
use crate::{Result, StratoError};
use async_trait::async_trait;
use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A provisioned VM as the provider reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInstance {
    pub id: String,
    pub status: String,
    pub public_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub size: String,
    pub location: String,
}

/// Cloud-provider seam; the orchestrator only sees this trait so tests can
/// substitute a scripted provider.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn create_instance(&self, request: CreateInstanceRequest) -> Result<ProviderInstance>;
    async fn get_instance(&self, instance_id: &str) -> Result<ProviderInstance>;
    async fn delete_instance(&self, instance_id: &str) -> Result<()>;
}

pub struct HttpCloudProvider {
    config: ProviderConfig,
    client: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
}

impl HttpCloudProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            config,
            client,
            breaker: Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn guard(&self) -> Result<()> {
        if !self.breaker.should_allow_request().await {
            warn!("Provider circuit breaker is open, rejecting request");
            return Err(StratoError::Provider {
                message: "provider temporarily unavailable (circuit open)".to_string(),
            });
        }
        Ok(())
    }

    /// Convert a non-success response into a classified provider error.
    async fn error_from_response(&self, response: reqwest::Response) -> StratoError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        StratoError::Provider {
            message: format!("provider returned {status}: {snippet}"),
        }
    }

    async fn track<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.breaker.record_success().await,
            Err(e) => {
                // Only upstream trouble trips the breaker; 4xx responses are
                // the caller's problem
                if e.classify() == crate::error::ErrorClass::Transient {
                    self.breaker.record_failure().await;
                } else {
                    self.breaker.record_success().await;
                }
            }
        }
        result
    }
}

#[async_trait]
impl CloudProvider for HttpCloudProvider {
    async fn create_instance(&self, request: CreateInstanceRequest) -> Result<ProviderInstance> {
        self.guard().await?;
        info!(
            "Creating provider instance {} ({} / {})",
            request.name, request.size, request.location
        );

        let result = async {
            let response = self
                .client
                .post(self.url("servers"))
                .bearer_auth(&self.config.api_token)
                .json(&request)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(self.error_from_response(response).await);
            }
            Ok(response.json::<ProviderInstance>().await?)
        }
        .await;

        self.track(result).await
    }

    async fn get_instance(&self, instance_id: &str) -> Result<ProviderInstance> {
        self.guard().await?;

        let result = async {
            let response = self
                .client
                .get(self.url(&format!("servers/{instance_id}")))
                .bearer_auth(&self.config.api_token)
                .send()
                .await?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(StratoError::NotFound(format!(
                    "provider instance {instance_id}"
                )));
            }
            if !response.status().is_success() {
                return Err(self.error_from_response(response).await);
            }
            Ok(response.json::<ProviderInstance>().await?)
        }
        .await;

        self.track(result).await
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        self.guard().await?;
        info!("Deleting provider instance {}", instance_id);

        let result = async {
            let response = self
                .client
                .delete(self.url(&format!("servers/{instance_id}")))
                .bearer_auth(&self.config.api_token)
                .send()
                .await?;
            // Deleting an already-gone instance is a success for cleanup
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(());
            }
            if !response.status().is_success() {
                return Err(self.error_from_response(response).await);
            }
            Ok(())
        }
        .await;

        self.track(result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_provider(base_url: &str) -> HttpCloudProvider {
        HttpCloudProvider::new(ProviderConfig {
            base_url: base_url.to_string(),
            api_token: "test-token".to_string(),
            request_timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn create_instance_parses_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/servers")
            .match_header("authorization", "Bearer test-token")
            .with_status(201)
            .with_body(r#"{"id": "inst-9", "status": "initializing", "public_ip": "10.1.2.3"}"#)
            .create_async()
            .await;

        let provider = test_provider(&server.url());
        let instance = provider
            .create_instance(CreateInstanceRequest {
                name: "node-1".to_string(),
                size: "medium".to_string(),
                location: "nbg1".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(instance.id, "inst-9");
        assert_eq!(instance.public_ip.as_deref(), Some("10.1.2.3"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_instance_maps_to_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/servers/ghost")
            .with_status(404)
            .create_async()
            .await;

        let provider = test_provider(&server.url());
        let err = provider.get_instance("ghost").await.unwrap_err();
        assert!(matches!(err, StratoError::NotFound(_)));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn server_errors_classify_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/servers/inst-1")
            .with_status(503)
            .with_body("upstream overloaded")
            .create_async()
            .await;

        let provider = test_provider(&server.url());
        let err = provider.get_instance("inst-1").await.unwrap_err();
        assert_eq!(err.classify(), crate::error::ErrorClass::Transient);
    }

    #[tokio::test]
    async fn delete_tolerates_already_gone() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/servers/gone")
            .with_status(404)
            .create_async()
            .await;

        let provider = test_provider(&server.url());
        provider.delete_instance("gone").await.unwrap();
    }
}
