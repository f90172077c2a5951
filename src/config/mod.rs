use crate::{constants, Result, StratoError};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub provider: ProviderConfig,
    pub node_agent: NodeAgentConfig,
    pub task_runner: TaskRunnerConfig,
    pub session_store: SessionStoreConfig,
    pub sweeper: SweeperConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// CMS database URL (SQLite).
    pub url: String,
    /// Root directory for per-project session databases.
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Shared bearer token presented by node agents on `/nodes/*` callbacks.
    pub node_agent_token: String,
    pub allowed_origins: Vec<String>,
    pub max_error_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_token: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAgentConfig {
    /// Port the in-VM agent listens on.
    pub port: u16,
    pub health_probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunnerConfig {
    pub step_max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub agent_poll_interval_ms: u64,
    pub agent_ready_timeout_ms: u64,
    pub workspace_ready_timeout_ms: u64,
    pub provision_poll_interval_ms: u64,
    pub max_nodes_per_user: u32,
    pub max_workspaces_per_node: u32,
    pub node_cpu_threshold_percent: f64,
    pub node_memory_threshold_percent: f64,
}

impl TaskRunnerConfig {
    pub fn agent_poll_interval(&self) -> Duration {
        Duration::from_millis(self.agent_poll_interval_ms)
    }

    pub fn provision_poll_interval(&self) -> Duration {
        Duration::from_millis(self.provision_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStoreConfig {
    pub max_sessions_per_project: u32,
    pub max_messages_per_session: u32,
    pub summary_sync_debounce_ms: u64,
    pub idle_timeout_minutes: u64,
    pub idle_cleanup_retry_delay_ms: u64,
    pub idle_cleanup_max_retries: u32,
}

impl SessionStoreConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_minutes * 60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    pub interval_secs: u64,
    pub stuck_queued_timeout_minutes: i64,
    pub stuck_in_progress_timeout_minutes: i64,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_required(name: &str) -> Result<String> {
    let value = env::var(name).map_err(|_| {
        StratoError::Configuration(format!("{name} environment variable is required"))
    })?;
    if value.trim().is_empty() {
        return Err(StratoError::Configuration(format!("{name} cannot be empty")));
    }
    Ok(value)
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file
        match dotenv() {
            Ok(path) => tracing::info!("Loaded .env file from: {:?}", path),
            Err(e) => tracing::debug!("No .env file loaded: {}", e),
        }

        let database = DatabaseConfig {
            url: env::var("STRATO_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://strato.db".to_string()),
            data_dir: PathBuf::from(
                env::var("STRATO_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            ),
        };

        // SECURITY: node agents authenticate every callback with this token
        let node_agent_token = env_required("NODE_AGENT_TOKEN")?;
        if node_agent_token.len() < 32 {
            return Err(StratoError::Configuration(
                "NODE_AGENT_TOKEN must be at least 32 characters".to_string(),
            ));
        }

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let api = ApiConfig {
            host: env::var("API_HOST").unwrap_or_else(|_| constants::DEFAULT_API_HOST.to_string()),
            port: env_parse("API_PORT", constants::DEFAULT_API_PORT),
            node_agent_token,
            allowed_origins,
            max_error_body_bytes: env_parse(
                "MAX_VM_AGENT_ERROR_BODY_BYTES",
                constants::MAX_VM_AGENT_ERROR_BODY_BYTES,
            ),
        };

        let provider_base_url = env_required("PROVIDER_BASE_URL")?;
        url::Url::parse(&provider_base_url).map_err(|e| {
            StratoError::Configuration(format!("PROVIDER_BASE_URL is not a valid URL: {e}"))
        })?;

        let provider = ProviderConfig {
            base_url: provider_base_url,
            api_token: env_required("PROVIDER_API_TOKEN")?,
            request_timeout_secs: env_parse("PROVIDER_REQUEST_TIMEOUT_SECS", 30),
        };

        let node_agent = NodeAgentConfig {
            port: env_parse("NODE_AGENT_PORT", constants::DEFAULT_NODE_AGENT_PORT),
            health_probe_timeout_secs: constants::AGENT_HEALTH_PROBE_TIMEOUT_SECS,
        };

        let task_runner = TaskRunnerConfig {
            step_max_retries: env_parse(
                "TASK_RUNNER_STEP_MAX_RETRIES",
                constants::TASK_RUNNER_STEP_MAX_RETRIES,
            ),
            retry_base_delay_ms: env_parse(
                "TASK_RUNNER_RETRY_BASE_DELAY_MS",
                constants::TASK_RUNNER_RETRY_BASE_DELAY_MS,
            ),
            retry_max_delay_ms: env_parse(
                "TASK_RUNNER_RETRY_MAX_DELAY_MS",
                constants::TASK_RUNNER_RETRY_MAX_DELAY_MS,
            ),
            agent_poll_interval_ms: env_parse(
                "TASK_RUNNER_AGENT_POLL_INTERVAL_MS",
                constants::TASK_RUNNER_AGENT_POLL_INTERVAL_MS,
            ),
            agent_ready_timeout_ms: env_parse(
                "TASK_RUNNER_AGENT_READY_TIMEOUT_MS",
                constants::TASK_RUNNER_AGENT_READY_TIMEOUT_MS,
            ),
            workspace_ready_timeout_ms: env_parse(
                "TASK_RUNNER_WORKSPACE_READY_TIMEOUT_MS",
                constants::TASK_RUNNER_WORKSPACE_READY_TIMEOUT_MS,
            ),
            provision_poll_interval_ms: env_parse(
                "TASK_RUNNER_PROVISION_POLL_INTERVAL_MS",
                constants::TASK_RUNNER_PROVISION_POLL_INTERVAL_MS,
            ),
            max_nodes_per_user: env_parse("MAX_NODES_PER_USER", constants::MAX_NODES_PER_USER),
            max_workspaces_per_node: env_parse(
                "MAX_WORKSPACES_PER_NODE",
                constants::MAX_WORKSPACES_PER_NODE,
            ),
            node_cpu_threshold_percent: env_parse(
                "TASK_RUN_NODE_CPU_THRESHOLD_PERCENT",
                constants::TASK_RUN_NODE_CPU_THRESHOLD_PERCENT,
            ),
            node_memory_threshold_percent: env_parse(
                "TASK_RUN_NODE_MEMORY_THRESHOLD_PERCENT",
                constants::TASK_RUN_NODE_MEMORY_THRESHOLD_PERCENT,
            ),
        };

        let session_store = SessionStoreConfig {
            max_sessions_per_project: env_parse(
                "MAX_SESSIONS_PER_PROJECT",
                constants::MAX_SESSIONS_PER_PROJECT,
            ),
            max_messages_per_session: env_parse(
                "MAX_MESSAGES_PER_SESSION",
                constants::MAX_MESSAGES_PER_SESSION,
            ),
            summary_sync_debounce_ms: env_parse(
                "DO_SUMMARY_SYNC_DEBOUNCE_MS",
                constants::DO_SUMMARY_SYNC_DEBOUNCE_MS,
            ),
            idle_timeout_minutes: env_parse(
                "SESSION_IDLE_TIMEOUT_MINUTES",
                constants::SESSION_IDLE_TIMEOUT_MINUTES,
            ),
            idle_cleanup_retry_delay_ms: env_parse(
                "IDLE_CLEANUP_RETRY_DELAY_MS",
                constants::IDLE_CLEANUP_RETRY_DELAY_MS,
            ),
            idle_cleanup_max_retries: env_parse(
                "IDLE_CLEANUP_MAX_RETRIES",
                constants::IDLE_CLEANUP_MAX_RETRIES,
            ),
        };

        let sweeper = SweeperConfig {
            interval_secs: env_parse("SWEEPER_INTERVAL_SECS", constants::SWEEPER_INTERVAL_SECS),
            stuck_queued_timeout_minutes: env_parse(
                "STUCK_QUEUED_TIMEOUT_MINUTES",
                constants::STUCK_QUEUED_TIMEOUT_MINUTES,
            ),
            stuck_in_progress_timeout_minutes: env_parse(
                "STUCK_IN_PROGRESS_TIMEOUT_MINUTES",
                constants::STUCK_IN_PROGRESS_TIMEOUT_MINUTES,
            ),
        };

        Ok(Config {
            database,
            api,
            provider,
            node_agent,
            task_runner,
            session_store,
            sweeper,
        })
    }
}
