use super::*;
use crate::StratoError;
use serial_test::serial;
use std::env;

// These tests modify global environment variables and use #[serial] to ensure
// they run sequentially, preventing interference between parallel tests.

fn cleanup_test_env() {
    env::remove_var("NODE_AGENT_TOKEN");
    env::remove_var("PROVIDER_BASE_URL");
    env::remove_var("PROVIDER_API_TOKEN");
    env::remove_var("STRATO_DATABASE_URL");
    env::remove_var("STRATO_DATA_DIR");
    env::remove_var("API_HOST");
    env::remove_var("API_PORT");
    env::remove_var("TASK_RUNNER_STEP_MAX_RETRIES");
    env::remove_var("SESSION_IDLE_TIMEOUT_MINUTES");
    env::remove_var("MAX_NODES_PER_USER");
}

fn set_required_env() {
    env::set_var(
        "NODE_AGENT_TOKEN",
        "test-node-agent-token-0123456789abcdef0123456789abcdef",
    );
    env::set_var("PROVIDER_BASE_URL", "https://provider.invalid/v1");
    env::set_var("PROVIDER_API_TOKEN", "test-provider-token");
}

#[test]
#[serial]
fn missing_node_agent_token_is_rejected() {
    cleanup_test_env();
    env::set_var("PROVIDER_BASE_URL", "https://provider.invalid/v1");
    env::set_var("PROVIDER_API_TOKEN", "test-provider-token");

    let result = Config::load();

    assert!(result.is_err());
    match result.unwrap_err() {
        StratoError::Configuration(msg) => {
            assert!(msg.contains("NODE_AGENT_TOKEN"), "{msg}");
        }
        other => panic!("Expected Configuration error, got {other:?}"),
    }

    cleanup_test_env();
}

#[test]
#[serial]
fn short_node_agent_token_is_rejected() {
    cleanup_test_env();
    set_required_env();
    env::set_var("NODE_AGENT_TOKEN", "too-short");

    let result = Config::load();

    assert!(result.is_err());
    match result.unwrap_err() {
        StratoError::Configuration(msg) => {
            assert!(msg.contains("at least 32 characters"), "{msg}");
        }
        other => panic!("Expected Configuration error, got {other:?}"),
    }

    cleanup_test_env();
}

#[test]
#[serial]
fn invalid_provider_url_is_rejected() {
    cleanup_test_env();
    set_required_env();
    env::set_var("PROVIDER_BASE_URL", "not a url");

    let result = Config::load();

    assert!(result.is_err());
    match result.unwrap_err() {
        StratoError::Configuration(msg) => {
            assert!(msg.contains("PROVIDER_BASE_URL"), "{msg}");
        }
        other => panic!("Expected Configuration error, got {other:?}"),
    }

    cleanup_test_env();
}

#[test]
#[serial]
fn defaults_apply_when_unset() {
    cleanup_test_env();
    set_required_env();

    let config = Config::load().unwrap();

    assert_eq!(config.api.host, "127.0.0.1");
    assert_eq!(config.api.port, 3100);
    assert_eq!(config.task_runner.step_max_retries, 3);
    assert_eq!(config.task_runner.retry_base_delay_ms, 5_000);
    assert_eq!(config.task_runner.agent_ready_timeout_ms, 120_000);
    assert_eq!(config.task_runner.workspace_ready_timeout_ms, 600_000);
    assert_eq!(config.task_runner.max_nodes_per_user, 10);
    assert_eq!(config.session_store.max_sessions_per_project, 1_000);
    assert_eq!(config.session_store.idle_timeout_minutes, 15);
    assert_eq!(config.session_store.idle_cleanup_max_retries, 1);
    assert_eq!(config.sweeper.interval_secs, 60);

    cleanup_test_env();
}

#[test]
#[serial]
fn env_overrides_and_parse_fallbacks() {
    cleanup_test_env();
    set_required_env();
    env::set_var("TASK_RUNNER_STEP_MAX_RETRIES", "7");
    env::set_var("SESSION_IDLE_TIMEOUT_MINUTES", "30");
    // Unparseable values fall back to the default instead of failing startup
    env::set_var("MAX_NODES_PER_USER", "lots");

    let config = Config::load().unwrap();

    assert_eq!(config.task_runner.step_max_retries, 7);
    assert_eq!(config.session_store.idle_timeout_minutes, 30);
    assert_eq!(
        config.session_store.idle_timeout(),
        std::time::Duration::from_secs(30 * 60)
    );
    assert_eq!(config.task_runner.max_nodes_per_user, 10);

    cleanup_test_env();
}
