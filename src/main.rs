use anyhow::Result;
use std::sync::Arc;
use strato_core::{
    api::{ApiServer, ApiState},
    cms::CmsStore,
    config::Config,
    node_agent::HttpNodeAgent,
    node_lifecycle::NodeLifecycleManager,
    observability::ObservabilityStore,
    orchestrator::TaskOrchestrator,
    provider::HttpCloudProvider,
    session_store::SessionStoreRuntime,
    sweeper::StuckTaskSweeper,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("Starting Strato Core orchestration engine");

    let config = Config::load()?;

    let cms = CmsStore::connect(&config.database.url).await?;
    let nlm = NodeLifecycleManager::new(cms.clone());
    let provider = Arc::new(HttpCloudProvider::new(config.provider.clone())?);
    let agent = Arc::new(HttpNodeAgent::new(config.node_agent.clone())?);
    let session_stores = SessionStoreRuntime::new(
        cms.clone(),
        config.session_store.clone(),
        config.database.data_dir.clone(),
    );

    let callback_base_url = format!("http://{}:{}", config.api.host, config.api.port);
    let orchestrator = TaskOrchestrator::new(
        cms.clone(),
        nlm.clone(),
        provider,
        agent,
        Some(Arc::new(session_stores.clone())),
        config.task_runner.clone(),
        callback_base_url,
    );

    let resumed = orchestrator.resume_incomplete().await?;
    if resumed > 0 {
        info!("Resumed {} task runners after restart", resumed);
    }

    let sweeper = StuckTaskSweeper::new(cms.clone(), nlm, config.sweeper.clone());

    let api_server = ApiServer::new(
        config.api.clone(),
        ApiState {
            cms: cms.clone(),
            orchestrator,
            session_stores,
            observability: ObservabilityStore::new(cms),
        },
    );

    tokio::select! {
        result = api_server.run() => {
            if let Err(e) = result {
                tracing::error!("API server failed: {}", e);
            }
        }
        _ = sweeper.run() => {
            tracing::error!("Sweeper loop exited unexpectedly");
        }
    }

    Ok(())
}
