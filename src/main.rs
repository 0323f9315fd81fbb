use std::sync::Arc;

use orbitfetch::config::Settings;
use orbitfetch::download::{DownloadManager, DownloadManagerConfig};
use orbitfetch::orchestrator::Orchestrator;
use orbitfetch::provider::{Provider, ProviderRegistry};
use orbitfetch::store::FjallStore;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::load()?;
    tracing::info!(data_root = %settings.data_root.display(), "starting orbitfetch");

    let store = Arc::new(FjallStore::open(settings.store_path())?);
    let providers = build_providers(&settings)?;

    let orchestrator = Orchestrator::new(store, Arc::new(providers), settings);
    orchestrator.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    orchestrator.stop().await;

    Ok(())
}

fn build_providers(
    settings: &Settings,
) -> Result<ProviderRegistry, Box<dyn std::error::Error + Send + Sync>> {
    let mut registry = ProviderRegistry::new();

    for (tag, _limit) in &settings.provider_limits {
        let download_manager = Arc::new(DownloadManager::new(DownloadManagerConfig::default())?);
        let provider: Arc<dyn Provider> =
            Arc::new(orbitfetch::provider::StubProvider::new(tag.clone(), download_manager));
        registry.register(tag.clone(), provider);
    }

    Ok(registry)
}
