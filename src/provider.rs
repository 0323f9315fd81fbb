//! Imagery providers: the trait, a registry, and a deterministic test stub.
//!
//! Grounded on the teacher's `handlers/traits.rs` (`JobHandler` async trait)
//! and `handlers/registry.rs` (`BTreeMap<String, Arc<dyn _>>` registry).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::config::Settings;
use crate::download::{CancelChecker, DownloadManager, DownloadRequest, ProgressCallback};
use crate::error::{DownloadError, ProviderError};
use crate::model::AoiInput;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("provider '{0}' not registered")]
    NotFound(String),
}

/// A satellite-imagery provider: searches a catalog and downloads products.
/// Implementations own their own auth/rate-limit concerns; the orchestrator
/// only calls these two operations.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// A coarse dataset label, surfaced in manifests when present.
    fn dataset(&self) -> Option<&str> {
        None
    }

    async fn search_products(
        &self,
        collection: &str,
        product_type: &str,
        start_date: &str,
        end_date: &str,
        aoi: &AoiInput,
        tile_id: Option<&str>,
    ) -> Result<Vec<String>, ProviderError>;

    /// `on_progress` receives cumulative `(downloaded, total)` bytes across
    /// the whole call; `should_cancel` should be polled between files (or
    /// more finely, between chunks) so a mid-transfer cancellation request
    /// is honored promptly.
    async fn download_products(
        &self,
        product_ids: &[String],
        output_dir: &Path,
        on_progress: ProgressCallback,
        should_cancel: CancelChecker,
    ) -> Result<Vec<PathBuf>, ProviderError>;
}

pub type ProviderFactory =
    Arc<dyn Fn(&Settings, Arc<DownloadManager>) -> Arc<dyn Provider> + Send + Sync>;

/// Maps provider tags to live instances, built once at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, tag: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(tag.into(), provider);
    }

    pub fn get(&self, tag: &str) -> Result<Arc<dyn Provider>, RegistryError> {
        self.providers
            .get(tag)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(tag.to_string()))
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.providers.contains_key(tag)
    }
}

/// Deterministic provider for integration tests. Serves `file_count` files
/// of `bytes_per_file` bytes each from a throwaway local HTTP server, written
/// in `chunk_size` pieces with an optional per-chunk delay on the wire, and
/// downloads them through the same [`DownloadManager`] (C2) a real adapter
/// would use — so the same stub drives both a fast happy-path scenario and a
/// slow one a test can cancel mid-stream, with no byte-writing logic
/// duplicated outside the download manager.
pub struct StubProvider {
    tag: String,
    download_manager: Arc<DownloadManager>,
    pub file_count: usize,
    pub bytes_per_file: usize,
    pub chunk_size: usize,
    pub chunk_delay: Duration,
}

impl StubProvider {
    pub fn new(tag: impl Into<String>, download_manager: Arc<DownloadManager>) -> Self {
        Self {
            tag: tag.into(),
            download_manager,
            file_count: 2,
            bytes_per_file: 1024,
            chunk_size: 1024,
            chunk_delay: Duration::ZERO,
        }
    }

    pub fn with_slow_chunks(mut self, chunk_size: usize, delay: Duration) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_delay = delay;
        self
    }
}

/// Accepts exactly `n` connections and serves `bytes_per_file` bytes of
/// filler on each, written in `chunk_size`-byte pieces with `chunk_delay`
/// between writes so a client streaming the response sees it arrive slowly.
async fn spawn_stub_server(
    n: usize,
    bytes_per_file: usize,
    chunk_size: usize,
    chunk_delay: Duration,
) -> std::io::Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        for _ in 0..n {
            match listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(serve_fixed_body(stream, bytes_per_file, chunk_size, chunk_delay));
                }
                Err(_) => break,
            }
        }
    });
    Ok((addr, handle))
}

async fn serve_fixed_body(mut stream: TcpStream, bytes_per_file: usize, chunk_size: usize, chunk_delay: Duration) {
    let header = format!("HTTP/1.1 200 OK\r\nContent-Length: {bytes_per_file}\r\nConnection: close\r\n\r\n");
    if stream.write_all(header.as_bytes()).await.is_err() {
        return;
    }
    let chunk = vec![0xABu8; chunk_size.max(1)];
    let mut remaining = bytes_per_file;
    while remaining > 0 {
        let take = remaining.min(chunk.len());
        if stream.write_all(&chunk[..take]).await.is_err() {
            return;
        }
        remaining -= take;
        if !chunk_delay.is_zero() {
            tokio::time::sleep(chunk_delay).await;
        }
    }
    let _ = stream.shutdown().await;
}

#[async_trait]
impl Provider for StubProvider {
    fn name(&self) -> &str {
        &self.tag
    }

    async fn search_products(
        &self,
        collection: &str,
        _product_type: &str,
        _start_date: &str,
        _end_date: &str,
        _aoi: &AoiInput,
        _tile_id: Option<&str>,
    ) -> Result<Vec<String>, ProviderError> {
        Ok((0..self.file_count)
            .map(|i| format!("{collection}-product-{i}"))
            .collect())
    }

    async fn download_products(
        &self,
        product_ids: &[String],
        output_dir: &Path,
        on_progress: ProgressCallback,
        should_cancel: CancelChecker,
    ) -> Result<Vec<PathBuf>, ProviderError> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| ProviderError::Failed(e.to_string()))?;

        if should_cancel() {
            return Err(ProviderError::Cancelled);
        }

        let (addr, _server) = spawn_stub_server(product_ids.len(), self.bytes_per_file, self.chunk_size, self.chunk_delay)
            .await
            .map_err(|e| ProviderError::Failed(e.to_string()))?;

        let requests = product_ids
            .iter()
            .map(|id| DownloadRequest {
                url: format!("http://{addr}/{id}"),
                destination: output_dir.join(format!("{id}.bin")),
                headers: Vec::new(),
            })
            .collect();

        match self
            .download_manager
            .download_batch(requests, on_progress, should_cancel, None)
            .await
        {
            Ok(paths) => Ok(paths),
            Err(DownloadError::Cancelled) => Err(ProviderError::Cancelled),
            Err(e) => Err(ProviderError::Failed(e.to_string())),
        }
    }
}

/// When `StubProvider::dataset` matters for manifest metadata tests.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::DownloadManagerConfig;

    fn test_download_manager() -> Arc<DownloadManager> {
        Arc::new(DownloadManager::new(DownloadManagerConfig::default()).unwrap())
    }

    #[test]
    fn registry_reports_missing_providers() {
        let registry = ProviderRegistry::new();
        assert!(registry.get("copernicus").is_err());
        assert!(!registry.contains("copernicus"));
    }

    #[test]
    fn registry_finds_registered_provider() {
        let mut registry = ProviderRegistry::new();
        registry.register("copernicus", Arc::new(StubProvider::new("copernicus", test_download_manager())));
        assert!(registry.contains("copernicus"));
        assert_eq!(registry.get("copernicus").unwrap().name(), "copernicus");
    }

    #[tokio::test]
    async fn stub_provider_search_and_download_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let provider = StubProvider::new("copernicus", test_download_manager());
        let aoi = AoiInput {
            wkt: Some("POLYGON((0 0,1 1,1 0,0 0))".to_string()),
            geojson: None,
        };
        let ids = provider
            .search_products("sentinel-2", "l2a", "2024-01-01", "2024-01-02", &aoi, None)
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        let no_op_progress: ProgressCallback = Arc::new(|_file_name, _delta, _downloaded, _total| {});
        let never_cancel: CancelChecker = Arc::new(|| false);
        let paths = provider
            .download_products(&ids, dir.path(), no_op_progress, never_cancel)
            .await
            .unwrap();
        assert_eq!(paths.len(), 2);
        for path in &paths {
            assert_eq!(std::fs::metadata(path).unwrap().len(), 1024);
        }
    }
}
