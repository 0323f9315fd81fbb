//! End-to-end scenario tests against the in-memory stub provider.

use std::sync::Arc;
use std::time::Duration;

use orbitfetch::config::Settings;
use orbitfetch::download::{DownloadManager, DownloadManagerConfig};
use orbitfetch::model::{
    AoiInput, DownloadProductsRequest, JobListFilter, JobRequest, JobState, SearchDownloadRequest,
};
use orbitfetch::orchestrator::Orchestrator;
use orbitfetch::provider::{ProviderRegistry, StubProvider};
use orbitfetch::store::{FjallStore, JobStore};
use tempfile::TempDir;

fn valid_aoi() -> AoiInput {
    AoiInput {
        wkt: Some("POLYGON((0 0, 0 1, 1 1, 1 0, 0 0))".to_string()),
        geojson: None,
    }
}

fn test_download_manager() -> Arc<DownloadManager> {
    Arc::new(DownloadManager::new(DownloadManagerConfig::default()).unwrap())
}

/// Event types for `job_id`, in id order, with no payloads.
fn event_types(store: &FjallStore, job_id: &str) -> Vec<String> {
    store
        .list_events(Some(job_id), 0, 1000)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

fn test_settings(dir: &TempDir) -> Settings {
    Settings {
        data_root: dir.path().to_path_buf(),
        max_concurrent_jobs: 4,
        queue_poll_seconds: 0.05,
        stale_job_seconds: 2,
        ..Settings::default()
    }
}

async fn wait_for_terminal(
    orchestrator: &Arc<Orchestrator>,
    job_id: &str,
    timeout: Duration,
) -> orbitfetch::model::Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = orchestrator.get_job(job_id).unwrap();
        if job.state.is_terminal() {
            return job;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("job {job_id} did not reach a terminal state in time (state={:?})", job.state);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// S1: happy path, search-and-download succeeds with a manifest.
#[tokio::test]
async fn happy_path_search_and_download_produces_manifest() {
    let dir = TempDir::new().unwrap();
    let settings = test_settings(&dir);
    let store = Arc::new(FjallStore::open(settings.store_path()).unwrap());
    let store_handle = store.clone();

    let mut registry = ProviderRegistry::new();
    registry.register("copernicus", Arc::new(StubProvider::new("copernicus", test_download_manager())));

    let orchestrator = Orchestrator::new(store, Arc::new(registry), settings);
    orchestrator.start().await.unwrap();

    let job_id = orchestrator
        .submit_job(JobRequest::SearchDownload(SearchDownloadRequest {
            provider: "copernicus".to_string(),
            collection: "sentinel-2".to_string(),
            product_type: "l2a".to_string(),
            start_date: "2024-01-01".to_string(),
            end_date: "2024-01-31".to_string(),
            aoi: valid_aoi(),
            tile_id: None,
            output_dir: None,
        }))
        .await
        .unwrap();

    let job = wait_for_terminal(&orchestrator, &job_id, Duration::from_secs(5)).await;
    assert_eq!(job.state, JobState::Succeeded);

    let result = orchestrator.get_result(&job_id).unwrap().unwrap();
    assert!(result.paths.contains(&"manifest.json".to_string()));
    assert_eq!(result.paths.len(), 3); // 2 products + manifest

    let types = event_types(&store_handle, &job_id);
    assert_eq!(types.first(), Some(&"job.queued".to_string()));
    assert!(types.contains(&"job.started".to_string()));
    assert!(types.contains(&"job.products_found".to_string()));
    assert!(types.contains(&"job.progress".to_string()));
    assert_eq!(types.last(), Some(&"job.succeeded".to_string()));
    let queued_idx = types.iter().position(|t| t == "job.queued").unwrap();
    let started_idx = types.iter().position(|t| t == "job.started").unwrap();
    let found_idx = types.iter().position(|t| t == "job.products_found").unwrap();
    let progress_idx = types.iter().position(|t| t == "job.progress").unwrap();
    let succeeded_idx = types.iter().position(|t| t == "job.succeeded").unwrap();
    assert!(queued_idx < started_idx);
    assert!(started_idx < found_idx);
    assert!(found_idx < progress_idx);
    assert!(progress_idx < succeeded_idx);

    let found_event = store_handle
        .list_events(Some(&job_id), 0, 1000)
        .unwrap()
        .into_iter()
        .find(|e| e.event_type == "job.products_found")
        .unwrap();
    assert_eq!(found_event.payload["count"], 2);

    orchestrator.stop().await;
}

/// S2: end_date before start_date is rejected synchronously, no job created.
#[tokio::test]
async fn invalid_date_range_is_rejected_before_job_creation() {
    let dir = TempDir::new().unwrap();
    let settings = test_settings(&dir);
    let store = Arc::new(FjallStore::open(settings.store_path()).unwrap());

    let mut registry = ProviderRegistry::new();
    registry.register("copernicus", Arc::new(StubProvider::new("copernicus", test_download_manager())));

    let orchestrator = Orchestrator::new(store, Arc::new(registry), settings);
    orchestrator.start().await.unwrap();

    let result = orchestrator
        .submit_job(JobRequest::SearchDownload(SearchDownloadRequest {
            provider: "copernicus".to_string(),
            collection: "sentinel-2".to_string(),
            product_type: "l2a".to_string(),
            start_date: "2024-02-01".to_string(),
            end_date: "2024-01-01".to_string(),
            aoi: valid_aoi(),
            tile_id: None,
            output_dir: None,
        }))
        .await;

    assert!(result.is_err());
    let (jobs, total) = orchestrator.list_jobs(JobListFilter::default()).unwrap();
    assert_eq!(total, 0);
    assert!(jobs.is_empty());

    orchestrator.stop().await;
}

/// S3: an output_dir trying to escape the sandbox is rejected synchronously
/// at submission, before any job or directory is created.
#[tokio::test]
async fn output_dir_traversal_is_rejected_before_job_creation() {
    let dir = TempDir::new().unwrap();
    let settings = test_settings(&dir);
    let downloads_root = settings.downloads_root();
    let store = Arc::new(FjallStore::open(settings.store_path()).unwrap());

    let mut registry = ProviderRegistry::new();
    registry.register("usgs", Arc::new(StubProvider::new("usgs", test_download_manager())));

    let orchestrator = Orchestrator::new(store, Arc::new(registry), settings);
    orchestrator.start().await.unwrap();

    let result = orchestrator
        .submit_job(JobRequest::DownloadProducts(DownloadProductsRequest {
            provider: "usgs".to_string(),
            collection: "landsat".to_string(),
            product_ids: vec!["p1".to_string()],
            output_dir: Some("../escape".to_string()),
        }))
        .await;

    assert!(result.is_err());
    let (jobs, total) = orchestrator.list_jobs(JobListFilter::default()).unwrap();
    assert_eq!(total, 0);
    assert!(jobs.is_empty());
    assert!(!downloads_root.join("..").join("escape").exists());

    orchestrator.stop().await;
}

/// S4: cancelling a running job (slow, chunked stub download) lands it in
/// `cancelled`, not `succeeded`.
#[tokio::test]
async fn cancel_while_running_stops_the_job() {
    let dir = TempDir::new().unwrap();
    let settings = test_settings(&dir);
    let store = Arc::new(FjallStore::open(settings.store_path()).unwrap());
    let store_handle = store.clone();

    let mut registry = ProviderRegistry::new();
    let slow = StubProvider::new("copernicus", test_download_manager()).with_slow_chunks(16, Duration::from_millis(5));
    registry.register("copernicus", Arc::new(slow));

    let orchestrator = Orchestrator::new(store, Arc::new(registry), settings);
    orchestrator.start().await.unwrap();

    let job_id = orchestrator
        .submit_job(JobRequest::DownloadProducts(DownloadProductsRequest {
            provider: "copernicus".to_string(),
            collection: "sentinel-2".to_string(),
            product_ids: (0..200).map(|i| format!("p{i}")).collect(),
            output_dir: None,
        }))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let accepted = orchestrator.cancel_job(&job_id).await.unwrap();
    assert!(accepted);

    let job = wait_for_terminal(&orchestrator, &job_id, Duration::from_secs(10)).await;
    assert_eq!(job.state, JobState::Cancelled);

    let types = event_types(&store_handle, &job_id);
    let requested_idx = types.iter().position(|t| t == "job.cancel_requested").unwrap();
    let cancelled_idx = types.iter().position(|t| t == "job.cancelled").unwrap();
    assert!(requested_idx < cancelled_idx);

    let second_cancel = orchestrator.cancel_job(&job_id).await.unwrap();
    assert!(!second_cancel);

    orchestrator.stop().await;
}

/// S5: listing jobs filtered by state returns only the matching subset.
#[tokio::test]
async fn batch_list_filters_by_state() {
    let dir = TempDir::new().unwrap();
    let settings = test_settings(&dir);
    let store = Arc::new(FjallStore::open(settings.store_path()).unwrap());

    let mut registry = ProviderRegistry::new();
    registry.register("copernicus", Arc::new(StubProvider::new("copernicus", test_download_manager())));

    let orchestrator = Orchestrator::new(store, Arc::new(registry), settings);
    orchestrator.start().await.unwrap();

    let mut job_ids = Vec::new();
    for i in 0..3 {
        let job_id = orchestrator
            .submit_job(JobRequest::DownloadProducts(DownloadProductsRequest {
                provider: "copernicus".to_string(),
                collection: "sentinel-2".to_string(),
                product_ids: vec![format!("p{i}")],
                output_dir: None,
            }))
            .await
            .unwrap();
        job_ids.push(job_id);
    }

    for job_id in &job_ids {
        wait_for_terminal(&orchestrator, job_id, Duration::from_secs(5)).await;
    }

    let (succeeded, total) = orchestrator
        .list_jobs(JobListFilter {
            state: Some(JobState::Succeeded),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(total, 3);
    assert_eq!(succeeded.len(), 3);

    let (failed, failed_total) = orchestrator
        .list_jobs(JobListFilter {
            state: Some(JobState::Failed),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(failed_total, 0);
    assert!(failed.is_empty());

    orchestrator.stop().await;
}

/// S6: a job left `running` by a simulated crash is requeued and completes
/// on the next startup.
#[tokio::test]
async fn crash_recovery_requeues_running_job_on_restart() {
    let dir = TempDir::new().unwrap();
    let settings = test_settings(&dir);

    let job_id = {
        let store = FjallStore::open(settings.store_path()).unwrap();
        let now = chrono::Utc::now();
        let request = JobRequest::DownloadProducts(DownloadProductsRequest {
            provider: "copernicus".to_string(),
            collection: "sentinel-2".to_string(),
            product_ids: vec!["p1".to_string()],
            output_dir: None,
        });
        let job_id = "crash-test-job".to_string();
        store.create_job(&job_id, request, now).unwrap();
        store.claim_job_for_execution(&job_id, "worker-dead", now).unwrap();
        job_id
    };

    let store = Arc::new(FjallStore::open(settings.store_path()).unwrap());
    let store_handle = store.clone();
    let mut registry = ProviderRegistry::new();
    registry.register("copernicus", Arc::new(StubProvider::new("copernicus", test_download_manager())));

    let orchestrator = Orchestrator::new(store, Arc::new(registry), settings);
    orchestrator.start().await.unwrap();

    let job = wait_for_terminal(&orchestrator, &job_id, Duration::from_secs(5)).await;
    assert_eq!(job.state, JobState::Succeeded);

    let types = event_types(&store_handle, &job_id);
    assert!(types.contains(&"job.requeued_after_restart".to_string()));
    let requeued_idx = types.iter().position(|t| t == "job.requeued_after_restart").unwrap();
    let succeeded_idx = types.iter().position(|t| t == "job.succeeded").unwrap();
    assert!(requeued_idx < succeeded_idx);

    orchestrator.stop().await;
}
