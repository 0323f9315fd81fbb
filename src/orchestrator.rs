//! Fetcher orchestrator (spec §4.4): the engine's public API surface and the
//! `run_job` lifecycle that drives a single job from claim to completion.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{EngineError, ValidationError};
use crate::executor::Executor;
use crate::manifest::write_manifest;
use crate::model::{Job, JobListFilter, JobRequest, JobResult, JobState, JobType, JobUpdate};
use crate::observability::Metrics;
use crate::path::sanitize_output_dir;
use crate::provider::ProviderRegistry;
use crate::store::JobStore;

const STALE_CHECK_CACHE: Duration = Duration::from_millis(500);

/// Validates a submitted request against §6's rules. Raised synchronously
/// to the submitter, never persisted as a job failure.
fn validate_request(request: &JobRequest) -> Result<(), ValidationError> {
    use crate::model::LABEL_PATTERN_DESCRIPTION;

    if !crate::model::is_valid_label(request.collection()) {
        return Err(ValidationError::invalid(
            "collection",
            format!("must match {LABEL_PATTERN_DESCRIPTION}"),
        ));
    }

    match request {
        JobRequest::SearchDownload(r) => {
            if !crate::model::is_valid_label(&r.product_type) {
                return Err(ValidationError::invalid(
                    "product_type",
                    format!("must match {LABEL_PATTERN_DESCRIPTION}"),
                ));
            }
            if r.end_date < r.start_date {
                return Err(ValidationError::invalid("end_date", "must be >= start_date"));
            }
            crate::aoi::validate_aoi(&r.aoi)?;
        }
        JobRequest::DownloadProducts(r) => {
            if r.product_ids.is_empty() {
                return Err(ValidationError::invalid("product_ids", "must be non-empty"));
            }
            if r.product_ids.iter().any(|p| p.is_empty()) {
                return Err(ValidationError::invalid("product_ids", "entries must be non-empty"));
            }
        }
    }

    if let Some(dir) = request.output_dir() {
        let candidate = std::path::Path::new(dir);
        if candidate.is_absolute() || candidate.components().any(|c| c.as_os_str() == ".." || c.as_os_str() == ".") {
            return Err(ValidationError::invalid("output_dir", "must be relative with no '.' or '..' segments"));
        }
    }

    Ok(())
}

struct CancelCache {
    checked_at: Instant,
    cancelled: bool,
}

/// Per-job progress state, captured by a `run_job` invocation's
/// `on_progress` closure. `bytes_total` only grows as each file's content
/// length is learned for the first time, so it climbs toward the true
/// total rather than being known up front.
struct ProgressAggregator {
    downloaded: u64,
    total: u64,
    seen_file_totals: HashSet<String>,
    last_emit: Instant,
    last_emit_downloaded: u64,
}

impl ProgressAggregator {
    fn new() -> Self {
        Self {
            downloaded: 0,
            total: 0,
            seen_file_totals: HashSet::new(),
            last_emit: Instant::now(),
            last_emit_downloaded: 0,
        }
    }
}

/// The Fetcher Orchestrator: owns the store, provider registry, download
/// manager factory, and executor, and exposes the engine's public API.
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    providers: Arc<ProviderRegistry>,
    settings: Settings,
    metrics: Arc<Metrics>,
    executor: Mutex<Option<Arc<Executor>>>,
    cancel_cache: Arc<StdMutex<HashMap<String, CancelCache>>>,
    recovery_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn JobStore>, providers: Arc<ProviderRegistry>, settings: Settings) -> Arc<Self> {
        Arc::new(Self {
            store,
            providers,
            settings,
            metrics: Arc::new(Metrics::new()),
            executor: Mutex::new(None),
            cancel_cache: Arc::new(StdMutex::new(HashMap::new())),
            recovery_handle: Mutex::new(None),
        })
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// `requeue_incomplete_jobs` → start executor → enqueue queued jobs →
    /// start the recovery loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        let now = Utc::now();
        let requeued = self.store.requeue_incomplete_jobs(now)?;
        if !requeued.is_empty() {
            info!(count = requeued.len(), "requeued incomplete jobs on startup");
        }

        let orchestrator = self.clone();
        let settings = self.settings.clone();
        let runner: crate::executor::JobRunner = Arc::new(move |job_id, cancel| {
            let orchestrator = orchestrator.clone();
            Box::pin(async move {
                orchestrator.run_job(job_id, cancel).await;
            })
        });

        let default_limit = settings.default_provider_limit;
        let limits = settings.provider_limits.clone();
        let provider_limit = move |provider: &str| -> u32 {
            limits.get(provider).copied().unwrap_or(default_limit)
        };

        let executor = Executor::new(settings.max_concurrent_jobs, provider_limit, runner);
        executor.start().await;
        *self.executor.lock().await = Some(executor.clone());

        let (queued, _) = self.store.list_jobs(JobListFilter {
            state: Some(JobState::Queued),
            page_size: 10_000,
            ..Default::default()
        })?;
        for job in queued {
            executor.submit(job.id, job.provider).await;
        }

        let orchestrator = self.clone();
        let poll = Duration::from_secs_f64(self.settings.queue_poll_seconds);
        let stale_seconds = self.settings.stale_job_seconds;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll).await;
                let now = Utc::now();
                match orchestrator.store.requeue_stale_running_jobs(stale_seconds, now) {
                    Ok(requeued) => {
                        for job_id in requeued {
                            warn!(job_id = %job_id, "requeued stale running job");
                            if let Ok(Some(job)) = orchestrator.store.get_job(&job_id) {
                                if let Some(executor) = orchestrator.executor.lock().await.clone() {
                                    executor.submit(job.id, job.provider).await;
                                }
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "recovery loop: requeue_stale_running_jobs failed"),
                }
            }
        });
        *self.recovery_handle.lock().await = Some(handle);

        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.recovery_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(executor) = self.executor.lock().await.take() {
            executor.stop().await;
        }
    }

    /// Validate, persist in `queued`, append `job.queued`, submit to the
    /// executor, and return the new job id.
    pub async fn submit_job(&self, request: JobRequest) -> Result<String, EngineError> {
        validate_request(&request)?;
        if !self.providers.contains(request.provider()) {
            return Err(EngineError::Provider(crate::error::ProviderError::NotFound(
                request.provider().to_string(),
            )));
        }

        let job_id = Uuid::now_v7().to_string();
        let now = Utc::now();
        self.store.create_job(&job_id, request.clone(), now)?;
        self.store.append_event(&job_id, "job.queued", Value::Null, now)?;
        self.metrics.job_submitted();

        if let Some(executor) = self.executor.lock().await.clone() {
            executor.submit(job_id.clone(), request.provider().to_string()).await;
        }

        Ok(job_id)
    }

    pub async fn submit_batch(&self, requests: Vec<JobRequest>) -> Vec<Result<String, EngineError>> {
        let mut out = Vec::with_capacity(requests.len());
        for request in requests {
            out.push(self.submit_job(request).await);
        }
        out
    }

    pub fn get_job(&self, job_id: &str) -> Result<Job, EngineError> {
        self.store
            .get_job(job_id)?
            .ok_or_else(|| EngineError::NotFound(job_id.to_string()))
    }

    pub fn get_result(&self, job_id: &str) -> Result<Option<JobResult>, EngineError> {
        Ok(self.store.get_result(job_id)?)
    }

    pub fn list_jobs(&self, filter: JobListFilter) -> Result<(Vec<Job>, usize), EngineError> {
        Ok(self.store.list_jobs(filter)?)
    }

    /// Marks `cancel_requested` (or, for a still-`queued` job, a direct
    /// transition straight to `cancelled`) and flips the executor's local
    /// cancel latch for `job_id`. Returns `true` if the job was queued or
    /// running (the cancel request had an effect), `false` if it had
    /// already reached a terminal state (a no-op).
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool, EngineError> {
        let job = self.get_job(job_id)?;
        let now = Utc::now();

        let accepted = match job.state {
            JobState::Queued => {
                self.store.update_job(job_id, JobUpdate::default().state(JobState::Cancelled).finished_at(now), now)?;
                self.store.append_event(job_id, "job.cancelled", Value::Null, now)?;
                self.metrics.job_cancelled();
                true
            }
            JobState::Running => {
                self.store.update_job(job_id, JobUpdate::default().state(JobState::CancelRequested), now)?;
                self.store.append_event(job_id, "job.cancel_requested", Value::Null, now)?;
                true
            }
            _ => false,
        };

        if let Some(executor) = self.executor.lock().await.clone() {
            executor.cancel(job_id).await;
        }

        Ok(accepted)
    }

    fn cached_cancel_check(&self, job_id: String) -> impl Fn() -> bool + Send + Sync {
        let store = self.store.clone();
        let cache = self.cancel_cache.clone();
        move || {
            let mut cache = cache.lock().unwrap();
            if let Some(entry) = cache.get(&job_id) {
                if entry.checked_at.elapsed() < STALE_CHECK_CACHE {
                    return entry.cancelled;
                }
            }
            let cancelled = matches!(
                store.get_job(&job_id),
                Ok(Some(job)) if matches!(job.state, JobState::CancelRequested | JobState::Cancelled)
            );
            cache.insert(job_id.clone(), CancelCache { checked_at: Instant::now(), cancelled });
            cancelled
        }
    }

    /// The 13-step `run_job` lifecycle (spec §4.4). Invoked by the executor;
    /// all errors are caught here and persisted as a job failure rather than
    /// propagated — the executor only swallows panics.
    async fn run_job(self: Arc<Self>, job_id: String, executor_cancel: crate::executor::CancelChecker) {
        let worker_id = format!("worker-{}", Uuid::new_v4());
        let now = Utc::now();

        // Step 1: claim.
        let claimed = match self.store.claim_job_for_execution(&job_id, &worker_id, now) {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "claim failed");
                return;
            }
        };
        if !claimed {
            return;
        }

        // Step 2: compose the cancellation predicate (executor latch OR
        // store-backed check, memoized 500ms).
        let store_cancel = self.cached_cancel_check(job_id.clone());
        let executor_cancel_for_combine = executor_cancel.clone();
        let is_cancelled: crate::download::CancelChecker =
            Arc::new(move || executor_cancel_for_combine() || store_cancel());

        // Step 3: pre-start cancellation check.
        if is_cancelled() {
            self.finish_cancelled(&job_id).await;
            return;
        }

        // Step 4: mark running (already done by claim; append event).
        let now = Utc::now();
        let _ = self.store.append_event(&job_id, "job.started", Value::Null, now);

        let job = match self.store.get_job(&job_id) {
            Ok(Some(job)) => job,
            _ => return,
        };

        // Step 5: sanitize the output directory.
        let base_dir = self.settings.downloads_root();
        let output_dir = match sanitize_output_dir(&base_dir, job.request.output_dir(), &job_id) {
            Ok(dir) => dir,
            Err(e) => {
                self.finish_failed(&job_id, vec![e.to_string()]).await;
                return;
            }
        };

        // Step 6: instantiate the provider. It already carries its own
        // download manager, wired up at registry-construction time.
        let provider = match self.providers.get(&job.provider) {
            Ok(p) => p,
            Err(e) => {
                self.finish_failed(&job_id, vec![e.to_string()]).await;
                return;
            }
        };

        // Step 7: build the progress aggregator. Sums deltas into a running
        // `bytes_downloaded`, and each file's total (once, the first time
        // it's seen) into a running `bytes_total`; throttled to one
        // store write per 250ms, except heartbeats (`delta_bytes == 0`).
        let job_id_for_progress = job_id.clone();
        let store_for_progress = self.store.clone();
        let progress_state: Arc<StdMutex<ProgressAggregator>> =
            Arc::new(StdMutex::new(ProgressAggregator::new()));
        let on_progress: crate::download::ProgressCallback =
            Arc::new(move |file_name: &str, delta_bytes: u64, _file_downloaded: u64, file_total: Option<u64>| {
                let mut agg = progress_state.lock().unwrap();
                agg.downloaded = agg.downloaded.saturating_add(delta_bytes);
                if let Some(total) = file_total {
                    if agg.seen_file_totals.insert(file_name.to_string()) {
                        agg.total = agg.total.saturating_add(total);
                    }
                }

                let is_heartbeat = delta_bytes == 0;
                let elapsed = agg.last_emit.elapsed();
                if elapsed < Duration::from_millis(250) && !is_heartbeat {
                    return;
                }

                let delta_secs = elapsed.as_secs_f64().max(0.001);
                let speed = agg.downloaded.saturating_sub(agg.last_emit_downloaded) as f64 / delta_secs;
                let pct = if agg.total > 0 {
                    (100.0 * agg.downloaded as f64 / agg.total as f64).min(99.0)
                } else {
                    0.0
                };

                let now = Utc::now();
                let _ = store_for_progress.update_job(
                    &job_id_for_progress,
                    JobUpdate::default().progress(pct).bytes(agg.downloaded, agg.total),
                    now,
                );
                let _ = store_for_progress.append_event(
                    &job_id_for_progress,
                    "job.progress",
                    json!({
                        "file": file_name,
                        "bytes": agg.downloaded,
                        "bytes_total": agg.total,
                        "speed_bytes_per_second": speed,
                        "status": "running",
                    }),
                    now,
                );
                agg.last_emit = Instant::now();
                agg.last_emit_downloaded = agg.downloaded;
            });

        // Step 8: dispatch by job type.
        let download_result = self
            .dispatch_job(&job, &output_dir, provider.clone(), on_progress, is_cancelled.clone())
            .await;

        let result_paths = match download_result {
            Ok(paths) => paths,
            Err(EngineError::Cancelled) => {
                self.finish_cancelled(&job_id).await;
                return;
            }
            Err(e) => {
                self.finish_failed(&job_id, vec![e.to_string()]).await;
                return;
            }
        };

        // Step 9: post-download cancellation check.
        if is_cancelled() {
            self.finish_cancelled(&job_id).await;
            return;
        }

        // Step 10: build the manifest.
        let manifest_result = write_manifest(
            &output_dir,
            &job_id,
            &job.provider,
            &job.collection,
            Utc::now(),
            &result_paths,
            Value::Null,
        );
        let result = match manifest_result {
            Ok(r) => r,
            Err(e) => {
                self.finish_failed(&job_id, vec![format!("manifest write failed: {e}")]).await;
                return;
            }
        };

        // Step 11: persist and finalize.
        if let Err(e) = self.store.set_result(result) {
            self.finish_failed(&job_id, vec![e.to_string()]).await;
            return;
        }

        let now = Utc::now();
        let _ = self.store.update_job(
            &job_id,
            JobUpdate::default().state(JobState::Succeeded).progress(100.0).finished_at(now),
            now,
        );
        let _ = self.store.append_event(&job_id, "job.succeeded", Value::Null, now);
        self.metrics.job_succeeded();

        // Step 13 (error handling is inline above): clear the cancel cache.
        self.cancel_cache.lock().unwrap().remove(&job_id);
    }

    async fn dispatch_job(
        &self,
        job: &Job,
        output_dir: &std::path::Path,
        provider: Arc<dyn crate::provider::Provider>,
        on_progress: crate::download::ProgressCallback,
        is_cancelled: crate::download::CancelChecker,
    ) -> Result<Vec<std::path::PathBuf>, EngineError> {
        match job.job_type {
            JobType::SearchDownload => {
                let JobRequest::SearchDownload(req) = &job.request else {
                    unreachable!("job_type matches request variant")
                };
                let product_ids = provider
                    .search_products(
                        &req.collection,
                        &req.product_type,
                        &req.start_date,
                        &req.end_date,
                        &req.aoi,
                        req.tile_id.as_deref(),
                    )
                    .await?;
                let _ = self.store.append_event(
                    &job.id,
                    "job.products_found",
                    json!({"count": product_ids.len()}),
                    Utc::now(),
                );
                if product_ids.is_empty() {
                    return Ok(Vec::new());
                }
                self.download_via_provider(provider, &product_ids, output_dir, on_progress, is_cancelled)
                    .await
            }
            JobType::DownloadProducts => {
                let JobRequest::DownloadProducts(req) = &job.request else {
                    unreachable!("job_type matches request variant")
                };
                self.download_via_provider(provider, &req.product_ids, output_dir, on_progress, is_cancelled)
                    .await
            }
        }
    }

    /// Providers are constructed with their own `DownloadManager` (the
    /// registry's `(settings, download_manager)` contract), so the
    /// orchestrator only has to thread progress and cancellation through.
    async fn download_via_provider(
        &self,
        provider: Arc<dyn crate::provider::Provider>,
        product_ids: &[String],
        output_dir: &std::path::Path,
        on_progress: crate::download::ProgressCallback,
        is_cancelled: crate::download::CancelChecker,
    ) -> Result<Vec<std::path::PathBuf>, EngineError> {
        if is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match provider.download_products(product_ids, output_dir, on_progress, is_cancelled).await {
            Ok(paths) => Ok(paths),
            Err(crate::error::ProviderError::Cancelled) => Err(EngineError::Cancelled),
            Err(e) => Err(EngineError::Provider(e)),
        }
    }

    async fn finish_cancelled(&self, job_id: &str) {
        let now = Utc::now();
        let _ = self.store.update_job(job_id, JobUpdate::default().state(JobState::Cancelled).finished_at(now), now);
        let _ = self.store.append_event(job_id, "job.cancelled", Value::Null, now);
        self.metrics.job_cancelled();
        self.cancel_cache.lock().unwrap().remove(job_id);
    }

    async fn finish_failed(&self, job_id: &str, errors: Vec<String>) {
        let now = Utc::now();
        let _ = self.store.update_job(
            job_id,
            JobUpdate::default().state(JobState::Failed).errors(errors.clone()).finished_at(now),
            now,
        );
        let _ = self.store.append_event(job_id, "job.failed", json!({"errors": errors}), now);
        self.metrics.job_failed();
        self.cancel_cache.lock().unwrap().remove(job_id);
    }
}
