//! Domain types: jobs, events, results, and the request union.
//!
//! These are the shapes persisted by [`crate::store`] and produced/consumed by
//! the orchestrator. Timestamps are UTC `chrono::DateTime`s; job and event ids
//! are opaque strings and dense `u64`s respectively, per the store contract.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Collection and product-type labels must match this shape.
pub const LABEL_PATTERN_DESCRIPTION: &str = r"[A-Za-z0-9._\-/]{1,120}";

pub fn is_valid_label(s: &str) -> bool {
    if s.is_empty() || s.len() > 120 {
        return false;
    }
    s.bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-' | b'/'))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    SearchDownload,
    DownloadProducts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    CancelRequested,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }
}

/// AOI payload: exactly one of `wkt` or `geojson` must be set (validated at
/// construction, see [`crate::aoi`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AoiInput {
    pub wkt: Option<String>,
    pub geojson: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchDownloadRequest {
    pub provider: String,
    pub collection: String,
    pub product_type: String,
    pub start_date: String,
    pub end_date: String,
    pub aoi: AoiInput,
    pub tile_id: Option<String>,
    pub output_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProductsRequest {
    pub provider: String,
    pub collection: String,
    pub product_ids: Vec<String>,
    pub output_dir: Option<String>,
}

/// The tagged request union discriminated by `job_type`. Each variant is
/// validated at construction by [`JobRequest::validate`] — callers never
/// introspect fields at runtime to decide behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum JobRequest {
    SearchDownload(SearchDownloadRequest),
    DownloadProducts(DownloadProductsRequest),
}

impl JobRequest {
    pub fn job_type(&self) -> JobType {
        match self {
            JobRequest::SearchDownload(_) => JobType::SearchDownload,
            JobRequest::DownloadProducts(_) => JobType::DownloadProducts,
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            JobRequest::SearchDownload(r) => &r.provider,
            JobRequest::DownloadProducts(r) => &r.provider,
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            JobRequest::SearchDownload(r) => &r.collection,
            JobRequest::DownloadProducts(r) => &r.collection,
        }
    }

    pub fn output_dir(&self) -> Option<&str> {
        match self {
            JobRequest::SearchDownload(r) => r.output_dir.as_deref(),
            JobRequest::DownloadProducts(r) => r.output_dir.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub provider: String,
    pub collection: String,
    pub request: JobRequest,
    pub state: JobState,
    pub progress: f64,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: String, request: JobRequest, now: DateTime<Utc>) -> Self {
        Self {
            job_type: request.job_type(),
            provider: request.provider().to_string(),
            collection: request.collection().to_string(),
            id,
            request,
            state: JobState::Queued,
            progress: 0.0,
            bytes_downloaded: 0,
            bytes_total: 0,
            started_at: None,
            finished_at: None,
            errors: Vec::new(),
            worker_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn duration_seconds(&self, now: DateTime<Utc>) -> Option<f64> {
        let started = self.started_at?;
        let end = self.finished_at.unwrap_or(now);
        Some((end - started).num_milliseconds() as f64 / 1000.0)
    }
}

/// Partial update applied by [`crate::store::JobStore::update_job`]. Unset
/// fields are left untouched; `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub state: Option<JobState>,
    pub progress: Option<f64>,
    pub bytes_downloaded: Option<u64>,
    pub bytes_total: Option<u64>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub finished_at: Option<Option<DateTime<Utc>>>,
    pub errors: Option<Vec<String>>,
    pub worker_id: Option<Option<String>>,
}

impl JobUpdate {
    pub fn state(mut self, s: JobState) -> Self {
        self.state = Some(s);
        self
    }
    pub fn progress(mut self, p: f64) -> Self {
        self.progress = Some(p);
        self
    }
    pub fn bytes(mut self, downloaded: u64, total: u64) -> Self {
        self.bytes_downloaded = Some(downloaded);
        self.bytes_total = Some(total);
        self
    }
    pub fn started_at(mut self, t: DateTime<Utc>) -> Self {
        self.started_at = Some(Some(t));
        self
    }
    pub fn finished_at(mut self, t: DateTime<Utc>) -> Self {
        self.finished_at = Some(Some(t));
        self
    }
    pub fn errors(mut self, errs: Vec<String>) -> Self {
        self.errors = Some(errs);
        self
    }
    pub fn worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = Some(Some(id.into()));
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub job_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

/// An event emitted by the streamer: either a real, stored `Event`, or a
/// synthetic heartbeat with no id (per §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Stored(Event),
    Heartbeat { timestamp: DateTime<Utc> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub paths: Vec<String>,
    pub checksums: HashMap<String, String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Default)]
pub struct JobListFilter {
    pub state: Option<JobState>,
    pub provider: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub page: u32,
    pub page_size: u32,
}

impl JobListFilter {
    /// Clamp `page_size` into `[1, 200]` and `page` to be at least 1, per §4.1.
    pub fn normalized(mut self) -> Self {
        self.page_size = self.page_size.clamp(1, 200);
        self.page = self.page.max(1);
        self
    }
}
