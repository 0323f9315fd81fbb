//! Fjall-based persistence layer for jobs, the event log, and results.
//!
//! This is the engine's single source of truth: job state transitions are
//! only ever legal through [`JobStore::claim_job_for_execution`] and
//! [`JobStore::update_job`], and the event log is append-only. The embedded
//! backend ([`FjallStore`]) persists three logical partitions (jobs, events,
//! results) plus a metadata partition holding the event id counter, so
//! recovery survives a process restart.
//!
//! List/filter operations (`list_jobs` by state/provider/date range) have no
//! secondary index to lean on; they scan the `jobs` partition and filter,
//! sort, and paginate in memory. Acceptable at the scale this engine targets.

pub mod error;
pub mod fjall_store;
pub mod keys;

pub use error::{Result, StoreError};
pub use fjall_store::FjallStore;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::{Event, Job, JobListFilter, JobRequest, JobResult, JobUpdate};

/// The durable job store contract (spec §4.1).
pub trait JobStore: Send + Sync {
    /// Inserts a row in state `queued` with zero counters and empty errors.
    /// Fails with [`StoreError::JobAlreadyExists`] if `id` is already present.
    fn create_job(&self, id: &str, request: JobRequest, now: DateTime<Utc>) -> Result<()>;

    fn get_job(&self, id: &str) -> Result<Option<Job>>;

    /// Partial field update; `updated_at` is refreshed. No-op if `id` is missing.
    fn update_job(&self, id: &str, update: JobUpdate, now: DateTime<Utc>) -> Result<()>;

    /// Ordered by `created_at` descending. `page_size` is clamped to [1, 200].
    fn list_jobs(&self, filter: JobListFilter) -> Result<(Vec<Job>, usize)>;

    /// Assigns the next global monotonic id and returns it.
    fn append_event(
        &self,
        job_id: &str,
        event_type: &str,
        payload: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<u64>;

    /// Ordered by id ascending; `limit` clamped to [1, 1000]. Returns events
    /// with id strictly greater than `since_id`. `job_id = None` scans across
    /// every job.
    fn list_events(&self, job_id: Option<&str>, since_id: u64, limit: u32) -> Result<Vec<Event>>;

    fn set_result(&self, result: JobResult) -> Result<()>;

    fn get_result(&self, job_id: &str) -> Result<Option<JobResult>>;

    /// On startup: atomically moves any job in `{running, cancel_requested}`
    /// back to `queued`, appending `job.requeued_after_restart` for each.
    fn requeue_incomplete_jobs(&self, now: DateTime<Utc>) -> Result<Vec<String>>;

    /// Atomic CAS: if current state is `queued`, transitions to `running`,
    /// sets `started_at` if unset, records `worker_id`, and returns `true`.
    /// Otherwise returns `false` without side effects. This is the only legal
    /// entry into `running`.
    fn claim_job_for_execution(
        &self,
        job_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Moves jobs in `{running, cancel_requested}` whose `updated_at` is
    /// older than `now - stale_seconds` back to `queued`, appending
    /// `job.requeued_stale`. Recovers from crashed workers.
    fn requeue_stale_running_jobs(
        &self,
        stale_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>>;
}
