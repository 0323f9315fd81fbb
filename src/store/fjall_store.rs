use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde_json::Value;
use tracing::{debug, info};

use crate::model::{Event, Job, JobListFilter, JobRequest, JobResult, JobState, JobUpdate};

use super::error::{Result, StoreError};
use super::keys::{
    decode_event_key, encode_event_key, encode_event_prefix, encode_job_key, encode_result_key,
    EVENT_SEQ_KEY,
};
use super::JobStore;

/// Fjall-backed persistent storage for jobs, the event log, and results.
///
/// All mutating operations that must appear atomic (claim, requeue, the
/// event id counter) take `write_lock` for the duration of their
/// read-modify-write. That's sufficient here: this engine is single-process
/// by design (see non-goals), so a process-local mutex gives the same
/// atomicity a cross-process CAS would need a transaction for.
#[derive(Clone)]
pub struct FjallStore {
    keyspace: Keyspace,
    jobs: PartitionHandle,
    events: PartitionHandle,
    results: PartitionHandle,
    metadata: PartitionHandle,
    write_lock: std::sync::Arc<Mutex<()>>,
}

impl FjallStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("opening fjall store at {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;
        let jobs = keyspace.open_partition("jobs", PartitionCreateOptions::default())?;
        let events = keyspace.open_partition("events", PartitionCreateOptions::default())?;
        let results = keyspace.open_partition("results", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            jobs,
            events,
            results,
            metadata,
            write_lock: std::sync::Arc::new(Mutex::new(())),
        })
    }

    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    fn read_job(&self, job_id: &str) -> Result<Option<Job>> {
        match self.jobs.get(encode_job_key(job_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_job(&self, job: &Job) -> Result<()> {
        let key = encode_job_key(&job.id);
        let value = serde_json::to_vec(job)?;
        self.jobs.insert(key, value)?;
        Ok(())
    }

    fn all_jobs(&self) -> Result<Vec<Job>> {
        let mut out = Vec::new();
        for item in self.jobs.iter() {
            let (_, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    fn next_event_id_locked(&self) -> Result<u64> {
        let current = match self.metadata.get(EVENT_SEQ_KEY)? {
            Some(bytes) => serde_json::from_slice::<u64>(&bytes)?,
            None => 0,
        };
        let next = current + 1;
        self.metadata
            .insert(EVENT_SEQ_KEY, serde_json::to_vec(&next)?)?;
        Ok(next)
    }

    fn append_event_locked(
        &self,
        job_id: &str,
        event_type: &str,
        payload: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<u64> {
        let id = self.next_event_id_locked()?;
        let event = Event {
            id,
            job_id: job_id.to_string(),
            event_type: event_type.to_string(),
            timestamp,
            payload,
        };
        let key = encode_event_key(job_id, id);
        self.events.insert(key, serde_json::to_vec(&event)?)?;
        debug!(job_id, event_id = id, event_type, "event appended");
        Ok(id)
    }

    fn requeue_matching(
        &self,
        now: DateTime<Utc>,
        event_type: &str,
        should_requeue: impl Fn(&Job) -> bool,
    ) -> Result<Vec<String>> {
        let _guard = self.write_lock.lock().unwrap();
        let mut requeued = Vec::new();
        for mut job in self.all_jobs()? {
            if !matches!(job.state, JobState::Running | JobState::CancelRequested) {
                continue;
            }
            if !should_requeue(&job) {
                continue;
            }
            job.state = JobState::Queued;
            job.updated_at = now;
            self.write_job(&job)?;
            self.append_event_locked(&job.id, event_type, Value::Null, now)?;
            requeued.push(job.id.clone());
        }
        Ok(requeued)
    }
}

fn apply_update(job: &mut Job, update: JobUpdate, now: DateTime<Utc>) {
    if let Some(state) = update.state {
        job.state = state;
    }
    if let Some(progress) = update.progress {
        job.progress = progress;
    }
    if let Some(downloaded) = update.bytes_downloaded {
        job.bytes_downloaded = downloaded;
    }
    if let Some(total) = update.bytes_total {
        job.bytes_total = total;
    }
    if let Some(started_at) = update.started_at {
        job.started_at = started_at;
    }
    if let Some(finished_at) = update.finished_at {
        job.finished_at = finished_at;
    }
    if let Some(errors) = update.errors {
        job.errors = errors;
    }
    if let Some(worker_id) = update.worker_id {
        job.worker_id = worker_id;
    }
    job.updated_at = now;
}

impl JobStore for FjallStore {
    fn create_job(&self, id: &str, request: JobRequest, now: DateTime<Utc>) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        if self.read_job(id)?.is_some() {
            return Err(StoreError::JobAlreadyExists(id.to_string()));
        }
        let job = Job::new(id.to_string(), request, now);
        self.write_job(&job)
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.read_job(id)
    }

    fn update_job(&self, id: &str, update: JobUpdate, now: DateTime<Utc>) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let Some(mut job) = self.read_job(id)? else {
            return Ok(());
        };
        apply_update(&mut job, update, now);
        self.write_job(&job)
    }

    fn list_jobs(&self, filter: JobListFilter) -> Result<(Vec<Job>, usize)> {
        let filter = filter.normalized();
        let mut matching: Vec<Job> = self
            .all_jobs()?
            .into_iter()
            .filter(|j| filter.state.is_none_or(|s| j.state == s))
            .filter(|j| filter.provider.as_deref().is_none_or(|p| j.provider == p))
            .filter(|j| filter.date_from.is_none_or(|d| j.created_at >= d))
            .filter(|j| filter.date_to.is_none_or(|d| j.created_at <= d))
            .collect();

        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matching.len();

        let start = ((filter.page - 1) as usize) * (filter.page_size as usize);
        let page = if start >= total {
            Vec::new()
        } else {
            let end = (start + filter.page_size as usize).min(total);
            matching[start..end].to_vec()
        };
        Ok((page, total))
    }

    fn append_event(
        &self,
        job_id: &str,
        event_type: &str,
        payload: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<u64> {
        let _guard = self.write_lock.lock().unwrap();
        self.append_event_locked(job_id, event_type, payload, timestamp)
    }

    fn list_events(&self, job_id: Option<&str>, since_id: u64, limit: u32) -> Result<Vec<Event>> {
        let limit = limit.clamp(1, 1000) as usize;
        let mut out = Vec::new();

        match job_id {
            Some(job_id) => {
                let prefix = encode_event_prefix(job_id);
                for item in self.events.iter() {
                    let (key, value) = item?;
                    if !key.starts_with(prefix.as_slice()) {
                        continue;
                    }
                    let event: Event = serde_json::from_slice(&value)?;
                    if event.id > since_id {
                        out.push(event);
                    }
                }
            }
            None => {
                for item in self.events.iter() {
                    let (_, value) = item?;
                    let event: Event = serde_json::from_slice(&value)?;
                    if event.id > since_id {
                        out.push(event);
                    }
                }
            }
        }

        out.sort_by_key(|e| e.id);
        out.truncate(limit);
        Ok(out)
    }

    fn set_result(&self, result: JobResult) -> Result<()> {
        let key = encode_result_key(&result.job_id);
        self.results.insert(key, serde_json::to_vec(&result)?)?;
        Ok(())
    }

    fn get_result(&self, job_id: &str) -> Result<Option<JobResult>> {
        match self.results.get(encode_result_key(job_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn requeue_incomplete_jobs(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.requeue_matching(now, "job.requeued_after_restart", |_| true)
    }

    fn claim_job_for_execution(
        &self,
        job_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap();
        let Some(mut job) = self.read_job(job_id)? else {
            return Ok(false);
        };
        if job.state != JobState::Queued {
            return Ok(false);
        }
        job.state = JobState::Running;
        if job.started_at.is_none() {
            job.started_at = Some(now);
        }
        job.worker_id = Some(worker_id.to_string());
        job.updated_at = now;
        self.write_job(&job)?;
        Ok(true)
    }

    fn requeue_stale_running_jobs(
        &self,
        stale_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let cutoff = now - chrono::Duration::seconds(stale_seconds);
        self.requeue_matching(now, "job.requeued_stale", |job| job.updated_at < cutoff)
    }
}
