//! In-process, bounded-concurrency job scheduler (spec §4.3).
//!
//! Grounded on the teacher's `queue/broker.rs` `TaskBroker`: jobs are handed
//! to a fixed worker pool through a channel rather than spawned ad hoc. Here
//! the channel is a single shared FIFO (workers pull round-robin by racing
//! on the same receiver) instead of per-worker round robin, since job
//! concurrency is additionally bounded by two semaphores rather than by
//! channel count alone.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type CancelChecker = Arc<dyn Fn() -> bool + Send + Sync>;
pub type JobRunner =
    Arc<dyn Fn(String, CancelChecker) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct QueuedJob {
    job_id: String,
    provider: String,
}

/// Fixed worker pool draining an internal FIFO. Owns a global semaphore
/// (width = `max_concurrent_jobs`) and one semaphore per provider tag
/// (width from `provider_limit`), both acquired before a job runs.
pub struct Executor {
    tx: mpsc::UnboundedSender<QueuedJob>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<QueuedJob>>>,
    global: Arc<Semaphore>,
    provider_semaphores: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    provider_limit: Arc<dyn Fn(&str) -> u32 + Send + Sync>,
    cancel_flags: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
    queued: Arc<Mutex<std::collections::HashSet<String>>>,
    worker_count: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    runner: JobRunner,
}

impl Executor {
    pub fn new(
        worker_count: u32,
        provider_limit: impl Fn(&str) -> u32 + Send + Sync + 'static,
        runner: JobRunner,
    ) -> Arc<Self> {
        let worker_count = worker_count.max(1) as usize;
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            global: Arc::new(Semaphore::new(worker_count)),
            provider_semaphores: Arc::new(Mutex::new(HashMap::new())),
            provider_limit: Arc::new(provider_limit),
            cancel_flags: Arc::new(Mutex::new(HashMap::new())),
            queued: Arc::new(Mutex::new(std::collections::HashSet::new())),
            worker_count,
            workers: Mutex::new(Vec::new()),
            runner,
        })
    }

    /// Spawn the fixed worker pool. Idempotent: calling twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..self.worker_count {
            let executor = self.clone();
            workers.push(tokio::spawn(async move { executor.worker_loop(worker_id).await }));
        }
    }

    pub async fn stop(&self) {
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            handle.abort();
        }
    }

    /// Enqueue `job_id`. A job already queued or running is not re-queued.
    pub async fn submit(&self, job_id: impl Into<String>, provider: impl Into<String>) {
        let job_id = job_id.into();
        let provider = provider.into();

        {
            let mut queued = self.queued.lock().await;
            if !queued.insert(job_id.clone()) {
                debug!(job_id = %job_id, "already queued, skipping submit");
                return;
            }
        }

        let mut flags = self.cancel_flags.lock().await;
        flags.entry(job_id.clone()).or_insert_with(|| Arc::new(AtomicBool::new(false)));
        drop(flags);

        let _ = self.tx.send(QueuedJob { job_id, provider });
    }

    /// Set the local cancel latch for `job_id`. No-op if the job isn't
    /// tracked (never submitted, or already finished).
    pub async fn cancel(&self, job_id: &str) {
        let flags = self.cancel_flags.lock().await;
        if let Some(flag) = flags.get(job_id) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    fn cancel_checker(&self, job_id: &str, flag: Arc<AtomicBool>) -> CancelChecker {
        let _ = job_id;
        Arc::new(move || flag.load(Ordering::SeqCst))
    }

    async fn provider_semaphore(&self, provider: &str) -> Arc<Semaphore> {
        let mut map = self.provider_semaphores.lock().await;
        map.entry(provider.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new((self.provider_limit)(provider).max(1) as usize)))
            .clone()
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            let job = {
                let mut rx = self.rx.lock().await;
                rx.recv().await
            };
            let Some(job) = job else {
                debug!(worker_id, "queue closed, worker exiting");
                return;
            };

            let global_permit = match self.global.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let provider_sem = self.provider_semaphore(&job.provider).await;
            let provider_permit = match provider_sem.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };

            let flag = {
                let flags = self.cancel_flags.lock().await;
                flags.get(&job.job_id).cloned().unwrap_or_else(|| Arc::new(AtomicBool::new(false)))
            };
            let checker = self.cancel_checker(&job.job_id, flag);

            let job_id = job.job_id.clone();
            debug!(worker_id, job_id = %job_id, "dispatching job");

            let runner = self.runner.clone();
            let fut = runner(job_id.clone(), checker);
            let result = std::panic::AssertUnwindSafe(fut).catch_unwind().await;
            if result.is_err() {
                warn!(job_id = %job_id, "job runner panicked, swallowed at executor layer");
            }

            drop(global_permit);
            drop(provider_permit);

            self.queued.lock().await.remove(&job_id);
            self.cancel_flags.lock().await.remove(&job_id);
        }
    }
}
