//! Resumable, poll-based event stream (spec §4.5).
//!
//! The transport (SSE framing, long polling, whatever sits in front of this)
//! is out of scope; this module only produces the logical `Stream<Item =
//! StreamEvent>` that a transport adapts. Built with `futures::stream::unfold`
//! rather than a hand-rolled `Stream` impl, following the stream-combinator
//! style the example pack uses for incremental polling loops.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use tokio::time::Instant;

use crate::model::StreamEvent;
use crate::store::JobStore;

#[derive(Debug, Clone)]
pub struct EventStreamConfig {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(400),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

struct StreamState {
    store: Arc<dyn JobStore>,
    job_id: Option<String>,
    since_id: u64,
    config: EventStreamConfig,
    last_emit: Instant,
    pending: std::collections::VecDeque<StreamEvent>,
}

/// Builds a stream of events for `job_id` (or every job, if `None`) with id
/// greater than `since_id`. Polls the store every `poll_interval`; emits a
/// synthetic heartbeat if nothing real has been emitted for
/// `heartbeat_interval`.
pub fn stream_events(
    store: Arc<dyn JobStore>,
    job_id: Option<String>,
    since_id: u64,
    config: EventStreamConfig,
) -> impl Stream<Item = StreamEvent> {
    let state = StreamState {
        store,
        job_id,
        since_id,
        config,
        last_emit: Instant::now(),
        pending: std::collections::VecDeque::new(),
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                state.last_emit = Instant::now();
                return Some((event, state));
            }

            tokio::time::sleep(state.config.poll_interval).await;

            let events = state
                .store
                .list_events(state.job_id.as_deref(), state.since_id, 1000)
                .unwrap_or_default();

            if !events.is_empty() {
                for event in &events {
                    state.since_id = state.since_id.max(event.id);
                }
                state.pending.extend(events.into_iter().map(StreamEvent::Stored));
                continue;
            }

            if state.last_emit.elapsed() >= state.config.heartbeat_interval {
                state.last_emit = Instant::now();
                return Some((StreamEvent::Heartbeat { timestamp: Utc::now() }, state));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DownloadProductsRequest, JobRequest};
    use crate::store::FjallStore;
    use futures::StreamExt;
    use tempfile::TempDir;

    fn test_store() -> (Arc<dyn JobStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FjallStore::open(dir.path().join("store")).unwrap();
        (Arc::new(store), dir)
    }

    fn request() -> JobRequest {
        JobRequest::DownloadProducts(DownloadProductsRequest {
            provider: "copernicus".to_string(),
            collection: "sentinel-2".to_string(),
            product_ids: vec!["p1".to_string()],
            output_dir: None,
        })
    }

    #[tokio::test]
    async fn emits_stored_events_then_heartbeat() {
        let (store, _dir) = test_store();
        let now = Utc::now();
        store.create_job("job-1", request(), now).unwrap();
        store.append_event("job-1", "job.created", serde_json::Value::Null, now).unwrap();

        let config = EventStreamConfig {
            poll_interval: Duration::from_millis(5),
            heartbeat_interval: Duration::from_millis(20),
        };
        let mut stream = Box::pin(stream_events(store.clone(), Some("job-1".to_string()), 0, config));

        let first = stream.next().await.unwrap();
        match first {
            StreamEvent::Stored(event) => assert_eq!(event.event_type, "job.created"),
            StreamEvent::Heartbeat { .. } => panic!("expected stored event first"),
        }

        let second = stream.next().await.unwrap();
        assert!(matches!(second, StreamEvent::Heartbeat { .. }));
    }
}
