//! Key layout and encoding utilities for Fjall partitions.
//!
//! Partition structure:
//! - `jobs`: `{job_id}` -> `Job` (JSON)
//! - `events`: `{job_id}:{event_id:020}` -> `Event` (JSON); the zero-padded
//!   event id makes a per-job prefix scan come back in id order.
//! - `results`: `{job_id}` -> `JobResult` (JSON)
//! - `metadata`: `event_seq` -> next event id (JSON u64)

pub fn encode_job_key(job_id: &str) -> Vec<u8> {
    job_id.as_bytes().to_vec()
}

pub fn decode_job_key(key: &[u8]) -> Option<String> {
    std::str::from_utf8(key).ok().map(String::from)
}

pub fn encode_event_key(job_id: &str, event_id: u64) -> Vec<u8> {
    format!("{}:{:020}", job_id, event_id).into_bytes()
}

pub fn encode_event_prefix(job_id: &str) -> Vec<u8> {
    format!("{}:", job_id).into_bytes()
}

pub fn decode_event_key(key: &[u8]) -> Option<(String, u64)> {
    let key_str = std::str::from_utf8(key).ok()?;
    let (job_id, id_str) = key_str.rsplit_once(':')?;
    let event_id = id_str.parse().ok()?;
    Some((job_id.to_string(), event_id))
}

pub fn encode_result_key(job_id: &str) -> Vec<u8> {
    job_id.as_bytes().to_vec()
}

pub const EVENT_SEQ_KEY: &[u8] = b"event_seq";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_key_roundtrip() {
        let key = encode_job_key("job_123");
        assert_eq!(key, b"job_123");
        assert_eq!(decode_job_key(&key).unwrap(), "job_123");
    }

    #[test]
    fn event_key_roundtrip() {
        let key = encode_event_key("job_123", 42);
        assert_eq!(key, b"job_123:00000000000000000042");
        let (job_id, id) = decode_event_key(&key).unwrap();
        assert_eq!(job_id, "job_123");
        assert_eq!(id, 42);
    }

    #[test]
    fn event_prefix_scan_orders_by_id() {
        let mut keys = vec![
            encode_event_key("job_1", 10),
            encode_event_key("job_1", 2),
            encode_event_key("job_1", 100),
        ];
        keys.sort();
        let ids: Vec<u64> = keys
            .iter()
            .map(|k| decode_event_key(k).unwrap().1)
            .collect();
        assert_eq!(ids, vec![2, 10, 100]);
    }

    #[test]
    fn event_prefix_does_not_bleed_across_jobs() {
        let prefix = encode_event_prefix("job_1");
        let other = encode_event_key("job_10", 1);
        assert!(!other.starts_with(prefix.as_slice()));
    }
}
