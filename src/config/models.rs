use std::collections::HashMap;
use std::path::PathBuf;

/// The only backend this repository implements. The selector still exists
/// on the wire so a remote-store backend is a real extension point rather
/// than an implicit assumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbBackend {
    Embedded,
}

/// Engine-level settings (spec §10.3). Every field has a built-in default and
/// is overridable by a `FETCH_*` environment variable; numeric knobs are
/// clamped rather than rejected.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_root: PathBuf,
    pub db_backend: DbBackend,
    pub max_concurrent_jobs: u32,
    pub provider_limits: HashMap<String, u32>,
    pub default_provider_limit: u32,
    pub queue_poll_seconds: f64,
    pub stale_job_seconds: i64,
    pub event_poll_ms: u64,
    pub event_heartbeat_ms: u64,
    /// `FETCH_PROVIDER_CREDENTIAL_<TAG>`, keyed by lowercased tag, forwarded
    /// opaquely to provider constructors.
    pub provider_credentials: HashMap<String, String>,
}

impl Settings {
    pub fn store_path(&self) -> PathBuf {
        self.data_root.join("store")
    }

    pub fn downloads_root(&self) -> PathBuf {
        self.data_root.join("downloads")
    }

    pub fn provider_limit(&self, provider: &str) -> u32 {
        self.provider_limits
            .get(provider)
            .copied()
            .unwrap_or(self.default_provider_limit)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            db_backend: DbBackend::Embedded,
            max_concurrent_jobs: 4,
            provider_limits: default_provider_limits(),
            default_provider_limit: 1,
            queue_poll_seconds: 1.0,
            stale_job_seconds: 900,
            event_poll_ms: 400,
            event_heartbeat_ms: 10_000,
            provider_credentials: HashMap::new(),
        }
    }
}

fn default_provider_limits() -> HashMap<String, u32> {
    let mut m = HashMap::new();
    m.insert("copernicus".to_string(), 2);
    m.insert("usgs".to_string(), 4);
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let s = Settings::default();
        assert_eq!(s.max_concurrent_jobs, 4);
        assert_eq!(s.provider_limit("copernicus"), 2);
        assert_eq!(s.provider_limit("usgs"), 4);
        assert_eq!(s.provider_limit("unknown"), 1);
        assert_eq!(s.stale_job_seconds, 900);
    }

    #[test]
    fn derived_paths_are_siblings_under_data_root() {
        let s = Settings::default();
        assert_eq!(s.store_path(), PathBuf::from("./data/store"));
        assert_eq!(s.downloads_root(), PathBuf::from("./data/downloads"));
    }
}
