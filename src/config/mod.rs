//! Configuration for the fetch engine.
//!
//! Settings load from built-in defaults, overridable by `FETCH_*`
//! environment variables (plus a `.env` file via `dotenvy`, if present). No
//! config file is involved — the outer service's file-based config surface
//! is out of scope here, but the engine's own knobs still go through a
//! typed, fallible loading path rather than being read ad hoc.
//!
//! # Usage
//!
//! ```no_run
//! use orbitfetch::config::Settings;
//!
//! let settings = Settings::load().expect("failed to load settings");
//! println!("data root: {}", settings.data_root.display());
//! ```

mod models;
mod sources;

pub use models::{DbBackend, Settings};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {var} is malformed: {reason}")]
    Malformed { var: String, reason: String },

    #[error("unknown FETCH_DB_BACKEND '{0}' (only 'embedded' is supported)")]
    UnknownBackend(String),
}

impl Settings {
    /// Load settings from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        sources::load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn load_from_env_is_reexported_for_tests() {
        let settings = sources::load_from_env(&HashMap::new()).unwrap();
        assert_eq!(settings.max_concurrent_jobs, 4);
    }
}
