use std::collections::HashMap;
use std::path::PathBuf;

use super::models::{DbBackend, Settings};
use super::ConfigError;

const PROVIDER_CREDENTIAL_PREFIX: &str = "FETCH_PROVIDER_CREDENTIAL_";

/// Load settings from the process environment (plus a `.env` file, if
/// present). `.env` loading failures are ignored — the file is optional.
pub fn load() -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();
    let vars: HashMap<String, String> = std::env::vars().collect();
    load_from_env(&vars)
}

/// Core loader, parameterized over an explicit env map so it can be unit
/// tested without touching the real process environment (mutating that
/// concurrently across tests is unsound — see the env-based tests below,
/// which each build their own map).
pub fn load_from_env(vars: &HashMap<String, String>) -> Result<Settings, ConfigError> {
    let defaults = Settings::default();

    let data_root = vars
        .get("FETCH_DATA_ROOT")
        .map(PathBuf::from)
        .unwrap_or(defaults.data_root);

    let db_backend = match vars.get("FETCH_DB_BACKEND").map(String::as_str) {
        None | Some("embedded") => DbBackend::Embedded,
        Some(other) => {
            return Err(ConfigError::UnknownBackend(other.to_string()));
        }
    };

    let max_concurrent_jobs = parse_clamped(
        vars,
        "FETCH_MAX_CONCURRENT_JOBS",
        defaults.max_concurrent_jobs,
        1,
        128,
    )?;

    let provider_limits = match vars.get("FETCH_PROVIDER_LIMITS") {
        Some(raw) => parse_provider_limits(raw)?,
        None => defaults.provider_limits,
    };

    let queue_poll_seconds = parse_clamped_f64(
        vars,
        "FETCH_QUEUE_POLL_SECONDS",
        defaults.queue_poll_seconds,
        0.1,
        30.0,
    )?;

    let stale_job_seconds = parse_clamped_i64(
        vars,
        "FETCH_STALE_JOB_SECONDS",
        defaults.stale_job_seconds,
        30,
        86_400,
    )?;

    let event_poll_ms = parse_u64(vars, "FETCH_EVENT_POLL_MS", defaults.event_poll_ms)?;
    let event_heartbeat_ms = parse_u64(
        vars,
        "FETCH_EVENT_HEARTBEAT_MS",
        defaults.event_heartbeat_ms,
    )?;

    let provider_credentials = vars
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(PROVIDER_CREDENTIAL_PREFIX)
                .map(|tag| (tag.to_lowercase(), v.clone()))
        })
        .collect();

    Ok(Settings {
        data_root,
        db_backend,
        max_concurrent_jobs,
        provider_limits,
        default_provider_limit: defaults.default_provider_limit,
        queue_poll_seconds,
        stale_job_seconds,
        event_poll_ms,
        event_heartbeat_ms,
        provider_credentials,
    })
}

/// Parses `name=int,name=int` pairs; unspecified providers fall back to the
/// caller's default limit of `1` (applied in [`Settings::provider_limit`]).
fn parse_provider_limits(raw: &str) -> Result<HashMap<String, u32>, ConfigError> {
    let mut out = HashMap::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| ConfigError::Malformed {
                var: "FETCH_PROVIDER_LIMITS".to_string(),
                reason: format!("expected name=int, got '{pair}'"),
            })?;
        let limit: u32 = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Malformed {
                var: "FETCH_PROVIDER_LIMITS".to_string(),
                reason: format!("'{value}' is not a non-negative integer"),
            })?;
        out.insert(name.trim().to_string(), limit);
    }
    Ok(out)
}

fn parse_clamped(
    vars: &HashMap<String, String>,
    key: &str,
    default: u32,
    min: u32,
    max: u32,
) -> Result<u32, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => {
            let value: u32 = raw.trim().parse().map_err(|_| ConfigError::Malformed {
                var: key.to_string(),
                reason: format!("'{raw}' is not an integer"),
            })?;
            Ok(value.clamp(min, max))
        }
    }
}

fn parse_clamped_i64(
    vars: &HashMap<String, String>,
    key: &str,
    default: i64,
    min: i64,
    max: i64,
) -> Result<i64, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => {
            let value: i64 = raw.trim().parse().map_err(|_| ConfigError::Malformed {
                var: key.to_string(),
                reason: format!("'{raw}' is not an integer"),
            })?;
            Ok(value.clamp(min, max))
        }
    }
}

fn parse_clamped_f64(
    vars: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: f64,
    max: f64,
) -> Result<f64, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => {
            let value: f64 = raw.trim().parse().map_err(|_| ConfigError::Malformed {
                var: key.to_string(),
                reason: format!("'{raw}' is not a number"),
            })?;
            Ok(value.clamp(min, max))
        }
    }
}

fn parse_u64(vars: &HashMap<String, String>, key: &str, default: u64) -> Result<u64, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Malformed {
            var: key.to_string(),
            reason: format!("'{raw}' is not an integer"),
        }),
    }
}
