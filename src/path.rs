//! Output-directory sandboxing (spec §4.6).

use std::path::{Component, Path, PathBuf};

use crate::error::ValidationError;

/// Resolves `requested` under `base_dir`, creating the directory before
/// returning. `requested` falls back to `fallback_name` when null/empty.
/// Rejects absolute paths, `.`/`..` segments, and NUL bytes — anything that
/// could escape `base_dir`.
pub fn sanitize_output_dir(
    base_dir: &Path,
    requested: Option<&str>,
    fallback_name: &str,
) -> Result<PathBuf, ValidationError> {
    let requested = requested
        .filter(|s| !s.is_empty())
        .unwrap_or(fallback_name);

    if requested.contains('\0') {
        return Err(ValidationError::invalid("output_dir", "contains a NUL byte"));
    }

    let candidate = Path::new(requested);
    if candidate.is_absolute() {
        return Err(ValidationError::invalid("output_dir", "must be relative"));
    }

    for component in candidate.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(ValidationError::invalid(
                    "output_dir",
                    "must not contain '.' or '..' segments",
                ));
            }
        }
    }

    let resolved = base_dir.join(candidate);
    std::fs::create_dir_all(&resolved)
        .map_err(|e| ValidationError::invalid("output_dir", format!("could not create: {e}")))?;
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rejects_traversal_and_absolute_paths() {
        let base = TempDir::new().unwrap();
        for bad in ["/abs", "../x", "a/../b", "a/\0b"] {
            assert!(
                sanitize_output_dir(base.path(), Some(bad), "job-1").is_err(),
                "expected '{bad}' to be rejected"
            );
        }
    }

    #[test]
    fn accepts_empty_and_nested_relative_paths() {
        let base = TempDir::new().unwrap();
        for good in ["", "a", "a/b", "a/b/c"] {
            let resolved = sanitize_output_dir(base.path(), Some(good), "job-1")
                .unwrap_or_else(|e| panic!("expected '{good}' to be accepted, got {e}"));
            assert!(resolved.starts_with(base.path()));
            assert!(resolved.is_dir());
        }
    }

    #[test]
    fn falls_back_to_job_id_when_absent() {
        let base = TempDir::new().unwrap();
        let resolved = sanitize_output_dir(base.path(), None, "job-42").unwrap();
        assert_eq!(resolved, base.path().join("job-42"));
    }
}
