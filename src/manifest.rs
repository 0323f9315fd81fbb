//! SHA-256 digesting and manifest generation (spec §4.6).

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::model::JobResult;

const DIGEST_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct ManifestDoc {
    job_id: String,
    provider: String,
    collection: String,
    created_at: DateTime<Utc>,
    paths: Vec<String>,
    checksums: HashMap<String, String>,
    metadata: Value,
}

/// SHA-256 over `path`'s bytes, read in 1 MiB chunks, lowercase hex.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digests every path in `result_paths`, writes `output_dir/manifest.json`
/// (pretty, 2-space indent), then digests the manifest file itself and
/// folds that into the returned checksum map and path list.
pub fn write_manifest(
    output_dir: &Path,
    job_id: &str,
    provider: &str,
    collection: &str,
    created_at: DateTime<Utc>,
    result_paths: &[PathBuf],
    metadata: Value,
) -> std::io::Result<JobResult> {
    let mut checksums = HashMap::new();
    let mut paths = Vec::new();

    for path in result_paths {
        let digest = sha256_file(path)?;
        let rel = relative_name(output_dir, path);
        checksums.insert(rel.clone(), digest);
        paths.push(rel);
    }

    let doc = ManifestDoc {
        job_id: job_id.to_string(),
        provider: provider.to_string(),
        collection: collection.to_string(),
        created_at,
        paths: paths.clone(),
        checksums: checksums.clone(),
        metadata: metadata.clone(),
    };

    let manifest_path = output_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&doc)?;
    std::fs::write(&manifest_path, &bytes)?;

    let manifest_digest = sha256_file(&manifest_path)?;
    checksums.insert("manifest.json".to_string(), manifest_digest);
    paths.push("manifest.json".to_string());

    Ok(JobResult {
        job_id: job_id.to_string(),
        paths,
        checksums,
        metadata,
    })
}

fn relative_name(output_dir: &Path, path: &Path) -> String {
    path.strip_prefix(output_dir)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn digest_is_stable_and_lowercase_hex() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"hello world").unwrap();
        let digest = sha256_file(&path).unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(digest, sha256_file(&path).unwrap());
    }

    #[test]
    fn manifest_includes_data_files_and_itself() {
        let dir = TempDir::new().unwrap();
        let file_a = dir.path().join("a.bin");
        let file_b = dir.path().join("b.bin");
        std::fs::write(&file_a, vec![0u8; 1024]).unwrap();
        std::fs::write(&file_b, vec![1u8; 1024]).unwrap();

        let result = write_manifest(
            dir.path(),
            "job-1",
            "copernicus",
            "sentinel-2",
            Utc::now(),
            &[file_a, file_b],
            Value::Null,
        )
        .unwrap();

        assert_eq!(result.paths.len(), 3);
        assert!(result.paths.contains(&"manifest.json".to_string()));
        assert_eq!(result.checksums.len(), 3);

        let on_disk = sha256_file(&dir.path().join("manifest.json")).unwrap();
        assert_eq!(result.checksums["manifest.json"], on_disk);
    }
}
