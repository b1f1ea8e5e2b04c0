//! Content and Config Fingerprints
//!
//! Deterministic SHA-256 digests used for run metadata, revision detection
//! and export checksums.
//!
//! # Canonicalization
//!
//! - Values go through `serde_json::Value`, whose maps keep keys sorted, so
//!   field order in the source struct does not matter.
//! - Filesystem locations are stripped from the config before hashing: moving
//!   the store does not change what the pipeline computes.
//! - `is_late_arrival_revision` is excluded from row hashes. It describes how
//!   a row came to be, not what it contains.

use crate::pipeline::config::PipelineConfig;
use crate::pipeline::error::PipelineResult;
use crate::pipeline::features::FeatureRow;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Bump when the hashing layout changes.
pub const FINGERPRINT_VERSION: &str = "BBFP_V1";

const PATH_FIELDS: [&str; 3] = ["store_path", "raw_dir", "export_dir"];
const REVISION_FLAG_FIELD: &str = "is_late_arrival_revision";

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hash of every computation-relevant config value.
pub fn config_fingerprint(config: &PipelineConfig) -> PipelineResult<String> {
    let mut value = serde_json::to_value(config)?;
    if let Value::Object(map) = &mut value {
        for field in PATH_FIELDS {
            map.remove(field);
        }
    }
    let canonical = serde_json::to_string(&value)?;
    Ok(sha256_hex(format!("{}|{}", FINGERPRINT_VERSION, canonical).as_bytes()))
}

fn row_value(row: &FeatureRow) -> PipelineResult<serde_json::Map<String, Value>> {
    match serde_json::to_value(row)? {
        Value::Object(mut map) => {
            map.remove(REVISION_FLAG_FIELD);
            Ok(map)
        }
        _ => Ok(serde_json::Map::new()),
    }
}

/// Hash of a row's content.
pub fn row_hash(row: &FeatureRow) -> PipelineResult<String> {
    let canonical = serde_json::to_string(&Value::Object(row_value(row)?))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Hash of a whole partition, from its row hashes in key order.
pub fn content_hash<'a>(row_hashes: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_VERSION.as_bytes());
    for h in row_hashes {
        hasher.update(b"|");
        hasher.update(h.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Names of the fields whose values differ, sorted.
pub fn changed_fields(old: &FeatureRow, new: &FeatureRow) -> PipelineResult<Vec<String>> {
    let (a, b) = (row_value(old)?, row_value(new)?);
    Ok(a.iter()
        .filter(|(k, v)| b.get(k.as_str()) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect())
}

/// SHA-256 of raw bytes, for export files.
pub fn file_checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
