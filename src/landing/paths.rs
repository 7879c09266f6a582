// ABOUTME: Object path conventions for landed, archived and failed batches
// ABOUTME: Also derives the no-changes sentinel and the hashed per-run staging table name

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;

/// Marker segment that identifies a no-changes sentinel path.
pub const NO_CHANGES_MARKER: &str = "no_changes";

const HASH_SUFFIX_LEN: usize = 12;

/// Characters `hashed_table_name` adds to its base: `_` plus the digest.
pub const HASHED_NAME_SUFFIX_LEN: usize = HASH_SUFFIX_LEN + 1;

/// A bucket plus an object path inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobLocation {
    pub bucket: String,
    pub path: String,
}

impl BlobLocation {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
        }
    }

    /// Split `scheme://bucket/path` into its bucket and path.
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = match uri.split_once("://") {
            Some((_, rest)) => rest,
            None => bail!("Object URI '{}' has no scheme", uri),
        };
        match rest.split_once('/') {
            Some((bucket, path)) if !bucket.is_empty() && !path.is_empty() => {
                Ok(Self::new(bucket, path))
            }
            _ => bail!("Object URI '{}' must look like scheme://bucket/path", uri),
        }
    }

    pub fn uri(&self, scheme: &str) -> String {
        format!("{}://{}/{}", scheme, self.bucket, self.path)
    }
}

impl fmt::Display for BlobLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.path)
    }
}

/// `{prefix}/ingestion_dt=YYYY-MM-DD/{entity}_YYYYMMDD_HHMMSS.parquet`
pub fn landing_path(prefix: &str, entity: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}/ingestion_dt={}/{}_{}.parquet",
        prefix.trim_end_matches('/'),
        now.format("%Y-%m-%d"),
        entity,
        now.format("%Y%m%d_%H%M%S")
    )
}

/// `{scheme}://{bucket}/{prefix}/ingestion_dt=YYYY-MM-DD/no_changes`
pub fn no_changes_uri(scheme: &str, bucket: &str, prefix: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}://{}/{}/ingestion_dt={}/{}",
        scheme,
        bucket,
        prefix.trim_end_matches('/'),
        now.format("%Y-%m-%d"),
        NO_CHANGES_MARKER
    )
}

pub fn is_no_changes(uri: &str) -> bool {
    uri.rsplit('/').next() == Some(NO_CHANGES_MARKER)
}

/// Archive location: bucket gets `archive_suffix`, `landing/` becomes `archive/`.
pub fn archive_location(landed: &BlobLocation, archive_suffix: &str) -> BlobLocation {
    BlobLocation::new(
        format!("{}{}", landed.bucket, archive_suffix),
        landed.path.replace("landing/", "archive/"),
    )
}

/// Failure location: same bucket, `landing/` becomes `failed/`.
pub fn failed_location(landed: &BlobLocation) -> BlobLocation {
    BlobLocation::new(
        landed.bucket.clone(),
        landed.path.replace("landing/", "failed/"),
    )
}

/// `{base}_{12 hex chars}` from SHA-256 of `"{unix_seconds}_{uri}"`.
///
/// Same second and same URI give the same name; loads into it then append.
pub fn hashed_table_name(base: &str, landed_uri: &str, salt: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}_{}", salt.timestamp(), landed_uri).as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}_{}", base, &hex[..HASH_SUFFIX_LEN])
}
