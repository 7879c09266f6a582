// ABOUTME: Checkpoint metadata per replication stream, persisted as JSON
// ABOUTME: Tagged metadata values and the CheckpointStore collaborator interface

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// A single checkpoint metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetadataValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Path(String),
}

impl MetadataValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) | MetadataValue::Path(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            MetadataValue::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Text(s) | MetadataValue::Path(s) => write!(f, "{}", s),
            MetadataValue::Integer(i) => write!(f, "{}", i),
            MetadataValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Metadata emitted for one stream, keyed by field name.
pub type CheckpointMetadata = BTreeMap<String, MetadataValue>;

/// External collaborator that remembers the last committed metadata per stream.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Latest committed metadata for `stream_key`, or `None` if never committed.
    async fn get_latest_metadata(&self, stream_key: &str) -> Result<Option<CheckpointMetadata>>;

    /// Commit `metadata` as the latest checkpoint for `stream_key`.
    async fn emit_metadata(&self, stream_key: &str, metadata: CheckpointMetadata) -> Result<()>;
}

/// Committed checkpoint of a single stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamCheckpoint {
    pub metadata: CheckpointMetadata,
    pub committed_at: chrono::DateTime<chrono::Utc>,
}

/// On-disk layout of the checkpoint file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// Format version for future migrations
    pub version: u32,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub streams: BTreeMap<String, StreamCheckpoint>,
}

impl Default for CheckpointFile {
    fn default() -> Self {
        Self {
            version: 1,
            updated_at: chrono::Utc::now(),
            streams: BTreeMap::new(),
        }
    }
}

impl CheckpointFile {
    /// Load from `path`; a missing file is an empty checkpoint set.
    pub async fn load(path: &Path) -> Result<Self> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read checkpoints from {:?}", path))?;
        let file: CheckpointFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse checkpoints from {:?}", path))?;
        Ok(file)
    }

    /// Write to `path` through a temporary file and rename.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize checkpoints")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents)
            .await
            .with_context(|| format!("Failed to write checkpoints to {:?}", tmp))?;
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to move checkpoints into place at {:?}", path))?;
        Ok(())
    }
}

/// JSON-file checkpoint store.
///
/// Read-modify-write cycles are serialized within the process; separate
/// processes sharing one file are not coordinated.
pub struct FileCheckpointStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every committed stream checkpoint, for display.
    pub async fn snapshot(&self) -> Result<CheckpointFile> {
        let _guard = self.lock.lock().await;
        CheckpointFile::load(&self.path).await
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from(".warehouse-replicator/checkpoints.json")
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get_latest_metadata(&self, stream_key: &str) -> Result<Option<CheckpointMetadata>> {
        let _guard = self.lock.lock().await;
        let file = CheckpointFile::load(&self.path).await?;
        Ok(file.streams.get(stream_key).map(|s| s.metadata.clone()))
    }

    async fn emit_metadata(&self, stream_key: &str, metadata: CheckpointMetadata) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = CheckpointFile::load(&self.path).await?;
        let now = chrono::Utc::now();
        file.streams.insert(
            stream_key.to_string(),
            StreamCheckpoint {
                metadata,
                committed_at: now,
            },
        );
        file.updated_at = now;
        file.save(&self.path).await
    }
}
