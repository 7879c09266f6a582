// ABOUTME: Staging loader - lands an encoded batch and loads it into hashed and canonical tables
// ABOUTME: Resolves the landed object to archive on success or failed on error

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::schema::{filter_schema_columns, SchemaDescriptor};
use super::store::{StagingStore, TableRef, WriteMode};
use crate::config::{PipelineConfig, StreamConfig};
use crate::landing::blob::BlobStore;
use crate::landing::lifecycle::{BlobLifecycleManager, Outcome};
use crate::landing::paths::{hashed_table_name, landing_path, no_changes_uri, BlobLocation};

/// Clock used for landing paths and the hashed-name salt.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// What the loader is handed for one run.
#[derive(Debug, Clone)]
pub enum StagePayload {
    /// The extraction returned no rows; nothing is encoded.
    Empty,
    /// Encoded Parquet bytes of a non-empty batch.
    Encoded(Bytes),
}

/// Tables and object locations produced by a successful load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResult {
    pub landed_uri: String,
    /// Where the object ended up after the lifecycle move.
    pub terminal_uri: String,
    pub hashed: TableRef,
    pub canonical: TableRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Empty batch: only a sentinel path, no upload, load or move.
    NoChanges { sentinel: String },
    Loaded(LoadResult),
}

impl StageOutcome {
    /// Sentinel path or landed URI.
    pub fn uri(&self) -> &str {
        match self {
            StageOutcome::NoChanges { sentinel } => sentinel,
            StageOutcome::Loaded(result) => &result.landed_uri,
        }
    }

    pub fn loaded(&self) -> Option<&LoadResult> {
        match self {
            StageOutcome::NoChanges { .. } => None,
            StageOutcome::Loaded(result) => Some(result),
        }
    }
}

pub struct StagingLoader {
    blobs: Arc<dyn BlobStore>,
    staging: Arc<dyn StagingStore>,
    lifecycle: BlobLifecycleManager,
    bucket: String,
    prefix: String,
    dataset: String,
    excluded_fields: Vec<String>,
    clock: Clock,
}

impl StagingLoader {
    pub fn new(
        config: &PipelineConfig,
        blobs: Arc<dyn BlobStore>,
        staging: Arc<dyn StagingStore>,
    ) -> Self {
        Self {
            lifecycle: BlobLifecycleManager::new(
                blobs.clone(),
                config.storage.archive_bucket_suffix.clone(),
            ),
            blobs,
            staging,
            bucket: config.storage.bucket.clone(),
            prefix: config.storage.prefix.clone(),
            dataset: config.staging.dataset.clone(),
            excluded_fields: config.staging.excluded_fields.clone(),
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock, e.g. to pin the hashed-name salt in tests.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Land `payload` for `stream` and load it into both staging tables.
    ///
    /// A load failure moves the object to the failed location before the
    /// error is returned; the error names that location.
    pub async fn stage(&self, payload: StagePayload, stream: &StreamConfig) -> Result<StageOutcome> {
        let now = (self.clock)();

        let bytes = match payload {
            StagePayload::Empty => {
                let sentinel = no_changes_uri(self.blobs.scheme(), &self.bucket, &self.prefix, now);
                tracing::info!(
                    "No new or changed rows for '{}'; skipping upload and load",
                    stream.key
                );
                return Ok(StageOutcome::NoChanges { sentinel });
            }
            StagePayload::Encoded(bytes) => bytes,
        };

        let location = BlobLocation::new(&self.bucket, landing_path(&self.prefix, &stream.entity, now));
        let size = bytes.len();
        let landed_uri = self
            .blobs
            .upload(&location, bytes)
            .await
            .with_context(|| format!("Failed to land batch for stream '{}'", stream.key))?;
        tracing::info!("Landed {} bytes for '{}' at {}", size, stream.key, landed_uri);

        let hashed = TableRef::new(
            &self.dataset,
            hashed_table_name(&stream.entity, &landed_uri, now),
            WriteMode::Append,
        );
        let canonical = TableRef::new(&self.dataset, &stream.entity, WriteMode::Truncate);

        let schema = self.reference_schema(&stream.reference_table()).await;
        tracing::info!(
            "Loading {} into {} and {}",
            landed_uri,
            hashed,
            canonical
        );

        if let Err(e) = self.load_both(&hashed, &canonical, &landed_uri, schema.as_ref()).await {
            tracing::error!("Failed to load batch {}: {:#}", landed_uri, e);
            return match self.lifecycle.resolve(&landed_uri, Outcome::Failure).await {
                Ok(failed_uri) => {
                    Err(e.context(format!("Load failed; object moved to {}", failed_uri)))
                }
                Err(move_err) => {
                    tracing::warn!("Could not move {} to failed location: {:#}", landed_uri, move_err);
                    Err(e.context(format!("Load failed; object left at {}", landed_uri)))
                }
            };
        }

        let terminal_uri = match self.lifecycle.resolve(&landed_uri, Outcome::Success).await {
            Ok(uri) => uri,
            Err(e) => {
                tracing::error!("Failed to archive {}: {:#}", landed_uri, e);
                let location = match self.lifecycle.resolve(&landed_uri, Outcome::Failure).await {
                    Ok(failed_uri) => format!("object moved to {}", failed_uri),
                    Err(move_err) => {
                        tracing::warn!(
                            "Could not move {} to failed location: {:#}",
                            landed_uri,
                            move_err
                        );
                        format!("object left at {}", landed_uri)
                    }
                };
                return Err(e.context(format!(
                    "Loaded batch but failed to archive the landed object; {}",
                    location
                )));
            }
        };

        Ok(StageOutcome::Loaded(LoadResult {
            landed_uri,
            terminal_uri,
            hashed,
            canonical,
        }))
    }

    async fn load_both(
        &self,
        hashed: &TableRef,
        canonical: &TableRef,
        uri: &str,
        schema: Option<&SchemaDescriptor>,
    ) -> Result<()> {
        self.staging
            .load(hashed, uri, schema)
            .await
            .with_context(|| format!("Failed to load {} into {}", uri, hashed))?;
        self.staging
            .load(canonical, uri, schema)
            .await
            .with_context(|| format!("Failed to load {} into {}", uri, canonical))?;
        Ok(())
    }

    /// Filtered schema of the reference table, or `None` to load unconstrained.
    async fn reference_schema(&self, reference_table: &str) -> Option<SchemaDescriptor> {
        match self.staging.get_schema(&self.dataset, reference_table).await {
            Ok(Some(schema)) => {
                let filtered = filter_schema_columns(&schema, &self.excluded_fields);
                if filtered.is_empty() {
                    tracing::warn!(
                        "Reference table {}.{} has no loadable fields; loading without schema enforcement",
                        self.dataset,
                        reference_table
                    );
                    None
                } else {
                    tracing::info!(
                        "Enforcing {} fields from {}.{}",
                        filtered.len(),
                        self.dataset,
                        reference_table
                    );
                    Some(filtered)
                }
            }
            Ok(None) => {
                tracing::info!(
                    "Reference table {}.{} not found; loading without schema enforcement",
                    self.dataset,
                    reference_table
                );
                None
            }
            Err(e) => {
                tracing::warn!(
                    "Could not get schema of {}.{}, proceeding without schema enforcement: {:#}",
                    self.dataset,
                    reference_table,
                    e
                );
                None
            }
        }
    }
}
