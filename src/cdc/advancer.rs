// ABOUTME: Checkpoint advancer - commits the candidate watermark after downstream success
// ABOUTME: Optionally drops the per-run hashed staging table once the checkpoint is committed

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::checkpoint::{CheckpointMetadata, MetadataValue};
use super::extractor::Extraction;
use super::watermark::{Watermark, WatermarkStore};
use crate::staging::loader::LoadResult;
use crate::staging::store::StagingStore;

/// What happens to the hashed append table after a committed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashedTableRetention {
    /// Keep every hashed table as a per-run audit trail.
    #[default]
    Retain,
    /// Drop the run's hashed table once its watermark is committed.
    DropAfterCheckpoint,
}

/// Result of an advance attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The watermark was committed (possibly unchanged for an empty batch).
    Committed {
        watermark: Watermark,
        records_processed: usize,
    },
    /// Downstream failed; the previous watermark stays authoritative.
    Held { watermark: Watermark },
}

impl AdvanceOutcome {
    pub fn watermark(&self) -> Watermark {
        match self {
            AdvanceOutcome::Committed { watermark, .. } | AdvanceOutcome::Held { watermark } => {
                *watermark
            }
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, AdvanceOutcome::Committed { .. })
    }
}

pub struct CheckpointAdvancer {
    watermarks: WatermarkStore,
    staging: Arc<dyn StagingStore>,
    retention: HashedTableRetention,
}

impl CheckpointAdvancer {
    pub fn new(
        watermarks: WatermarkStore,
        staging: Arc<dyn StagingStore>,
        retention: HashedTableRetention,
    ) -> Self {
        Self {
            watermarks,
            staging,
            retention,
        }
    }

    /// Commit the extraction's candidate watermark if `downstream_success`.
    ///
    /// `loaded` is the staging result of this run, absent for an empty batch.
    /// A failed hashed-table cleanup is logged; the commit stands.
    pub async fn advance(
        &self,
        extraction: &Extraction,
        downstream_success: bool,
        loaded: Option<&LoadResult>,
    ) -> Result<AdvanceOutcome> {
        let stream_key = &extraction.stream_key;

        if !downstream_success {
            tracing::warn!(
                "Downstream step failed for '{}'; watermark stays at {}",
                stream_key,
                extraction.watermark
            );
            return Ok(AdvanceOutcome::Held {
                watermark: extraction.watermark,
            });
        }

        let candidate = extraction.batch_max_event_time.max(extraction.watermark);
        let records_processed = extraction.records_extracted();

        let mut extra = CheckpointMetadata::new();
        if let Some(loaded) = loaded {
            extra.insert(
                "archived_object".to_string(),
                MetadataValue::Path(loaded.terminal_uri.clone()),
            );
            extra.insert(
                "hashed_table".to_string(),
                MetadataValue::Text(loaded.hashed.to_string()),
            );
        }

        self.watermarks
            .set(stream_key, candidate, records_processed, extra)
            .await
            .with_context(|| {
                format!(
                    "Failed to commit watermark {} for stream '{}'",
                    candidate, stream_key
                )
            })?;

        if candidate > extraction.watermark {
            tracing::info!(
                "Advanced watermark for '{}' from {} to {} ({} rows)",
                stream_key,
                extraction.watermark,
                candidate,
                records_processed
            );
        } else {
            tracing::info!(
                "Watermark for '{}' unchanged at {} ({} rows)",
                stream_key,
                candidate,
                records_processed
            );
        }

        if let (Some(loaded), HashedTableRetention::DropAfterCheckpoint) = (loaded, self.retention)
        {
            match self.staging.drop_table(&loaded.hashed).await {
                Ok(true) => tracing::info!("Dropped hashed table {}", loaded.hashed),
                Ok(false) => tracing::debug!("Hashed table {} was already gone", loaded.hashed),
                Err(e) => tracing::warn!(
                    "Failed to drop hashed table {}: {:#}",
                    loaded.hashed,
                    e
                ),
            }
        }

        Ok(AdvanceOutcome::Committed {
            watermark: candidate,
            records_processed,
        })
    }
}
