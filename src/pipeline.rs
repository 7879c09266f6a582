// ABOUTME: One replication run per stream and the periodic runner over all streams
// ABOUTME: Watermark read, extract, encode, stage, transform, then advance, strictly in order

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;

use crate::cdc::advancer::{AdvanceOutcome, CheckpointAdvancer};
use crate::cdc::checkpoint::{CheckpointMetadata, CheckpointStore, FileCheckpointStore, MetadataValue};
use crate::cdc::extractor::{CdcExtractor, ChangeSource, PostgresSource};
use crate::cdc::watermark::{Watermark, WatermarkStore};
use crate::config::{PipelineConfig, StreamConfig};
use crate::landing::blob::{BlobStore, ObjectStoreBlobs};
use crate::landing::encoder::LandingEncoder;
use crate::staging::loader::{Clock, StageOutcome, StagePayload, StagingLoader};
use crate::staging::postgres::PostgresStagingStore;
use crate::staging::store::StagingStore;
use crate::transform::{
    drain, CommandTransform, NoTransform, TransformOutcome, TransformRequest, Transformer,
};

/// What a single run of a stream did.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub stream_key: String,
    pub watermark_before: Watermark,
    pub records_extracted: usize,
    /// Candidate watermark of the batch; the prior watermark when empty.
    pub batch_max_event_time: Watermark,
    pub stage: StageOutcome,
    /// `None` when the batch was empty and no transformation ran.
    pub transform: Option<TransformOutcome>,
    pub advance: AdvanceOutcome,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn watermark_after(&self) -> Watermark {
        self.advance.watermark()
    }

    /// `{records_extracted, batch_max_updated_at}` for run tracking.
    pub fn metadata(&self) -> CheckpointMetadata {
        let mut metadata = CheckpointMetadata::new();
        metadata.insert(
            "records_extracted".to_string(),
            MetadataValue::Integer(self.records_extracted as i64),
        );
        metadata.insert(
            "batch_max_updated_at".to_string(),
            MetadataValue::Text(self.batch_max_event_time.to_string()),
        );
        metadata
    }

    /// `key=value` pairs of [`RunReport::metadata`] for logs and the CLI.
    pub fn metadata_summary(&self) -> String {
        self.metadata()
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Executes the replication protocol for one stream at a time.
pub struct ReplicationRun {
    watermarks: WatermarkStore,
    extractor: CdcExtractor,
    encoder: LandingEncoder,
    loader: StagingLoader,
    transformer: Arc<dyn Transformer>,
    advancer: CheckpointAdvancer,
}

impl ReplicationRun {
    pub fn new(
        config: &PipelineConfig,
        source: Arc<dyn ChangeSource>,
        blobs: Arc<dyn BlobStore>,
        staging: Arc<dyn StagingStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        transformer: Arc<dyn Transformer>,
    ) -> Self {
        let watermarks = WatermarkStore::new(checkpoints);
        Self {
            extractor: CdcExtractor::new(source),
            encoder: LandingEncoder::new(),
            loader: StagingLoader::new(config, blobs, staging.clone()),
            transformer,
            advancer: CheckpointAdvancer::new(
                watermarks.clone(),
                staging,
                config.staging.hashed_table_retention,
            ),
            watermarks,
        }
    }

    /// Pin the clock used for landing paths and hashed names.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.loader = self.loader.with_clock(clock);
        self
    }

    /// Run `stream` once.
    ///
    /// Any error leaves the committed watermark untouched, so the next run
    /// retries the same window. A failed transformation is reported as an
    /// error after the watermark has been held.
    pub async fn execute(&self, stream: &StreamConfig) -> Result<RunReport> {
        let started = Instant::now();

        let watermark = self.watermarks.get(&stream.key).await;
        let extraction = self.extractor.extract(stream, watermark).await?;

        let payload = if extraction.batch.is_empty() {
            StagePayload::Empty
        } else {
            let bytes = self
                .encoder
                .encode(
                    &extraction.batch,
                    &stream.timestamp_columns,
                    &stream.date_columns,
                )
                .with_context(|| {
                    format!(
                        "Failed to encode batch for stream '{}' at watermark {}",
                        stream.key, watermark
                    )
                })?;
            StagePayload::Encoded(bytes)
        };

        let stage = self
            .loader
            .stage(payload, stream)
            .await
            .with_context(|| format!("Staging failed for stream '{}'", stream.key))?;

        let transform = match stage.loaded() {
            Some(loaded) => {
                let request = TransformRequest {
                    stream_key: stream.key.clone(),
                    model: stream.transform_model().to_string(),
                    temp_table: loaded.hashed.table.clone(),
                };
                Some(self.run_transform(request).await?)
            }
            None => None,
        };
        let downstream_success = transform.as_ref().map_or(true, |t| t.success);

        let advance = self
            .advancer
            .advance(&extraction, downstream_success, stage.loaded())
            .await?;

        if let Some(outcome) = transform.as_ref().filter(|t| !t.success) {
            let location = stage
                .loaded()
                .map(|l| l.terminal_uri.as_str())
                .unwrap_or_else(|| stage.uri());
            bail!(
                "Transformation failed for stream '{}': {}. Watermark held at {}; batch archived at {}",
                stream.key,
                outcome.detail.as_deref().unwrap_or("unknown error"),
                advance.watermark(),
                location
            );
        }

        let report = RunReport {
            stream_key: stream.key.clone(),
            watermark_before: watermark,
            records_extracted: extraction.records_extracted(),
            batch_max_event_time: extraction.batch_max_event_time,
            stage,
            transform,
            advance,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        tracing::info!(
            "Run of '{}' finished in {}ms: {} rows, watermark {} -> {}",
            report.stream_key,
            report.duration_ms,
            report.records_extracted,
            report.watermark_before,
            report.watermark_after()
        );
        tracing::info!("Run metadata for '{}': {}", report.stream_key, report.metadata_summary());
        Ok(report)
    }

    async fn run_transform(&self, request: TransformRequest) -> Result<TransformOutcome> {
        let transformer = self.transformer.clone();
        let stream_key = request.stream_key.clone();

        let outcome = tokio::task::spawn_blocking(move || transformer.run(&request).map(drain))
            .await
            .context("Transformation task panicked")?;

        Ok(match outcome {
            Ok(outcome) => {
                if outcome.success {
                    tracing::info!(
                        "Transformation for '{}' succeeded ({} output lines)",
                        stream_key,
                        outcome.lines
                    );
                }
                outcome
            }
            Err(e) => TransformOutcome {
                success: false,
                lines: 0,
                detail: Some(format!("{:#}", e)),
            },
        })
    }
}

/// Statistics for one pass over all streams.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub streams_succeeded: usize,
    pub records_extracted: usize,
    /// Failed streams with their error messages.
    pub errors: Vec<(String, String)>,
    pub duration_ms: u64,
}

/// Runs configured streams once or on a fixed interval.
pub struct PipelineRunner {
    config: PipelineConfig,
    run: ReplicationRun,
}

impl PipelineRunner {
    pub fn new(config: PipelineConfig, run: ReplicationRun) -> Self {
        Self { config, run }
    }

    /// Wire up the PostgreSQL source and staging store, object storage,
    /// the checkpoint file and the configured transformation.
    pub async fn connect(config: PipelineConfig) -> Result<Self> {
        let Some(source_url) = config.source.url.clone() else {
            bail!("No source database URL (set source.url, --source or SOURCE_DATABASE_URL)");
        };
        let Some(staging_url) = config.staging.url.clone() else {
            bail!("No staging database URL (set staging.url, --staging or STAGING_DATABASE_URL)");
        };

        let blobs: Arc<dyn BlobStore> = Arc::new(ObjectStoreBlobs::new(&config.storage));
        let source = Arc::new(PostgresSource::connect(&source_url).await?);
        let staging = Arc::new(PostgresStagingStore::connect(&staging_url, blobs.clone()).await?);
        let checkpoints = Arc::new(FileCheckpointStore::new(&config.checkpoint.state_path));
        let transformer: Arc<dyn Transformer> = match &config.transform {
            Some(transform) => Arc::new(CommandTransform::new(transform)),
            None => Arc::new(NoTransform),
        };

        let run = ReplicationRun::new(&config, source, blobs, staging, checkpoints, transformer);
        Ok(Self::new(config, run))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run_stream(&self, key: &str) -> Result<RunReport> {
        let stream = self
            .config
            .stream(key)
            .with_context(|| format!("Unknown stream '{}'", key))?;
        self.run.execute(stream).await
    }

    /// Run every stream in order. A failing stream is recorded and the
    /// remaining streams still run.
    pub async fn run_all(&self) -> CycleStats {
        let started = Instant::now();
        let mut stats = CycleStats::default();

        for stream in &self.config.streams {
            match self.run.execute(stream).await {
                Ok(report) => {
                    stats.streams_succeeded += 1;
                    stats.records_extracted += report.records_extracted;
                }
                Err(e) => {
                    tracing::error!("Stream '{}' failed: {:#}", stream.key, e);
                    stats.errors.push((stream.key.clone(), format!("{:#}", e)));
                }
            }
        }

        stats.duration_ms = started.elapsed().as_millis() as u64;
        stats
    }

    /// Run all streams every `schedule.interval_secs` until `shutdown` fires.
    ///
    /// A cycle in progress is allowed to finish; shutdown is only observed
    /// between cycles.
    pub async fn run_scheduled(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> Result<()> {
        let period = Duration::from_secs(self.config.schedule.interval_secs);
        let mut ticker = interval(period);
        let mut cycles = 0u64;

        tracing::info!(
            "Starting scheduled replication of {} streams every {:?}",
            self.config.streams.len(),
            period
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping scheduler");
                    break;
                }
                _ = ticker.tick() => {
                    cycles += 1;
                    tracing::info!("Starting replication cycle {}", cycles);

                    let stats = self.run_all().await;
                    tracing::info!(
                        "Cycle {} completed: {} streams, {} rows in {}ms",
                        cycles,
                        stats.streams_succeeded,
                        stats.records_extracted,
                        stats.duration_ms
                    );
                    if !stats.errors.is_empty() {
                        tracing::warn!("Cycle {} had {} failed streams", cycles, stats.errors.len());
                    }
                }
            }
        }

        Ok(())
    }
}
