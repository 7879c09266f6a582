// ABOUTME: Watermark type and the per-stream watermark store
// ABOUTME: Reads the last committed event time, defaulting to the 1900-01-01 sentinel

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::checkpoint::{CheckpointMetadata, CheckpointStore, MetadataValue};

/// Metadata key holding the committed watermark.
pub const WATERMARK_KEY: &str = "max_updated_at";
/// Metadata key holding the row count of the committed batch.
pub const RECORDS_PROCESSED_KEY: &str = "records_processed";
/// Same value as `max_updated_at`, named for what it is.
pub const CDC_WATERMARK_KEY: &str = "cdc_watermark";

const DISPLAY_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const DISPLAY_FORMAT_MICROS: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Last successfully processed event time of a stream.
///
/// Microsecond precision (PostgreSQL's timestamp resolution), no timezone.
/// Plain `timestamp`/`date` columns compare as stored; `timestamptz` columns
/// compare in UTC because every source session runs in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(NaiveDateTime);

impl Watermark {
    /// `1900-01-01T00:00:00`, used when a stream has never been committed.
    pub fn sentinel() -> Self {
        let date = NaiveDate::from_ymd_opt(1900, 1, 1).unwrap_or(NaiveDate::MIN);
        Watermark(date.and_hms_opt(0, 0, 0).unwrap_or_default())
    }

    /// Truncates to whole microseconds.
    pub fn from_datetime(value: NaiveDateTime) -> Self {
        use chrono::Timelike;
        let micros = value.nanosecond() / 1_000 * 1_000;
        Watermark(value.with_nanosecond(micros).unwrap_or(value))
    }

    pub fn from_date(value: NaiveDate) -> Self {
        Watermark(value.and_hms_opt(0, 0, 0).unwrap_or_default())
    }

    pub fn as_datetime(&self) -> NaiveDateTime {
        self.0
    }

    pub fn is_sentinel(&self) -> bool {
        *self == Self::sentinel()
    }

    /// Parse the textual forms found in checkpoint metadata and source data:
    /// `2024-01-03`, `2024-01-03 10:00:00`, `2024-01-03T10:00:00.123` and RFC 3339.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Ok(Self::from_datetime(dt.naive_utc()));
        }
        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
                return Ok(Self::from_datetime(dt));
            }
        }
        if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
            return Ok(Self::from_date(date));
        }
        bail!("Unrecognized watermark value '{}'", text)
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::sentinel()
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use chrono::Timelike;
        // Whole seconds keep the short form so existing checkpoints read back unchanged.
        let format = if self.0.nanosecond() == 0 {
            DISPLAY_FORMAT
        } else {
            DISPLAY_FORMAT_MICROS
        };
        write!(f, "{}", self.0.format(format))
    }
}

impl FromStr for Watermark {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Reads and commits stream watermarks through a checkpoint collaborator.
#[derive(Clone)]
pub struct WatermarkStore {
    checkpoints: Arc<dyn CheckpointStore>,
}

impl WatermarkStore {
    pub fn new(checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self { checkpoints }
    }

    /// Most recently committed watermark for `stream_key`.
    ///
    /// Missing, unreadable or unparseable metadata all resolve to the
    /// sentinel, so a broken checkpoint re-initializes the stream instead of
    /// stopping it.
    pub async fn get(&self, stream_key: &str) -> Watermark {
        let metadata = match self.checkpoints.get_latest_metadata(stream_key).await {
            Ok(Some(metadata)) => metadata,
            Ok(None) => {
                tracing::info!(
                    "No checkpoint for stream '{}', starting from {}",
                    stream_key,
                    Watermark::sentinel()
                );
                return Watermark::sentinel();
            }
            Err(e) => {
                tracing::warn!(
                    "Could not read checkpoint for stream '{}': {:#}. Starting from {}",
                    stream_key,
                    e,
                    Watermark::sentinel()
                );
                return Watermark::sentinel();
            }
        };

        match metadata.get(WATERMARK_KEY) {
            Some(MetadataValue::Text(text)) => match Watermark::parse(text) {
                Ok(wm) => wm,
                Err(e) => {
                    tracing::warn!(
                        "Ignoring checkpoint for stream '{}': {}",
                        stream_key,
                        e
                    );
                    Watermark::sentinel()
                }
            },
            Some(other) => {
                tracing::warn!(
                    "Checkpoint for stream '{}' has non-text watermark {:?}, starting from sentinel",
                    stream_key,
                    other
                );
                Watermark::sentinel()
            }
            None => Watermark::sentinel(),
        }
    }

    /// Commit `candidate` for `stream_key`, recording how many rows produced it.
    ///
    /// Only the checkpoint advancer calls this, after downstream success.
    pub async fn set(
        &self,
        stream_key: &str,
        candidate: Watermark,
        records_processed: usize,
        extra: CheckpointMetadata,
    ) -> Result<()> {
        let mut metadata = extra;
        metadata.insert(
            WATERMARK_KEY.to_string(),
            MetadataValue::Text(candidate.to_string()),
        );
        metadata.insert(
            CDC_WATERMARK_KEY.to_string(),
            MetadataValue::Text(candidate.to_string()),
        );
        metadata.insert(
            RECORDS_PROCESSED_KEY.to_string(),
            MetadataValue::Integer(records_processed as i64),
        );
        self.checkpoints.emit_metadata(stream_key, metadata).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::checkpoint::FileCheckpointStore;
    use tempfile::TempDir;

    #[test]
    fn test_sentinel_format() {
        assert_eq!(Watermark::sentinel().to_string(), "1900-01-01T00:00:00");
        assert!(Watermark::default().is_sentinel());
    }

    #[test]
    fn test_parse_accepts_common_forms() {
        let expected = "2024-01-03T10:15:00";
        assert_eq!(Watermark::parse("2024-01-03 10:15:00").unwrap().to_string(), expected);
        assert_eq!(Watermark::parse("2024-01-03T10:15:00").unwrap().to_string(), expected);
        assert_eq!(
            Watermark::parse("2024-01-03T10:15:00.987654").unwrap().to_string(),
            "2024-01-03T10:15:00.987654"
        );
        assert_eq!(
            Watermark::parse("2024-01-03 10:15:00.5").unwrap().to_string(),
            "2024-01-03T10:15:00.500000"
        );
        assert_eq!(
            Watermark::parse("2024-01-03T10:15:00+00:00").unwrap().to_string(),
            expected
        );
        assert_eq!(
            Watermark::parse("2024-01-03").unwrap().to_string(),
            "2024-01-03T00:00:00"
        );
        assert!(Watermark::parse("yesterday").is_err());
        assert!(Watermark::parse("").is_err());
    }

    #[test]
    fn test_subsecond_precision_survives_round_trip() {
        let ts = NaiveDateTime::parse_from_str("2024-01-03 10:00:00.500", "%Y-%m-%d %H:%M:%S%.f")
            .unwrap();
        let wm = Watermark::from_datetime(ts);
        assert_eq!(wm.as_datetime(), ts);

        let reparsed = Watermark::parse(&wm.to_string()).unwrap();
        assert_eq!(reparsed, wm);
        assert!(Watermark::parse("2024-01-03 10:00:00").unwrap() < reparsed);

        let nanos = ts + chrono::Duration::nanoseconds(123);
        assert_eq!(Watermark::from_datetime(nanos), wm);
    }

    #[test]
    fn test_ordering() {
        let a = Watermark::parse("2024-01-01").unwrap();
        let b = Watermark::parse("2024-01-03").unwrap();
        assert!(a < b);
        assert!(Watermark::sentinel() < a);
        assert_eq!(a.max(b), b);
    }

    #[tokio::test]
    async fn test_store_defaults_to_sentinel() {
        let dir = TempDir::new().unwrap();
        let store = WatermarkStore::new(Arc::new(FileCheckpointStore::new(
            dir.path().join("checkpoints.json"),
        )));
        assert_eq!(store.get("installments").await, Watermark::sentinel());
    }

    #[tokio::test]
    async fn test_store_set_then_get() {
        let dir = TempDir::new().unwrap();
        let checkpoints = Arc::new(FileCheckpointStore::new(dir.path().join("checkpoints.json")));
        let store = WatermarkStore::new(checkpoints.clone());

        let wm = Watermark::parse("2024-01-03").unwrap();
        store
            .set("installments", wm, 2, CheckpointMetadata::new())
            .await
            .unwrap();

        assert_eq!(store.get("installments").await, wm);
        let metadata = checkpoints
            .get_latest_metadata("installments")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(metadata[RECORDS_PROCESSED_KEY], MetadataValue::Integer(2));
    }

    #[tokio::test]
    async fn test_unreadable_checkpoint_falls_back_to_sentinel() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoints.json");
        std::fs::write(&path, "{ broken").unwrap();

        let store = WatermarkStore::new(Arc::new(FileCheckpointStore::new(&path)));
        assert!(store.get("installments").await.is_sentinel());
    }
}
