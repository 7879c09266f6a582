// ABOUTME: Change-data-capture protocol: watermark read, bounded extraction, checkpoint advance
// ABOUTME: Watermarks are event times committed only after downstream consumption succeeds

pub mod advancer;
pub mod checkpoint;
pub mod extractor;
pub mod query;
pub mod watermark;

pub use advancer::{AdvanceOutcome, CheckpointAdvancer, HashedTableRetention};
pub use checkpoint::{CheckpointMetadata, CheckpointStore, FileCheckpointStore, MetadataValue};
pub use extractor::{Batch, CdcExtractor, ChangeSource, Column, Extraction, PostgresSource, Value};
pub use query::{build_cdc_query, CdcQuery, EventTimeCursor, ExtractOrder};
pub use watermark::{Watermark, WatermarkStore};
