// ABOUTME: Library root for warehouse-replicator
// ABOUTME: CDC extraction, Parquet landing, staging loads and watermark checkpoints

pub mod cdc;
pub mod config;
pub mod landing;
pub mod pipeline;
pub mod postgres;
pub mod staging;
pub mod transform;
pub mod utils;

pub use config::{PipelineConfig, StreamConfig};
pub use pipeline::{PipelineRunner, ReplicationRun, RunReport};
