// ABOUTME: Staging layer: schema descriptors, the store interface, the PostgreSQL store and the loader
// ABOUTME: Every non-empty batch lands once and loads into a hashed and a canonical table

pub mod loader;
pub mod postgres;
pub mod schema;
pub mod store;

pub use loader::{LoadResult, StageOutcome, StagePayload, StagingLoader};
pub use postgres::PostgresStagingStore;
pub use schema::{filter_schema_columns, FieldType, SchemaDescriptor, SchemaField};
pub use store::{StagingStore, TableRef, WriteMode};
