// ABOUTME: Landing zone: Parquet encoding, object paths, blob storage and object lifecycle
// ABOUTME: A landed object ends in exactly one terminal location (archive or failed)

pub mod blob;
pub mod encoder;
pub mod lifecycle;
pub mod paths;

pub use blob::{BlobStore, ObjectStoreBlobs, StorageProvider};
pub use encoder::LandingEncoder;
pub use lifecycle::{BlobLifecycleManager, Outcome};
pub use paths::BlobLocation;
