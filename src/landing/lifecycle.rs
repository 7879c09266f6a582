// ABOUTME: Blob lifecycle manager - moves a landed object to its archive or failed location
// ABOUTME: Move is copy-then-delete; a re-run skips the copy when the destination already exists

use anyhow::{bail, Context, Result};
use std::fmt;
use std::sync::Arc;

use super::blob::BlobStore;
use super::paths::{archive_location, failed_location, BlobLocation};

/// How processing of a landed object ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "archive"),
            Outcome::Failure => write!(f, "failed"),
        }
    }
}

pub struct BlobLifecycleManager {
    blobs: Arc<dyn BlobStore>,
    archive_suffix: String,
}

impl BlobLifecycleManager {
    pub fn new(blobs: Arc<dyn BlobStore>, archive_suffix: impl Into<String>) -> Self {
        Self {
            blobs,
            archive_suffix: archive_suffix.into(),
        }
    }

    /// Terminal location for `landed` under `outcome`.
    pub fn destination(&self, landed: &BlobLocation, outcome: Outcome) -> BlobLocation {
        match outcome {
            Outcome::Success => archive_location(landed, &self.archive_suffix),
            Outcome::Failure => failed_location(landed),
        }
    }

    /// Move the object at `landed_uri` to its terminal location and return
    /// the terminal URI.
    ///
    /// A failed copy is an error and leaves the object where it was. A failed
    /// delete after a good copy only logs a warning: the terminal copy is
    /// authoritative.
    pub async fn resolve(&self, landed_uri: &str, outcome: Outcome) -> Result<String> {
        let landed = BlobLocation::parse(landed_uri)?;
        let destination = self.destination(&landed, outcome);
        let destination_uri = self.blobs.uri(&destination);
        if destination == landed {
            bail!(
                "{} location of {} is the landed object itself; its path needs a 'landing/' segment",
                outcome,
                landed_uri
            );
        }

        let already_there = self.blobs.exists(&destination).await.unwrap_or(false);
        if already_there {
            tracing::info!(
                "{} already exists; skipping copy of {}",
                destination_uri,
                landed_uri
            );
        } else {
            self.blobs
                .copy(&landed, &destination)
                .await
                .with_context(|| {
                    format!("Failed to move {} to {} location", landed_uri, outcome)
                })?;
        }

        match self.blobs.delete(&landed).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!("{} was already removed", landed_uri),
            Err(e) => tracing::warn!(
                "Copied {} to {} but could not delete the original: {:#}",
                landed_uri,
                destination_uri,
                e
            ),
        }

        tracing::info!("Moved {} to {}", landed_uri, destination_uri);
        Ok(destination_uri)
    }
}
