// ABOUTME: Opens tokio-postgres clients over native TLS
// ABOUTME: Process-wide TLS policy, UTC sessions and clients that reopen after a dropped connection

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::Client;

use crate::utils::{retry_with_backoff, sanitize_url, validate_connection_string};

/// Run on every new session. Watermarks are naive UTC, so `timestamptz`
/// columns must compare and decode in UTC too.
pub const SESSION_SETUP: &str = "SET TIME ZONE 'UTC'";

static ALLOW_SELF_SIGNED: OnceLock<bool> = OnceLock::new();

/// Set whether self-signed server certificates are accepted.
///
/// Called once from the binary before any connection is opened. Later calls
/// are ignored.
pub fn init_tls_policy(allow_self_signed: bool) {
    let _ = ALLOW_SELF_SIGNED.set(allow_self_signed);
}

fn allow_self_signed() -> bool {
    ALLOW_SELF_SIGNED.get().copied().unwrap_or(false)
}

fn make_tls() -> Result<MakeTlsConnector> {
    let mut builder = TlsConnector::builder();
    if allow_self_signed() {
        builder.danger_accept_invalid_certs(true);
    }
    let connector = builder.build().context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Connect to PostgreSQL and drive the connection on a background task.
pub async fn connect(url: &str) -> Result<Client> {
    validate_connection_string(url)?;

    let tls = make_tls()?;
    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .with_context(|| format!("Failed to connect to {}", sanitize_url(url)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    client
        .batch_execute(SESSION_SETUP)
        .await
        .context("Failed to set session time zone to UTC")?;

    Ok(client)
}

/// Connect with up to three retries (1s, 2s, 4s) for transient network errors.
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    retry_with_backoff(|| connect(url), 3, Duration::from_secs(1)).await
}

/// A client shared by one store that reopens itself once its connection closes.
///
/// The check happens when the client is taken, so a connection that drops
/// mid-query fails that query and the next operation reconnects.
pub struct ManagedClient {
    url: Option<String>,
    client: Mutex<Client>,
}

impl ManagedClient {
    /// Wrap an already-open client. It is never reopened.
    pub fn new(client: Client) -> Self {
        Self {
            url: None,
            client: Mutex::new(client),
        }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let client = connect_with_retry(url).await?;
        Ok(Self {
            url: Some(url.to_string()),
            client: Mutex::new(client),
        })
    }

    /// Exclusive access to an open client.
    pub async fn get(&self) -> Result<MutexGuard<'_, Client>> {
        let mut client = self.client.lock().await;
        if client.is_closed() {
            let Some(url) = &self.url else {
                anyhow::bail!("PostgreSQL connection is closed");
            };
            tracing::warn!(
                "Connection to {} was closed; reconnecting",
                sanitize_url(url)
            );
            *client = connect_with_retry(url)
                .await
                .with_context(|| format!("Failed to reconnect to {}", sanitize_url(url)))?;
        }
        Ok(client)
    }
}
