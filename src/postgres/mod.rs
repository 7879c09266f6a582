// ABOUTME: PostgreSQL connectivity shared by the CDC source and the staging store
// ABOUTME: Re-exports connection helpers with TLS policy and connect retry

pub mod connection;

pub use connection::{connect, connect_with_retry, ManagedClient, SESSION_SETUP};
