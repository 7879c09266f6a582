// ABOUTME: Staging store interface and table references
// ABOUTME: A landed object is loaded into an APPEND (hashed) and a TRUNCATE (canonical) table

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

use super::schema::SchemaDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Add rows to the table, creating it if missing.
    Append,
    /// Replace the table's contents wholesale.
    Truncate,
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::Append => write!(f, "APPEND"),
            WriteMode::Truncate => write!(f, "TRUNCATE"),
        }
    }
}

/// A destination table and how it is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub dataset: String,
    pub table: String,
    pub mode: WriteMode,
}

impl TableRef {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>, mode: WriteMode) -> Self {
        Self {
            dataset: dataset.into(),
            table: table.into(),
            mode,
        }
    }

    /// `dataset.table`
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.dataset, self.table)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

/// Analytical store receiving landed objects.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Load the object at `uri` into `target` using `target.mode`.
    ///
    /// With `schema`, the table has exactly those fields and cells are
    /// coerced to them; without it, the object's own columns are used.
    async fn load(
        &self,
        target: &TableRef,
        uri: &str,
        schema: Option<&SchemaDescriptor>,
    ) -> Result<TableRef>;

    /// Schema of `dataset.table`, or `None` if the table does not exist.
    async fn get_schema(&self, dataset: &str, table: &str) -> Result<Option<SchemaDescriptor>>;

    /// Drop `table`. Returns false if it did not exist.
    async fn drop_table(&self, table: &TableRef) -> Result<bool>;
}
