// ABOUTME: CDC extractor - pulls rows newer than the watermark from the source
// ABOUTME: Owns the in-memory batch model and computes the batch's maximum event time

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use std::sync::Arc;
use tokio_postgres::{Client, Row};

use super::query::{build_cdc_query, CdcQuery};
use super::watermark::Watermark;
use crate::config::StreamConfig;
use crate::postgres::ManagedClient;

/// A single extracted cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl Value {
    /// Event time carried by this cell, if it holds (or spells) a date or timestamp.
    pub fn event_time(&self) -> Option<Watermark> {
        match self {
            Value::Timestamp(ts) => Some(Watermark::from_datetime(*ts)),
            Value::Date(d) => Some(Watermark::from_date(*d)),
            Value::Text(s) => Watermark::parse(s).ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Name and source type of an extracted column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: String,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Ordered rows extracted in one run. Every row has one cell per column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
}

impl Batch {
    pub fn new(columns: Vec<Column>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Greatest event time over `event_columns`, skipping nulls and values
    /// that are not dates. `None` when nothing qualifies.
    pub fn max_event_time(&self, event_columns: &[String]) -> Option<Watermark> {
        let indexes: Vec<usize> = event_columns
            .iter()
            .filter_map(|c| self.column_index(c))
            .collect();

        self.rows
            .iter()
            .flat_map(|row| indexes.iter().filter_map(|&i| row.get(i)))
            .filter_map(Value::event_time)
            .max()
    }
}

/// Rows extracted for one run plus the candidate watermark derived from them.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub stream_key: String,
    pub batch: Batch,
    /// Watermark the query was bounded by.
    pub watermark: Watermark,
    /// Candidate next watermark; equals `watermark` for an empty batch and
    /// never falls below it.
    pub batch_max_event_time: Watermark,
}

impl Extraction {
    pub fn records_extracted(&self) -> usize {
        self.batch.len()
    }
}

/// Source of changed rows.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Run a CDC query and return its rows.
    async fn fetch(&self, query: &CdcQuery) -> Result<Batch>;
}

/// Extracts the changed rows of a stream.
pub struct CdcExtractor {
    source: Arc<dyn ChangeSource>,
}

impl CdcExtractor {
    pub fn new(source: Arc<dyn ChangeSource>) -> Self {
        Self { source }
    }

    /// Query rows of `stream` whose event time exceeds `watermark`.
    ///
    /// Source errors abort the run; retries are left to whoever scheduled it.
    pub async fn extract(&self, stream: &StreamConfig, watermark: Watermark) -> Result<Extraction> {
        let query = build_cdc_query(
            &stream.table,
            &stream.columns,
            &stream.cursor,
            stream.order,
            &watermark.to_string(),
            stream.limit,
        );

        tracing::info!(
            "Extracting '{}' from {} since {} (limit {})",
            stream.key,
            stream.table,
            watermark,
            stream.limit
        );
        tracing::debug!("CDC query: {}", query.sql);

        let batch = self.source.fetch(&query).await.with_context(|| {
            format!(
                "Failed to extract stream '{}' from {} at watermark {}",
                stream.key, stream.table, watermark
            )
        })?;

        let batch_max_event_time = if batch.is_empty() {
            watermark
        } else {
            match batch.max_event_time(&stream.watermark_columns()) {
                Some(max) if max >= watermark => max,
                Some(max) => {
                    tracing::warn!(
                        "Batch max event time {} for '{}' is below watermark {}; keeping watermark",
                        max,
                        stream.key,
                        watermark
                    );
                    watermark
                }
                None => {
                    tracing::warn!(
                        "No parseable event time in {} rows of '{}'; keeping watermark {}",
                        batch.len(),
                        stream.key,
                        watermark
                    );
                    watermark
                }
            }
        };

        if stream.limit > 0 && batch.len() >= stream.limit {
            tracing::info!(
                "Stream '{}' hit the row cap of {}; remaining changes are picked up by later runs",
                stream.key,
                stream.limit
            );
        }

        tracing::info!(
            "Extracted {} rows from '{}', batch max event time {}",
            batch.len(),
            stream.key,
            batch_max_event_time
        );

        Ok(Extraction {
            stream_key: stream.key.clone(),
            batch,
            watermark,
            batch_max_event_time,
        })
    }
}

/// PostgreSQL change source.
///
/// A connection dropped between runs is reopened on the next fetch.
pub struct PostgresSource {
    client: ManagedClient,
}

impl PostgresSource {
    pub fn new(client: Client) -> Self {
        Self {
            client: ManagedClient::new(client),
        }
    }

    /// Connect to `url` with retry.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = ManagedClient::connect(url)
            .await
            .context("Failed to connect to source database")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ChangeSource for PostgresSource {
    async fn fetch(&self, query: &CdcQuery) -> Result<Batch> {
        let client = self.client.get().await?;
        let statement = client
            .prepare(&query.sql)
            .await
            .context("Failed to prepare CDC query")?;

        let columns: Vec<Column> = statement
            .columns()
            .iter()
            .map(|c| Column::new(c.name(), c.type_().name()))
            .collect();

        let rows = client
            .query(&statement, &[&query.watermark_param, &query.limit])
            .await
            .context("Failed to execute CDC query")?;

        let rows = rows
            .iter()
            .map(|row| row_to_values(row, &columns))
            .collect::<Result<Vec<_>>>()?;

        Ok(Batch::new(columns, rows))
    }
}

/// Decode every cell of `row` according to its PostgreSQL type name.
pub fn row_to_values(row: &Row, columns: &[Column]) -> Result<Vec<Value>> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            cell_to_value(row, idx, &column.data_type)
                .with_context(|| format!("Failed to decode column '{}'", column.name))
        })
        .collect()
}

fn cell_to_value(row: &Row, idx: usize, data_type: &str) -> Result<Value> {
    let value = match data_type {
        "int2" => row.try_get::<_, Option<i16>>(idx)?.map(|v| Value::Int(v as i64)),
        "int4" => row.try_get::<_, Option<i32>>(idx)?.map(|v| Value::Int(v as i64)),
        "int8" => row.try_get::<_, Option<i64>>(idx)?.map(Value::Int),
        "float4" => row.try_get::<_, Option<f32>>(idx)?.map(|v| Value::Float(v as f64)),
        "float8" => row.try_get::<_, Option<f64>>(idx)?.map(Value::Float),
        "bool" => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        "numeric" => row
            .try_get::<_, Option<rust_decimal::Decimal>>(idx)?
            .map(|d| Value::Text(d.to_string())),
        "uuid" => row
            .try_get::<_, Option<uuid::Uuid>>(idx)?
            .map(|u| Value::Text(u.to_string())),
        "date" => row.try_get::<_, Option<NaiveDate>>(idx)?.map(Value::Date),
        "timestamp" => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(Value::Timestamp),
        "timestamptz" => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
            .map(|ts| Value::Timestamp(ts.naive_utc())),
        "json" | "jsonb" => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(Value::Json),
        "bytea" => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Bytes),
        _ => row.try_get::<_, Option<String>>(idx)?.map(Value::Text),
    };
    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::query::{EventTimeCursor, ExtractOrder};
    use std::sync::Mutex;

    fn ts(s: &str) -> Value {
        Value::Timestamp(NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap())
    }

    fn date(s: &str) -> Value {
        Value::Date(NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap())
    }

    fn installments_batch() -> Batch {
        Batch::new(
            vec![
                Column::new("asset_id", "int8"),
                Column::new("invoice_issue_date", "date"),
                Column::new("paid_date", "timestamp"),
            ],
            vec![
                vec![Value::Int(1), date("2024-01-01"), Value::Null],
                vec![Value::Int(2), date("2023-12-30"), ts("2024-01-03 00:00:00")],
            ],
        )
    }

    fn stream() -> StreamConfig {
        StreamConfig {
            key: "installments".to_string(),
            table: "oltp.business_case_installments".to_string(),
            entity: "business_case_installments".to_string(),
            columns: vec![],
            cursor: EventTimeCursor::Greatest {
                columns: vec!["invoice_issue_date".to_string(), "paid_date".to_string()],
            },
            watermark_columns: None,
            date_columns: vec![],
            timestamp_columns: vec![],
            reference_table: None,
            limit: 1000,
            order: ExtractOrder::Descending,
            transform_model: None,
        }
    }

    struct FixedSource {
        batch: Batch,
        seen: Mutex<Vec<CdcQuery>>,
    }

    #[async_trait]
    impl ChangeSource for FixedSource {
        async fn fetch(&self, query: &CdcQuery) -> Result<Batch> {
            self.seen.lock().unwrap().push(query.clone());
            Ok(self.batch.clone())
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl ChangeSource for BrokenSource {
        async fn fetch(&self, _query: &CdcQuery) -> Result<Batch> {
            anyhow::bail!("connection reset by peer")
        }
    }

    #[test]
    fn test_max_event_time_spans_columns_and_skips_nulls() {
        let batch = installments_batch();
        let max = batch
            .max_event_time(&["invoice_issue_date".to_string(), "paid_date".to_string()])
            .unwrap();
        assert_eq!(max.to_string(), "2024-01-03T00:00:00");

        let only_issue = batch
            .max_event_time(&["invoice_issue_date".to_string()])
            .unwrap();
        assert_eq!(only_issue.to_string(), "2024-01-01T00:00:00");
    }

    #[test]
    fn test_max_event_time_ignores_unparseable_text() {
        let batch = Batch::new(
            vec![Column::new("updated_at", "text")],
            vec![
                vec![Value::Text("garbage".to_string())],
                vec![Value::Text("2024-02-01 08:00:00".to_string())],
                vec![Value::Null],
            ],
        );
        let max = batch.max_event_time(&["updated_at".to_string()]).unwrap();
        assert_eq!(max.to_string(), "2024-02-01T08:00:00");
        assert!(batch.max_event_time(&["missing".to_string()]).is_none());
    }

    #[tokio::test]
    async fn test_extract_computes_candidate_watermark() {
        let source = Arc::new(FixedSource {
            batch: installments_batch(),
            seen: Mutex::new(Vec::new()),
        });
        let extractor = CdcExtractor::new(source.clone());

        let extraction = extractor
            .extract(&stream(), Watermark::sentinel())
            .await
            .unwrap();

        assert_eq!(extraction.records_extracted(), 2);
        assert_eq!(
            extraction.batch_max_event_time.to_string(),
            "2024-01-03T00:00:00"
        );

        let seen = source.seen.lock().unwrap();
        assert_eq!(seen[0].watermark_param, "1900-01-01T00:00:00");
        assert_eq!(seen[0].limit, 1000);
    }

    #[tokio::test]
    async fn test_empty_batch_keeps_watermark() {
        let source = Arc::new(FixedSource {
            batch: Batch::default(),
            seen: Mutex::new(Vec::new()),
        });
        let extractor = CdcExtractor::new(source);
        let wm = Watermark::parse("2024-05-01").unwrap();

        let extraction = extractor.extract(&stream(), wm).await.unwrap();
        assert_eq!(extraction.records_extracted(), 0);
        assert_eq!(extraction.batch_max_event_time, wm);
    }

    #[tokio::test]
    async fn test_batch_max_never_below_watermark() {
        let source = Arc::new(FixedSource {
            batch: installments_batch(),
            seen: Mutex::new(Vec::new()),
        });
        let extractor = CdcExtractor::new(source);
        let wm = Watermark::parse("2024-06-01").unwrap();

        let extraction = extractor.extract(&stream(), wm).await.unwrap();
        assert_eq!(extraction.batch_max_event_time, wm);
    }

    #[tokio::test]
    async fn test_source_error_carries_stream_context() {
        let extractor = CdcExtractor::new(Arc::new(BrokenSource));
        let err = extractor
            .extract(&stream(), Watermark::sentinel())
            .await
            .unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("installments"));
        assert!(message.contains("1900-01-01T00:00:00"));
        assert!(message.contains("connection reset by peer"));
    }
}
