// ABOUTME: PostgreSQL staging store - loads landed Parquet objects into dataset tables
// ABOUTME: TRUNCATE rebuilds the table in one transaction, APPEND creates if missing and inserts

use anyhow::{bail, Context, Result};
use arrow::array::{Array, ArrayRef, AsArray};
use arrow::datatypes::{DataType, Int64Type, TimeUnit, TimestampMicrosecondType};
use async_trait::async_trait;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::sync::Arc;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use super::schema::{FieldType, SchemaDescriptor, SchemaField};
use super::store::{StagingStore, TableRef, WriteMode};
use crate::landing::blob::BlobStore;
use crate::landing::paths::BlobLocation;
use crate::postgres::ManagedClient;
use crate::utils::{quote_ident, validate_identifier};

/// PostgreSQL parameter limit is 65535; leave some margin.
const MAX_PARAMS: usize = 65000;

/// Rows of a landed object, rendered as text and shaped to the destination columns.
#[derive(Debug, Clone, PartialEq)]
pub struct LandedRows {
    pub columns: Vec<SchemaField>,
    pub rows: Vec<Vec<Option<String>>>,
}

/// Decode a Parquet object into rows for the destination table.
///
/// With `schema`, the output has exactly the schema's fields in order:
/// landed columns outside it are dropped, missing ones are NULL, and cells
/// are coerced to the field type (epoch microseconds become timestamps or
/// dates). Without it, the object's own columns and types are used.
pub fn decode_landed(bytes: Bytes, schema: Option<&SchemaDescriptor>) -> Result<LandedRows> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)
        .context("Landed object is not a readable Parquet file")?;
    let arrow_schema = builder.schema().clone();
    let reader = builder.build().context("Failed to open Parquet reader")?;

    let columns: Vec<SchemaField> = match schema {
        Some(schema) => schema.fields.clone(),
        None => arrow_schema
            .fields()
            .iter()
            .map(|f| SchemaField::new(f.name(), FieldType::from_arrow(f.data_type())))
            .collect(),
    };
    let sources: Vec<Option<usize>> = columns
        .iter()
        .map(|c| arrow_schema.index_of(&c.name).ok())
        .collect();

    if let Some(schema) = schema {
        for field in arrow_schema.fields() {
            if schema.field(field.name()).is_none() {
                tracing::debug!("Dropping column '{}' not in enforced schema", field.name());
            }
        }
    }

    let mut rows = Vec::new();
    for record_batch in reader {
        let record_batch = record_batch.context("Failed to read Parquet row group")?;
        let num_rows = record_batch.num_rows();

        let rendered: Vec<Vec<Option<String>>> = columns
            .iter()
            .zip(&sources)
            .map(|(column, source)| match source {
                Some(idx) => column_cells(record_batch.column(*idx), &column.field_type)
                    .with_context(|| format!("Failed to convert column '{}'", column.name)),
                None => Ok(vec![None; num_rows]),
            })
            .collect::<Result<_>>()?;

        for row in 0..num_rows {
            rows.push(rendered.iter().map(|cells| cells[row].clone()).collect());
        }
    }

    Ok(LandedRows { columns, rows })
}

fn column_cells(array: &ArrayRef, target: &FieldType) -> Result<Vec<Option<String>>> {
    match (array.data_type(), target) {
        (DataType::Int64, FieldType::Timestamp | FieldType::Date) => array
            .as_primitive::<Int64Type>()
            .iter()
            .map(|v| v.map(|micros| micros_to_text(micros, target)).transpose())
            .collect(),
        (DataType::Timestamp(TimeUnit::Microsecond, _), FieldType::Date) => array
            .as_primitive::<TimestampMicrosecondType>()
            .iter()
            .map(|v| v.map(|micros| micros_to_text(micros, target)).transpose())
            .collect(),
        (DataType::Binary, _) => Ok(array
            .as_binary::<i32>()
            .iter()
            .map(|v| {
                v.map(|b| {
                    let hex: String = b.iter().map(|byte| format!("{:02x}", byte)).collect();
                    format!("\\x{}", hex)
                })
            })
            .collect()),
        _ => {
            let text = arrow::compute::cast(array, &DataType::Utf8)
                .with_context(|| format!("Cannot render {} as text", array.data_type()))?;
            Ok(text
                .as_string::<i32>()
                .iter()
                .map(|v| v.map(str::to_string))
                .collect())
        }
    }
}

fn micros_to_text(micros: i64, target: &FieldType) -> Result<String> {
    let Some(ts) = chrono::DateTime::from_timestamp_micros(micros) else {
        bail!("Epoch microseconds {} out of range", micros);
    };
    let ts = ts.naive_utc();
    Ok(match target {
        FieldType::Date => ts.format("%Y-%m-%d").to_string(),
        _ => ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
    })
}

/// `CREATE TABLE [IF NOT EXISTS] "ds"."t" ("a" BIGINT, ...)`
pub fn build_create_table_query(table: &TableRef, columns: &[SchemaField], if_not_exists: bool) -> String {
    let defs: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.field_type.sql_type()))
        .collect();
    format!(
        "CREATE TABLE {}{}.{} ({})",
        if if_not_exists { "IF NOT EXISTS " } else { "" },
        quote_ident(&table.dataset),
        quote_ident(&table.table),
        defs.join(", ")
    )
}

/// Multi-row INSERT whose text parameters are cast to each column's type.
pub fn build_insert_query(table: &TableRef, columns: &[SchemaField], num_rows: usize) -> String {
    let column_list: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();

    let mut param_idx = 1;
    let mut value_rows = Vec::with_capacity(num_rows);
    for _ in 0..num_rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| {
                let cell = format!("CAST(${}::text AS {})", param_idx, c.field_type.sql_type());
                param_idx += 1;
                cell
            })
            .collect();
        value_rows.push(format!("({})", cells.join(", ")));
    }

    format!(
        "INSERT INTO {}.{} ({}) VALUES {}",
        quote_ident(&table.dataset),
        quote_ident(&table.table),
        column_list.join(", "),
        value_rows.join(", ")
    )
}

/// Staging store on a PostgreSQL database; each dataset is a schema.
pub struct PostgresStagingStore {
    client: ManagedClient,
    blobs: Arc<dyn BlobStore>,
}

impl PostgresStagingStore {
    pub fn new(client: Client, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            client: ManagedClient::new(client),
            blobs,
        }
    }

    pub async fn connect(url: &str, blobs: Arc<dyn BlobStore>) -> Result<Self> {
        let client = ManagedClient::connect(url)
            .await
            .context("Failed to connect to staging database")?;
        Ok(Self { client, blobs })
    }
}

#[async_trait]
impl StagingStore for PostgresStagingStore {
    async fn load(
        &self,
        target: &TableRef,
        uri: &str,
        schema: Option<&SchemaDescriptor>,
    ) -> Result<TableRef> {
        validate_identifier(&target.dataset)?;
        validate_identifier(&target.table)?;

        let location = BlobLocation::parse(uri)?;
        let bytes = self.blobs.download(&location).await?;
        let landed = decode_landed(bytes, schema)?;
        if landed.columns.is_empty() {
            bail!("Landed object {} has no columns to load", uri);
        }

        let mut client = self.client.get().await?;
        let tx = client
            .transaction()
            .await
            .context("Failed to begin staging transaction")?;

        tx.batch_execute(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(&target.dataset)
        ))
        .await
        .with_context(|| format!("Failed to create dataset {}", target.dataset))?;

        match target.mode {
            WriteMode::Truncate => {
                tx.batch_execute(&format!(
                    "DROP TABLE IF EXISTS {}.{}",
                    quote_ident(&target.dataset),
                    quote_ident(&target.table)
                ))
                .await
                .with_context(|| format!("Failed to replace {}", target))?;
                tx.batch_execute(&build_create_table_query(target, &landed.columns, false))
                    .await
                    .with_context(|| format!("Failed to create {}", target))?;
            }
            WriteMode::Append => {
                tx.batch_execute(&build_create_table_query(target, &landed.columns, true))
                    .await
                    .with_context(|| format!("Failed to create {}", target))?;
            }
        }

        let batch_size = std::cmp::max(1, MAX_PARAMS / landed.columns.len());
        let mut inserted = 0u64;
        for chunk in landed.rows.chunks(batch_size) {
            let query = build_insert_query(target, &landed.columns, chunk.len());
            let params: Vec<&(dyn ToSql + Sync)> = chunk
                .iter()
                .flat_map(|row| row.iter().map(|v| v as &(dyn ToSql + Sync)))
                .collect();
            inserted += tx
                .execute(&query, &params)
                .await
                .with_context(|| format!("Failed to insert rows into {}", target))?;
        }

        tx.commit()
            .await
            .with_context(|| format!("Failed to commit load into {}", target))?;

        tracing::info!(
            "Loaded {} rows from {} into {} ({})",
            inserted,
            uri,
            target,
            target.mode
        );
        Ok(target.clone())
    }

    async fn get_schema(&self, dataset: &str, table: &str) -> Result<Option<SchemaDescriptor>> {
        let client = self.client.get().await?;
        let rows = client
            .query(
                "SELECT column_name, data_type
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&dataset, &table],
            )
            .await
            .with_context(|| format!("Failed to get schema for {}.{}", dataset, table))?;

        if rows.is_empty() {
            return Ok(None);
        }

        let fields = rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let data_type: String = row.get(1);
                SchemaField::new(name, FieldType::from_postgres(&data_type))
            })
            .collect();
        Ok(Some(SchemaDescriptor::new(fields)))
    }

    async fn drop_table(&self, table: &TableRef) -> Result<bool> {
        validate_identifier(&table.dataset)?;
        validate_identifier(&table.table)?;

        let client = self.client.get().await?;
        let row = client
            .query_one(
                "SELECT EXISTS (
                    SELECT 1 FROM information_schema.tables
                    WHERE table_schema = $1 AND table_name = $2
                 )",
                &[&table.dataset, &table.table],
            )
            .await
            .with_context(|| format!("Failed to check whether {} exists", table))?;
        let exists: bool = row.get(0);
        if !exists {
            return Ok(false);
        }

        client
            .batch_execute(&format!(
                "DROP TABLE IF EXISTS {}.{}",
                quote_ident(&table.dataset),
                quote_ident(&table.table)
            ))
            .await
            .with_context(|| format!("Failed to drop {}", table))?;
        Ok(true)
    }
}
