// ABOUTME: Landing encoder - turns an extracted batch into an immutable Parquet object
// ABOUTME: Date columns become Date32, timestamp columns become Int64 epoch microseconds

use anyhow::{bail, Context, Result};
use arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Date32Builder, Float64Builder, Int64Builder,
    StringBuilder, TimestampMicrosecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{NaiveDate, NaiveDateTime};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::sync::Arc;

use crate::cdc::extractor::{Batch, Value};
use crate::cdc::watermark::Watermark;

/// File extension of landed objects.
pub const LANDING_EXTENSION: &str = "parquet";

/// How a column is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    /// Declared date column: calendar date, no time of day.
    Date,
    /// Declared timestamp column: microseconds since the Unix epoch.
    EpochMicros,
    Bool,
    Int,
    Float,
    Timestamp,
    Binary,
    Text,
}

impl ColumnKind {
    fn data_type(self) -> DataType {
        match self {
            ColumnKind::Date => DataType::Date32,
            ColumnKind::EpochMicros | ColumnKind::Int => DataType::Int64,
            ColumnKind::Bool => DataType::Boolean,
            ColumnKind::Float => DataType::Float64,
            ColumnKind::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
            ColumnKind::Binary => DataType::Binary,
            ColumnKind::Text => DataType::Utf8,
        }
    }

    fn of(value: &Value) -> Option<ColumnKind> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnKind::Bool),
            Value::Int(_) => Some(ColumnKind::Int),
            Value::Float(_) => Some(ColumnKind::Float),
            Value::Date(_) => Some(ColumnKind::Date),
            Value::Timestamp(_) => Some(ColumnKind::Timestamp),
            Value::Bytes(_) => Some(ColumnKind::Binary),
            Value::Text(_) | Value::Json(_) => Some(ColumnKind::Text),
        }
    }

    /// Wider of two observed kinds; anything irreconcilable is written as text.
    fn merge(a: ColumnKind, b: ColumnKind) -> ColumnKind {
        match (a, b) {
            (x, y) if x == y => x,
            (ColumnKind::Int, ColumnKind::Float) | (ColumnKind::Float, ColumnKind::Int) => {
                ColumnKind::Float
            }
            (ColumnKind::Date, ColumnKind::Timestamp) | (ColumnKind::Timestamp, ColumnKind::Date) => {
                ColumnKind::Timestamp
            }
            _ => ColumnKind::Text,
        }
    }
}

/// Serializes batches into Snappy-compressed Parquet.
#[derive(Debug, Clone)]
pub struct LandingEncoder {
    compression: Compression,
}

impl Default for LandingEncoder {
    fn default() -> Self {
        Self {
            compression: Compression::SNAPPY,
        }
    }
}

impl LandingEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a non-empty batch. Deterministic for identical input.
    ///
    /// Callers skip encoding for empty batches; an empty batch is rejected.
    pub fn encode(
        &self,
        batch: &Batch,
        timestamp_columns: &[String],
        date_columns: &[String],
    ) -> Result<Bytes> {
        if batch.is_empty() {
            bail!("Refusing to encode an empty batch");
        }

        let record_batch = to_record_batch(batch, timestamp_columns, date_columns)?;

        let props = WriterProperties::builder()
            .set_compression(self.compression)
            .build();
        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, record_batch.schema(), Some(props))
            .context("Failed to create Parquet writer")?;
        writer
            .write(&record_batch)
            .context("Failed to write Parquet row group")?;
        writer.close().context("Failed to finish Parquet file")?;

        Ok(Bytes::from(buffer))
    }
}

/// Normalize a batch into an Arrow record batch.
pub fn to_record_batch(
    batch: &Batch,
    timestamp_columns: &[String],
    date_columns: &[String],
) -> Result<RecordBatch> {
    let mut fields = Vec::with_capacity(batch.columns.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(batch.columns.len());

    for (idx, column) in batch.columns.iter().enumerate() {
        let cells: Vec<&Value> = batch
            .rows
            .iter()
            .map(|row| row.get(idx).unwrap_or(&Value::Null))
            .collect();

        let kind = if date_columns.contains(&column.name) {
            ColumnKind::Date
        } else if timestamp_columns.contains(&column.name) {
            ColumnKind::EpochMicros
        } else {
            cells
                .iter()
                .filter_map(|v| ColumnKind::of(v))
                .reduce(ColumnKind::merge)
                .unwrap_or(ColumnKind::Text)
        };

        let array = build_array(kind, &cells)
            .with_context(|| format!("Failed to encode column '{}'", column.name))?;
        fields.push(Field::new(&column.name, kind.data_type(), true));
        arrays.push(array);
    }

    let schema = Arc::new(Schema::new(fields));
    RecordBatch::try_new(schema, arrays).context("Failed to assemble record batch")
}

fn build_array(kind: ColumnKind, cells: &[&Value]) -> Result<ArrayRef> {
    let array: ArrayRef = match kind {
        ColumnKind::Date => {
            let mut builder = Date32Builder::with_capacity(cells.len());
            for cell in cells {
                builder.append_option(to_date(cell)?.map(days_since_epoch));
            }
            Arc::new(builder.finish())
        }
        ColumnKind::EpochMicros => {
            let mut builder = Int64Builder::with_capacity(cells.len());
            for cell in cells {
                let micros = match cell {
                    Value::Int(i) => Some(*i),
                    other => to_datetime(other)?.map(|ts| ts.and_utc().timestamp_micros()),
                };
                builder.append_option(micros);
            }
            Arc::new(builder.finish())
        }
        ColumnKind::Timestamp => {
            let mut builder = TimestampMicrosecondBuilder::with_capacity(cells.len());
            for cell in cells {
                builder.append_option(to_datetime(cell)?.map(|ts| ts.and_utc().timestamp_micros()));
            }
            Arc::new(builder.finish())
        }
        ColumnKind::Bool => {
            let mut builder = BooleanBuilder::with_capacity(cells.len());
            for cell in cells {
                builder.append_option(match cell {
                    Value::Bool(b) => Some(*b),
                    _ => None,
                });
            }
            Arc::new(builder.finish())
        }
        ColumnKind::Int => {
            let mut builder = Int64Builder::with_capacity(cells.len());
            for cell in cells {
                builder.append_option(match cell {
                    Value::Int(i) => Some(*i),
                    _ => None,
                });
            }
            Arc::new(builder.finish())
        }
        ColumnKind::Float => {
            let mut builder = Float64Builder::with_capacity(cells.len());
            for cell in cells {
                builder.append_option(match cell {
                    Value::Float(f) => Some(*f),
                    Value::Int(i) => Some(*i as f64),
                    _ => None,
                });
            }
            Arc::new(builder.finish())
        }
        ColumnKind::Binary => {
            let mut builder = BinaryBuilder::with_capacity(cells.len(), 0);
            for cell in cells {
                match cell {
                    Value::Bytes(b) => builder.append_value(b),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnKind::Text => {
            let mut builder = StringBuilder::with_capacity(cells.len(), 0);
            for cell in cells {
                builder.append_option(render_text(cell));
            }
            Arc::new(builder.finish())
        }
    };
    Ok(array)
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    (date - epoch).num_days() as i32
}

fn to_date(value: &Value) -> Result<Option<NaiveDate>> {
    Ok(match value {
        Value::Null => None,
        Value::Date(d) => Some(*d),
        Value::Timestamp(ts) => Some(ts.date()),
        Value::Text(s) if s.trim().is_empty() => None,
        Value::Text(s) => Some(Watermark::parse(s)?.as_datetime().date()),
        other => bail!("Cannot convert {:?} to a date", other),
    })
}

fn to_datetime(value: &Value) -> Result<Option<NaiveDateTime>> {
    Ok(match value {
        Value::Null => None,
        Value::Timestamp(ts) => Some(*ts),
        Value::Date(d) => d.and_hms_opt(0, 0, 0),
        Value::Text(s) if s.trim().is_empty() => None,
        Value::Text(s) => Some(Watermark::parse(s)?.as_datetime()),
        other => bail!("Cannot convert {:?} to a timestamp", other),
    })
}

fn render_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Int(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Text(s) => Some(s.clone()),
        Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        Value::Timestamp(ts) => Some(ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        Value::Json(j) => Some(j.to_string()),
        Value::Bytes(b) => Some(b.iter().map(|byte| format!("{:02x}", byte)).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::extractor::Column;
    use arrow::array::{Array, Date32Array, Int64Array, StringArray, TimestampMicrosecondArray};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    fn sample_batch() -> Batch {
        let ts = |s: &str| {
            Value::Timestamp(NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap())
        };
        Batch::new(
            vec![
                Column::new("asset_id", "int8"),
                Column::new("invoice_issue_date", "timestamp"),
                Column::new("paid_date", "timestamp"),
                Column::new("amount", "numeric"),
                Column::new("created_at", "timestamp"),
                Column::new("payload", "jsonb"),
            ],
            vec![
                vec![
                    Value::Int(1),
                    ts("2024-01-01 13:45:00"),
                    Value::Null,
                    Value::Text("100.50".to_string()),
                    ts("2023-12-31 08:00:00"),
                    Value::Json(serde_json::json!({"a": 1})),
                ],
                vec![
                    Value::Int(2),
                    Value::Text("2024-01-02".to_string()),
                    ts("2024-01-03 00:00:00"),
                    Value::Null,
                    ts("2024-01-01 09:30:00"),
                    Value::Null,
                ],
            ],
        )
    }

    fn decode(bytes: Bytes) -> RecordBatch {
        let mut reader = ParquetRecordBatchReaderBuilder::try_new(bytes)
            .unwrap()
            .build()
            .unwrap();
        reader.next().unwrap().unwrap()
    }

    #[test]
    fn test_declared_columns_are_normalized() {
        let batch = to_record_batch(
            &sample_batch(),
            &["paid_date".to_string()],
            &["invoice_issue_date".to_string()],
        )
        .unwrap();

        let schema = batch.schema();
        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        assert_eq!(schema.field(1).data_type(), &DataType::Date32);
        assert_eq!(schema.field(2).data_type(), &DataType::Int64);
        assert_eq!(schema.field(3).data_type(), &DataType::Utf8);
        assert_eq!(
            schema.field(4).data_type(),
            &DataType::Timestamp(TimeUnit::Microsecond, None)
        );
        assert_eq!(schema.field(5).data_type(), &DataType::Utf8);

        let dates = batch
            .column(1)
            .as_any()
            .downcast_ref::<Date32Array>()
            .unwrap();
        assert_eq!(dates.value_as_date(0).unwrap().to_string(), "2024-01-01");
        assert_eq!(dates.value_as_date(1).unwrap().to_string(), "2024-01-02");

        let micros = batch
            .column(2)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert!(micros.is_null(0));
        assert_eq!(micros.value(1), 1_704_240_000_000_000);
    }

    #[test]
    fn test_encode_round_trips_through_parquet() {
        let encoder = LandingEncoder::new();
        let bytes = encoder
            .encode(
                &sample_batch(),
                &["paid_date".to_string()],
                &["invoice_issue_date".to_string()],
            )
            .unwrap();
        assert_eq!(&bytes[..4], b"PAR1");

        let decoded = decode(bytes);
        assert_eq!(decoded.num_rows(), 2);
        assert_eq!(decoded.schema().field(1).data_type(), &DataType::Date32);

        let created = decoded
            .column(4)
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .unwrap();
        assert_eq!(created.value(1), 1_704_101_400_000_000);

        let payload = decoded
            .column(5)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(payload.value(0), r#"{"a":1}"#);
        assert!(payload.is_null(1));
    }

    #[test]
    fn test_encode_is_deterministic() {
        let encoder = LandingEncoder::new();
        let a = encoder.encode(&sample_batch(), &[], &[]).unwrap();
        let b = encoder.encode(&sample_batch(), &[], &[]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        let batch = Batch::new(vec![Column::new("id", "int8")], vec![]);
        assert!(LandingEncoder::new().encode(&batch, &[], &[]).is_err());
    }

    #[test]
    fn test_mixed_kinds_fall_back_to_text() {
        let batch = Batch::new(
            vec![Column::new("mixed", "text"), Column::new("nulls", "text")],
            vec![
                vec![Value::Int(5), Value::Null],
                vec![Value::Bool(true), Value::Null],
            ],
        );
        let rb = to_record_batch(&batch, &[], &[]).unwrap();
        assert_eq!(rb.schema().field(0).data_type(), &DataType::Utf8);
        assert_eq!(rb.schema().field(1).data_type(), &DataType::Utf8);
        let mixed = rb.column(0).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(mixed.value(0), "5");
        assert_eq!(mixed.value(1), "true");
    }

    #[test]
    fn test_unconvertible_date_names_the_column() {
        let batch = Batch::new(
            vec![Column::new("paid_date", "text")],
            vec![vec![Value::Text("not a date".to_string())]],
        );
        let err = to_record_batch(&batch, &[], &["paid_date".to_string()]).unwrap_err();
        assert!(err.to_string().contains("paid_date"));
    }
}
