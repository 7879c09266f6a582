// ABOUTME: Destination table schema descriptors for enforced staging loads
// ABOUTME: Maps PostgreSQL and Arrow types and filters internal bookkeeping fields

use arrow::datatypes::DataType;
use std::fmt;

/// Logical type of a destination field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    Int64,
    Float64,
    Numeric,
    Bool,
    Date,
    Timestamp,
    Bytes,
    Json,
    /// A type with no dedicated mapping, loaded as text.
    Other(String),
}

impl FieldType {
    /// Map an `information_schema.columns.data_type` value.
    pub fn from_postgres(data_type: &str) -> Self {
        match data_type {
            "text" | "character varying" | "character" | "uuid" | "name" => FieldType::String,
            "smallint" | "integer" | "bigint" => FieldType::Int64,
            "real" | "double precision" => FieldType::Float64,
            "numeric" => FieldType::Numeric,
            "boolean" => FieldType::Bool,
            "date" => FieldType::Date,
            "timestamp without time zone" | "timestamp with time zone" => FieldType::Timestamp,
            "bytea" => FieldType::Bytes,
            "json" | "jsonb" => FieldType::Json,
            other => FieldType::Other(other.to_string()),
        }
    }

    /// Map the Arrow type of a landed column.
    pub fn from_arrow(data_type: &DataType) -> Self {
        match data_type {
            DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => FieldType::String,
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32 => FieldType::Int64,
            DataType::Float16 | DataType::Float32 | DataType::Float64 => FieldType::Float64,
            DataType::Decimal128(_, _) | DataType::Decimal256(_, _) | DataType::UInt64 => {
                FieldType::Numeric
            }
            DataType::Boolean => FieldType::Bool,
            DataType::Date32 | DataType::Date64 => FieldType::Date,
            DataType::Timestamp(_, _) => FieldType::Timestamp,
            DataType::Binary | DataType::LargeBinary | DataType::BinaryView => FieldType::Bytes,
            other => FieldType::Other(other.to_string()),
        }
    }

    /// Column type used when creating a staging table.
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::String | FieldType::Other(_) => "TEXT",
            FieldType::Int64 => "BIGINT",
            FieldType::Float64 => "DOUBLE PRECISION",
            FieldType::Numeric => "NUMERIC",
            FieldType::Bool => "BOOLEAN",
            FieldType::Date => "DATE",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Bytes => "BYTEA",
            FieldType::Json => "JSONB",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Other(name) => write!(f, "{}", name),
            known => write!(f, "{}", known.sql_type()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaField {
    pub name: String,
    pub field_type: FieldType,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Ordered fields of a destination table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDescriptor {
    pub fields: Vec<SchemaField>,
}

impl SchemaDescriptor {
    pub fn new(fields: Vec<SchemaField>) -> Self {
        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }
}

/// Drop bookkeeping fields such as `_loaded_at` and `_source_table`,
/// keeping the order of the rest.
pub fn filter_schema_columns(schema: &SchemaDescriptor, excluded: &[String]) -> SchemaDescriptor {
    SchemaDescriptor::new(
        schema
            .fields
            .iter()
            .filter(|f| !excluded.iter().any(|e| e == &f.name))
            .cloned()
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::TimeUnit;

    fn bronze_schema() -> SchemaDescriptor {
        SchemaDescriptor::new(vec![
            SchemaField::new("asset_id", FieldType::Int64),
            SchemaField::new("_loaded_at", FieldType::Timestamp),
            SchemaField::new("paid_date", FieldType::Timestamp),
            SchemaField::new("_source_table", FieldType::String),
            SchemaField::new("invoice_issue_date", FieldType::Date),
        ])
    }

    #[test]
    fn test_filter_removes_bookkeeping_fields() {
        let excluded = vec!["_loaded_at".to_string(), "_source_table".to_string()];
        let filtered = filter_schema_columns(&bronze_schema(), &excluded);
        assert_eq!(
            filtered.names(),
            vec!["asset_id", "paid_date", "invoice_issue_date"]
        );
    }

    #[test]
    fn test_filter_without_exclusions_is_identity() {
        assert_eq!(filter_schema_columns(&bronze_schema(), &[]), bronze_schema());
    }

    #[test]
    fn test_postgres_type_mapping() {
        assert_eq!(FieldType::from_postgres("bigint"), FieldType::Int64);
        assert_eq!(
            FieldType::from_postgres("timestamp without time zone"),
            FieldType::Timestamp
        );
        assert_eq!(FieldType::from_postgres("character varying"), FieldType::String);
        assert_eq!(
            FieldType::from_postgres("USER-DEFINED"),
            FieldType::Other("USER-DEFINED".to_string())
        );
        assert_eq!(FieldType::Other("interval".to_string()).sql_type(), "TEXT");
    }

    #[test]
    fn test_arrow_type_mapping() {
        assert_eq!(FieldType::from_arrow(&DataType::Date32), FieldType::Date);
        assert_eq!(
            FieldType::from_arrow(&DataType::Timestamp(TimeUnit::Microsecond, None)),
            FieldType::Timestamp
        );
        assert_eq!(FieldType::from_arrow(&DataType::Int64), FieldType::Int64);
        assert_eq!(FieldType::from_arrow(&DataType::Binary), FieldType::Bytes);
    }
}
