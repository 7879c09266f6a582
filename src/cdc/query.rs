// ABOUTME: Builds the bounded CDC query for a replication stream
// ABOUTME: Event-time expression is GREATEST over cursor columns or an audit-column disjunction

use serde::{Deserialize, Serialize};

use crate::utils::{quote_ident, quote_qualified};

/// Floor substituted for NULL event times inside `GREATEST(...)`.
pub const EPOCH_FLOOR: &str = "1900-01-01";

/// How changed rows are recognised in the source table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EventTimeCursor {
    /// One or more business event columns (issue date, paid date, ...).
    /// A row's event time is the greatest non-null value among them.
    Greatest { columns: Vec<String> },
    /// Only audit columns exist: a row changed if either column moved past
    /// the watermark.
    Audit {
        #[serde(default = "default_created_at")]
        created_at: String,
        #[serde(default = "default_updated_at")]
        updated_at: String,
    },
}

fn default_created_at() -> String {
    "created_at".to_string()
}

fn default_updated_at() -> String {
    "updated_at".to_string()
}

impl EventTimeCursor {
    /// Columns that participate in change detection.
    pub fn columns(&self) -> Vec<String> {
        match self {
            EventTimeCursor::Greatest { columns } => columns.clone(),
            EventTimeCursor::Audit {
                created_at,
                updated_at,
            } => vec![created_at.clone(), updated_at.clone()],
        }
    }

    /// Expression used for ordering the extracted rows.
    pub fn order_expr(&self) -> String {
        match self {
            EventTimeCursor::Greatest { columns } if columns.len() == 1 => quote_ident(&columns[0]),
            EventTimeCursor::Greatest { columns } => {
                let parts: Vec<String> = columns
                    .iter()
                    .map(|c| {
                        format!(
                            "COALESCE({}, '{} 00:00:00'::timestamp)",
                            quote_ident(c),
                            EPOCH_FLOOR
                        )
                    })
                    .collect();
                format!("GREATEST({})", parts.join(", "))
            }
            EventTimeCursor::Audit { updated_at, .. } => quote_ident(updated_at),
        }
    }

    /// Predicate selecting rows newer than the watermark bound to `param`.
    pub fn predicate(&self, param: &str) -> String {
        match self {
            EventTimeCursor::Greatest { .. } => format!("{} > {}", self.order_expr(), param),
            EventTimeCursor::Audit {
                created_at,
                updated_at,
            } => format!(
                "({} > {} OR {} > {})",
                quote_ident(updated_at),
                param,
                quote_ident(created_at),
                param
            ),
        }
    }
}

/// Sort direction of the extracted batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractOrder {
    /// Newest rows first.
    #[default]
    Descending,
    /// Oldest rows first; a capped batch then leaves the newest rows for the
    /// next run instead of skipping older ones.
    Ascending,
}

impl ExtractOrder {
    fn as_sql(self) -> &'static str {
        match self {
            ExtractOrder::Descending => "DESC",
            ExtractOrder::Ascending => "ASC",
        }
    }
}

/// A CDC query with its bind parameters.
///
/// The watermark is bound as `$1` (text, cast to timestamp server-side) and
/// the row cap as `$2`; nothing caller-supplied is spliced into the SQL text
/// except validated identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdcQuery {
    pub sql: String,
    pub watermark_param: String,
    pub limit: i64,
}

/// Build `SELECT <columns> FROM <table> WHERE <event_time> > $1 ORDER BY <event_time> <dir> LIMIT $2`.
///
/// An empty column list selects every column.
pub fn build_cdc_query(
    table: &str,
    columns: &[String],
    cursor: &EventTimeCursor,
    order: ExtractOrder,
    watermark: &str,
    limit: usize,
) -> CdcQuery {
    let column_list = if columns.is_empty() {
        "*".to_string()
    } else {
        columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let bound = "$1::text::timestamp";
    let sql = format!(
        "SELECT {} FROM {} WHERE {} ORDER BY {} {} LIMIT $2",
        column_list,
        quote_qualified(table),
        cursor.predicate(bound),
        cursor.order_expr(),
        order.as_sql()
    );

    CdcQuery {
        sql,
        watermark_param: watermark.to_string(),
        limit: limit as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installments_cursor() -> EventTimeCursor {
        EventTimeCursor::Greatest {
            columns: vec!["invoice_issue_date".to_string(), "paid_date".to_string()],
        }
    }

    #[test]
    fn test_greatest_cursor_coalesces_each_column() {
        let expr = installments_cursor().order_expr();
        assert_eq!(
            expr,
            "GREATEST(COALESCE(\"invoice_issue_date\", '1900-01-01 00:00:00'::timestamp), \
             COALESCE(\"paid_date\", '1900-01-01 00:00:00'::timestamp))"
        );
    }

    #[test]
    fn test_single_column_cursor_is_bare_column() {
        let cursor = EventTimeCursor::Greatest {
            columns: vec!["updated_at".to_string()],
        };
        assert_eq!(cursor.order_expr(), "\"updated_at\"");
        assert_eq!(cursor.predicate("$1"), "\"updated_at\" > $1");
    }

    #[test]
    fn test_audit_cursor_is_disjunction() {
        let cursor = EventTimeCursor::Audit {
            created_at: "created_at".to_string(),
            updated_at: "updated_at".to_string(),
        };
        assert_eq!(
            cursor.predicate("$1"),
            "(\"updated_at\" > $1 OR \"created_at\" > $1)"
        );
        assert_eq!(cursor.order_expr(), "\"updated_at\"");
        assert_eq!(cursor.columns(), vec!["created_at", "updated_at"]);
    }

    #[test]
    fn test_build_cdc_query_binds_watermark_and_limit() {
        let query = build_cdc_query(
            "oltp.business_case_installments",
            &["asset_id".to_string(), "paid_date".to_string()],
            &installments_cursor(),
            ExtractOrder::Descending,
            "1900-01-01T00:00:00",
            1000,
        );

        assert!(query
            .sql
            .starts_with("SELECT \"asset_id\", \"paid_date\" FROM \"oltp\".\"business_case_installments\""));
        assert!(query.sql.contains("> $1::text::timestamp ORDER BY GREATEST("));
        assert!(query.sql.ends_with("DESC LIMIT $2"));
        assert!(!query.sql.contains("1900-01-01T00:00:00"));
        assert_eq!(query.watermark_param, "1900-01-01T00:00:00");
        assert_eq!(query.limit, 1000);
    }

    #[test]
    fn test_build_cdc_query_all_columns_ascending() {
        let query = build_cdc_query(
            "cnpj_ws",
            &[],
            &EventTimeCursor::Audit {
                created_at: "created_at".to_string(),
                updated_at: "updated_at".to_string(),
            },
            ExtractOrder::Ascending,
            "2024-01-01T00:00:00",
            50,
        );
        assert!(query.sql.starts_with("SELECT * FROM \"cnpj_ws\" WHERE ("));
        assert!(query.sql.ends_with("ORDER BY \"updated_at\" ASC LIMIT $2"));
    }

    #[test]
    fn test_cursor_deserializes_from_toml() {
        let cursor: EventTimeCursor =
            toml::from_str("mode = \"greatest\"\ncolumns = [\"paid_date\"]").unwrap();
        assert_eq!(
            cursor,
            EventTimeCursor::Greatest {
                columns: vec!["paid_date".to_string()]
            }
        );

        let cursor: EventTimeCursor = toml::from_str("mode = \"audit\"").unwrap();
        assert_eq!(cursor.columns(), vec!["created_at", "updated_at"]);
    }
}
