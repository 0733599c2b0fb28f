use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde_json::Value;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;
use tokio_postgres::{types::Type, Row};

use crate::error::{Error, Stage};

/// Categorized SQLSTATE classes for failures the relational backend reports.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCategory {
    /// Syntax errors (SQLSTATE 42601, 42000)
    Syntax,
    /// Missing relation (42P01)
    UndefinedTable,
    /// Other semantic errors (missing column, ambiguous reference)
    Semantic,
    /// Statement cancelled by timeout or cancel request (57014)
    Canceled,
    /// Write attempted in a read-only transaction (25006)
    ReadOnly,
    /// Execution/runtime errors (division by zero, resource limits)
    Execution,
    /// Transaction state errors (e.g., transaction aborted)
    Transaction,
    /// Connection/communication errors
    Connection,
    /// Unknown or unclassified errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::UndefinedTable => write!(f, "Undefined Table"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Canceled => write!(f, "Query Canceled"),
            ErrorCategory::ReadOnly => write!(f, "Read-only Violation"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Transaction => write!(f, "Transaction Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

/// Categorize a SQLSTATE code into an ErrorCategory.
pub fn categorize_sqlstate(code: &str) -> ErrorCategory {
    if code.len() < 2 {
        return ErrorCategory::Unknown;
    }
    match code {
        "42P01" => return ErrorCategory::UndefinedTable,
        "57014" => return ErrorCategory::Canceled,
        "25006" => return ErrorCategory::ReadOnly,
        _ => {}
    }
    let class = &code[..2];
    match class {
        // Class 42: Syntax Error or Access Rule Violation
        "42" => {
            if code == "42601" || code == "42000" {
                ErrorCategory::Syntax
            } else {
                ErrorCategory::Semantic
            }
        }
        // Class 22: Data Exception
        "22" => ErrorCategory::Execution,
        // Class 25: Invalid Transaction State
        "25" => ErrorCategory::Transaction,
        // Class 40: Transaction Rollback
        "40" => ErrorCategory::Transaction,
        // Class 08: Connection Exception
        "08" => ErrorCategory::Connection,
        // Class 57: Operator Intervention (admin shutdown, crash shutdown)
        "57" => ErrorCategory::Connection,
        // Class 53/54/55: resources, program limits, object state
        "53" | "54" | "55" => ErrorCategory::Execution,
        _ => ErrorCategory::Unknown,
    }
}

/// Reduce a driver error to the crate error, keeping only the server's
/// primary message. `relation` names the table reported when the server says
/// a relation is missing without naming it.
pub fn map_pg_error(err: &tokio_postgres::Error, relation: &str, timeout: Duration) -> Error {
    let Some(db_err) = err.as_db_error() else {
        if err.is_closed() || err.source().is_some() {
            return Error::Connection(err.to_string());
        }
        return Error::Execution(err.to_string());
    };
    let message = db_err.message().to_string();
    match categorize_sqlstate(db_err.code().code()) {
        ErrorCategory::UndefinedTable => Error::BackendNotFound(
            db_err
                .table()
                .map(str::to_string)
                .or_else(|| quoted_name(&message))
                .unwrap_or_else(|| relation.to_string()),
        ),
        ErrorCategory::Canceled => Error::timeout(Stage::Execute, timeout),
        ErrorCategory::ReadOnly => Error::UnsafeOperation(message),
        ErrorCategory::Connection => Error::Connection(message),
        _ => Error::Execution(message),
    }
}

/// `relation "orders" does not exist` -> `orders`
fn quoted_name(message: &str) -> Option<String> {
    let start = message.find('"')? + 1;
    let len = message[start..].find('"')?;
    Some(message[start..start + len].to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(Value),
    Array(Vec<CellValue>),
    Unknown(String),
}

impl CellValue {
    /// JSON form; dates become RFC 3339 text, bytes hex. Non-finite floats
    /// have no JSON form and yield `None`.
    pub fn to_json(&self) -> Option<Value> {
        let value = match self {
            CellValue::Null => Value::Null,
            CellValue::Bool(b) => Value::Bool(*b),
            CellValue::Int16(i) => Value::from(*i),
            CellValue::Int32(i) => Value::from(*i),
            CellValue::Int64(i) => Value::from(*i),
            CellValue::Float32(f) => Value::from(serde_json::Number::from_f64(f64::from(*f))?),
            CellValue::Float64(f) => Value::from(serde_json::Number::from_f64(*f)?),
            CellValue::Text(s) | CellValue::Unknown(s) => Value::String(s.clone()),
            CellValue::Bytes(b) => Value::String(hex(b)),
            CellValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            CellValue::Time(t) => Value::String(t.format("%H:%M:%S%.f").to_string()),
            CellValue::DateTime(dt) => Value::String(
                dt.and_utc().to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ),
            CellValue::TimestampTz(dt) => {
                Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            CellValue::Json(j) => j.clone(),
            CellValue::Array(items) => Value::Array(
                items
                    .iter()
                    .map(CellValue::to_json)
                    .collect::<Option<Vec<_>>>()?,
            ),
        };
        Some(value)
    }
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Named cells of one result row.
pub fn row_values(row: &Row) -> Vec<(String, CellValue)> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| (col.name().to_string(), extract_value(row, i, col.type_())))
        .collect()
}

pub fn extract_value(row: &Row, idx: usize, pg_type: &Type) -> CellValue {
    match *pg_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Bool)
            .unwrap_or(CellValue::Null),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int16)
            .unwrap_or(CellValue::Null),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int32)
            .unwrap_or(CellValue::Null),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int64)
            .unwrap_or(CellValue::Null),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Float32)
            .unwrap_or(CellValue::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Float64)
            .unwrap_or(CellValue::Null),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::CHAR | Type::BPCHAR => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Text)
            .unwrap_or(CellValue::Null),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Bytes)
            .unwrap_or(CellValue::Null),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Date)
            .unwrap_or(CellValue::Null),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Time)
            .unwrap_or(CellValue::Null),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(CellValue::DateTime)
            .unwrap_or(CellValue::Null),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .ok()
            .flatten()
            .map(CellValue::TimestampTz)
            .unwrap_or(CellValue::Null),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<Value>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Json)
            .unwrap_or(CellValue::Null),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => row
            .try_get::<_, Option<Vec<Option<String>>>>(idx)
            .ok()
            .flatten()
            .map(|items| {
                CellValue::Array(
                    items
                        .into_iter()
                        .map(|v| v.map(CellValue::Text).unwrap_or(CellValue::Null))
                        .collect(),
                )
            })
            .unwrap_or(CellValue::Null),
        Type::INT8_ARRAY => row
            .try_get::<_, Option<Vec<Option<i64>>>>(idx)
            .ok()
            .flatten()
            .map(|items| {
                CellValue::Array(
                    items
                        .into_iter()
                        .map(|v| v.map(CellValue::Int64).unwrap_or(CellValue::Null))
                        .collect(),
                )
            })
            .unwrap_or(CellValue::Null),
        _ => {
            // Compiled queries cast every column to a supported type; this
            // only catches raw shapes the driver can still read as text.
            match row.try_get::<_, Option<String>>(idx) {
                Ok(Some(s)) => CellValue::Text(s),
                Ok(None) => CellValue::Null,
                Err(_) => CellValue::Unknown(format!("<{}>", pg_type.name())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_categorize_sqlstate() {
        assert_eq!(categorize_sqlstate("42601"), ErrorCategory::Syntax);
        assert_eq!(categorize_sqlstate("42P01"), ErrorCategory::UndefinedTable);
        assert_eq!(categorize_sqlstate("42703"), ErrorCategory::Semantic);
        assert_eq!(categorize_sqlstate("57014"), ErrorCategory::Canceled);
        assert_eq!(categorize_sqlstate("25006"), ErrorCategory::ReadOnly);
        assert_eq!(categorize_sqlstate("25001"), ErrorCategory::Transaction);
        assert_eq!(categorize_sqlstate("22012"), ErrorCategory::Execution);
        assert_eq!(categorize_sqlstate("08006"), ErrorCategory::Connection);
        assert_eq!(categorize_sqlstate("XX000"), ErrorCategory::Unknown);
        assert_eq!(categorize_sqlstate(""), ErrorCategory::Unknown);
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::UndefinedTable.to_string(), "Undefined Table");
        assert_eq!(ErrorCategory::Unknown.to_string(), "Error");
    }

    #[test]
    fn test_quoted_name() {
        assert_eq!(
            quoted_name("relation \"orders\" does not exist"),
            Some("orders".to_string())
        );
        assert_eq!(quoted_name("no quotes"), None);
    }

    #[test]
    fn test_cell_to_json() {
        assert_eq!(CellValue::Null.to_json(), Some(Value::Null));
        assert_eq!(CellValue::Int32(-7).to_json(), Some(json!(-7)));
        assert_eq!(CellValue::Float64(2.5).to_json(), Some(json!(2.5)));
        assert_eq!(CellValue::Bytes(vec![0xde, 0xad]).to_json(), Some(json!("dead")));
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(
            CellValue::TimestampTz(ts).to_json(),
            Some(json!("2024-05-01T10:00:00Z"))
        );
        assert_eq!(
            CellValue::Array(vec![CellValue::Text("a".into()), CellValue::Null]).to_json(),
            Some(json!(["a", null]))
        );
    }

    #[test]
    fn test_non_finite_float_has_no_json() {
        assert_eq!(CellValue::Float64(f64::NAN).to_json(), None);
        assert_eq!(
            CellValue::Array(vec![CellValue::Float32(f32::INFINITY)]).to_json(),
            None
        );
    }
}
