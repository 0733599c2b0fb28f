//! Result envelope.
//!
//! [`format`] is pure: the execution timestamp comes in through [`Timing`],
//! so formatting the same records twice yields identical envelopes.
use chrono::{DateTime, SecondsFormat, Utc};
use mongodb::bson::{Bson, Document};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;

use crate::backend::Record;
use crate::db::{hex, CellValue};
use crate::gate::{AppliedLimit, QueryType, ValidatedDescriptor};
use crate::schema::Cardinality;

/// Records nested deeper than this are treated as malformed.
pub const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    pub executed_at: DateTime<Utc>,
    pub compile_time: Duration,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultEnvelope {
    pub query_info: QueryInfo,
    pub results: Results,
    pub summary: Summary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryInfo {
    pub primary_collection: String,
    pub query_type: QueryType,
    pub backend: String,
    pub limit: AppliedLimit,
    pub joins: Vec<JoinInfo>,
    pub generated_query: Value,
    pub compiled_query: String,
    pub compile_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinInfo {
    pub collection: String,
    pub alias: String,
    pub local_field: String,
    pub foreign_field: String,
    pub cardinality: Cardinality,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Results {
    pub total_count: usize,
    pub data: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub executed_at: String,
    pub elapsed_ms: f64,
    pub result_count: usize,
    pub skipped_records: usize,
    pub collections_involved: Vec<String>,
}

fn millis(d: Duration) -> f64 {
    (d.as_secs_f64() * 1_000_000.0).round() / 1000.0
}

/// Build the envelope for `records`, keeping at most the validated limit.
pub fn format(
    records: &[Record],
    validated: &ValidatedDescriptor,
    backend: &str,
    compiled_query: &str,
    timing: &Timing,
) -> ResultEnvelope {
    let limit = validated.limit() as usize;
    let mut skipped = 0;
    let data: Vec<Value> = records
        .iter()
        .take(limit)
        .map(|record| match record_to_json(record) {
            Ok(value) => value,
            Err(reason) => {
                skipped += 1;
                tracing::warn!(stage = "format", %reason, "record skipped");
                serde_json::json!({ "_skipped": true, "reason": reason })
            }
        })
        .collect();

    let joins = validated
        .joins()
        .iter()
        .map(|j| JoinInfo {
            collection: j.collection.clone(),
            alias: j.alias.clone(),
            local_field: if j.from == validated.primary_collection() {
                j.local_path.clone()
            } else {
                format!("{}.{}", j.from, j.local_path)
            },
            foreign_field: j.foreign_field.clone(),
            cardinality: j.cardinality,
        })
        .collect();

    ResultEnvelope {
        query_info: QueryInfo {
            primary_collection: validated.primary_collection().to_string(),
            query_type: validated.query_type(),
            backend: backend.to_string(),
            limit: validated.limit_info(),
            joins,
            generated_query: validated.descriptor().to_value(),
            compiled_query: compiled_query.to_string(),
            compile_time_ms: millis(timing.compile_time),
        },
        results: Results {
            total_count: data.len(),
            data,
        },
        summary: Summary {
            executed_at: timing
                .executed_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            elapsed_ms: millis(timing.elapsed),
            result_count: records.len().min(limit),
            skipped_records: skipped,
            collections_involved: validated.collections_involved(),
        },
    }
}

/// JSON form of one record, or why it has none.
pub fn record_to_json(record: &Record) -> Result<Value, String> {
    match record {
        Record::Document(doc) => document_to_json(doc, 0),
        Record::Json(map) => {
            if 1 + map.values().map(depth).max().unwrap_or(0) > MAX_DEPTH {
                return Err(format!("record nests deeper than {} levels", MAX_DEPTH));
            }
            Ok(Value::Object(map.clone()))
        }
        Record::Row(cells) => row_to_json(cells),
    }
}

fn depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(depth).max().unwrap_or(0),
        _ => 0,
    }
}

/// Dotted column labels become nested objects.
fn row_to_json(cells: &[(String, CellValue)]) -> Result<Value, String> {
    let mut out = Map::new();
    for (name, cell) in cells {
        let value = cell
            .to_json()
            .ok_or_else(|| format!("column `{}` holds a non-finite number", name))?;
        insert_path(&mut out, name, value);
    }
    Ok(Value::Object(out))
}

fn insert_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let slot = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            match slot {
                Value::Object(inner) => insert_path(inner, rest, value),
                _ => {
                    map.insert(path.to_string(), value);
                }
            }
        }
    }
}

fn document_to_json(doc: &Document, level: usize) -> Result<Value, String> {
    if level > MAX_DEPTH {
        return Err(format!("record nests deeper than {} levels", MAX_DEPTH));
    }
    let mut out = Map::new();
    for (key, value) in doc {
        out.insert(key.clone(), bson_to_json(value, level + 1)?);
    }
    Ok(Value::Object(out))
}

fn bson_to_json(value: &Bson, level: usize) -> Result<Value, String> {
    let json = match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(i) => Value::from(*i),
        Bson::Int64(i) => Value::from(*i),
        Bson::Double(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| format!("non-finite number {}", f))?,
        Bson::String(s) | Bson::Symbol(s) => Value::String(s.clone()),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => Value::String(
            dt.try_to_rfc3339_string()
                .unwrap_or_else(|_| dt.timestamp_millis().to_string()),
        ),
        Bson::Decimal128(d) => Value::String(d.to_string()),
        Bson::Binary(bin) => Value::String(hex(&bin.bytes)),
        Bson::Timestamp(ts) => Value::from(ts.time),
        Bson::Document(inner) => document_to_json(inner, level)?,
        Bson::Array(items) => {
            if level > MAX_DEPTH {
                return Err(format!("record nests deeper than {} levels", MAX_DEPTH));
            }
            Value::Array(
                items
                    .iter()
                    .map(|item| bson_to_json(item, level + 1))
                    .collect::<Result<_, _>>()?,
            )
        }
        other => Value::String(other.to_string()),
    };
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{JoinSpec, QueryDescriptor};
    use crate::gate::{validate, Policy};
    use crate::testing::fixtures;
    use chrono::TimeZone;
    use mongodb::bson::{doc, oid::ObjectId};
    use serde_json::json;

    fn validated(limit: i64) -> ValidatedDescriptor {
        let mut d = QueryDescriptor::new("orders");
        d.limit = Some(limit);
        validate(d, &fixtures::orders_schema(), &Policy::default()).unwrap()
    }

    fn timing() -> Timing {
        Timing {
            executed_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            compile_time: Duration::from_micros(1500),
            elapsed: Duration::from_millis(42),
        }
    }

    #[test]
    fn test_document_identifiers_flatten() {
        let oid = ObjectId::parse_str("65f1a2b3c4d5e6f708091a2b").unwrap();
        let record = Record::Document(doc! {
            "_id": oid,
            "placed": mongodb::bson::DateTime::from_millis(0),
            "items": [{ "sku": "a" }],
        });
        let value = record_to_json(&record).unwrap();
        assert_eq!(value["_id"], "65f1a2b3c4d5e6f708091a2b");
        assert_eq!(value["placed"], "1970-01-01T00:00:00Z");
        assert_eq!(value["items"][0]["sku"], "a");
    }

    #[test]
    fn test_malformed_record_becomes_placeholder() {
        let records = vec![
            Record::Document(doc! { "amount": f64::NAN }),
            Record::Json(json!({ "amount": 1 }).as_object().unwrap().clone()),
        ];
        let env = format(&records, &validated(10), "mongodb", "db.orders.find({})", &timing());
        assert_eq!(env.summary.skipped_records, 1);
        assert_eq!(env.results.data[0]["_skipped"], true);
        assert_eq!(env.results.data[1]["amount"], 1);
        assert_eq!(env.results.total_count, 2);
    }

    #[test]
    fn test_rows_unflatten_dotted_labels() {
        let record = Record::Row(vec![
            ("id".into(), CellValue::Int64(7)),
            ("customer.email".into(), CellValue::Text("a@b.c".into())),
            ("customer.name".into(), CellValue::Null),
        ]);
        assert_eq!(
            record_to_json(&record).unwrap(),
            json!({ "id": 7, "customer": { "email": "a@b.c", "name": null } })
        );
    }

    #[test]
    fn test_data_is_capped_to_limit() {
        let records: Vec<Record> = (0..5)
            .map(|i| Record::Json(json!({ "id": i }).as_object().unwrap().clone()))
            .collect();
        let env = format(&records, &validated(3), "memory", "", &timing());
        assert_eq!(env.results.data.len(), 3);
        assert_eq!(env.summary.result_count, 3);
    }

    #[test]
    fn test_format_is_idempotent() {
        let records = vec![Record::Document(doc! { "b": 1, "a": "x" })];
        let v = validated(10);
        let first = serde_json::to_string(&format(&records, &v, "mongodb", "q", &timing())).unwrap();
        let second = serde_json::to_string(&format(&records, &v, "mongodb", "q", &timing())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_envelope_metadata() {
        let mut d = QueryDescriptor::new("orders");
        d.joins.push(JoinSpec::new("users", "user_id", "id"));
        d.limit = Some(50_000);
        let v = validate(d, &fixtures::shop_schema(), &Policy::default()).unwrap();
        let env = format(&[], &v, "postgresql", "SELECT 1", &timing());
        assert_eq!(env.summary.executed_at, "2024-05-01T12:00:00.000Z");
        assert_eq!(env.summary.elapsed_ms, 42.0);
        assert_eq!(env.query_info.compile_time_ms, 1.5);
        assert_eq!(env.query_info.limit.applied, 10_000);
        assert!(env.query_info.limit.clamped);
        assert_eq!(env.query_info.query_type, QueryType::Aggregation);
        assert_eq!(env.summary.collections_involved, vec!["orders", "users"]);
        assert_eq!(env.query_info.joins[0].cardinality, Cardinality::ManyToOne);
        assert_eq!(env.results.total_count, 0);
        assert_eq!(env.query_info.generated_query["primary_collection"], "orders");
    }

    #[test]
    fn test_depth_limit() {
        let mut value = json!(1);
        for _ in 0..(MAX_DEPTH + 2) {
            value = json!({ "x": value });
        }
        let record = Record::Json(value.as_object().unwrap().clone());
        assert!(record_to_json(&record).is_err());
    }
}
