//! Descriptor generation.
//!
//! The oracle's answer is untrusted text. It is decoded into a
//! [`QueryDescriptor`] or rejected; one corrective retry carrying the decode
//! error is the only repair attempted.
mod oracle;
mod prompt;

pub use oracle::{NoOracle, Oracle, OracleError, ProcessOracle};
pub use prompt::{correction_prompt, descriptor_prompt, extract_json, routing_prompt};

use serde_json::{Map, Value};
use std::time::{Duration, Instant};

use crate::descriptor::{Operator, QueryDescriptor};
use crate::error::{Error, Result, Stage};
use crate::gate::{forbidden_key, FORBIDDEN_PIPELINE_KEYS};
use crate::schema::Schema;

/// Top-level keys that only make sense for a write.
const MUTATION_KEYS: [&str; 14] = [
    "insert", "insert_one", "insert_many", "update", "update_one", "update_many", "delete",
    "delete_one", "delete_many", "drop", "replace", "$set", "$unset", "upsert",
];

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorOptions {
    /// Corrective follow-ups after the first answer.
    pub max_retries: u32,
    /// Bound on each oracle call.
    pub timeout: Duration,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            max_retries: 1,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub descriptor: QueryDescriptor,
    /// Oracle calls made, including the successful one.
    pub attempts: u32,
}

/// Why an answer was not accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// Not a descriptor; worth one correction.
    Malformed(String),
    /// Asks for a write or an operator outside the grammar; never retried.
    Unsafe(String),
}

/// Decode an oracle answer into a descriptor.
pub fn decode_response(text: &str) -> std::result::Result<QueryDescriptor, Rejection> {
    let body = extract_json(text);
    if body.is_empty() {
        return Err(Rejection::Malformed("the answer was empty".into()));
    }
    let value: Value = serde_json::from_str(body)
        .map_err(|e| Rejection::Malformed(format!("the answer is not valid JSON: {}", e)))?;
    let Value::Object(obj) = &value else {
        return Err(Rejection::Malformed(
            "the answer must be a single JSON object".into(),
        ));
    };
    if let Some(key) = obj
        .keys()
        .find(|k| MUTATION_KEYS.contains(&k.to_ascii_lowercase().as_str()))
    {
        return Err(Rejection::Unsafe(format!(
            "generated descriptor requests a write (`{}`)",
            key
        )));
    }
    if let Some(op) = forbidden_operator(obj) {
        return Err(Rejection::Unsafe(format!(
            "generated descriptor uses operator `{}`, which is not an allowed read operator",
            op
        )));
    }
    QueryDescriptor::from_value(value)
        .map_err(|e| Rejection::Malformed(format!("the answer does not match the descriptor shape: {}", e)))
}

/// First operator in the answer outside the filter grammar: an unknown
/// condition `op`, a `$` key other than `$and`/`$or` in a filter node, or a
/// server-side or writing stage in `aggregation`.
fn forbidden_operator(obj: &Map<String, Value>) -> Option<String> {
    if let Some(op) = obj.get("filter").and_then(filter_operator) {
        return Some(op);
    }
    obj.get("aggregation")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(Value::as_object)
        .find_map(|stage| {
            stage
                .keys()
                .find(|k| FORBIDDEN_PIPELINE_KEYS.contains(&k.as_str()))
                .cloned()
        })
}

fn filter_operator(node: &Value) -> Option<String> {
    match node {
        Value::Array(items) => items.iter().find_map(filter_operator),
        Value::Object(obj) => {
            for (key, value) in obj {
                match key.to_ascii_lowercase().trim_start_matches('$') {
                    "and" | "or" => return filter_operator(value),
                    _ if key.starts_with('$') => return Some(key.clone()),
                    _ => {}
                }
            }
            if let Some(key) = obj.get("value").and_then(forbidden_key) {
                return Some(key.to_string());
            }
            let op = obj.get("op").or_else(|| obj.get("operator"))?.as_str()?;
            op.parse::<Operator>().is_err().then(|| op.to_string())
        }
        _ => None,
    }
}

/// Ask `oracle` for a descriptor answering `request`.
pub async fn generate<O: Oracle>(
    oracle: &O,
    request: &str,
    schema: &Schema,
    options: &GeneratorOptions,
) -> Result<Generation> {
    let base = descriptor_prompt(schema, request);
    let mut prompt = base.clone();
    let max_attempts = options.max_retries + 1;
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        let started = Instant::now();
        let answer = match tokio::time::timeout(options.timeout, oracle.generate(&prompt)).await {
            Err(_) => return Err(Error::timeout(Stage::Generate, options.timeout)),
            Ok(Err(e)) => {
                return Err(Error::Generation {
                    message: e.to_string(),
                    attempts: attempt,
                })
            }
            Ok(Ok(answer)) => answer,
        };
        tracing::debug!(
            stage = "generate",
            attempt,
            elapsed_ms = started.elapsed().as_millis() as u64,
            bytes = answer.len(),
            "oracle answered"
        );

        match decode_response(&answer) {
            Ok(descriptor) => {
                tracing::info!(
                    stage = "generate",
                    attempts = attempt,
                    collection = %descriptor.primary_collection,
                    "descriptor generated"
                );
                return Ok(Generation {
                    descriptor,
                    attempts: attempt,
                });
            }
            Err(Rejection::Unsafe(message)) => return Err(Error::UnsafeOperation(message)),
            Err(Rejection::Malformed(message)) => {
                tracing::warn!(stage = "generate", attempt, error = %message, "answer rejected");
                prompt = correction_prompt(&base, &answer, &message);
                last_error = message;
            }
        }
    }

    Err(Error::Generation {
        message: last_error,
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Filter, Operator};
    use crate::testing::{fixtures, ScriptedOracle};

    const SCENARIO_A: &str = r#"```json
{"primary_collection": "orders",
 "filter": {"and": [{"field": "status", "op": "eq", "value": "open"},
                    {"field": "amount", "op": "gt", "value": 100}]},
 "limit": 100}
```"#;

    #[tokio::test]
    async fn test_generates_scenario_a() {
        let oracle = ScriptedOracle::new([SCENARIO_A]);
        let g = generate(&oracle, "show open orders over 100", &fixtures::orders_schema(), &GeneratorOptions::default())
            .await
            .unwrap();
        assert_eq!(g.attempts, 1);
        assert_eq!(g.descriptor.limit, Some(100));
        assert_eq!(
            g.descriptor.filter,
            Some(Filter::And(vec![
                Filter::condition("status", Operator::Eq, "open"),
                Filter::condition("amount", Operator::Gt, 100),
            ]))
        );
        assert_eq!(oracle.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_one_corrective_retry() {
        let oracle = ScriptedOracle::new(["I think you want the orders table.", SCENARIO_A]);
        let g = generate(&oracle, "show open orders over 100", &fixtures::orders_schema(), &GeneratorOptions::default())
            .await
            .unwrap();
        assert_eq!(g.attempts, 2);
        let calls = oracle.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].contains("I think you want the orders table."));
        assert!(calls[1].contains("not valid JSON"));
    }

    #[tokio::test]
    async fn test_two_failures_surface_generation_error() {
        let oracle = ScriptedOracle::new([
            r#"{"primary_collection": "orders", "filter": {"field": "status", "value": "o"}}"#,
            "still not json",
            SCENARIO_A,
        ]);
        let err = generate(&oracle, "x", &fixtures::orders_schema(), &GeneratorOptions::default())
            .await
            .unwrap_err();
        match err {
            Error::Generation { attempts, message } => {
                assert_eq!(attempts, 2);
                assert!(message.contains("not valid JSON"));
            }
            other => panic!("expected generation error, got {:?}", other),
        }
        assert_eq!(oracle.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_correction_carries_shape_error() {
        let oracle = ScriptedOracle::new([
            r#"{"primary_collection": "orders", "filter": {"field": "status", "value": "o"}}"#,
            SCENARIO_A,
        ]);
        generate(&oracle, "x", &fixtures::orders_schema(), &GeneratorOptions::default())
            .await
            .unwrap();
        assert!(oracle.calls()[1].contains("missing `op`"));
    }

    #[tokio::test]
    async fn test_disallowed_operator_is_not_retried() {
        let oracle = ScriptedOracle::new([
            r#"{"primary_collection": "orders", "filter": {"field": "status", "op": "$where", "value": "sleep(100)"}}"#,
            SCENARIO_A,
        ]);
        let err = generate(&oracle, "x", &fixtures::orders_schema(), &GeneratorOptions::default())
            .await
            .unwrap_err();
        match err {
            Error::UnsafeOperation(message) => assert!(message.contains("$where")),
            other => panic!("expected unsafe operation, got {:?}", other),
        }
        assert_eq!(oracle.calls().len(), 1);
    }

    #[test]
    fn test_decode_flags_operators_outside_the_grammar() {
        let unsafe_answers = [
            r#"{"primary_collection": "orders", "filter": {"field": "status", "op": "regex", "value": "o"}}"#,
            r#"{"primary_collection": "orders", "filter": {"and": [{"field": "amount", "op": "gt", "value": 1}, {"field": "status", "op": "$function", "value": "x"}]}}"#,
            r#"{"primary_collection": "orders", "filter": {"$where": "this.amount > 1"}}"#,
            r#"{"primary_collection": "orders", "filter": {"field": "status", "op": "eq", "value": {"$where": "1"}}}"#,
            r#"{"primary_collection": "orders", "aggregation": [{"$out": "copy"}]}"#,
        ];
        for answer in unsafe_answers {
            assert!(
                matches!(decode_response(answer), Err(Rejection::Unsafe(_))),
                "{}",
                answer
            );
        }
        assert!(decode_response(
            r#"{"primary_collection": "orders", "filter": {"$or": [{"field": "status", "op": "$eq", "value": "open"}]}}"#
        )
        .is_ok());
    }

    #[tokio::test]
    async fn test_write_request_is_not_retried() {
        let oracle = ScriptedOracle::new([r#"{"update": "orders", "$set": {"status": "closed"}}"#]);
        let err = generate(&oracle, "close all orders", &fixtures::orders_schema(), &GeneratorOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsafeOperation(_)));
        assert_eq!(oracle.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_oracle_failure_is_not_retried() {
        let oracle = ScriptedOracle::failing(OracleError::Other("rate limited".into()));
        let err = generate(&oracle, "x", &fixtures::orders_schema(), &GeneratorOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Generation { attempts: 1, .. }));
        assert_eq!(oracle.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_oracle_timeout() {
        let oracle = ScriptedOracle::new([SCENARIO_A]).with_delay(Duration::from_secs(5));
        let options = GeneratorOptions {
            timeout: Duration::from_millis(20),
            ..GeneratorOptions::default()
        };
        let err = generate(&oracle, "x", &fixtures::orders_schema(), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { stage: Stage::Generate, .. }));
    }

    #[test]
    fn test_decode_rejects_non_object() {
        assert!(matches!(decode_response("[1, 2]"), Err(Rejection::Malformed(_))));
        assert!(matches!(decode_response(""), Err(Rejection::Malformed(_))));
    }
}
