//! Routing decision: does a message need the query pipeline at all?
//!
//! The router asks the oracle first and falls back to a keyword heuristic
//! whenever the oracle fails or answers with something unusable. It never
//! returns an error.
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::generator::{extract_json, routing_prompt, Oracle};
use crate::schema::Schema;

/// Confidence given to a heuristic verdict after an unparseable answer.
pub const UNPARSEABLE_CONFIDENCE: f64 = 0.3;
/// Confidence given to a heuristic verdict after the oracle call failed.
pub const ORACLE_FAILURE_CONFIDENCE: f64 = 0.2;

/// Words and phrases that suggest a request for stored data.
const DATA_KEYWORDS: &[&str] = &[
    "data", "database", "query", "queries", "table", "tables", "collection", "collections",
    "field", "fields", "record", "records", "row", "rows", "find", "search", "get", "show",
    "list", "count", "how many", "total", "average", "sum", "minimum", "maximum", "which",
    "status", "metric", "metrics", "statistic", "statistics", "numbers", "figures", "top",
    "latest", "schema",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteState {
    Start,
    Analyze,
    QueryPath,
    NonQueryPath,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Oracle,
    Heuristic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteDecision {
    pub needs_query: bool,
    pub confidence: f64,
    pub rationale: String,
    pub relevant_collections: Vec<String>,
    pub query_type: Option<String>,
    pub source: DecisionSource,
    /// `QueryPath` or `NonQueryPath`.
    pub path: RouteState,
    /// States visited, in order.
    pub states: Vec<RouteState>,
}

impl RouteDecision {
    pub fn takes_query_path(&self) -> bool {
        self.path == RouteState::QueryPath
    }
}

/// What the oracle said, once decoded.
#[derive(Debug, Clone, PartialEq)]
struct Verdict {
    needs_query: bool,
    confidence: f64,
    rationale: String,
    relevant_collections: Vec<String>,
    query_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Router {
    /// Minimum oracle confidence for the query path.
    pub threshold: f64,
    /// Bound on the oracle call.
    pub timeout: Duration,
}

impl Default for Router {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            timeout: Duration::from_secs(60),
        }
    }
}

impl Router {
    pub fn new(threshold: f64, timeout: Duration) -> Self {
        Self { threshold, timeout }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.confidence_threshold, config.oracle.timeout())
    }

    pub async fn route<O: Oracle>(&self, oracle: &O, message: &str, schema: &Schema) -> RouteDecision {
        let started = Instant::now();
        let prompt = routing_prompt(schema, message);

        let decision = match tokio::time::timeout(self.timeout, oracle.generate(&prompt)).await {
            Ok(Ok(answer)) => match parse_verdict(&answer, schema) {
                Some(verdict) => self.decide(verdict),
                None => {
                    tracing::warn!(stage = "route", "routing answer unparseable, using keyword fallback");
                    heuristic(
                        message,
                        schema,
                        UNPARSEABLE_CONFIDENCE,
                        "keyword fallback after an unparseable routing answer",
                    )
                }
            },
            Ok(Err(e)) => {
                tracing::warn!(stage = "route", error = %e, "routing oracle failed, using keyword fallback");
                heuristic(
                    message,
                    schema,
                    ORACLE_FAILURE_CONFIDENCE,
                    "keyword fallback after an oracle error",
                )
            }
            Err(_) => {
                tracing::warn!(
                    stage = "route",
                    timeout_s = self.timeout.as_secs_f64(),
                    "routing oracle timed out, using keyword fallback"
                );
                heuristic(
                    message,
                    schema,
                    ORACLE_FAILURE_CONFIDENCE,
                    "keyword fallback after an oracle timeout",
                )
            }
        };

        tracing::info!(
            stage = "route",
            needs_query = decision.needs_query,
            confidence = decision.confidence,
            source = ?decision.source,
            path = ?decision.path,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "route decided"
        );
        decision
    }

    fn decide(&self, verdict: Verdict) -> RouteDecision {
        let path = if verdict.needs_query && verdict.confidence >= self.threshold {
            RouteState::QueryPath
        } else {
            RouteState::NonQueryPath
        };
        RouteDecision {
            needs_query: verdict.needs_query,
            confidence: verdict.confidence,
            rationale: verdict.rationale,
            relevant_collections: verdict.relevant_collections,
            query_type: verdict.query_type,
            source: DecisionSource::Oracle,
            path,
            states: visited(path),
        }
    }
}

fn visited(path: RouteState) -> Vec<RouteState> {
    vec![RouteState::Start, RouteState::Analyze, path, RouteState::Done]
}

fn parse_verdict(answer: &str, schema: &Schema) -> Option<Verdict> {
    let value: Value = serde_json::from_str(extract_json(answer)).ok()?;
    let obj = value.as_object()?;
    let needs_query = obj
        .get("needs_database_query")
        .or_else(|| obj.get("needs_query"))?
        .as_bool()?;
    let confidence = match obj.get("confidence") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };
    let rationale = obj
        .get("reasoning")
        .or_else(|| obj.get("rationale"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let relevant_collections = obj
        .get("relevant_collections")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|name| schema.collection(name).is_some())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let query_type = obj
        .get("query_type")
        .and_then(Value::as_str)
        .map(str::to_string);

    Some(Verdict {
        needs_query,
        confidence: if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        },
        rationale,
        relevant_collections,
        query_type,
    })
}

/// Lowercased words of `message`, space separated and padded so that
/// `" word "` lookups match whole words and phrases.
fn normalize(message: &str) -> String {
    let words: Vec<String> = message
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    format!(" {} ", words.join(" "))
}

fn mentions(normalized: &str, word: &str) -> bool {
    normalized.contains(&format!(" {} ", word))
}

/// Whether `message` mentions a data keyword or any schema vocabulary word.
pub fn keyword_match(message: &str, schema: &Schema) -> bool {
    let normalized = normalize(message);
    DATA_KEYWORDS.iter().any(|kw| mentions(&normalized, kw))
        || schema.vocabulary().iter().any(|word| mentions(&normalized, word))
}

fn heuristic(message: &str, schema: &Schema, confidence: f64, rationale: &str) -> RouteDecision {
    let needs_query = keyword_match(message, schema);
    let normalized = normalize(message);
    let relevant_collections = schema
        .collection_names()
        .into_iter()
        .filter(|name| mentions(&normalized, &name.to_lowercase()))
        .map(str::to_string)
        .collect();
    let path = if needs_query {
        RouteState::QueryPath
    } else {
        RouteState::NonQueryPath
    };
    RouteDecision {
        needs_query,
        confidence,
        rationale: rationale.to_string(),
        relevant_collections,
        query_type: Some("fallback".to_string()),
        source: DecisionSource::Heuristic,
        path,
        states: visited(path),
    }
}
