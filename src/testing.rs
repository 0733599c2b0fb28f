//! Test doubles shared by the unit tests: schema fixtures, a scripted oracle
//! and an adapter that evaluates descriptors over in-memory JSON.
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::Duration;

use crate::backend::{NativeQuery, QueryAdapter, Record};
use crate::descriptor::{Direction, Filter, Operator, SortKey};
use crate::error::{Error, Result, Stage};
use crate::gate::ValidatedDescriptor;
use crate::generator::{Oracle, OracleError};

pub mod fixtures {
    use crate::schema::{Cardinality, Collection, Field, FieldType, Relationship, Schema};

    fn orders(extra: Vec<Field>) -> Collection {
        let mut fields = vec![
            Field::new("id", FieldType::Integer).required(),
            Field::new("status", FieldType::String).with_enum(["open", "closed"]),
            Field::new("amount", FieldType::Float),
        ];
        fields.extend(extra);
        let mut collection = Collection::new("orders", fields);
        collection.primary_key = Some("id".into());
        collection
    }

    /// `orders` alone, with no relationships.
    pub fn orders_schema() -> Schema {
        Schema::new(vec![orders(Vec::new())], Vec::new())
    }

    /// `orders` and `users`, joined by `orders.user_id -> users.id`.
    pub fn shop_schema() -> Schema {
        let orders = orders(vec![
            Field::new("user_id", FieldType::Integer),
            Field::new("placed_at", FieldType::Date),
            Field::new("shipping", FieldType::Object)
                .with_fields(vec![Field::new("city", FieldType::String)]),
            Field::new("totals", FieldType::Object)
                .with_fields(vec![Field::new("net", FieldType::Float)]),
        ]);
        let users = Collection::new(
            "users",
            vec![
                Field::new("id", FieldType::Integer).required(),
                Field::new("email", FieldType::String),
                Field::new("name", FieldType::String),
            ],
        );
        Schema::new(
            vec![orders, users],
            vec![Relationship::new(
                ("orders", "user_id"),
                ("users", "id"),
                Cardinality::ManyToOne,
            )],
        )
    }
}

/// Replays queued answers in order and records every prompt it was given.
#[derive(Debug, Default)]
pub struct ScriptedOracle {
    answers: Mutex<VecDeque<std::result::Result<String, OracleError>>>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedOracle {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: Mutex::new(answers.into_iter().map(|a| Ok(a.into())).collect()),
            ..Self::default()
        }
    }

    pub fn failing(error: OracleError) -> Self {
        Self {
            answers: Mutex::new(VecDeque::from([Err(error)])),
            ..Self::default()
        }
    }

    /// Sleep before answering each prompt.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Oracle for ScriptedOracle {
    fn generate(&self, prompt: &str) -> impl Future<Output = std::result::Result<String, OracleError>> + Send {
        let prompt = prompt.to_string();
        async move {
            self.calls.lock().unwrap().push(prompt);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.answers.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Err(OracleError::Other("script exhausted".into())))
        }
    }
}

/// Plan the memory adapter runs: a find over one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryQuery {
    pub collection: String,
    pub filter: Option<Filter>,
    pub projection: Vec<String>,
    pub sort: Vec<SortKey>,
    pub limit: u32,
}

impl NativeQuery for MemoryQuery {
    fn render(&self) -> String {
        format!("memory find {} limit {}", self.collection, self.limit)
    }
}

/// Evaluates finds over JSON records held in memory.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    data: BTreeMap<String, Vec<Value>>,
    delay: Option<Duration>,
    executions: AtomicUsize,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, name: &str, records: Vec<Value>) -> Self {
        self.data.insert(name.to_string(), records);
        self
    }

    /// Sleep before answering, to exercise timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of queries that reached `run`.
    pub fn executions(&self) -> usize {
        self.executions.load(AtomicOrdering::SeqCst)
    }

    fn evaluate(&self, query: &MemoryQuery) -> Result<Vec<Record>> {
        let records = self
            .data
            .get(&query.collection)
            .ok_or_else(|| Error::BackendNotFound(query.collection.clone()))?;
        let mut matched: Vec<&Value> = records
            .iter()
            .filter(|r| query.filter.as_ref().map_or(true, |f| matches(f, r)))
            .collect();
        matched.sort_by(|a, b| {
            query
                .sort
                .iter()
                .map(|key| {
                    let ord = compare(lookup(a, &key.field), lookup(b, &key.field));
                    match key.direction {
                        Direction::Asc => ord,
                        Direction::Desc => ord.reverse(),
                    }
                })
                .find(|ord| *ord != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
        Ok(matched
            .into_iter()
            .take(query.limit as usize)
            .map(|r| Record::Json(project(r, &query.projection)))
            .collect())
    }
}

impl QueryAdapter for MemoryAdapter {
    type Compiled = MemoryQuery;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn compile(&self, validated: &ValidatedDescriptor) -> Result<MemoryQuery> {
        if validated.raw().is_some() || validated.is_grouped() || !validated.joins().is_empty() {
            return Err(Error::Execution("memory adapter only runs finds".into()));
        }
        Ok(MemoryQuery {
            collection: validated.primary_collection().to_string(),
            filter: validated.filter().cloned(),
            projection: validated.projection().to_vec(),
            sort: validated.sort().to_vec(),
            limit: validated.limit(),
        })
    }

    fn run(&self, compiled: &MemoryQuery, timeout: Duration) -> impl Future<Output = Result<Vec<Record>>> + Send {
        async move {
            self.executions.fetch_add(1, AtomicOrdering::SeqCst);
            let work = async {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                self.evaluate(compiled)
            };
            tokio::time::timeout(timeout, work)
                .await
                .map_err(|_| Error::timeout(Stage::Execute, timeout))?
        }
    }
}

fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(record, |value, segment| value.get(segment))
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

fn equal(a: Option<&Value>, b: &Value) -> bool {
    match (a, b) {
        (Some(Value::Number(x)), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (None, Value::Null) => true,
        (Some(x), y) => x == y,
        (None, _) => false,
    }
}

fn matches(filter: &Filter, record: &Value) -> bool {
    match filter {
        Filter::And(children) => children.iter().all(|c| matches(c, record)),
        Filter::Or(children) => children.iter().any(|c| matches(c, record)),
        Filter::Condition(c) => {
            let actual = lookup(record, &c.field);
            match c.op {
                Operator::Eq => equal(actual, &c.value),
                Operator::Ne => !equal(actual, &c.value),
                Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                    if matches!(actual, None | Some(Value::Null)) {
                        return false;
                    }
                    let ord = compare(actual, Some(&c.value));
                    match c.op {
                        Operator::Gt => ord == Ordering::Greater,
                        Operator::Gte => ord != Ordering::Less,
                        Operator::Lt => ord == Ordering::Less,
                        _ => ord != Ordering::Greater,
                    }
                }
                Operator::In => c
                    .value
                    .as_array()
                    .is_some_and(|options| options.iter().any(|o| equal(actual, o))),
                Operator::Contains => match (actual, &c.value) {
                    (Some(Value::String(s)), Value::String(needle)) => {
                        s.to_lowercase().contains(&needle.to_lowercase())
                    }
                    _ => false,
                },
            }
        }
    }
}

fn project(record: &Value, projection: &[String]) -> Map<String, Value> {
    let Some(obj) = record.as_object() else {
        return Map::new();
    };
    if projection.is_empty() {
        return obj.clone();
    }
    let mut out = Map::new();
    for path in projection {
        if let Some(value) = lookup(record, path) {
            out.insert(path.clone(), value.clone());
        }
    }
    out
}
