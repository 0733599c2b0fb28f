//! Safety and validation gate.
//!
//! [`validate`] is the only way to obtain a [`ValidatedDescriptor`], and the
//! adapters accept nothing else. Checks run in a fixed order and stop at the
//! first failure: collection, joins, field paths and value types, limit,
//! read-only policy.
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{Number, Value};
use sqlparser::ast::{SetExpr, Statement};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use crate::config::{BackendType, Config};
use crate::descriptor::{
    aggregate_name, group_key_name, AggregateOp, Filter, JoinSpec, Operator, QueryDescriptor, SortKey,
    Stage,
};
use crate::error::{Error, Result};
use crate::schema::{Cardinality, FieldType, Schema};

/// Words rejected anywhere in raw query text.
pub const MUTATION_KEYWORDS: [&str; 7] =
    ["insert", "update", "delete", "drop", "alter", "create", "replace"];

/// Pipeline stages and operators that write or run server-side code.
pub(crate) const FORBIDDEN_PIPELINE_KEYS: [&str; 5] = ["$out", "$merge", "$function", "$accumulator", "$where"];

fn mutation_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?i)\b(insert|update|delete|drop|alter|create|replace)\b")
            .expect("mutation keyword regex should compile")
    })
}

fn identifier_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex should compile")
    })
}

/// First mutation keyword found in `text`, lowercased.
pub fn find_mutation_keyword(text: &str) -> Option<String> {
    mutation_regex()
        .find(text)
        .map(|m| m.as_str().to_ascii_lowercase())
}

/// Limits and permissions the gate enforces.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub backend: BackendType,
    pub default_limit: u32,
    pub max_limit: u32,
    pub allow_raw_query: bool,
}

impl Policy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            backend: config.backend_type,
            default_limit: config.default_limit,
            max_limit: config.max_limit,
            allow_raw_query: config.allow_raw_query,
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Find,
    Aggregation,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AppliedLimit {
    pub requested: Option<i64>,
    pub applied: u32,
    pub clamped: bool,
}

/// A source path split into the scope it lives in and its segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Join alias the path starts with; `None` for the primary collection.
    pub alias: Option<String>,
    /// Remaining segments; empty when the path names the alias itself.
    pub segments: Vec<String>,
    pub field_type: FieldType,
}

impl ResolvedPath {
    /// Dotted path past the alias.
    pub fn inner(&self) -> String {
        self.segments.join(".")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedJoin {
    pub collection: String,
    pub alias: String,
    /// Primary collection name or an earlier alias holding the local field.
    pub from: String,
    pub from_collection: String,
    /// Local field relative to `from`.
    pub local_path: String,
    pub foreign_field: String,
    pub cardinality: Cardinality,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupKey {
    pub source: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAggregate {
    pub op: AggregateOp,
    /// Input column or path; `*` for a row count.
    pub source: String,
    pub name: String,
}

/// One group stage; `index` 0 reads source paths, later stages read the
/// previous stage's output names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStage {
    pub index: usize,
    pub keys: Vec<GroupKey>,
    pub aggregates: Vec<GroupAggregate>,
}

impl GroupStage {
    pub fn output_names(&self) -> Vec<&str> {
        self.keys
            .iter()
            .map(|k| k.name.as_str())
            .chain(self.aggregates.iter().map(|a| a.name.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawQuery {
    Sql(String),
    Pipeline(Vec<Value>),
}

/// A descriptor the gate accepted. Immutable; only [`validate`] builds one.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedDescriptor {
    descriptor: QueryDescriptor,
    limit: AppliedLimit,
    joins: Vec<ResolvedJoin>,
    groups: Vec<GroupStage>,
    paths: BTreeMap<String, ResolvedPath>,
    raw: Option<RawQuery>,
    query_type: QueryType,
}

impl ValidatedDescriptor {
    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    pub fn primary_collection(&self) -> &str {
        &self.descriptor.primary_collection
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.descriptor.filter.as_ref()
    }

    pub fn projection(&self) -> &[String] {
        &self.descriptor.projection
    }

    pub fn sort(&self) -> &[SortKey] {
        &self.descriptor.sort
    }

    pub fn limit(&self) -> u32 {
        self.limit.applied
    }

    pub fn limit_info(&self) -> AppliedLimit {
        self.limit
    }

    pub fn joins(&self) -> &[ResolvedJoin] {
        &self.joins
    }

    pub fn groups(&self) -> &[GroupStage] {
        &self.groups
    }

    pub fn is_grouped(&self) -> bool {
        !self.groups.is_empty()
    }

    /// Resolution of a source-scope path the descriptor references.
    pub fn path(&self, path: &str) -> Option<&ResolvedPath> {
        self.paths.get(path)
    }

    pub fn raw(&self) -> Option<&RawQuery> {
        self.raw.as_ref()
    }

    pub fn query_type(&self) -> QueryType {
        self.query_type
    }

    /// Sorted, de-duplicated collection names the query touches.
    pub fn collections_involved(&self) -> Vec<String> {
        let mut names: BTreeSet<&str> = BTreeSet::new();
        names.insert(self.primary_collection());
        for join in &self.joins {
            names.insert(&join.collection);
        }
        names.into_iter().map(str::to_string).collect()
    }
}

/// Validate `descriptor` against `schema` and `policy`.
pub fn validate(mut descriptor: QueryDescriptor, schema: &Schema, policy: &Policy) -> Result<ValidatedDescriptor> {
    let primary = descriptor.primary_collection.as_str();
    if schema.collection(primary).is_none() {
        return Err(Error::UnknownCollection {
            collection: descriptor.primary_collection.clone(),
        });
    }

    let mut scope = SourceScope::new(schema, primary);
    check_stage_order(&descriptor)?;
    let joins = resolve_joins(&descriptor, schema, &mut scope)?;

    let mut paths = BTreeMap::new();
    let mut groups = Vec::new();
    if descriptor.raw_query.is_none() {
        groups = resolve_fields(&descriptor, &scope, &mut paths)?;
        if let Some(filter) = descriptor.filter.as_mut() {
            coerce_filter(filter, &paths)?;
        }
        // Join keys are compiled through the same resolution.
        for join in &joins {
            let local = if join.from == scope.primary {
                join.local_path.clone()
            } else {
                format!("{}.{}", join.from, join.local_path)
            };
            scope.resolve_into(&local, &mut paths)?;
        }
    }

    let limit = apply_limit(descriptor.limit, policy);

    let raw = match &descriptor.raw_query {
        Some(text) => Some(check_raw_query(&descriptor, text, policy)?),
        None => None,
    };

    let query_type = if raw.is_some() {
        QueryType::Raw
    } else if joins.is_empty() && groups.is_empty() {
        QueryType::Find
    } else {
        QueryType::Aggregation
    };

    Ok(ValidatedDescriptor {
        descriptor,
        limit,
        joins,
        groups,
        paths,
        raw,
        query_type,
    })
}

/// `min(max(L, 1), max_limit)`, or the default limit when none was requested.
pub fn apply_limit(requested: Option<i64>, policy: &Policy) -> AppliedLimit {
    let max = policy.max_limit.max(1);
    let applied = match requested {
        None => policy.default_limit.clamp(1, max),
        Some(l) => l.clamp(1, i64::from(max)) as u32,
    };
    AppliedLimit {
        requested,
        applied,
        clamped: requested.is_some_and(|l| l != i64::from(applied)),
    }
}

fn check_stage_order(descriptor: &QueryDescriptor) -> Result<()> {
    let mut seen_group = false;
    for stage in &descriptor.aggregation {
        match stage {
            Stage::Group { .. } => seen_group = true,
            Stage::Join { join } if seen_group => {
                return Err(Error::InvalidDescriptor(format!(
                    "join stage on `{}` must come before every group stage",
                    join.collection
                )));
            }
            Stage::Join { .. } => {}
        }
    }
    Ok(())
}

struct SourceScope<'a> {
    schema: &'a Schema,
    primary: String,
    /// alias -> joined collection name
    aliases: BTreeMap<String, String>,
}

impl<'a> SourceScope<'a> {
    fn new(schema: &'a Schema, primary: &str) -> Self {
        Self {
            schema,
            primary: primary.to_string(),
            aliases: BTreeMap::new(),
        }
    }

    fn unknown(&self, path: &str) -> Error {
        Error::UnknownField {
            collection: self.primary.clone(),
            path: path.to_string(),
        }
    }

    fn resolve(&self, path: &str) -> Option<ResolvedPath> {
        let path = path.trim();
        if path.is_empty() {
            return None;
        }
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        if let Some(collection) = self.aliases.get(head) {
            let segments: Vec<String> = rest
                .map(|r| r.split('.').map(str::to_string).collect())
                .unwrap_or_default();
            let field_type = match rest {
                None => FieldType::Object,
                Some(rest) => self.schema.resolve_path(collection, rest)?.field_type,
            };
            return Some(ResolvedPath {
                alias: Some(head.to_string()),
                segments,
                field_type,
            });
        }
        let field = self.schema.resolve_path(&self.primary, path)?;
        Some(ResolvedPath {
            alias: None,
            segments: path.split('.').map(str::to_string).collect(),
            field_type: field.field_type,
        })
    }

    fn resolve_into(&self, path: &str, paths: &mut BTreeMap<String, ResolvedPath>) -> Result<FieldType> {
        let resolved = self.resolve(path).ok_or_else(|| self.unknown(path))?;
        let field_type = resolved.field_type;
        paths.insert(path.trim().to_string(), resolved);
        Ok(field_type)
    }
}

fn resolve_joins(
    descriptor: &QueryDescriptor,
    schema: &Schema,
    scope: &mut SourceScope<'_>,
) -> Result<Vec<ResolvedJoin>> {
    let primary_fields: BTreeSet<&str> = schema
        .collection(&scope.primary)
        .map(|c| c.fields.iter().map(|f| f.name.as_str()).collect())
        .unwrap_or_default();

    let mut joins = Vec::new();
    for join_spec in descriptor.all_joins() {
        let JoinSpec {
            collection,
            local_field,
            foreign_field,
            ..
        } = join_spec;
        let alias = join_spec.alias().trim().to_string();

        // Resolve the local side: a leading alias means a chained join.
        let (from, from_collection, local_path) = match local_field.split_once('.') {
            Some((head, rest)) if scope.aliases.contains_key(head) => {
                (head.to_string(), scope.aliases[head].clone(), rest.to_string())
            }
            _ => (scope.primary.clone(), scope.primary.clone(), local_field.clone()),
        };

        let cardinality = schema
            .join_edge(&from_collection, &local_path, collection, foreign_field)
            .ok_or_else(|| Error::NoRelationship {
                from: from_collection.clone(),
                to: collection.clone(),
                local_field: local_path.clone(),
                foreign_field: foreign_field.clone(),
            })?;

        if schema.resolve_path(&from_collection, &local_path).is_none() {
            return Err(Error::UnknownField {
                collection: from_collection,
                path: local_path,
            });
        }
        if schema.collection(collection).is_none() {
            return Err(Error::UnknownCollection {
                collection: collection.clone(),
            });
        }
        if schema.resolve_path(collection, foreign_field).is_none() {
            return Err(Error::UnknownField {
                collection: collection.clone(),
                path: foreign_field.clone(),
            });
        }

        if !identifier_regex().is_match(&alias) {
            return Err(Error::InvalidDescriptor(format!(
                "join alias `{}` is not a plain identifier",
                alias
            )));
        }
        if scope.aliases.contains_key(&alias) || alias == scope.primary {
            return Err(Error::InvalidDescriptor(format!(
                "join alias `{}` is used more than once",
                alias
            )));
        }
        if primary_fields.contains(alias.as_str()) {
            return Err(Error::InvalidDescriptor(format!(
                "join alias `{}` shadows a field of `{}`",
                alias, scope.primary
            )));
        }

        scope.aliases.insert(alias.clone(), collection.clone());
        joins.push(ResolvedJoin {
            collection: collection.clone(),
            alias,
            from,
            from_collection,
            local_path,
            foreign_field: foreign_field.clone(),
            cardinality,
        });
    }
    Ok(joins)
}

fn resolve_fields(
    descriptor: &QueryDescriptor,
    scope: &SourceScope<'_>,
    paths: &mut BTreeMap<String, ResolvedPath>,
) -> Result<Vec<GroupStage>> {
    if let Some(filter) = &descriptor.filter {
        for condition in filter.conditions() {
            scope.resolve_into(&condition.field, paths)?;
        }
    }

    // `None` while still addressing source paths, then the latest outputs.
    let mut outputs: Option<BTreeMap<String, FieldType>> = None;
    let mut groups = Vec::new();
    for (index, (group_by, aggregations)) in descriptor.group_stages().enumerate() {
        let lookup = |path: &str, paths: &mut BTreeMap<String, ResolvedPath>| -> Result<FieldType> {
            match &outputs {
                None => scope.resolve_into(path, paths),
                Some(columns) => columns.get(path).copied().ok_or_else(|| scope.unknown(path)),
            }
        };

        let mut next = BTreeMap::new();
        let mut keys = Vec::new();
        for key in group_by {
            let field_type = lookup(key.as_str(), &mut *paths)?;
            let name = group_key_name(key);
            next.insert(name.clone(), field_type);
            keys.push(GroupKey {
                source: key.clone(),
                name,
            });
        }

        let mut aggregates = Vec::new();
        for (field, op) in aggregations {
            let output_type = if field == "*" {
                if *op != AggregateOp::Count {
                    return Err(Error::InvalidDescriptor(format!(
                        "`*` can only be counted, not `{}`",
                        op.name()
                    )));
                }
                FieldType::Integer
            } else {
                let field_type = lookup(field.as_str(), &mut *paths)?;
                match op {
                    AggregateOp::Avg | AggregateOp::Sum
                        if !(field_type.is_numeric() || field_type == FieldType::Unknown) =>
                    {
                        return Err(Error::InvalidDescriptor(format!(
                            "cannot {} non-numeric field `{}` ({})",
                            op.name(),
                            field,
                            field_type
                        )));
                    }
                    AggregateOp::Avg => FieldType::Float,
                    AggregateOp::Count => FieldType::Integer,
                    _ => field_type,
                }
            };
            let name = aggregate_name(*op, field);
            if next.insert(name.clone(), output_type).is_some() {
                return Err(Error::InvalidDescriptor(format!(
                    "group stage produces `{}` twice",
                    name
                )));
            }
            aggregates.push(GroupAggregate {
                op: *op,
                source: field.clone(),
                name,
            });
        }

        groups.push(GroupStage {
            index,
            keys,
            aggregates,
        });
        outputs = Some(next);
    }

    let check_output = |path: &String, paths: &mut BTreeMap<String, ResolvedPath>| -> Result<()> {
        match &outputs {
            None => scope.resolve_into(path, paths).map(|_| ()),
            Some(columns) if columns.contains_key(path.as_str()) => Ok(()),
            Some(_) => Err(scope.unknown(path)),
        }
    };
    for key in &descriptor.sort {
        check_output(&key.field, &mut *paths)?;
    }
    for path in &descriptor.projection {
        check_output(path, &mut *paths)?;
    }
    Ok(groups)
}

/// Parse an RFC 3339 timestamp, a naive `YYYY-MM-DDTHH:MM:SS` (read as UTC)
/// or a bare date at midnight UTC.
pub(crate) fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
}

/// Rewrite every condition value as its field's declared type.
fn coerce_filter(filter: &mut Filter, paths: &BTreeMap<String, ResolvedPath>) -> Result<()> {
    match filter {
        Filter::And(children) | Filter::Or(children) => {
            children.iter_mut().try_for_each(|child| coerce_filter(child, paths))
        }
        Filter::Condition(c) => {
            let field_type = paths
                .get(c.field.trim())
                .map_or(FieldType::Unknown, |p| p.field_type);
            c.value = coerce_condition(&c.field, field_type, c.op, &c.value)?;
            Ok(())
        }
    }
}

fn coerce_condition(field: &str, field_type: FieldType, op: Operator, value: &Value) -> Result<Value> {
    match (op, value) {
        (Operator::Eq | Operator::Ne, Value::Null) => Ok(Value::Null),
        (Operator::Contains, Value::String(_)) => Ok(value.clone()),
        (Operator::Contains, Value::Number(_) | Value::Bool(_)) => Ok(Value::String(value.to_string())),
        (Operator::Contains, _) => Err(Error::InvalidDescriptor(format!(
            "`contains` on `{}` requires a string value",
            field
        ))),
        (Operator::In, Value::Array(items)) => items
            .iter()
            .map(|item| coerce_scalar(field, field_type, item))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        (Operator::In, _) => Err(Error::InvalidDescriptor(format!(
            "`in` on `{}` requires an array value",
            field
        ))),
        (_, value) => coerce_scalar(field, field_type, value),
    }
}

fn parse_number(text: &str) -> Option<Value> {
    let text = text.trim();
    if let Ok(i) = text.parse::<i64>() {
        return Some(Value::from(i));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn coerce_scalar(field: &str, field_type: FieldType, value: &Value) -> Result<Value> {
    let coerced = match (field_type, value) {
        (FieldType::Unknown | FieldType::Array | FieldType::Object, v) if !v.is_null() => {
            Some(v.clone())
        }
        (FieldType::Integer | FieldType::Float, Value::Number(_)) => Some(value.clone()),
        (FieldType::Integer | FieldType::Float, Value::String(s)) => parse_number(s),
        (FieldType::Boolean, Value::Bool(_)) => Some(value.clone()),
        (FieldType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        (FieldType::String, Value::String(_)) => Some(value.clone()),
        (FieldType::String, Value::Number(_) | Value::Bool(_)) => Some(Value::String(value.to_string())),
        (FieldType::Date, Value::String(s)) if parse_timestamp(s).is_some() => Some(value.clone()),
        _ => None,
    };
    coerced.ok_or_else(|| {
        Error::InvalidDescriptor(format!(
            "`{}` is {}; `{}` is not a valid value for it",
            field, field_type, value
        ))
    })
}

fn check_raw_query(descriptor: &QueryDescriptor, text: &str, policy: &Policy) -> Result<RawQuery> {
    if !policy.allow_raw_query {
        return Err(Error::UnsafeOperation("raw queries are disabled".into()));
    }
    if descriptor.filter.is_some()
        || !descriptor.projection.is_empty()
        || !descriptor.sort.is_empty()
        || !descriptor.aggregation.is_empty()
        || !descriptor.joins.is_empty()
    {
        return Err(Error::InvalidDescriptor(
            "raw_query cannot be combined with filter, projection, sort, aggregation or joins"
                .into(),
        ));
    }
    if let Some(keyword) = find_mutation_keyword(text) {
        return Err(Error::UnsafeOperation(format!(
            "raw query contains forbidden keyword `{}`",
            keyword
        )));
    }
    match policy.backend {
        BackendType::Relational => check_raw_sql(text).map(RawQuery::Sql),
        BackendType::Document => check_raw_pipeline(text).map(RawQuery::Pipeline),
    }
}

fn check_raw_sql(text: &str) -> Result<String> {
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, text)
        .map_err(|e| Error::InvalidDescriptor(format!("raw SQL does not parse: {}", e)))?;
    let [statement] = statements.as_slice() else {
        return Err(Error::UnsafeOperation(format!(
            "raw SQL must be exactly one statement, got {}",
            statements.len()
        )));
    };
    match statement {
        Statement::Query(query) if selects_into(&query.body) => Err(Error::UnsafeOperation(
            "raw SQL may not create a table with SELECT INTO".into(),
        )),
        Statement::Query(query) if query.locks.is_empty() => {
            Ok(text.trim().trim_end_matches(';').trim().to_string())
        }
        Statement::Query(_) => Err(Error::UnsafeOperation(
            "raw SQL may not take row locks".into(),
        )),
        _ => Err(Error::UnsafeOperation(
            "raw SQL must be a SELECT query".into(),
        )),
    }
}

fn selects_into(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_some(),
        SetExpr::Query(query) => selects_into(&query.body),
        SetExpr::SetOperation { left, right, .. } => selects_into(left) || selects_into(right),
        _ => false,
    }
}

fn check_raw_pipeline(text: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| Error::InvalidDescriptor(format!("raw pipeline is not JSON: {}", e)))?;
    let Value::Array(stages) = value else {
        return Err(Error::InvalidDescriptor(
            "raw pipeline must be an array of stages".into(),
        ));
    };
    for stage in &stages {
        if !stage.is_object() {
            return Err(Error::InvalidDescriptor(
                "raw pipeline stages must be objects".into(),
            ));
        }
        if let Some(key) = forbidden_key(stage) {
            return Err(Error::UnsafeOperation(format!(
                "raw pipeline uses forbidden operator `{}`",
                key
            )));
        }
    }
    Ok(stages)
}

pub(crate) fn forbidden_key(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) => map.iter().find_map(|(k, v)| {
            if FORBIDDEN_PIPELINE_KEYS.contains(&k.as_str()) {
                Some(k.as_str())
            } else {
                forbidden_key(v)
            }
        }),
        Value::Array(items) => items.iter().find_map(forbidden_key),
        _ => None,
    }
}
