//! Backend-neutral query descriptor.
//!
//! The descriptor is the JSON contract between the generator and the gate.
//! Predicate nodes and aggregation stages are closed sum types decoded from
//! `serde_json::Value`, so a malformed shape fails at decode time with a
//! message specific enough to hand back to the oracle.
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub primary_collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub projection: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sort: Vec<SortKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub aggregation: Vec<Stage>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub joins: Vec<JoinSpec>,
    /// Native query text, honoured only when the policy allows it.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "raw_query_text"
    )]
    pub raw_query: Option<String>,
}

impl QueryDescriptor {
    pub fn new(primary_collection: impl Into<String>) -> Self {
        Self {
            primary_collection: primary_collection.into(),
            filter: None,
            projection: Vec::new(),
            sort: Vec::new(),
            limit: None,
            aggregation: Vec::new(),
            joins: Vec::new(),
            raw_query: None,
        }
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Joins from `joins`, followed by join stages inside `aggregation`.
    pub fn all_joins(&self) -> impl Iterator<Item = &JoinSpec> {
        self.joins.iter().chain(self.aggregation.iter().filter_map(|s| match s {
            Stage::Join { join } => Some(join),
            Stage::Group { .. } => None,
        }))
    }

    pub fn group_stages(&self) -> impl Iterator<Item = (&[String], &BTreeMap<String, AggregateOp>)> {
        self.aggregation.iter().filter_map(|s| match s {
            Stage::Group {
                group_by,
                aggregations,
            } => Some((group_by.as_slice(), aggregations)),
            Stage::Join { .. } => None,
        })
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A raw pipeline may arrive as a JSON array rather than a string.
fn raw_query_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Contains,
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::In => "in",
            Operator::Contains => "contains",
        }
    }

    pub const ALL: [Operator; 8] = [
        Operator::Eq,
        Operator::Ne,
        Operator::Gt,
        Operator::Gte,
        Operator::Lt,
        Operator::Lte,
        Operator::In,
        Operator::Contains,
    ];
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s.trim().trim_start_matches('$').to_ascii_lowercase().as_str() {
            "eq" | "=" | "==" | "equals" => Operator::Eq,
            "ne" | "!=" | "<>" | "neq" | "not_equals" => Operator::Ne,
            "gt" | ">" => Operator::Gt,
            "gte" | ">=" | "ge" => Operator::Gte,
            "lt" | "<" => Operator::Lt,
            "lte" | "<=" | "le" => Operator::Lte,
            "in" => Operator::In,
            "contains" | "like" | "ilike" => Operator::Contains,
            _ => {
                return Err(format!(
                    "unsupported operator `{}` (allowed: eq, ne, gt, gte, lt, lte, in, contains)",
                    s
                ))
            }
        };
        Ok(op)
    }
}

impl<'de> Deserialize<'de> for Operator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Condition {
    pub field: String,
    pub op: Operator,
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }
}

/// Predicate tree. Serialized as `{"and": [..]}`, `{"or": [..]}` or a
/// `{field, op, value}` leaf.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Condition(Condition),
}

impl Filter {
    pub fn condition(field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Filter::Condition(Condition::new(field, op, value))
    }

    /// Every leaf, depth first.
    pub fn conditions(&self) -> Vec<&Condition> {
        fn walk<'a>(filter: &'a Filter, out: &mut Vec<&'a Condition>) {
            match filter {
                Filter::And(children) | Filter::Or(children) => {
                    for child in children {
                        walk(child, out);
                    }
                }
                Filter::Condition(c) => out.push(c),
            }
        }
        let mut out = Vec::new();
        walk(self, &mut out);
        out
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        match self {
            Filter::And(children) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("and", children)?;
                map.end()
            }
            Filter::Or(children) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("or", children)?;
                map.end()
            }
            Filter::Condition(c) => c.serialize(serializer),
        }
    }
}

fn group_children(key: &str, value: &Value) -> Result<Vec<Filter>, String> {
    let Value::Array(items) = value else {
        return Err(format!("`{}` must be an array of filter nodes", key));
    };
    if items.is_empty() {
        return Err(format!("`{}` needs at least one filter node", key));
    }
    items.iter().cloned().map(Filter::try_from).collect()
}

fn is_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}

impl TryFrom<Value> for Filter {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let obj = match value {
            // A bare list of nodes is an implicit conjunction.
            Value::Array(_) => {
                let mut children = group_children("filter", &value)?;
                return Ok(if children.len() == 1 {
                    children.remove(0)
                } else {
                    Filter::And(children)
                });
            }
            Value::Object(obj) => obj,
            other => {
                return Err(format!(
                    "filter node must be an object, got `{}`",
                    other
                ))
            }
        };

        for (key, value) in &obj {
            match key.to_ascii_lowercase().trim_start_matches('$') {
                "and" => return group_children("and", value).map(Filter::And),
                "or" => return group_children("or", value).map(Filter::Or),
                _ => {}
            }
        }

        let Some(field) = obj.get("field") else {
            let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
            return Err(format!(
                "filter node must be an and/or group or a {{field, op, value}} condition, got keys [{}]",
                keys.join(", ")
            ));
        };
        let Some(field) = field.as_str().filter(|f| !f.trim().is_empty()) else {
            return Err("condition `field` must be a non-empty string".into());
        };
        let op = obj
            .get("op")
            .or_else(|| obj.get("operator"))
            .and_then(Value::as_str)
            .ok_or_else(|| format!("condition on `{}` is missing `op`", field))?
            .parse::<Operator>()?;
        let value = obj
            .get("value")
            .cloned()
            .ok_or_else(|| format!("condition on `{}` is missing `value`", field))?;

        match (&op, &value) {
            (Operator::In, Value::Array(items)) => {
                if let Some(bad) = items.iter().find(|v| !is_scalar(v) || v.is_null()) {
                    return Err(format!(
                        "`in` values for `{}` must be scalars, got `{}`",
                        field, bad
                    ));
                }
            }
            (Operator::In, _) => {
                return Err(format!("`in` on `{}` requires an array value", field));
            }
            (Operator::Contains, Value::String(_)) => {}
            (Operator::Contains, _) => {
                return Err(format!("`contains` on `{}` requires a string value", field));
            }
            (Operator::Eq | Operator::Ne, Value::Null) => {}
            (_, Value::Null) => {
                return Err(format!("`{}` on `{}` cannot compare with null", op, field));
            }
            (_, v) if !is_scalar(v) => {
                return Err(format!(
                    "`{}` on `{}` requires a scalar value, got `{}`",
                    op, field, v
                ));
            }
            _ => {}
        }

        Ok(Filter::Condition(Condition {
            field: field.trim().to_string(),
            op,
            value,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    fn parse(value: &Value) -> Result<Self, String> {
        match value {
            Value::Number(n) if n.as_i64() == Some(1) => Ok(Direction::Asc),
            Value::Number(n) if n.as_i64() == Some(-1) => Ok(Direction::Desc),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "asc" | "ascending" | "up" => Ok(Direction::Asc),
                "desc" | "descending" | "down" => Ok(Direction::Desc),
                other => Err(format!("unknown sort direction `{}`", other)),
            },
            other => Err(format!("unknown sort direction `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct SortKey {
    pub field: String,
    pub direction: Direction,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }
}

impl TryFrom<Value> for SortKey {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(s) => match s.strip_prefix('-') {
                Some(field) => Ok(SortKey::desc(field)),
                None => Ok(SortKey::asc(s)),
            },
            Value::Array(pair) => match pair.as_slice() {
                [Value::String(field), direction] => Ok(SortKey {
                    field: field.clone(),
                    direction: Direction::parse(direction)?,
                }),
                _ => Err("sort pair must be [field, direction]".into()),
            },
            Value::Object(obj) => {
                if let Some(field) = obj.get("field").and_then(Value::as_str) {
                    let direction = match obj.get("direction").or_else(|| obj.get("order")) {
                        Some(d) => Direction::parse(d)?,
                        None => Direction::Asc,
                    };
                    return Ok(SortKey {
                        field: field.to_string(),
                        direction,
                    });
                }
                match obj.iter().next() {
                    Some((field, direction)) if obj.len() == 1 => Ok(SortKey {
                        field: field.clone(),
                        direction: Direction::parse(direction)?,
                    }),
                    _ => Err("sort key must be {field, direction}".into()),
                }
            }
            other => Err(format!("sort key must be an object, got `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOp {
    #[serde(alias = "average", alias = "mean")]
    Avg,
    #[serde(alias = "total")]
    Sum,
    Min,
    Max,
    Count,
}

impl AggregateOp {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateOp::Avg => "avg",
            AggregateOp::Sum => "sum",
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
            AggregateOp::Count => "count",
        }
    }
}

/// Column name produced by a group key.
pub fn group_key_name(path: &str) -> String {
    path.replace('.', "_")
}

/// Column name produced by an aggregate over `field`.
pub fn aggregate_name(op: AggregateOp, field: &str) -> String {
    if field == "*" {
        return "count".to_string();
    }
    format!("{}_{}", op.name(), field.replace('.', "_"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub collection: String,
    pub local_field: String,
    pub foreign_field: String,
    #[serde(default, alias = "as", skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl JoinSpec {
    pub fn new(
        collection: impl Into<String>,
        local_field: impl Into<String>,
        foreign_field: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            local_field: local_field.into(),
            foreign_field: foreign_field.into(),
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Name joined values are addressed by; the collection name when unset.
    pub fn alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.collection)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged, try_from = "Value")]
pub enum Stage {
    Join {
        join: JoinSpec,
    },
    Group {
        group_by: Vec<String>,
        aggregations: BTreeMap<String, AggregateOp>,
    },
}

impl TryFrom<Value> for Stage {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(mut obj) = value else {
            return Err("aggregation stage must be an object".into());
        };
        if let Some(join) = obj.remove("join").or_else(|| obj.remove("lookup")) {
            let join: JoinSpec =
                serde_json::from_value(join).map_err(|e| format!("invalid join stage: {}", e))?;
            return Ok(Stage::Join { join });
        }
        if !obj.contains_key("group_by") && !obj.contains_key("aggregations") {
            let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
            return Err(format!(
                "aggregation stage must be {{group_by, aggregations}} or {{join}}, got keys [{}]",
                keys.join(", ")
            ));
        }
        let group_by = match obj.remove("group_by").unwrap_or(Value::Null) {
            Value::Null => Vec::new(),
            Value::String(s) => vec![s],
            Value::Array(items) => items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => Ok(s),
                    other => Err(format!("group_by entries must be strings, got `{}`", other)),
                })
                .collect::<Result<_, _>>()?,
            other => return Err(format!("group_by must be a list of fields, got `{}`", other)),
        };
        let aggregations = match obj.remove("aggregations").unwrap_or(Value::Null) {
            Value::Null => BTreeMap::new(),
            value => serde_json::from_value(value)
                .map_err(|e| format!("invalid aggregations: {}", e))?,
        };
        if group_by.is_empty() && aggregations.is_empty() {
            return Err("group stage needs group_by fields or aggregations".into());
        }
        Ok(Stage::Group {
            group_by,
            aggregations,
        })
    }
}
