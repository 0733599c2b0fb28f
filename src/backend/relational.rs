//! PostgreSQL adapter.
//!
//! Every filter value is a bound parameter; identifiers come only from the
//! validated descriptor and are always quoted. Sessions run read-only with a
//! server-side `statement_timeout` as well as a client-side deadline.
use deadpool_postgres::Pool;
use serde_json::Value;
use std::fmt::Write as _;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_postgres::types::ToSql;
use tokio_postgres::{CancelToken, Row};

use super::{NativeQuery, QueryAdapter, Record};
use crate::config::Config;
use crate::db::{acquire, create_pool, map_pg_error, row_values, PgTls};
use crate::descriptor::{AggregateOp, Direction, Filter, Operator};
use crate::error::{Error, Result, Stage};
use crate::gate::{GroupStage, RawQuery, ResolvedPath, ValidatedDescriptor};
use crate::schema::FieldType;

/// A bound statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    BoolArray(Vec<bool>),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    TextArray(Vec<String>),
}

impl SqlParam {
    pub fn as_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            SqlParam::Bool(v) => v,
            SqlParam::Int(v) => v,
            SqlParam::Float(v) => v,
            SqlParam::Text(v) => v,
            SqlParam::BoolArray(v) => v,
            SqlParam::IntArray(v) => v,
            SqlParam::FloatArray(v) => v,
            SqlParam::TextArray(v) => v,
        }
    }
}

impl std::fmt::Display for SqlParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlParam::Bool(v) => write!(f, "{}", v),
            SqlParam::Int(v) => write!(f, "{}", v),
            SqlParam::Float(v) => write!(f, "{}", v),
            SqlParam::Text(v) => write!(f, "'{}'", v.replace('\'', "''")),
            SqlParam::BoolArray(v) => write!(f, "{:?}", v),
            SqlParam::IntArray(v) => write!(f, "{:?}", v),
            SqlParam::FloatArray(v) => write!(f, "{:?}", v),
            SqlParam::TextArray(v) => write!(f, "{:?}", v),
        }
    }
}

/// How result rows are read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    /// One `jsonb` object column per row.
    Json,
    /// Typed columns, read through the cell extractor.
    Columns,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
    pub shape: RowShape,
    /// Table named in `BackendNotFound` when the server does not say which.
    pub relation: String,
}

impl NativeQuery for SqlQuery {
    fn render(&self) -> String {
        let mut out = self.sql.clone();
        for (i, param) in self.params.iter().enumerate() {
            let _ = write!(out, "\n-- ${} = {}", i + 1, param);
        }
        out
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// How a value is compared or selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Integer,
    Float,
    Bool,
    Date,
    Text,
    Json,
}

impl Kind {
    fn of(field_type: FieldType) -> Self {
        match field_type {
            FieldType::Integer => Kind::Integer,
            FieldType::Float => Kind::Float,
            FieldType::Boolean => Kind::Bool,
            FieldType::Date => Kind::Date,
            FieldType::String | FieldType::Unknown => Kind::Text,
            FieldType::Array | FieldType::Object => Kind::Json,
        }
    }

    fn cast(self) -> &'static str {
        match self {
            Kind::Integer => "int8",
            Kind::Float => "float8",
            Kind::Bool => "boolean",
            Kind::Date => "timestamptz",
            Kind::Text => "text",
            Kind::Json => "jsonb",
        }
    }
}

struct Compiler<'a> {
    validated: &'a ValidatedDescriptor,
    params: Vec<SqlParam>,
}

pub(crate) fn compile(validated: &ValidatedDescriptor) -> Result<SqlQuery> {
    let mut compiler = Compiler {
        validated,
        params: Vec::new(),
    };
    let (sql, shape) = match validated.raw() {
        Some(RawQuery::Sql(raw)) => (compiler.raw(raw), RowShape::Json),
        Some(RawQuery::Pipeline(_)) => {
            return Err(Error::InvalidDescriptor(
                "a raw pipeline cannot run on the relational backend".into(),
            ))
        }
        None if validated.is_grouped() => (compiler.grouped()?, RowShape::Columns),
        None => compiler.find()?,
    };
    Ok(SqlQuery {
        sql,
        params: compiler.params,
        shape,
        relation: validated.primary_collection().to_string(),
    })
}

impl<'a> Compiler<'a> {
    fn bind(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }

    fn path(&self, path: &str) -> Result<&'a ResolvedPath> {
        self.validated.path(path.trim()).ok_or_else(|| Error::UnknownField {
            collection: self.validated.primary_collection().to_string(),
            path: path.to_string(),
        })
    }

    fn table_of(&self, path: &ResolvedPath) -> String {
        quote_ident(
            path.alias
                .as_deref()
                .unwrap_or(self.validated.primary_collection()),
        )
    }

    /// Expression for `path` read as `kind`. Top-level columns are left
    /// uncast unless compared as text, so indexes stay usable.
    fn expr(&self, path: &ResolvedPath, kind: Kind) -> String {
        let table = self.table_of(path);
        let Some((column, nested)) = path.segments.split_first() else {
            return format!("to_jsonb({}.*)", table);
        };
        let column = format!("{}.{}", table, quote_ident(column));
        let Some((last, parents)) = nested.split_last() else {
            return match kind {
                Kind::Text => format!("{}::text", column),
                Kind::Json => format!("to_jsonb({})", column),
                _ => column,
            };
        };
        let mut chain = column;
        for parent in parents {
            let _ = write!(chain, "->{}", quote_literal(parent));
        }
        match kind {
            Kind::Json => format!("({}->{})", chain, quote_literal(last)),
            Kind::Text => format!("({}->>{})", chain, quote_literal(last)),
            other => format!("({}->>{})::{}", chain, quote_literal(last), other.cast()),
        }
    }

    /// Select-list expression, cast to the declared type so the cell
    /// extractor sees a known column type.
    fn select_expr(&self, path: &ResolvedPath) -> String {
        let kind = Kind::of(path.field_type);
        let expr = self.expr(path, kind);
        if path.segments.len() == 1 && matches!(kind, Kind::Integer | Kind::Float | Kind::Bool | Kind::Date) {
            format!("{}::{}", expr, kind.cast())
        } else {
            expr
        }
    }

    fn from_clause(&self) -> String {
        let primary = self.validated.primary_collection();
        let mut out = format!("FROM {}", quote_ident(primary));
        for join in self.validated.joins() {
            let local = ResolvedPath {
                alias: (join.from != primary).then(|| join.from.clone()),
                segments: join.local_path.split('.').map(str::to_string).collect(),
                field_type: FieldType::Unknown,
            };
            let foreign = ResolvedPath {
                alias: Some(join.alias.clone()),
                segments: join.foreign_field.split('.').map(str::to_string).collect(),
                field_type: FieldType::Unknown,
            };
            // Plain columns compare as declared; a nested side forces text.
            let nested = local.segments.len() > 1 || foreign.segments.len() > 1;
            let kind = if nested { Kind::Text } else { Kind::Integer };
            let (lhs, rhs) = (self.expr(&foreign, kind), self.expr(&local, kind));
            let _ = write!(
                out,
                " LEFT JOIN {} AS {} ON {} = {}",
                quote_ident(&join.collection),
                quote_ident(&join.alias),
                lhs,
                rhs
            );
        }
        out
    }

    fn where_clause(&mut self) -> Result<String> {
        match self.validated.filter() {
            Some(filter) => Ok(format!(" WHERE {}", self.filter(filter)?)),
            None => Ok(String::new()),
        }
    }

    fn filter(&mut self, filter: &Filter) -> Result<String> {
        match filter {
            Filter::And(children) | Filter::Or(children) if children.is_empty() => {
                Ok(if matches!(filter, Filter::And(_)) { "TRUE" } else { "FALSE" }.to_string())
            }
            Filter::And(children) | Filter::Or(children) => {
                let joiner = if matches!(filter, Filter::And(_)) { " AND " } else { " OR " };
                let parts = children
                    .iter()
                    .map(|child| self.filter(child))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("({})", parts.join(joiner)))
            }
            Filter::Condition(c) => {
                let path = self.path(&c.field)?;
                self.condition(path, c.op, &c.value)
            }
        }
    }

    fn condition(&mut self, path: &ResolvedPath, op: Operator, value: &Value) -> Result<String> {
        let field_type = path.field_type;
        match (op, value) {
            (Operator::Eq, Value::Null) => Ok(format!("{} IS NULL", self.expr(path, Kind::Text))),
            (Operator::Ne, Value::Null) => Ok(format!("{} IS NOT NULL", self.expr(path, Kind::Text))),
            (Operator::Contains, Value::String(s)) => {
                let lhs = self.expr(path, Kind::Text);
                let placeholder = self.bind(SqlParam::Text(format!("%{}%", escape_like(s))));
                Ok(format!("{} ILIKE {}::text", lhs, placeholder))
            }
            (Operator::In, Value::Array(items)) if items.is_empty() => Ok("FALSE".to_string()),
            (Operator::In, Value::Array(items)) => {
                let (kind, param) = array_param(items, field_type)?;
                let lhs = self.expr(path, kind);
                let placeholder = self.bind(param);
                let cast = match kind {
                    Kind::Date => "::text[]::timestamptz[]".to_string(),
                    other => format!("::{}[]", other.cast()),
                };
                Ok(format!("{} = ANY({}{})", lhs, placeholder, cast))
            }
            (op, value) => {
                let (kind, param) = scalar_param(value, field_type)?;
                let lhs = self.expr(path, kind);
                let placeholder = self.bind(param);
                let rhs = match kind {
                    Kind::Date => format!("{}::text::timestamptz", placeholder),
                    other => format!("{}::{}", placeholder, other.cast()),
                };
                let sql_op = match op {
                    Operator::Eq => "=",
                    Operator::Ne => "IS DISTINCT FROM",
                    Operator::Gt => ">",
                    Operator::Gte => ">=",
                    Operator::Lt => "<",
                    Operator::Lte => "<=",
                    Operator::In | Operator::Contains => {
                        return Err(Error::InvalidDescriptor(format!(
                            "`{}` has an invalid value",
                            op
                        )))
                    }
                };
                Ok(format!("{} {} {}", lhs, sql_op, rhs))
            }
        }
    }

    fn order_by(&self, grouped: bool) -> Result<String> {
        let sort = self.validated.sort();
        if sort.is_empty() {
            return Ok(String::new());
        }
        let mut keys = Vec::with_capacity(sort.len());
        for key in sort {
            let expr = if grouped {
                format!("\"result\".{}", quote_ident(key.field.trim()))
            } else {
                self.select_expr(self.path(&key.field)?)
            };
            let direction = match key.direction {
                Direction::Asc => "ASC",
                Direction::Desc => "DESC",
            };
            keys.push(format!("{} {}", expr, direction));
        }
        Ok(format!(" ORDER BY {}", keys.join(", ")))
    }

    fn limit(&mut self) -> String {
        let placeholder = self.bind(SqlParam::Int(i64::from(self.validated.limit())));
        format!(" LIMIT {}::int8", placeholder)
    }

    fn find(&mut self) -> Result<(String, RowShape)> {
        let (select, shape) = if self.validated.projection().is_empty() {
            let primary = quote_ident(self.validated.primary_collection());
            let mut row = format!("to_jsonb({}.*)", primary);
            if !self.validated.joins().is_empty() {
                let pairs: Vec<String> = self
                    .validated
                    .joins()
                    .iter()
                    .map(|j| format!("{}, to_jsonb({}.*)", quote_literal(&j.alias), quote_ident(&j.alias)))
                    .collect();
                let _ = write!(row, " || jsonb_build_object({})", pairs.join(", "));
            }
            (format!("{} AS \"_row\"", row), RowShape::Json)
        } else {
            let mut columns = Vec::new();
            for path in self.validated.projection() {
                let resolved = self.path(path)?;
                columns.push(format!("{} AS {}", self.select_expr(resolved), quote_ident(path.trim())));
            }
            (columns.join(", "), RowShape::Columns)
        };
        let from = self.from_clause();
        let filter = self.where_clause()?;
        let order = self.order_by(false)?;
        let limit = self.limit();
        Ok((format!("SELECT {} {}{}{}{}", select, from, filter, order, limit), shape))
    }

    fn grouped(&mut self) -> Result<String> {
        let groups = self.validated.groups();
        let mut inner = String::new();
        for group in groups {
            inner = if group.index == 0 {
                self.first_group(group)?
            } else {
                let source = format!("({}) AS \"s{}\"", inner, group.index);
                later_group(group, &source)
            };
        }

        let select = if self.validated.projection().is_empty() {
            "*".to_string()
        } else {
            self.validated
                .projection()
                .iter()
                .map(|p| format!("\"result\".{}", quote_ident(p.trim())))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let order = self.order_by(true)?;
        let limit = self.limit();
        Ok(format!("SELECT {} FROM ({}) AS \"result\"{}{}", select, inner, order, limit))
    }

    fn first_group(&mut self, group: &GroupStage) -> Result<String> {
        let mut columns = Vec::new();
        let mut keys = Vec::new();
        for key in &group.keys {
            let expr = self.select_expr(self.path(&key.source)?);
            columns.push(format!("{} AS {}", expr, quote_ident(&key.name)));
            keys.push(expr);
        }
        for agg in &group.aggregates {
            let expr = if agg.source == "*" {
                "count(*)".to_string()
            } else {
                let path = self.path(&agg.source)?;
                match agg.op {
                    AggregateOp::Sum | AggregateOp::Avg => {
                        let input = match path.segments.len() {
                            1 => format!("{}::float8", self.expr(path, Kind::Float)),
                            _ => self.expr(path, Kind::Float),
                        };
                        format!("{}({})::float8", agg.op.name(), input)
                    }
                    AggregateOp::Count => format!("count({})", self.expr(path, Kind::Text)),
                    AggregateOp::Min | AggregateOp::Max => {
                        format!("{}({})", agg.op.name(), self.select_expr(path))
                    }
                }
            };
            columns.push(format!("{} AS {}", expr, quote_ident(&agg.name)));
        }
        let from = self.from_clause();
        let filter = self.where_clause()?;
        let mut sql = format!("SELECT {} {}{}", columns.join(", "), from, filter);
        if !keys.is_empty() {
            let _ = write!(sql, " GROUP BY {}", keys.join(", "));
        }
        Ok(sql)
    }

    fn raw(&mut self, raw: &str) -> String {
        let limit = self.limit();
        format!("SELECT to_jsonb(\"raw\".*) AS \"_row\" FROM ({}) AS \"raw\"{}", raw, limit)
    }
}

/// A stage reading the previous stage's output columns.
fn later_group(group: &GroupStage, source: &str) -> String {
    let mut columns = Vec::new();
    let mut keys = Vec::new();
    for key in &group.keys {
        let column = quote_ident(&key.source);
        columns.push(format!("{} AS {}", column, quote_ident(&key.name)));
        keys.push(column);
    }
    for agg in &group.aggregates {
        let expr = match (agg.op, agg.source.as_str()) {
            (_, "*") => "count(*)".to_string(),
            (AggregateOp::Sum | AggregateOp::Avg, source) => {
                format!("{}({}::float8)::float8", agg.op.name(), quote_ident(source))
            }
            (op, source) => format!("{}({})", op.name(), quote_ident(source)),
        };
        columns.push(format!("{} AS {}", expr, quote_ident(&agg.name)));
    }
    let mut sql = format!("SELECT {} FROM {}", columns.join(", "), source);
    if !keys.is_empty() {
        let _ = write!(sql, " GROUP BY {}", keys.join(", "));
    }
    sql
}

/// `%` and `_` are literal inside a `contains` needle.
fn escape_like(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len());
    for c in needle.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn mismatch(value: &Value, field_type: FieldType) -> Error {
    Error::InvalidDescriptor(format!("`{}` is not a valid {} value", value, field_type))
}

fn number_param(n: &serde_json::Number) -> Result<(Kind, SqlParam)> {
    match n.as_i64() {
        Some(i) => Ok((Kind::Integer, SqlParam::Int(i))),
        None => n
            .as_f64()
            .map(|f| (Kind::Float, SqlParam::Float(f)))
            .ok_or_else(|| Error::InvalidDescriptor(format!("number `{}` is out of range", n))),
    }
}

/// Bind `value` as the declared `field_type`. Fields without a scalar
/// declaration fall back to the literal's own type.
fn scalar_param(value: &Value, field_type: FieldType) -> Result<(Kind, SqlParam)> {
    match (field_type, value) {
        (FieldType::Float, Value::Number(n)) => n
            .as_f64()
            .map(|f| (Kind::Float, SqlParam::Float(f)))
            .ok_or_else(|| mismatch(value, field_type)),
        // A fractional bound on an integer column compares as float8.
        (FieldType::Integer, Value::Number(n)) => number_param(n),
        (FieldType::Boolean, Value::Bool(b)) => Ok((Kind::Bool, SqlParam::Bool(*b))),
        (FieldType::Date, Value::String(s)) => Ok((Kind::Date, SqlParam::Text(s.clone()))),
        (FieldType::String, Value::String(s)) => Ok((Kind::Text, SqlParam::Text(s.clone()))),
        (FieldType::Unknown | FieldType::Array | FieldType::Object, value) => match value {
            Value::Bool(b) => Ok((Kind::Bool, SqlParam::Bool(*b))),
            Value::Number(n) => number_param(n),
            Value::String(s) => Ok((Kind::Text, SqlParam::Text(s.clone()))),
            other => Err(Error::InvalidDescriptor(format!(
                "cannot bind `{}` as a parameter",
                other
            ))),
        },
        (field_type, value) => Err(mismatch(value, field_type)),
    }
}

fn texts(items: &[Value]) -> Option<Vec<String>> {
    items.iter().map(|v| v.as_str().map(str::to_string)).collect()
}

fn array_param(items: &[Value], field_type: FieldType) -> Result<(Kind, SqlParam)> {
    let ints = || items.iter().map(Value::as_i64).collect::<Option<Vec<_>>>();
    let floats = || items.iter().map(Value::as_f64).collect::<Option<Vec<_>>>();
    let bools = || items.iter().map(Value::as_bool).collect::<Option<Vec<_>>>();
    let bound = match field_type {
        FieldType::Float => floats().map(|v| (Kind::Float, SqlParam::FloatArray(v))),
        FieldType::Integer => ints()
            .map(|v| (Kind::Integer, SqlParam::IntArray(v)))
            .or_else(|| floats().map(|v| (Kind::Float, SqlParam::FloatArray(v)))),
        FieldType::Boolean => bools().map(|v| (Kind::Bool, SqlParam::BoolArray(v))),
        FieldType::Date => texts(items).map(|v| (Kind::Date, SqlParam::TextArray(v))),
        FieldType::String => texts(items).map(|v| (Kind::Text, SqlParam::TextArray(v))),
        FieldType::Unknown | FieldType::Array | FieldType::Object => Some(
            bools()
                .map(|v| (Kind::Bool, SqlParam::BoolArray(v)))
                .or_else(|| ints().map(|v| (Kind::Integer, SqlParam::IntArray(v))))
                .or_else(|| floats().map(|v| (Kind::Float, SqlParam::FloatArray(v))))
                .unwrap_or_else(|| {
                    let all = items
                        .iter()
                        .map(|v| match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect();
                    (Kind::Text, SqlParam::TextArray(all))
                }),
        ),
    };
    bound.ok_or_else(|| mismatch(&Value::Array(items.to_vec()), field_type))
}

/// Cancels the server-side statement if dropped while armed.
struct CancelOnDrop {
    token: Option<CancelToken>,
    tls: PgTls,
}

impl CancelOnDrop {
    fn arm(token: CancelToken, tls: PgTls) -> Self {
        Self {
            token: Some(token),
            tls,
        }
    }

    fn disarm(mut self) {
        self.token = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let tls = self.tls.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            tracing::debug!(stage = "execute", "cancelling in-flight statement");
            handle.spawn(async move { tls.cancel(token).await });
        }
    }
}

/// Relational backend over a shared connection pool.
#[derive(Debug, Clone)]
pub struct RelationalAdapter {
    pool: Pool,
    tls: PgTls,
}

impl RelationalAdapter {
    pub fn new(pool: Pool, tls: PgTls) -> Self {
        Self { pool, tls }
    }

    pub fn connect(config: &Config) -> Result<Self> {
        let (pool, tls) = create_pool(config)?;
        Ok(Self::new(pool, tls))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn run_query(&self, query: &SqlQuery, timeout: Duration) -> Result<Vec<Record>> {
        let started = Instant::now();
        let client = acquire(&self.pool, timeout).await?;
        let remaining = timeout.saturating_sub(started.elapsed()).max(Duration::from_millis(1));
        let setup = format!(
            "SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY; SET statement_timeout = {}",
            remaining.as_millis().max(1)
        );

        let params: Vec<&(dyn ToSql + Sync)> = query.params.iter().map(SqlParam::as_sql).collect();
        let guard = CancelOnDrop::arm(client.cancel_token(), self.tls.clone());
        let outcome = within(
            remaining,
            client.batch_execute(&setup),
            client.query(query.sql.as_str(), &params),
        )
        .await;
        let rows = match outcome {
            None => return Err(Error::timeout(Stage::Execute, timeout)),
            Some(result) => {
                guard.disarm();
                result.map_err(|e| map_pg_error(&e, &query.relation, timeout))?
            }
        };
        Ok(rows.iter().map(|row| read_row(row, query.shape)).collect())
    }
}

/// Session setup then the statement, both under `deadline`; `None` when it
/// elapsed.
async fn within<S, Q, T>(
    deadline: Duration,
    setup: S,
    query: Q,
) -> Option<std::result::Result<T, tokio_postgres::Error>>
where
    S: Future<Output = std::result::Result<(), tokio_postgres::Error>>,
    Q: Future<Output = std::result::Result<T, tokio_postgres::Error>>,
{
    let work = async {
        setup.await?;
        query.await
    };
    tokio::time::timeout(deadline, work).await.ok()
}

fn read_row(row: &Row, shape: RowShape) -> Record {
    if shape == RowShape::Json {
        if let Ok(Value::Object(map)) = row.try_get::<_, Value>(0) {
            return Record::Json(map);
        }
    }
    Record::Row(row_values(row))
}

impl QueryAdapter for RelationalAdapter {
    type Compiled = SqlQuery;

    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn compile(&self, validated: &ValidatedDescriptor) -> Result<SqlQuery> {
        compile(validated)
    }

    fn run(
        &self,
        compiled: &SqlQuery,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<Record>>> + Send {
        self.run_query(compiled, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendType;
    use crate::descriptor::{JoinSpec, QueryDescriptor, SortKey, Stage};
    use crate::gate::{validate, Policy};
    use crate::testing::fixtures;
    use serde_json::json;

    fn policy() -> Policy {
        Policy {
            backend: BackendType::Relational,
            default_limit: 100,
            max_limit: 10_000,
            allow_raw_query: true,
        }
    }

    fn compiled(d: QueryDescriptor) -> SqlQuery {
        let v = validate(d, &fixtures::shop_schema(), &policy()).unwrap();
        compile(&v).unwrap()
    }

    #[test]
    fn test_scenario_a_binds_every_value() {
        let mut d = QueryDescriptor::new("orders");
        d.filter = Some(Filter::And(vec![
            Filter::condition("status", Operator::Eq, "open"),
            Filter::condition("amount", Operator::Gt, 100),
        ]));
        d.limit = Some(100);
        let q = compiled(d);
        assert_eq!(
            q.sql,
            "SELECT to_jsonb(\"orders\".*) AS \"_row\" FROM \"orders\" \
             WHERE (\"orders\".\"status\"::text = $1::text AND \"orders\".\"amount\" > $2::float8) \
             LIMIT $3::int8"
        );
        assert_eq!(
            q.params,
            vec![
                SqlParam::Text("open".into()),
                SqlParam::Float(100.0),
                SqlParam::Int(100)
            ]
        );
        assert_eq!(q.shape, RowShape::Json);
        assert!(!q.sql.contains("'open'"));
    }

    #[test]
    fn test_join_becomes_left_join_on_declared_fields() {
        let mut d = QueryDescriptor::new("orders");
        d.joins.push(JoinSpec::new("users", "user_id", "id").with_alias("customer"));
        d.filter = Some(Filter::condition("customer.email", Operator::Contains, "50%_off"));
        d.projection = vec!["id".into(), "customer.email".into()];
        d.sort = vec![SortKey::desc("id")];
        let q = compiled(d);
        assert!(q.sql.contains(
            "FROM \"orders\" LEFT JOIN \"users\" AS \"customer\" ON \"customer\".\"id\" = \"orders\".\"user_id\""
        ));
        assert!(q.sql.contains("\"customer\".\"email\"::text ILIKE $1::text"));
        assert!(q.sql.contains("\"orders\".\"id\"::int8 AS \"id\""));
        assert!(q.sql.contains("AS \"customer.email\""));
        assert!(q.sql.contains("ORDER BY \"orders\".\"id\"::int8 DESC"));
        assert_eq!(q.params[0], SqlParam::Text("%50\\%\\_off%".into()));
        assert_eq!(q.shape, RowShape::Columns);
    }

    #[test]
    fn test_find_without_projection_embeds_joined_rows() {
        let mut d = QueryDescriptor::new("orders");
        d.joins.push(JoinSpec::new("users", "user_id", "id"));
        let q = compiled(d);
        assert!(q.sql.starts_with(
            "SELECT to_jsonb(\"orders\".*) || jsonb_build_object('users', to_jsonb(\"users\".*)) AS \"_row\""
        ));
    }

    #[test]
    fn test_group_by_with_aggregates() {
        let mut d = QueryDescriptor::new("orders");
        d.aggregation.push(Stage::Group {
            group_by: vec!["status".into()],
            aggregations: [
                ("amount".to_string(), AggregateOp::Avg),
                ("*".to_string(), AggregateOp::Count),
            ]
            .into_iter()
            .collect(),
        });
        d.sort = vec![SortKey::desc("count")];
        d.limit = Some(5);
        let q = compiled(d);
        assert_eq!(
            q.sql,
            "SELECT * FROM (SELECT \"orders\".\"status\"::text AS \"status\", count(*) AS \"count\", \
             avg(\"orders\".\"amount\"::float8)::float8 AS \"avg_amount\" FROM \"orders\" \
             GROUP BY \"orders\".\"status\"::text) AS \"result\" ORDER BY \"result\".\"count\" DESC LIMIT $1::int8"
        );
        assert_eq!(q.params, vec![SqlParam::Int(5)]);
    }

    #[test]
    fn test_second_group_nests_first() {
        let mut d = QueryDescriptor::new("orders");
        d.aggregation.push(Stage::Group {
            group_by: vec!["status".into()],
            aggregations: [("amount".to_string(), AggregateOp::Sum)].into_iter().collect(),
        });
        d.aggregation.push(Stage::Group {
            group_by: vec![],
            aggregations: [("sum_amount".to_string(), AggregateOp::Max)].into_iter().collect(),
        });
        let q = compiled(d);
        assert!(q.sql.contains(
            "SELECT max(\"sum_amount\") AS \"max_sum_amount\" FROM (SELECT \"orders\".\"status\"::text"
        ));
        assert!(q.sql.contains(") AS \"s1\") AS \"result\""));
    }

    #[test]
    fn test_in_null_and_ne() {
        let mut d = QueryDescriptor::new("orders");
        d.filter = Some(Filter::Or(vec![
            Filter::condition("status", Operator::In, json!(["open", "closed"])),
            Filter::condition("user_id", Operator::Eq, Value::Null),
            Filter::condition("amount", Operator::Ne, 2.5),
        ]));
        let q = compiled(d);
        assert!(q.sql.contains("\"orders\".\"status\"::text = ANY($1::text[])"));
        assert!(q.sql.contains("\"orders\".\"user_id\"::text IS NULL"));
        assert!(q.sql.contains("\"orders\".\"amount\" IS DISTINCT FROM $2::float8"));
        assert_eq!(
            q.params[0],
            SqlParam::TextArray(vec!["open".into(), "closed".into()])
        );
        assert_eq!(q.params[1], SqlParam::Float(2.5));
    }

    #[test]
    fn test_values_bind_as_declared_type() {
        let mut d = QueryDescriptor::new("orders");
        d.filter = Some(Filter::And(vec![
            Filter::condition("amount", Operator::Gt, "100"),
            Filter::condition("status", Operator::Eq, 5),
            Filter::condition("status", Operator::In, json!([5, "open"])),
            Filter::condition("totals.net", Operator::Gt, 100),
            Filter::condition("user_id", Operator::Lt, 2.5),
        ]));
        let q = compiled(d);
        assert!(q.sql.contains("\"orders\".\"amount\" > $1::float8"));
        assert!(q.sql.contains("\"orders\".\"status\"::text = $2::text"));
        assert!(q.sql.contains("\"orders\".\"status\"::text = ANY($3::text[])"));
        assert!(q.sql.contains("(\"orders\".\"totals\"->>'net')::float8 > $4::float8"));
        assert!(q.sql.contains("\"orders\".\"user_id\" < $5::float8"));
        assert!(!q.sql.contains("int8 >") && !q.sql.contains("::int8[]"));
        assert_eq!(
            q.params[..5],
            [
                SqlParam::Float(100.0),
                SqlParam::Text("5".into()),
                SqlParam::TextArray(vec!["5".into(), "open".into()]),
                SqlParam::Float(100.0),
                SqlParam::Float(2.5),
            ]
        );
    }

    #[test]
    fn test_integer_in_list_binds_int_array() {
        let mut d = QueryDescriptor::new("orders");
        d.filter = Some(Filter::condition("user_id", Operator::In, json!([1, "2"])));
        let q = compiled(d);
        assert!(q.sql.contains("\"orders\".\"user_id\" = ANY($1::int8[])"));
        assert_eq!(q.params[0], SqlParam::IntArray(vec![1, 2]));
    }

    #[test]
    fn test_param_kinds_follow_field_type() {
        assert_eq!(
            scalar_param(&json!(3), FieldType::Float).unwrap(),
            (Kind::Float, SqlParam::Float(3.0))
        );
        assert_eq!(
            scalar_param(&json!(3), FieldType::Unknown).unwrap(),
            (Kind::Integer, SqlParam::Int(3))
        );
        assert!(matches!(
            scalar_param(&json!(3), FieldType::String),
            Err(Error::InvalidDescriptor(_))
        ));
        assert_eq!(
            array_param(&[json!(1), json!(2)], FieldType::Float).unwrap(),
            (Kind::Float, SqlParam::FloatArray(vec![1.0, 2.0]))
        );
        assert!(array_param(&[json!("a")], FieldType::Integer).is_err());
    }

    #[tokio::test]
    async fn test_session_setup_shares_the_deadline() {
        let stalled_setup = std::future::pending::<std::result::Result<(), tokio_postgres::Error>>();
        let query = async { Ok::<_, tokio_postgres::Error>(7) };
        assert!(within(Duration::from_millis(20), stalled_setup, query).await.is_none());

        let setup = async { Ok::<_, tokio_postgres::Error>(()) };
        let query = async { Ok::<_, tokio_postgres::Error>(7) };
        assert!(matches!(
            within(Duration::from_secs(5), setup, query).await,
            Some(Ok(7))
        ));
    }

    #[test]
    fn test_date_and_nested_paths() {
        let mut d = QueryDescriptor::new("orders");
        d.filter = Some(Filter::And(vec![
            Filter::condition("placed_at", Operator::Gte, "2024-01-01T00:00:00Z"),
            Filter::condition("shipping.city", Operator::Eq, "Oslo"),
        ]));
        d.projection = vec!["shipping.city".into()];
        let q = compiled(d);
        assert!(q.sql.contains("\"orders\".\"placed_at\" >= $1::text::timestamptz"));
        assert!(q.sql.contains("(\"orders\".\"shipping\"->>'city') = $2::text"));
        assert!(q.sql.contains("(\"orders\".\"shipping\"->>'city') AS \"shipping.city\""));
    }

    #[test]
    fn test_raw_sql_is_wrapped_and_limited() {
        let mut d = QueryDescriptor::new("orders");
        d.raw_query = Some("SELECT status FROM orders;".into());
        d.limit = Some(50_000);
        let q = compiled(d);
        assert_eq!(
            q.sql,
            "SELECT to_jsonb(\"raw\".*) AS \"_row\" FROM (SELECT status FROM orders) AS \"raw\" LIMIT $1::int8"
        );
        assert_eq!(q.params, vec![SqlParam::Int(10_000)]);
    }

    #[test]
    fn test_render_lists_params() {
        let mut d = QueryDescriptor::new("orders");
        d.filter = Some(Filter::condition("status", Operator::Eq, "it's"));
        let rendered = compiled(d).render();
        assert!(rendered.contains("-- $1 = 'it''s'"));
        assert!(rendered.contains("-- $2 = 100"));
    }

    #[test]
    fn test_identifiers_are_quoted() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(escape_like("a\\b"), "a\\\\b");
    }
}
