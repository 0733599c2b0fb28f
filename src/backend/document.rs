//! MongoDB adapter.
//!
//! Plain descriptors compile to `find`; joins and group stages compile to an
//! aggregation pipeline in descriptor order.
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::options::ClientOptions;
use mongodb::Client;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

use super::{NativeQuery, QueryAdapter, Record};
use crate::config::Config;
use crate::descriptor::{AggregateOp, Direction, Filter, Operator};
use crate::error::{Error, Result, Stage};
use crate::gate::{parse_timestamp, GroupStage, RawQuery, ValidatedDescriptor};
use crate::schema::FieldType;

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOp {
    Find {
        filter: Document,
        projection: Option<Document>,
        sort: Option<Document>,
        limit: i64,
    },
    Aggregate {
        pipeline: Vec<Document>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentQuery {
    pub collection: String,
    /// Every collection the query reads, checked for existence first.
    pub collections: Vec<String>,
    pub op: DocumentOp,
}

fn to_json_text(document: &Document) -> String {
    Bson::Document(document.clone())
        .into_relaxed_extjson()
        .to_string()
}

impl NativeQuery for DocumentQuery {
    fn render(&self) -> String {
        match &self.op {
            DocumentOp::Find {
                filter,
                projection,
                sort,
                limit,
            } => {
                let mut out = format!("db.{}.find({}", self.collection, to_json_text(filter));
                if let Some(p) = projection {
                    out.push_str(", ");
                    out.push_str(&to_json_text(p));
                }
                out.push(')');
                if let Some(s) = sort {
                    out.push_str(&format!(".sort({})", to_json_text(s)));
                }
                out.push_str(&format!(".limit({})", limit));
                out
            }
            DocumentOp::Aggregate { pipeline } => {
                let stages: Vec<String> = pipeline.iter().map(to_json_text).collect();
                format!("db.{}.aggregate([{}])", self.collection, stages.join(", "))
            }
        }
    }
}

pub(crate) fn compile(validated: &ValidatedDescriptor) -> Result<DocumentQuery> {
    let collection = validated.primary_collection().to_string();
    let collections = validated.collections_involved();
    let limit = i64::from(validated.limit());

    if let Some(raw) = validated.raw() {
        let RawQuery::Pipeline(stages) = raw else {
            return Err(Error::InvalidDescriptor(
                "raw SQL cannot run on the document backend".into(),
            ));
        };
        let mut pipeline = Vec::with_capacity(stages.len() + 1);
        for stage in stages {
            match Bson::try_from(stage.clone()) {
                Ok(Bson::Document(d)) => pipeline.push(d),
                Ok(_) => {
                    return Err(Error::InvalidDescriptor(
                        "raw pipeline stages must be objects".into(),
                    ))
                }
                Err(e) => {
                    return Err(Error::InvalidDescriptor(format!(
                        "raw pipeline stage is not valid extended JSON: {}",
                        e
                    )))
                }
            }
        }
        pipeline.push(doc! { "$limit": limit });
        return Ok(DocumentQuery {
            collection,
            collections,
            op: DocumentOp::Aggregate { pipeline },
        });
    }

    let filter = match validated.filter() {
        Some(f) => filter_document(f, validated),
        None => Document::new(),
    };
    let sort = sort_document(validated);
    let projection = projection_document(validated.projection());

    if validated.joins().is_empty() && !validated.is_grouped() {
        return Ok(DocumentQuery {
            collection,
            collections,
            op: DocumentOp::Find {
                filter,
                projection,
                sort,
                limit,
            },
        });
    }

    let mut pipeline = Vec::new();
    // A filter that reads joined values has to wait for the lookups.
    let reads_joined = validated.filter().is_some_and(|f| {
        f.conditions().iter().any(|c| {
            validated
                .path(&c.field)
                .is_some_and(|p| p.alias.is_some())
        })
    });
    let filter_stage = (!filter.is_empty()).then(|| doc! { "$match": filter });
    if !reads_joined {
        pipeline.extend(filter_stage.clone());
    }
    for join in validated.joins() {
        let local = if join.from == validated.primary_collection() {
            join.local_path.clone()
        } else {
            format!("{}.{}", join.from, join.local_path)
        };
        pipeline.push(doc! {
            "$lookup": {
                "from": join.collection.as_str(),
                "localField": local,
                "foreignField": join.foreign_field.as_str(),
                "as": join.alias.as_str(),
            }
        });
        if join.cardinality.is_single() {
            pipeline.push(doc! {
                "$unwind": {
                    "path": format!("${}", join.alias),
                    "preserveNullAndEmptyArrays": true,
                }
            });
        }
    }
    if reads_joined {
        pipeline.extend(filter_stage);
    }
    for group in validated.groups() {
        pipeline.extend(group_stages(group));
    }
    if let Some(sort) = sort {
        pipeline.push(doc! { "$sort": sort });
    }
    if let Some(projection) = projection {
        pipeline.push(doc! { "$project": projection });
    }
    pipeline.push(doc! { "$limit": limit });

    Ok(DocumentQuery {
        collection,
        collections,
        op: DocumentOp::Aggregate { pipeline },
    })
}

fn filter_document(filter: &Filter, validated: &ValidatedDescriptor) -> Document {
    match filter {
        Filter::And(children) if children.is_empty() => Document::new(),
        Filter::Or(children) if children.is_empty() => doc! { "$expr": false },
        Filter::And(children) | Filter::Or(children) => {
            let key = if matches!(filter, Filter::And(_)) { "$and" } else { "$or" };
            let nodes: Vec<Bson> = children
                .iter()
                .map(|c| Bson::Document(filter_document(c, validated)))
                .collect();
            let mut out = Document::new();
            out.insert(key, nodes);
            out
        }
        Filter::Condition(c) => {
            let field_type = validated
                .path(&c.field)
                .map_or(FieldType::Unknown, |p| p.field_type);
            let predicate = match (c.op, &c.value) {
                (Operator::Contains, Value::String(needle)) => doc! {
                    "$regex": regex::escape(needle),
                    "$options": "i",
                },
                (op, value) => {
                    let mut d = Document::new();
                    d.insert(operator_key(op), to_bson(value, field_type));
                    d
                }
            };
            let mut out = Document::new();
            out.insert(c.field.as_str(), predicate);
            out
        }
    }
}

fn operator_key(op: Operator) -> &'static str {
    match op {
        Operator::Eq => "$eq",
        Operator::Ne => "$ne",
        Operator::Gt => "$gt",
        Operator::Gte => "$gte",
        Operator::Lt => "$lt",
        Operator::Lte => "$lte",
        Operator::In => "$in",
        Operator::Contains => "$regex",
    }
}

/// Convert a filter value to BSON as the declared `field_type`: date strings
/// become BSON dates and float fields compare as doubles.
fn to_bson(value: &Value, field_type: FieldType) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Number(n) => match (field_type, n.as_i64()) {
            (FieldType::Float, _) | (_, None) => n.as_f64().map(Bson::Double).unwrap_or(Bson::Null),
            (_, Some(i)) => Bson::Int64(i),
        },
        Value::String(s) if field_type == FieldType::Date => parse_timestamp(s)
            .map(|dt| Bson::DateTime(bson::DateTime::from_millis(dt.timestamp_millis())))
            .unwrap_or_else(|| Bson::String(s.clone())),
        Value::String(s) => Bson::String(s.clone()),
        Value::Array(items) => Bson::Array(items.iter().map(|v| to_bson(v, field_type)).collect()),
        Value::Object(map) => Bson::Document(
            map.iter()
                .map(|(k, v)| (k.clone(), to_bson(v, FieldType::Unknown)))
                .collect(),
        ),
    }
}

fn sort_document(validated: &ValidatedDescriptor) -> Option<Document> {
    if validated.sort().is_empty() {
        return None;
    }
    let mut sort = Document::new();
    for key in validated.sort() {
        let direction = match key.direction {
            Direction::Asc => 1,
            Direction::Desc => -1,
        };
        sort.insert(key.field.trim(), direction);
    }
    Some(sort)
}

fn projection_document(paths: &[String]) -> Option<Document> {
    if paths.is_empty() {
        return None;
    }
    let mut projection = Document::new();
    for path in paths {
        projection.insert(path.trim(), 1);
    }
    if !projection.contains_key("_id") {
        projection.insert("_id", 0);
    }
    Some(projection)
}

/// `$group` keyed by the group keys, then `$project` to flatten `_id`.
fn group_stages(group: &GroupStage) -> [Document; 2] {
    let mut body = Document::new();
    if group.keys.is_empty() {
        body.insert("_id", Bson::Null);
    } else {
        let mut id = Document::new();
        for key in &group.keys {
            id.insert(key.name.as_str(), format!("${}", key.source));
        }
        body.insert("_id", id);
    }
    for agg in &group.aggregates {
        let accumulator = match (agg.op, agg.source.as_str()) {
            (_, "*") => doc! { "$sum": 1 },
            (AggregateOp::Count, source) => doc! {
                "$sum": { "$cond": [{ "$gt": [format!("${}", source), Bson::Null] }, 1, 0] }
            },
            (op, source) => {
                let mut d = Document::new();
                d.insert(format!("${}", op.name()), format!("${}", source));
                d
            }
        };
        body.insert(agg.name.as_str(), accumulator);
    }

    let mut project = doc! { "_id": 0 };
    for key in &group.keys {
        project.insert(key.name.as_str(), format!("$_id.{}", key.name));
    }
    for agg in &group.aggregates {
        project.insert(agg.name.as_str(), 1);
    }
    [doc! { "$group": body }, doc! { "$project": project }]
}

/// Reduce a driver error to the crate error.
fn map_mongo_error(err: &mongodb::error::Error, collection: &str, timeout: Duration) -> Error {
    use mongodb::error::ErrorKind;
    match err.kind.as_ref() {
        // MaxTimeMSExpired
        ErrorKind::Command(cmd) if cmd.code == 50 => Error::timeout(Stage::Execute, timeout),
        // NamespaceNotFound
        ErrorKind::Command(cmd) if cmd.code == 26 => Error::BackendNotFound(collection.to_string()),
        ErrorKind::Command(cmd) => Error::Execution(cmd.message.clone()),
        ErrorKind::ServerSelection { message, .. }
        | ErrorKind::Authentication { message, .. }
        | ErrorKind::ConnectionPoolCleared { message, .. } => Error::Connection(message.clone()),
        ErrorKind::Io(e) => Error::Connection(e.to_string()),
        ErrorKind::InvalidArgument { message, .. } => Error::Config(message.clone()),
        _ => Error::Execution(err.to_string()),
    }
}

/// Document backend over the driver's internal connection pool.
#[derive(Debug, Clone)]
pub struct DocumentAdapter {
    client: Client,
    database: String,
}

impl DocumentAdapter {
    pub async fn connect(config: &Config) -> Result<Self> {
        let mut options = ClientOptions::parse(&config.connection_uri)
            .await
            .map_err(|e| Error::Config(format!("invalid connection_uri: {}", e)))?;
        options.app_name = Some("querygate".to_string());
        options.max_pool_size = u32::try_from(config.pool_size).ok();
        if options.server_selection_timeout.is_none() {
            options.server_selection_timeout = Some(Duration::from_secs(15));
        }
        let database = match config.database_name.trim() {
            "" => options.default_database.clone().ok_or_else(|| {
                Error::Config("database_name is required for the document backend".into())
            })?,
            name => name.to_string(),
        };
        let client = Client::with_options(options)
            .map_err(|e| Error::Config(format!("cannot build client: {}", e)))?;
        Ok(Self { client, database })
    }

    async fn run_query(&self, query: &DocumentQuery, timeout: Duration) -> Result<Vec<Record>> {
        let map_err = |e: mongodb::error::Error| map_mongo_error(&e, &query.collection, timeout);
        let work = async {
            let db = self.client.database(&self.database);
            let present = db
                .list_collection_names()
                .filter(doc! { "name": { "$in": query.collections.clone() } })
                .await
                .map_err(map_err)?;
            if let Some(missing) = query.collections.iter().find(|c| !present.contains(c)) {
                return Err(Error::BackendNotFound(missing.clone()));
            }

            let collection = db.collection::<Document>(&query.collection);
            let mut cursor = match &query.op {
                DocumentOp::Find {
                    filter,
                    projection,
                    sort,
                    limit,
                } => {
                    let mut find = collection
                        .find(filter.clone())
                        .limit(*limit)
                        .max_time(timeout);
                    if let Some(p) = projection {
                        find = find.projection(p.clone());
                    }
                    if let Some(s) = sort {
                        find = find.sort(s.clone());
                    }
                    find.await.map_err(map_err)?
                }
                DocumentOp::Aggregate { pipeline } => collection
                    .aggregate(pipeline.clone())
                    .max_time(timeout)
                    .await
                    .map_err(map_err)?,
            };

            let mut records = Vec::new();
            while cursor.advance().await.map_err(map_err)? {
                records.push(Record::Document(cursor.deserialize_current().map_err(map_err)?));
            }
            Ok(records)
        };
        match tokio::time::timeout(timeout, work).await {
            Err(_) => Err(Error::timeout(Stage::Execute, timeout)),
            Ok(result) => result,
        }
    }
}

impl QueryAdapter for DocumentAdapter {
    type Compiled = DocumentQuery;

    fn name(&self) -> &'static str {
        "mongodb"
    }

    fn compile(&self, validated: &ValidatedDescriptor) -> Result<DocumentQuery> {
        compile(validated)
    }

    fn run(
        &self,
        compiled: &DocumentQuery,
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
            backend: BackendType::Document,
            default_limit: 100,
            max_limit: 10_000,
            allow_raw_query: true,
        }
    }

    fn compiled(d: QueryDescriptor) -> DocumentQuery {
        let v = validate(d, &fixtures::shop_schema(), &policy()).unwrap();
        compile(&v).unwrap()
    }

    #[test]
    fn test_plain_descriptor_compiles_to_find() {
        let mut d = QueryDescriptor::new("orders");
        d.filter = Some(Filter::And(vec![
            Filter::condition("status", Operator::Eq, "open"),
            Filter::condition("amount", Operator::Gt, 100),
        ]));
        d.projection = vec!["id".into(), "amount".into()];
        d.sort = vec![SortKey::desc("amount")];
        d.limit = Some(50_000);
        let q = compiled(d);
        assert_eq!(
            q.op,
            DocumentOp::Find {
                filter: doc! { "$and": [
                    { "status": { "$eq": "open" } },
                    { "amount": { "$gt": 100.0 } },
                ] },
                projection: Some(doc! { "id": 1, "amount": 1, "_id": 0 }),
                sort: Some(doc! { "amount": -1 }),
                limit: 10_000,
            }
        );
        assert!(q.render().starts_with("db.orders.find("));
    }

    #[test]
    fn test_join_then_group_pipeline() {
        let mut d = QueryDescriptor::new("orders");
        d.aggregation.push(Stage::Join {
            join: JoinSpec::new("users", "user_id", "id").with_alias("customer"),
        });
        d.aggregation.push(Stage::Group {
            group_by: vec!["customer.email".into()],
            aggregations: [("amount".to_string(), AggregateOp::Sum)].into_iter().collect(),
        });
        d.filter = Some(Filter::condition("status", Operator::In, json!(["open"])));
        d.sort = vec![SortKey::desc("sum_amount")];
        let q = compiled(d);
        let DocumentOp::Aggregate { pipeline } = q.op else {
            panic!("expected a pipeline");
        };
        assert_eq!(
            pipeline,
            vec![
                doc! { "$match": { "status": { "$in": ["open"] } } },
                doc! { "$lookup": {
                    "from": "users",
                    "localField": "user_id",
                    "foreignField": "id",
                    "as": "customer",
                } },
                doc! { "$unwind": { "path": "$customer", "preserveNullAndEmptyArrays": true } },
                doc! { "$group": {
                    "_id": { "customer_email": "$customer.email" },
                    "sum_amount": { "$sum": "$amount" },
                } },
                doc! { "$project": { "_id": 0, "customer_email": "$_id.customer_email", "sum_amount": 1 } },
                doc! { "$sort": { "sum_amount": -1 } },
                doc! { "$limit": 100_i64 },
            ]
        );
        assert_eq!(q.collections, vec!["orders", "users"]);
    }

    #[test]
    fn test_filter_on_joined_field_follows_lookup() {
        let mut d = QueryDescriptor::new("orders");
        d.joins.push(JoinSpec::new("users", "user_id", "id"));
        d.filter = Some(Filter::condition("users.email", Operator::Contains, "a.b"));
        let q = compiled(d);
        let DocumentOp::Aggregate { pipeline } = q.op else {
            panic!("expected a pipeline");
        };
        assert!(pipeline[0].contains_key("$lookup"));
        assert!(pipeline[1].contains_key("$unwind"));
        assert_eq!(
            pipeline[2],
            doc! { "$match": { "users.email": { "$regex": "a\\.b", "$options": "i" } } }
        );
    }

    #[test]
    fn test_one_to_many_join_keeps_array() {
        let mut d = QueryDescriptor::new("users");
        d.joins.push(JoinSpec::new("orders", "id", "user_id"));
        let q = compiled(d);
        let DocumentOp::Aggregate { pipeline } = q.op else {
            panic!("expected a pipeline");
        };
        assert!(!pipeline.iter().any(|s| s.contains_key("$unwind")));
    }

    #[test]
    fn test_count_star_and_null_key() {
        let mut d = QueryDescriptor::new("orders");
        d.aggregation.push(Stage::Group {
            group_by: vec![],
            aggregations: [("*".to_string(), AggregateOp::Count)].into_iter().collect(),
        });
        let q = compiled(d);
        let DocumentOp::Aggregate { pipeline } = q.op else {
            panic!("expected a pipeline");
        };
        assert_eq!(pipeline[0], doc! { "$group": { "_id": Bson::Null, "count": { "$sum": 1 } } });
    }

    #[test]
    fn test_date_values_become_bson_dates() {
        let mut d = QueryDescriptor::new("orders");
        d.filter = Some(Filter::condition("placed_at", Operator::Gte, "2024-01-31"));
        let q = compiled(d);
        let DocumentOp::Find { filter, .. } = q.op else {
            panic!("expected find");
        };
        let expected = bson::DateTime::from_millis(1_706_659_200_000);
        assert_eq!(filter, doc! { "placed_at": { "$gte": expected } });
    }

    #[test]
    fn test_values_follow_declared_type() {
        let mut d = QueryDescriptor::new("orders");
        d.filter = Some(Filter::And(vec![
            Filter::condition("amount", Operator::Gt, "100"),
            Filter::condition("status", Operator::Eq, 5),
            Filter::condition("totals.net", Operator::Gte, 100),
            Filter::condition("user_id", Operator::In, json!([1, "2"])),
        ]));
        let q = compiled(d);
        let DocumentOp::Find { filter, .. } = q.op else {
            panic!("expected find");
        };
        assert_eq!(
            filter,
            doc! { "$and": [
                { "amount": { "$gt": 100.0 } },
                { "status": { "$eq": "5" } },
                { "totals.net": { "$gte": 100.0 } },
                { "user_id": { "$in": [1_i64, 2_i64] } },
            ] }
        );
    }

    #[test]
    fn test_raw_pipeline_gets_limit() {
        let mut d = QueryDescriptor::new("orders");
        d.raw_query = Some(json!([{ "$match": { "status": "open" } }]).to_string());
        d.limit = Some(5);
        let q = compiled(d);
        assert_eq!(
            q.op,
            DocumentOp::Aggregate {
                pipeline: vec![
                    doc! { "$match": { "status": "open" } },
                    doc! { "$limit": 5_i64 },
                ]
            }
        );
    }
}
