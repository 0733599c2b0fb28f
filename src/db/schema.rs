use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio_postgres::{Client, Row};

use super::query::map_pg_error;
use crate::error::{Error, Result, Stage};
use crate::schema::{Cardinality, Collection, Field, FieldType, Relationship, Schema};

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    pub schema: String,
    pub table_type: TableType,
    pub row_estimate: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableType {
    Table,
    View,
    MaterializedView,
    ForeignTable,
}

impl TableType {
    pub fn label(&self) -> &'static str {
        match self {
            TableType::Table => "table",
            TableType::View => "view",
            TableType::MaterializedView => "materialized view",
            TableType::ForeignTable => "foreign table",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnDetails {
    pub table: String,
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub is_primary_key: bool,
    pub enum_values: Vec<String>,
    pub ordinal_position: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKey {
    pub source_table: String,
    pub source_column: String,
    pub target_table: String,
    pub target_column: String,
}

const CATALOG_TIMEOUT: Duration = Duration::from_secs(30);

/// Await a catalog query, giving up after `timeout`.
async fn bounded<F>(query: F, relation: &str, timeout: Duration) -> Result<Vec<Row>>
where
    F: Future<Output = std::result::Result<Vec<Row>, tokio_postgres::Error>>,
{
    match tokio::time::timeout(timeout, query).await {
        Err(_) => Err(Error::timeout(Stage::Schema, timeout)),
        Ok(result) => result.map_err(|e| map_pg_error(&e, relation, timeout)),
    }
}

pub async fn get_tables(client: &Client, schema: &str) -> Result<Vec<TableInfo>> {
    let rows = bounded(
        client.query(
            r#"
            SELECT
                c.relname as name,
                n.nspname as schema,
                CASE c.relkind
                    WHEN 'r' THEN 'table'
                    WHEN 'p' THEN 'table'
                    WHEN 'v' THEN 'view'
                    WHEN 'm' THEN 'materialized_view'
                    WHEN 'f' THEN 'foreign_table'
                    ELSE 'other'
                END as table_type,
                GREATEST(COALESCE(c.reltuples::bigint, 0), 0) as row_estimate
            FROM pg_catalog.pg_class c
            JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1
              AND c.relkind IN ('r', 'p', 'v', 'm', 'f')
              AND NOT c.relispartition
            ORDER BY c.relname
            "#,
            &[&schema],
        ),
        "pg_class",
        CATALOG_TIMEOUT,
    )
    .await?;

    let tables = rows
        .iter()
        .map(|row| {
            let type_str: String = row.get("table_type");
            let table_type = match type_str.as_str() {
                "view" => TableType::View,
                "materialized_view" => TableType::MaterializedView,
                "foreign_table" => TableType::ForeignTable,
                _ => TableType::Table,
            };

            TableInfo {
                name: row.get("name"),
                schema: row.get("schema"),
                table_type,
                row_estimate: row.get("row_estimate"),
            }
        })
        .collect();

    Ok(tables)
}

/// Columns of every table in `schema`, with enum labels for enum-typed columns.
pub async fn get_columns(client: &Client, schema: &str) -> Result<Vec<ColumnDetails>> {
    let rows = bounded(
        client.query(
            r#"
            SELECT
                c.table_name as table_name,
                c.column_name as name,
                CASE WHEN c.data_type = 'USER-DEFINED' THEN c.udt_name ELSE c.data_type END as data_type,
                c.is_nullable = 'YES' as is_nullable,
                COALESCE(tc.constraint_type = 'PRIMARY KEY', false) as is_primary_key,
                ARRAY(
                    SELECT e.enumlabel::text
                    FROM pg_catalog.pg_enum e
                    JOIN pg_catalog.pg_type t ON t.oid = e.enumtypid
                    WHERE t.typname = c.udt_name
                    ORDER BY e.enumsortorder
                ) as enum_values,
                c.ordinal_position::int4 as ordinal_position
            FROM information_schema.columns c
            LEFT JOIN information_schema.key_column_usage kcu
                ON c.table_schema = kcu.table_schema
                AND c.table_name = kcu.table_name
                AND c.column_name = kcu.column_name
            LEFT JOIN information_schema.table_constraints tc
                ON kcu.constraint_name = tc.constraint_name
                AND kcu.table_schema = tc.table_schema
                AND tc.constraint_type = 'PRIMARY KEY'
            WHERE c.table_schema = $1
            ORDER BY c.table_name, c.ordinal_position
            "#,
            &[&schema],
        ),
        "information_schema.columns",
        CATALOG_TIMEOUT,
    )
    .await?;

    let mut columns: Vec<ColumnDetails> = Vec::with_capacity(rows.len());
    for row in &rows {
        let column = ColumnDetails {
            table: row.get("table_name"),
            name: row.get("name"),
            data_type: row.get("data_type"),
            is_nullable: row.get("is_nullable"),
            is_primary_key: row.get("is_primary_key"),
            enum_values: row.get("enum_values"),
            ordinal_position: row.get("ordinal_position"),
        };
        // A column in several key constraints appears once per constraint.
        let duplicate = columns
            .last()
            .is_some_and(|c| c.table == column.table && c.name == column.name);
        if duplicate {
            if column.is_primary_key {
                if let Some(last) = columns.last_mut() {
                    last.is_primary_key = true;
                }
            }
            continue;
        }
        columns.push(column);
    }
    Ok(columns)
}

/// Single-column foreign keys declared in `schema`.
pub async fn get_foreign_keys(client: &Client, schema: &str) -> Result<Vec<ForeignKey>> {
    let rows = bounded(
        client.query(
            r#"
            SELECT
                src.relname as source_table,
                src_col.attname as source_column,
                tgt.relname as target_table,
                tgt_col.attname as target_column
            FROM pg_catalog.pg_constraint con
            JOIN pg_catalog.pg_class src ON src.oid = con.conrelid
            JOIN pg_catalog.pg_class tgt ON tgt.oid = con.confrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = src.relnamespace
            JOIN pg_catalog.pg_attribute src_col
                ON src_col.attrelid = con.conrelid AND src_col.attnum = con.conkey[1]
            JOIN pg_catalog.pg_attribute tgt_col
                ON tgt_col.attrelid = con.confrelid AND tgt_col.attnum = con.confkey[1]
            WHERE con.contype = 'f'
              AND n.nspname = $1
              AND array_length(con.conkey, 1) = 1
            ORDER BY src.relname, src_col.attname
            "#,
            &[&schema],
        ),
        "pg_constraint",
        CATALOG_TIMEOUT,
    )
    .await?;

    Ok(rows
        .iter()
        .map(|row| ForeignKey {
            source_table: row.get("source_table"),
            source_column: row.get("source_column"),
            target_table: row.get("target_table"),
            target_column: row.get("target_column"),
        })
        .collect())
}

/// Read the catalog of `schema_name` into a [`Schema`]. Declared foreign keys
/// are the only relationships produced.
pub async fn introspect_schema(client: &Client, schema_name: &str) -> Result<Schema> {
    let tables = get_tables(client, schema_name).await?;
    let columns = get_columns(client, schema_name).await?;
    let foreign_keys = get_foreign_keys(client, schema_name).await?;
    tracing::info!(
        stage = "schema",
        schema = schema_name,
        tables = tables.len(),
        foreign_keys = foreign_keys.len(),
        "catalog introspected"
    );
    Ok(build_schema(&tables, &columns, &foreign_keys))
}

pub fn build_schema(tables: &[TableInfo], columns: &[ColumnDetails], foreign_keys: &[ForeignKey]) -> Schema {
    let mut by_table: BTreeMap<&str, Vec<&ColumnDetails>> = BTreeMap::new();
    for column in columns {
        by_table.entry(column.table.as_str()).or_default().push(column);
    }

    let collections: Vec<Collection> = tables
        .iter()
        .map(|table| {
            let mut table_columns = by_table.remove(table.name.as_str()).unwrap_or_default();
            table_columns.sort_by_key(|c| c.ordinal_position);
            let fields = table_columns
                .iter()
                .map(|c| {
                    let field_type = if c.enum_values.is_empty() {
                        FieldType::parse(&c.data_type)
                    } else {
                        FieldType::String
                    };
                    let mut field =
                        Field::new(c.name.as_str(), field_type).with_enum(c.enum_values.clone());
                    field.required = !c.is_nullable;
                    field
                })
                .collect();
            let mut collection = Collection::new(table.name.as_str(), fields);
            collection.document_count = u64::try_from(table.row_estimate).ok();
            let primary: Vec<&str> = table_columns
                .iter()
                .filter(|c| c.is_primary_key)
                .map(|c| c.name.as_str())
                .collect();
            if let [only] = primary.as_slice() {
                collection.primary_key = Some(only.to_string());
            }
            if table.table_type != TableType::Table {
                collection.description = Some(table.table_type.label().to_string());
            }
            collection
        })
        .collect();

    let relationships = foreign_keys
        .iter()
        .filter(|fk| {
            collections.iter().any(|c| c.name == fk.source_table)
                && collections.iter().any(|c| c.name == fk.target_table)
        })
        .map(|fk| {
            Relationship::new(
                (fk.source_table.as_str(), fk.source_column.as_str()),
                (fk.target_table.as_str(), fk.target_column.as_str()),
                Cardinality::ManyToOne,
            )
        })
        .collect();

    Schema::new(collections, relationships)
}
