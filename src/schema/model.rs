use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fmt::Write as _;

/// Declared type of a field. Anything unrecognised is `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Array,
    Object,
    Date,
    #[default]
    Unknown,
}

impl FieldType {
    /// Map a free-form type annotation (`varchar(32)`, `int8`, `ISODate`,
    /// `timestamp with time zone`, `string[]`, ...) onto a declared type.
    pub fn parse(annotation: &str) -> Self {
        let normalized = annotation.trim().trim_matches('`').to_ascii_lowercase();
        if normalized.is_empty() {
            return FieldType::Unknown;
        }
        if normalized.ends_with("[]")
            || normalized.starts_with("array")
            || normalized.starts_with("list")
            || normalized.starts_with("vec<")
        {
            return FieldType::Array;
        }
        if let Some(t) = Self::from_keyword(&normalized) {
            return t;
        }
        // Union annotations such as `string|null` take the first concrete type.
        if normalized.contains('|') {
            return normalized
                .split('|')
                .map(str::trim)
                .filter(|part| *part != "null" && *part != "none")
                .map(Self::parse)
                .next()
                .unwrap_or(FieldType::Unknown);
        }
        let head: String = normalized
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        Self::from_keyword(&head).unwrap_or(FieldType::Unknown)
    }

    fn from_keyword(word: &str) -> Option<Self> {
        let t = match word {
            "string" | "str" | "text" | "varchar" | "character varying" | "char"
            | "character" | "bpchar" | "citext" | "uuid" | "objectid" | "name" | "enum"
            | "email" | "url" => FieldType::String,
            "int" | "integer" | "int2" | "int4" | "int8" | "bigint" | "smallint" | "long"
            | "serial" | "bigserial" | "i32" | "i64" | "u32" | "u64" => FieldType::Integer,
            "float" | "double" | "double precision" | "number" | "numeric" | "decimal"
            | "real" | "float4" | "float8" | "money" | "f32" | "f64" => FieldType::Float,
            "bool" | "boolean" => FieldType::Boolean,
            "object" | "dict" | "map" | "json" | "jsonb" | "document" | "struct"
            | "embedded" => FieldType::Object,
            "date" | "datetime" | "timestamp" | "timestamptz" | "timestamp with time zone"
            | "timestamp without time zone" | "time" | "isodate" | "instant" => FieldType::Date,
            _ => return None,
        };
        Some(t)
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Date => "date",
            FieldType::Unknown => "unknown",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Float)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(default)]
    pub required: bool,
    /// Nested fields of an object, or of the elements of an array of objects.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Field>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            enum_values: Vec::new(),
            required: false,
            fields: Vec::new(),
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_enum<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fields(mut self, fields: Vec<Field>) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn child(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    pub fields: Vec<Field>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Collection {
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            name: name.into(),
            fields,
            document_count: None,
            primary_key: None,
            description: None,
        }
    }

    /// Walk a dotted path through nested object/array fields.
    pub fn resolve(&self, path: &str) -> Option<&Field> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut field = self.fields.iter().find(|f| f.name == first)?;
        for segment in segments {
            field = field.child(segment)?;
        }
        Some(field)
    }

    /// Insert `field` at a dotted path, creating object parents as needed.
    /// An existing field at the same path is replaced, keeping its children.
    pub fn insert_path(&mut self, path: &str, mut field: Field) {
        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        let Some((leaf, parents)) = segments.split_last() else {
            return;
        };
        field.name = leaf.to_string();
        let mut level = &mut self.fields;
        for parent in parents {
            let idx = match level.iter().position(|f| f.name == *parent) {
                Some(idx) => idx,
                None => {
                    level.push(Field::new(*parent, FieldType::Object));
                    level.len() - 1
                }
            };
            level = &mut level[idx].fields;
        }
        match level.iter().position(|f| f.name == *leaf) {
            Some(idx) => {
                let existing = &mut level[idx];
                let children = std::mem::take(&mut existing.fields);
                *existing = field;
                if existing.fields.is_empty() {
                    existing.fields = children;
                }
            }
            None => level.push(field),
        }
    }

    /// All dotted paths, depth first.
    pub fn paths(&self) -> Vec<(String, &Field)> {
        fn walk<'a>(prefix: &str, fields: &'a [Field], out: &mut Vec<(String, &'a Field)>) {
            for field in fields {
                let path = if prefix.is_empty() {
                    field.name.clone()
                } else {
                    format!("{}.{}", prefix, field.name)
                };
                out.push((path.clone(), field));
                walk(&path, &field.fields, out);
            }
        }
        let mut out = Vec::new();
        walk("", &self.fields, &mut out);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
}

impl Cardinality {
    pub fn parse(text: &str) -> Option<Self> {
        let normalized: String = text
            .to_ascii_lowercase()
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '_'))
            .collect();
        match normalized.as_str() {
            "onetoone" | "1:1" | "11" | "hasone" => Some(Cardinality::OneToOne),
            "onetomany" | "1:n" | "1:m" | "1n" | "hasmany" => Some(Cardinality::OneToMany),
            "manytoone" | "n:1" | "m:1" | "n1" | "belongsto" | "foreignkey" | "fk"
            | "references" => Some(Cardinality::ManyToOne),
            _ => None,
        }
    }

    /// The same edge seen from the other end.
    pub fn reverse(self) -> Self {
        match self {
            Cardinality::OneToOne => Cardinality::OneToOne,
            Cardinality::OneToMany => Cardinality::ManyToOne,
            Cardinality::ManyToOne => Cardinality::OneToMany,
        }
    }

    /// Whether each source row matches at most one target row.
    pub fn is_single(self) -> bool {
        matches!(self, Cardinality::OneToOne | Cardinality::ManyToOne)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Cardinality::OneToOne => "one-to-one",
            Cardinality::OneToMany => "one-to-many",
            Cardinality::ManyToOne => "many-to-one",
        }
    }
}

/// An explicitly declared join path. Relationships are never inferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub source_collection: String,
    pub source_field: String,
    pub target_collection: String,
    pub target_field: String,
    pub cardinality: Cardinality,
}

impl Relationship {
    pub fn new(
        source: (&str, &str),
        target: (&str, &str),
        cardinality: Cardinality,
    ) -> Self {
        Self {
            source_collection: source.0.to_string(),
            source_field: source.1.to_string(),
            target_collection: target.0.to_string(),
            target_field: target.1.to_string(),
            cardinality,
        }
    }

    pub fn connects(&self, a: &str, b: &str) -> bool {
        (self.source_collection == a && self.target_collection == b)
            || (self.source_collection == b && self.target_collection == a)
    }

    /// Orient this edge as `from.local -> to.foreign`, if it matches.
    pub fn oriented(&self, from: &str, local: &str, to: &str, foreign: &str) -> Option<Cardinality> {
        if self.source_collection == from
            && self.source_field == local
            && self.target_collection == to
            && self.target_field == foreign
        {
            Some(self.cardinality)
        } else if self.source_collection == to
            && self.source_field == foreign
            && self.target_collection == from
            && self.target_field == local
        {
            Some(self.cardinality.reverse())
        } else {
            None
        }
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{} ({})",
            self.source_collection,
            self.source_field,
            self.target_collection,
            self.target_field,
            self.cardinality.name()
        )
    }
}

/// Collections, their fields and the declared relationships between them.
/// Read-only once built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub collections: Vec<Collection>,
    pub relationships: Vec<Relationship>,
}

impl Schema {
    pub fn new(collections: Vec<Collection>, relationships: Vec<Relationship>) -> Self {
        Self {
            collections,
            relationships,
        }
    }

    pub fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn collection_names(&self) -> Vec<&str> {
        self.collections.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn resolve_path(&self, collection: &str, path: &str) -> Option<&Field> {
        self.collection(collection)?.resolve(path)
    }

    /// First declared relationship linking `a` and `b`, in either direction.
    pub fn relationship_between(&self, a: &str, b: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.connects(a, b))
    }

    /// The cardinality of `from.local -> to.foreign` if some declared
    /// relationship covers exactly that pair of fields.
    pub fn join_edge(&self, from: &str, local: &str, to: &str, foreign: &str) -> Option<Cardinality> {
        self.relationships
            .iter()
            .find_map(|r| r.oriented(from, local, to, foreign))
    }

    /// Lowercased collection and field names, for keyword matching.
    pub fn vocabulary(&self) -> BTreeSet<String> {
        let mut words = BTreeSet::new();
        for collection in &self.collections {
            words.insert(collection.name.to_lowercase());
            for (_, field) in collection.paths() {
                if field.name.len() > 2 {
                    words.insert(field.name.to_lowercase());
                }
            }
        }
        words
    }

    /// Compact textual form handed to the oracle: collections, fields, types,
    /// enumerations and relationships, nothing else.
    pub fn summary(&self) -> String {
        let mut out = String::from("Collections:\n");
        for collection in &self.collections {
            let mut notes = Vec::new();
            if let Some(count) = collection.document_count {
                notes.push(format!("{} documents", count));
            }
            if let Some(pk) = &collection.primary_key {
                notes.push(format!("primary key: {}", pk));
            }
            if notes.is_empty() {
                let _ = writeln!(out, "- {}", collection.name);
            } else {
                let _ = writeln!(out, "- {} ({})", collection.name, notes.join(", "));
            }
            for (path, field) in collection.paths() {
                let depth = path.matches('.').count();
                let indent = "  ".repeat(depth + 1);
                let _ = write!(out, "{}- {}: {}", indent, path, field.field_type);
                if !field.enum_values.is_empty() {
                    let _ = write!(out, " enum[{}]", field.enum_values.join(", "));
                }
                if field.required {
                    out.push_str(" (required)");
                }
                if let Some(desc) = &field.description {
                    let _ = write!(out, " - {}", desc);
                }
                out.push('\n');
            }
        }
        if self.relationships.is_empty() {
            out.push_str("Relationships: none declared (joins are not permitted)\n");
        } else {
            out.push_str("Relationships:\n");
            for rel in &self.relationships {
                let _ = writeln!(out, "- {}", rel);
            }
        }
        out
    }

    /// Render as a document the schema parser reads back.
    pub fn to_markdown(&self) -> String {
        let mut out = String::from("# Schema\n\n");
        for collection in &self.collections {
            let _ = writeln!(out, "### {} Collection\n", collection.name);
            if let Some(desc) = &collection.description {
                let _ = writeln!(out, "**Purpose**: {}\n", desc);
            }
            if let Some(count) = collection.document_count {
                let _ = writeln!(out, "**Document Count**: {}\n", count);
            }
            if let Some(pk) = &collection.primary_key {
                let _ = writeln!(out, "**Primary key**: {}\n", pk);
            }
            out.push_str("| Field | Type | Required | Enum | Description |\n");
            out.push_str("|-------|------|----------|------|-------------|\n");
            for (path, field) in collection.paths() {
                let _ = writeln!(
                    out,
                    "| {} | {} | {} | {} | {} |",
                    path,
                    field.field_type,
                    if field.required { "yes" } else { "no" },
                    field.enum_values.join(", ").replace('|', "/"),
                    field
                        .description
                        .as_deref()
                        .unwrap_or("")
                        .replace('|', "/")
                );
            }
            out.push('\n');
        }
        if !self.relationships.is_empty() {
            out.push_str("## Key Field Relationships\n\n");
            out.push_str(
                "| From Collection | From Field | To Collection | To Field | Relationship Type |\n",
            );
            out.push_str(
                "|-----------------|------------|---------------|----------|-------------------|\n",
            );
            for rel in &self.relationships {
                let _ = writeln!(
                    out,
                    "| {} | {} | {} | {} | {} |",
                    rel.source_collection,
                    rel.source_field,
                    rel.target_collection,
                    rel.target_field,
                    rel.cardinality.name()
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> Collection {
        Collection::new(
            "orders",
            vec![
                Field::new("id", FieldType::Integer).required(),
                Field::new("status", FieldType::String).with_enum(["open", "closed"]),
                Field::new("customer", FieldType::Object).with_fields(vec![
                    Field::new("name", FieldType::String),
                    Field::new("address", FieldType::Object)
                        .with_fields(vec![Field::new("city", FieldType::String)]),
                ]),
                Field::new("items", FieldType::Array)
                    .with_fields(vec![Field::new("sku", FieldType::String)]),
            ],
        )
    }

    #[test]
    fn test_field_type_parse() {
        assert_eq!(FieldType::parse("int"), FieldType::Integer);
        assert_eq!(FieldType::parse("varchar(32)"), FieldType::String);
        assert_eq!(FieldType::parse("double precision"), FieldType::Float);
        assert_eq!(FieldType::parse("timestamp with time zone"), FieldType::Date);
        assert_eq!(FieldType::parse("ISODate"), FieldType::Date);
        assert_eq!(FieldType::parse("text[]"), FieldType::Array);
        assert_eq!(FieldType::parse("string|null"), FieldType::String);
        assert_eq!(FieldType::parse("jsonb"), FieldType::Object);
        assert_eq!(FieldType::parse("geometry"), FieldType::Unknown);
        assert_eq!(FieldType::parse(""), FieldType::Unknown);
    }

    #[test]
    fn test_resolve_nested_paths() {
        let c = orders();
        assert_eq!(c.resolve("id").unwrap().field_type, FieldType::Integer);
        assert_eq!(c.resolve("customer.address.city").unwrap().name, "city");
        assert_eq!(c.resolve("items.sku").unwrap().field_type, FieldType::String);
        assert!(c.resolve("customer.phone").is_none());
        assert!(c.resolve("status.value").is_none());
        assert!(c.resolve("").is_none());
    }

    #[test]
    fn test_insert_path_creates_parents() {
        let mut c = Collection::new("apps", vec![]);
        c.insert_path("application.criticality", Field::new("x", FieldType::String));
        c.insert_path("application", Field::new("x", FieldType::Object).required());
        let parent = c.resolve("application").unwrap();
        assert!(parent.required);
        assert_eq!(parent.fields.len(), 1);
        assert_eq!(
            c.resolve("application.criticality").unwrap().name,
            "criticality"
        );
    }

    #[test]
    fn test_relationship_either_direction() {
        let schema = Schema::new(
            vec![orders(), Collection::new("users", vec![Field::new("id", FieldType::Integer)])],
            vec![Relationship::new(
                ("orders", "user_id"),
                ("users", "id"),
                Cardinality::ManyToOne,
            )],
        );
        assert!(schema.relationship_between("orders", "users").is_some());
        assert!(schema.relationship_between("users", "orders").is_some());
        assert!(schema.relationship_between("orders", "products").is_none());
        assert_eq!(
            schema.join_edge("orders", "user_id", "users", "id"),
            Some(Cardinality::ManyToOne)
        );
        assert_eq!(
            schema.join_edge("users", "id", "orders", "user_id"),
            Some(Cardinality::OneToMany)
        );
        assert_eq!(schema.join_edge("orders", "id", "users", "id"), None);
    }

    #[test]
    fn test_cardinality_parse() {
        assert_eq!(Cardinality::parse("many-to-one"), Some(Cardinality::ManyToOne));
        assert_eq!(Cardinality::parse("One To Many"), Some(Cardinality::OneToMany));
        assert_eq!(Cardinality::parse("1:1"), Some(Cardinality::OneToOne));
        assert_eq!(Cardinality::parse("Foreign Key"), Some(Cardinality::ManyToOne));
        assert_eq!(Cardinality::parse("sometimes"), None);
    }

    #[test]
    fn test_summary_lists_enums_and_no_relationships() {
        let schema = Schema::new(vec![orders()], vec![]);
        let summary = schema.summary();
        assert!(summary.contains("- orders"));
        assert!(summary.contains("status: string enum[open, closed]"));
        assert!(summary.contains("customer.address.city: string"));
        assert!(summary.contains("joins are not permitted"));
    }
}
