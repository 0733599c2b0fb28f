//! Tolerant schema document parser.
//!
//! Schema documents are free text with structured islands: markdown headings
//! naming collections, field tables, fenced JSON-schema blocks, compact
//! `fields:` lines and relationship statements or tables. Anything that is not
//! recognised is skipped. A field that cannot be understood degrades to an
//! `unknown` type or is dropped with a warning; only a document with no
//! collections at all is an error.
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::OnceLock;

use super::model::{Cardinality, Collection, Field, FieldType, Relationship, Schema};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct ParseWarning {
    /// 1-based line of the construct the warning is about.
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Parse a schema document, logging any warnings.
pub fn parse(raw: &str) -> Result<Schema> {
    let (schema, warnings) = parse_with_warnings(raw)?;
    for warning in &warnings {
        tracing::warn!(stage = "schema", "{}", warning);
    }
    Ok(schema)
}

pub fn parse_with_warnings(raw: &str) -> Result<(Schema, Vec<ParseWarning>)> {
    let mut parser = DocumentParser::default();
    parser.run(raw);
    parser.finish()
}

fn heading_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^\s{0,3}#{1,6}\s+(.*?)\s*#*\s*$").expect("heading regex"))
}

fn keyword_heading_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"(?i)^(?:(?:collection|table)\s*[:\-]\s*([A-Za-z_][\w\-]*)|([A-Za-z_][\w\-]*)\s+(?:collection|table))$",
        )
        .expect("keyword heading regex")
    })
}

fn bare_heading_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^([A-Za-z_][\w\-]*)$").expect("bare heading regex"))
}

fn count_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?i)\b(?:document|row|record)s?\s+count\**\s*:\s*\**\s*~?([\d,_]+)")
            .expect("count regex")
    })
}

fn primary_key_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?i)^\W*primary\s+key\**\s*:\s*\**\s*([A-Za-z_][\w.]*)\s*$")
            .expect("primary key regex")
    })
}

fn purpose_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?i)^\**(?:purpose|description)\**\s*:\s*\**\s*(.+)$").expect("purpose regex")
    })
}

fn relationship_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"(?i)([A-Za-z_][\w\-]*)\.([A-Za-z_][\w.]*)\s*(?:->|→|=>|\breferences\b|\brefers\s+to\b)\s*([A-Za-z_][\w\-]*)\.([A-Za-z_][\w.]*?)\.?(?:\s*\(([^)]*)\))?\s*$",
        )
        .expect("relationship regex")
    })
}

fn fields_line_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:[-*]\s*)?\**fields\**\s*:\s*(.+)$").expect("fields line regex")
    })
}

fn bullet_field_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^\s*[-*]\s+([A-Za-z_][\w.]*)\s*\(([^)]+)\)\s*(?::\s*(.*))?$")
            .expect("bullet field regex")
    })
}

fn ticked_bullet_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^\s*[-*]\s+`([A-Za-z_][\w.]*)`\s*:\s*(\S.*)$").expect("ticked bullet regex")
    })
}

fn inline_enum_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(?i)\benum\s*[\[(]([^\])]*)[\])]").expect("enum regex"))
}

/// Split a type annotation such as `string enum[open,closed]` into its type
/// and enumerated values.
pub fn parse_type_annotation(annotation: &str) -> (FieldType, Vec<String>) {
    let cleaned = annotation.replace('`', "");
    let mut enum_values = Vec::new();
    let mut remainder = cleaned.clone();
    if let Some(caps) = inline_enum_regex().captures(&cleaned) {
        enum_values = split_values(&caps[1]);
        remainder = cleaned.replace(&caps[0], " ");
    }
    let remainder = remainder.trim();
    let field_type = if remainder.is_empty() && !enum_values.is_empty() {
        FieldType::String
    } else {
        FieldType::parse(remainder)
    };
    (field_type, enum_values)
}

fn split_values(list: &str) -> Vec<String> {
    list.split([',', '/'])
        .map(|v| v.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`'))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_flag(cell: &str) -> Option<bool> {
    match cell.trim().to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" | "required" | "x" | "✓" | "✔" => Some(true),
        "no" | "n" | "false" | "optional" | "" | "-" => Some(false),
        _ => None,
    }
}

/// Split `a:int, b:string enum[x,y]` on commas outside brackets.
fn split_top_level(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, ch) in list.char_indices() {
        match ch {
            '[' | '(' | '{' | '<' => depth += 1,
            ']' | ')' | '}' | '>' => depth -= 1,
            ',' if depth <= 0 => {
                parts.push(&list[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&list[start..]);
    parts.into_iter().map(str::trim).filter(|p| !p.is_empty()).collect()
}

fn clean_cell(cell: &str) -> String {
    cell.trim().replace("**", "").replace('`', "").trim().to_string()
}

fn split_row(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    let inner = trimmed.strip_prefix('|').unwrap_or(trimmed);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner.split('|').map(clean_cell).collect()
}

fn is_separator_row(cells: &[String]) -> bool {
    !cells.is_empty()
        && cells
            .iter()
            .all(|c| !c.is_empty() && c.chars().all(|ch| matches!(ch, '-' | ':' | ' ')))
}

#[derive(Debug)]
struct PendingRelationship {
    line: usize,
    source: (String, String),
    target: (String, String),
    cardinality: Option<String>,
}

#[derive(Debug)]
struct Fence {
    start: usize,
    lang: String,
    body: String,
}

#[derive(Debug, Default)]
struct DocumentParser {
    collections: Vec<Collection>,
    current: Option<usize>,
    /// A bare-identifier heading that becomes a collection once fields show up.
    pending: Option<String>,
    relationships: Vec<PendingRelationship>,
    primary_keys: Vec<(String, String)>,
    table: Vec<(usize, String)>,
    fence: Option<Fence>,
    warnings: Vec<ParseWarning>,
}

impl DocumentParser {
    fn warn(&mut self, line: usize, message: impl Into<String>) {
        self.warnings.push(ParseWarning {
            line,
            message: message.into(),
        });
    }

    fn run(&mut self, raw: &str) {
        for (idx, line) in raw.lines().enumerate() {
            let lineno = idx + 1;
            let trimmed = line.trim();

            if let Some(fence) = self.fence.as_mut() {
                if trimmed.starts_with("```") {
                    let fence = self.fence.take();
                    if let Some(fence) = fence {
                        self.finish_fence(fence);
                    }
                } else {
                    fence.body.push_str(line);
                    fence.body.push('\n');
                }
                continue;
            }

            if trimmed.starts_with('|') {
                self.table.push((lineno, line.to_string()));
                continue;
            }
            self.flush_table();

            if let Some(lang) = trimmed.strip_prefix("```") {
                self.fence = Some(Fence {
                    start: lineno,
                    lang: lang.trim().to_ascii_lowercase(),
                    body: String::new(),
                });
                continue;
            }

            if let Some(caps) = heading_regex().captures(line) {
                self.heading(&caps[1]);
                continue;
            }

            self.text_line(lineno, trimmed);
        }
        self.flush_table();
        if let Some(fence) = self.fence.take() {
            let start = fence.start;
            self.warn(start, "unterminated code fence");
            self.finish_fence(fence);
        }
    }

    fn heading(&mut self, text: &str) {
        let text = text.replace('`', "").replace("**", "");
        let text = text.trim();
        self.pending = None;
        self.current = None;
        if let Some(caps) = keyword_heading_regex().captures(text) {
            let name = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str());
            if let Some(name) = name {
                self.current = Some(self.collection_index(name));
            }
        } else if bare_heading_regex().is_match(text) {
            self.pending = Some(text.to_string());
        }
    }

    fn collection_index(&mut self, name: &str) -> usize {
        if let Some(idx) = self.collections.iter().position(|c| c.name == name) {
            return idx;
        }
        self.collections.push(Collection::new(name, Vec::new()));
        self.collections.len() - 1
    }

    /// The collection fields should go into, promoting a pending heading.
    fn target(&mut self) -> Option<usize> {
        if self.current.is_none() {
            if let Some(name) = self.pending.take() {
                self.current = Some(self.collection_index(&name));
            }
        }
        self.current
    }

    fn add_field(&mut self, line: usize, path: &str, field: Field) {
        match self.target() {
            Some(idx) => self.collections[idx].insert_path(path, field),
            None => self.warn(line, format!("field `{}` outside of any collection", path)),
        }
    }

    fn text_line(&mut self, lineno: usize, trimmed: &str) {
        if trimmed.is_empty() {
            return;
        }
        let unticked = trimmed.replace('`', "");

        if let Some(caps) = relationship_regex().captures(&unticked) {
            self.relationships.push(PendingRelationship {
                line: lineno,
                source: (caps[1].to_string(), caps[2].to_string()),
                target: (caps[3].to_string(), caps[4].to_string()),
                cardinality: caps.get(5).map(|m| m.as_str().to_string()),
            });
            return;
        }

        if let Some(caps) = count_regex().captures(&unticked) {
            let digits: String = caps[1].chars().filter(char::is_ascii_digit).collect();
            if let (Some(idx), Ok(count)) = (self.current, digits.parse::<u64>()) {
                self.collections[idx].document_count = Some(count);
            }
            return;
        }

        if let Some(caps) = primary_key_regex().captures(&unticked) {
            if let Some(idx) = self.current {
                self.collections[idx].primary_key = Some(caps[1].to_string());
            }
            return;
        }

        if let Some(caps) = purpose_regex().captures(&unticked) {
            if let Some(idx) = self.current {
                let text = caps[1].trim_end_matches("**").trim().to_string();
                self.collections[idx].description = Some(text);
            }
            return;
        }

        if let Some(caps) = fields_line_regex().captures(&unticked) {
            let list = caps[1].to_string();
            for item in split_top_level(&list) {
                match item.split_once(':') {
                    Some((name, annotation)) => {
                        let (field_type, enum_values) = parse_type_annotation(annotation);
                        let name = name.trim();
                        let field = Field::new(name, field_type).with_enum(enum_values);
                        self.add_field(lineno, name, field);
                    }
                    None => {
                        let name = item.trim();
                        self.add_field(lineno, name, Field::new(name, FieldType::Unknown));
                    }
                }
            }
            return;
        }

        let bullet = bullet_field_regex()
            .captures(trimmed)
            .or_else(|| ticked_bullet_regex().captures(trimmed));
        if let Some(caps) = bullet {
            if self.current.is_none() && self.pending.is_none() {
                return;
            }
            let name = caps[1].to_string();
            let (field_type, enum_values) = parse_type_annotation(&caps[2]);
            let mut field = Field::new(name.as_str(), field_type).with_enum(enum_values);
            if let Some(desc) = caps.get(3).map(|m| m.as_str().trim()).filter(|d| !d.is_empty()) {
                field.description = Some(desc.to_string());
            }
            self.add_field(lineno, &name, field);
        }
    }

    fn flush_table(&mut self) {
        if self.table.is_empty() {
            return;
        }
        let rows = std::mem::take(&mut self.table);
        let (header_line, header) = (rows[0].0, split_row(&rows[0].1));
        let lower: Vec<String> = header.iter().map(|h| h.to_ascii_lowercase()).collect();
        let col = |names: &[&str]| lower.iter().position(|h| names.contains(&h.as_str()));

        let body: Vec<(usize, Vec<String>)> = rows[1..]
            .iter()
            .map(|(n, l)| (*n, split_row(l)))
            .filter(|(_, cells)| !is_separator_row(cells))
            .collect();

        if let (Some(fc), Some(tc)) = (
            col(&["from collection", "source collection", "from table"]),
            col(&["to collection", "target collection", "to table"]),
        ) {
            let ff = col(&["from field", "source field", "from column"]);
            let tf = col(&["to field", "target field", "to column"]);
            let kind = col(&["relationship type", "type", "cardinality", "relationship"]);
            for (lineno, cells) in body {
                let get = |i: Option<usize>| i.and_then(|i| cells.get(i)).cloned().unwrap_or_default();
                self.relationship_row(lineno, &get(Some(fc)), &get(ff), &get(Some(tc)), &get(tf), &get(kind));
            }
            return;
        }

        if let (Some(fc), Some(tc)) = (col(&["from", "source"]), col(&["to", "target"])) {
            let kind = col(&["type", "cardinality", "relationship type", "relationship"]);
            for (lineno, cells) in body {
                let get = |i: Option<usize>| i.and_then(|i| cells.get(i)).cloned().unwrap_or_default();
                let (from, to) = (get(Some(fc)), get(Some(tc)));
                match (from.split_once('.'), to.split_once('.')) {
                    (Some((sc, sf)), Some((tcol, tfield))) => {
                        self.relationship_row(lineno, sc, sf, tcol, tfield, &get(kind))
                    }
                    _ => self.warn(lineno, format!("unreadable relationship row `{} -> {}`", from, to)),
                }
            }
            return;
        }

        let name_col = col(&["field", "name", "column", "field name", "column name", "path", "attribute"]);
        let type_col = col(&["type", "data type", "data_type", "datatype"]);
        let (Some(name_col), Some(type_col)) = (name_col, type_col) else {
            return;
        };
        let required_col = col(&["required", "req"]);
        let nullable_col = col(&["nullable", "null"]);
        let enum_col = col(&["enum", "values", "allowed values", "enum values"]);
        let desc_col = col(&["description", "notes", "desc", "comment"]);

        if self.target().is_none() {
            self.warn(header_line, "field table outside of any collection");
            return;
        }

        for (lineno, cells) in body {
            let Some(name) = cells.get(name_col).filter(|n| !n.is_empty()).cloned() else {
                self.warn(lineno, "field row without a name");
                continue;
            };
            let annotation = cells.get(type_col).cloned().unwrap_or_default();
            let (field_type, mut enum_values) = parse_type_annotation(&annotation);
            if let Some(values) = enum_col.and_then(|i| cells.get(i)) {
                let listed = split_values(values);
                if !listed.is_empty() {
                    enum_values = listed;
                }
            }
            let mut field = Field::new(name.as_str(), field_type).with_enum(enum_values);
            if let Some(flag) = required_col.and_then(|i| cells.get(i)) {
                field.required = parse_flag(flag).unwrap_or(false);
            } else if let Some(flag) = nullable_col.and_then(|i| cells.get(i)) {
                field.required = parse_flag(flag) == Some(false);
            }
            if let Some(desc) = desc_col.and_then(|i| cells.get(i)).filter(|d| !d.is_empty()) {
                field.description = Some(desc.clone());
            }
            if field_type == FieldType::Unknown && !annotation.is_empty() {
                self.warn(lineno, format!("unrecognised type `{}` for `{}`", annotation, name));
            }
            self.add_field(lineno, &name, field);
        }
    }

    fn relationship_row(
        &mut self,
        lineno: usize,
        from_collection: &str,
        from_field: &str,
        to_collection: &str,
        to_field: &str,
        kind: &str,
    ) {
        let missing = |s: &str| s.is_empty() || s == "-";
        if missing(from_collection) || missing(from_field) {
            return;
        }
        if missing(to_collection) || missing(to_field) {
            if kind.to_ascii_lowercase().contains("primary") {
                self.primary_keys
                    .push((from_collection.to_string(), from_field.to_string()));
            }
            return;
        }
        self.relationships.push(PendingRelationship {
            line: lineno,
            source: (from_collection.to_string(), from_field.to_string()),
            target: (to_collection.to_string(), to_field.to_string()),
            cardinality: Some(kind.to_string()).filter(|k| !k.is_empty()),
        });
    }

    fn finish_fence(&mut self, fence: Fence) {
        let body = fence.body.trim();
        let looks_json = fence.lang == "json" || (fence.lang.is_empty() && body.starts_with('{'));
        if !looks_json {
            return;
        }
        let value: Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(e) => {
                self.warn(fence.start, format!("invalid JSON schema block: {}", e));
                return;
            }
        };
        let Some(properties) = json_properties(&value) else {
            return;
        };
        if self.target().is_none() {
            self.warn(fence.start, "JSON schema block outside of any collection");
            return;
        }
        let required = json_required(&value);
        let mut fields = Vec::new();
        for (name, definition) in properties {
            match json_field(name, definition, &required) {
                Ok(field) => fields.push(field),
                Err(message) => self.warn(fence.start, message),
            }
        }
        for field in fields {
            let name = field.name.clone();
            self.add_field(fence.start, &name, field);
        }
    }

    fn finish(mut self) -> Result<(Schema, Vec<ParseWarning>)> {
        if self.collections.is_empty() {
            return Err(Error::SchemaParse(
                "no collections found in schema document".into(),
            ));
        }
        for (collection, field) in std::mem::take(&mut self.primary_keys) {
            if let Some(c) = self.collections.iter_mut().find(|c| c.name == collection) {
                c.primary_key.get_or_insert(field);
            }
        }

        let schema_so_far = Schema::new(self.collections.clone(), Vec::new());
        let mut relationships: Vec<Relationship> = Vec::new();
        for pending in std::mem::take(&mut self.relationships) {
            let (sc, sf) = (&pending.source.0, &pending.source.1);
            let (tc, tf) = (&pending.target.0, &pending.target.1);
            if schema_so_far.resolve_path(sc, sf).is_none() {
                self.warn(pending.line, format!("relationship source `{}.{}` does not resolve", sc, sf));
                continue;
            }
            if schema_so_far.resolve_path(tc, tf).is_none() {
                self.warn(pending.line, format!("relationship target `{}.{}` does not resolve", tc, tf));
                continue;
            }
            let cardinality = match pending.cardinality.as_deref() {
                None => Cardinality::ManyToOne,
                Some(text) => Cardinality::parse(text).unwrap_or_else(|| {
                    self.warn(
                        pending.line,
                        format!("unknown cardinality `{}`, assuming many-to-one", text),
                    );
                    Cardinality::ManyToOne
                }),
            };
            let rel = Relationship::new((sc, sf), (tc, tf), cardinality);
            if !relationships.contains(&rel) {
                relationships.push(rel);
            }
        }

        Ok((Schema::new(self.collections, relationships), self.warnings))
    }
}

fn json_properties(value: &Value) -> Option<&serde_json::Map<String, Value>> {
    let obj = value.as_object()?;
    if let Some(props) = obj.get("properties").and_then(Value::as_object) {
        return Some(props);
    }
    // A bare `{ "field": { "type": ... } }` map.
    if !obj.is_empty() && obj.values().all(|v| v.get("type").is_some()) {
        return Some(obj);
    }
    None
}

fn json_required(value: &Value) -> Vec<String> {
    value
        .get("required")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn json_type(definition: &Value) -> FieldType {
    match definition.get("type") {
        Some(Value::String(t)) => FieldType::parse(t),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null")
            .map(FieldType::parse)
            .unwrap_or(FieldType::Unknown),
        _ if definition.get("properties").is_some() => FieldType::Object,
        _ => FieldType::Unknown,
    }
}

fn json_field(name: &str, definition: &Value, parent_required: &[String]) -> std::result::Result<Field, String> {
    if !definition.is_object() {
        return Err(format!("field `{}` has no type description", name));
    }
    let field_type = json_type(definition);
    let mut field = Field::new(name, field_type);
    field.required = match definition.get("required") {
        Some(Value::Bool(b)) => *b,
        _ => parent_required.iter().any(|r| r == name),
    };
    if let Some(values) = definition.get("enum").and_then(Value::as_array) {
        field.enum_values = values
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
    }
    field.description = definition
        .get("description")
        .and_then(Value::as_str)
        .map(str::to_string);

    let nested = match field_type {
        FieldType::Array => definition.get("items").unwrap_or(&Value::Null),
        _ => definition,
    };
    if let Some(props) = nested.get("properties").and_then(Value::as_object) {
        let required = json_required(nested);
        for (child_name, child_spec) in props {
            // A broken child degrades to an unknown field rather than failing the parent.
            let child = json_field(child_name, child_spec, &required)
                .unwrap_or_else(|_| Field::new(child_name.as_str(), FieldType::Unknown));
            field.fields.push(child);
        }
    }
    Ok(field)
}
