use regex::Regex;
use std::fmt::Write as _;
use std::sync::OnceLock;

use crate::descriptor::Operator;
use crate::gate::MUTATION_KEYWORDS;
use crate::schema::Schema;

const DESCRIPTOR_SHAPE: &str = r#"{
  "primary_collection": "<collection name>",
  "filter": {"and": [{"field": "<path>", "op": "<operator>", "value": <value>}]},
  "projection": ["<path>", ...],
  "sort": [{"field": "<path>", "direction": "asc|desc"}],
  "limit": <positive integer>,
  "aggregation": [
    {"join": {"collection": "<name>", "local_field": "<path>", "foreign_field": "<path>", "alias": "<name>"}},
    {"group_by": ["<path>", ...], "aggregations": {"<path or *>": "avg|sum|min|max|count"}}
  ],
  "joins": [{"collection": "<name>", "local_field": "<path>", "foreign_field": "<path>", "alias": "<name>"}]
}"#;

fn fence_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("fence regex should compile")
    })
}

/// Instruction asking the oracle for one descriptor.
pub fn descriptor_prompt(schema: &Schema, request: &str) -> String {
    let operators: Vec<&str> = Operator::ALL.iter().map(Operator::name).collect();
    let mut out = String::new();
    out.push_str("Translate the request into a JSON query descriptor for the schema below.\n\n");
    out.push_str("Descriptor shape (omit keys you do not need):\n");
    out.push_str(DESCRIPTOR_SHAPE);
    out.push_str("\n\nRules:\n");
    let _ = writeln!(out, "- Allowed operators: {}.", operators.join(", "));
    out.push_str("- Use only collections and dotted field paths listed in the schema.\n");
    out.push_str("- Join only along the relationships listed; if none fits, do not join.\n");
    out.push_str("- Fields of a joined collection are addressed as `<alias>.<field>`.\n");
    out.push_str("- After a group stage, sort and projection use its output names: \
                  group keys with `.` replaced by `_`, aggregates as `<op>_<field>`, `count` for `*`.\n");
    let _ = writeln!(
        out,
        "- The query is read-only: never {}.",
        MUTATION_KEYWORDS.join(", ")
    );
    out.push_str("- Respond with the JSON object only.\n\n");
    out.push_str("Schema:\n");
    out.push_str(&schema.summary());
    out.push_str("\nRequest:\n");
    out.push_str(request.trim());
    out.push('\n');
    out
}

/// Follow-up after an unusable answer, naming what was wrong with it.
pub fn correction_prompt(base_prompt: &str, previous: &str, error: &str) -> String {
    let mut out = String::from(base_prompt);
    out.push_str("\nYour previous answer was:\n");
    out.push_str(previous.trim());
    out.push_str("\n\nIt was rejected: ");
    out.push_str(error);
    out.push_str("\nReturn a corrected JSON descriptor only.\n");
    out
}

/// Instruction asking whether a message needs structured data.
pub fn routing_prompt(schema: &Schema, message: &str) -> String {
    let mut out = String::new();
    out.push_str("Decide whether the message below needs a database query against this schema.\n\n");
    out.push_str("Collections:\n");
    for collection in &schema.collections {
        match &collection.description {
            Some(desc) => {
                let _ = writeln!(out, "- {}: {}", collection.name, desc);
            }
            None => {
                let _ = writeln!(out, "- {}", collection.name);
            }
        }
    }
    out.push_str(
        r#"
Respond with only this JSON object:
{
  "needs_database_query": true or false,
  "reasoning": "<one sentence>",
  "relevant_collections": ["<collection>", ...],
  "query_type": "find|aggregate|count|analysis",
  "confidence": <number between 0.0 and 1.0>
}

Message:
"#,
    );
    out.push_str(message.trim());
    out.push('\n');
    out
}

/// The JSON part of an oracle answer: a fenced block if present, otherwise
/// the outermost `{...}` span, otherwise the trimmed text.
pub fn extract_json(text: &str) -> &str {
    if let Some(body) = fence_regex()
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .find(|body| body.starts_with('{') || body.starts_with('['))
    {
        return body;
    }
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text.trim(),
    }
}
