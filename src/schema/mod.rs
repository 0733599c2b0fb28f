//! Schema model, document parser and shared schema cache.
mod cache;
mod model;
mod parser;

pub use cache::*;
pub use model::*;
pub use parser::{parse, parse_type_annotation, parse_with_warnings, ParseWarning};
