pub mod backend;
pub mod config;
pub mod db;
pub mod descriptor;
pub mod error;
pub mod format;
pub mod gate;
pub mod generator;
pub mod pipeline;
pub mod planner;
pub mod schema;

#[cfg(test)]
mod testing;

pub use config::{BackendType, Config};
pub use descriptor::QueryDescriptor;
pub use error::{Error, ErrorKind, PipelineError, Result, Stage};
pub use format::ResultEnvelope;
pub use gate::{validate, Policy, ValidatedDescriptor};
pub use pipeline::{Outcome, QueryPipeline};
pub use schema::Schema;
