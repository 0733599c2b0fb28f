//! Backend adapters.
//!
//! Each adapter compiles a [`ValidatedDescriptor`] into its store's native
//! form and executes it under a timeout. Compilation is pure, so a compiled
//! query can be shown without a connection.
mod document;
mod relational;

pub use document::{DocumentAdapter, DocumentOp, DocumentQuery};
pub use relational::{RelationalAdapter, SqlParam, SqlQuery};

use mongodb::bson::Document;
use serde_json::{Map, Value};
use std::future::Future;
use std::time::Duration;

use crate::config::{BackendType, Config};
use crate::db::CellValue;
use crate::error::{Error, Result};
use crate::gate::ValidatedDescriptor;

/// One result item as the backend produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Document(Document),
    /// Column name and value, in select-list order.
    Row(Vec<(String, CellValue)>),
    Json(Map<String, Value>),
}

/// A compiled native query.
pub trait NativeQuery {
    /// Human-readable native text, echoed in the result envelope.
    fn render(&self) -> String;
}

/// A read-only backend.
pub trait QueryAdapter: Send + Sync {
    type Compiled: NativeQuery + Send + Sync;

    fn name(&self) -> &'static str;

    fn compile(&self, validated: &ValidatedDescriptor) -> Result<Self::Compiled>;

    fn run(
        &self,
        compiled: &Self::Compiled,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<Record>>> + Send;

    /// Compile and run in one step.
    fn execute(
        &self,
        validated: &ValidatedDescriptor,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<Record>>> + Send {
        async move {
            let compiled = self.compile(validated)?;
            self.run(&compiled, timeout).await
        }
    }
}

impl<A: QueryAdapter> QueryAdapter for &A {
    type Compiled = A::Compiled;

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn compile(&self, validated: &ValidatedDescriptor) -> Result<Self::Compiled> {
        (**self).compile(validated)
    }

    fn run(
        &self,
        compiled: &Self::Compiled,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<Record>>> + Send {
        (**self).run(compiled, timeout)
    }
}

/// The configured backend. Exactly one is active per process.
#[derive(Debug)]
pub enum Backend {
    Relational(RelationalAdapter),
    Document(DocumentAdapter),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendQuery {
    Sql(SqlQuery),
    Document(DocumentQuery),
}

impl NativeQuery for BackendQuery {
    fn render(&self) -> String {
        match self {
            BackendQuery::Sql(q) => q.render(),
            BackendQuery::Document(q) => q.render(),
        }
    }
}

/// Compile for `backend` without any connection.
pub fn compile_native(backend: BackendType, validated: &ValidatedDescriptor) -> Result<BackendQuery> {
    match backend {
        BackendType::Relational => relational::compile(validated).map(BackendQuery::Sql),
        BackendType::Document => document::compile(validated).map(BackendQuery::Document),
    }
}

impl Backend {
    /// Build the adapter `config.backend_type` selects.
    pub async fn connect(config: &Config) -> Result<Self> {
        config.require_connection()?;
        let backend = match config.backend_type {
            BackendType::Relational => Backend::Relational(RelationalAdapter::connect(config)?),
            BackendType::Document => Backend::Document(DocumentAdapter::connect(config).await?),
        };
        tracing::info!(
            stage = "execute",
            backend = backend.name(),
            database = %config.database_name,
            "backend ready"
        );
        Ok(backend)
    }

    pub fn backend_type(&self) -> BackendType {
        match self {
            Backend::Relational(_) => BackendType::Relational,
            Backend::Document(_) => BackendType::Document,
        }
    }
}

impl QueryAdapter for Backend {
    type Compiled = BackendQuery;

    fn name(&self) -> &'static str {
        match self {
            Backend::Relational(a) => a.name(),
            Backend::Document(a) => a.name(),
        }
    }

    fn compile(&self, validated: &ValidatedDescriptor) -> Result<BackendQuery> {
        compile_native(self.backend_type(), validated)
    }

    fn run(
        &self,
        compiled: &BackendQuery,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<Record>>> + Send {
        async move {
            match (self, compiled) {
                (Backend::Relational(a), BackendQuery::Sql(q)) => a.run(q, timeout).await,
                (Backend::Document(a), BackendQuery::Document(q)) => a.run(q, timeout).await,
                _ => Err(Error::Execution(format!(
                    "query was compiled for a different backend than `{}`",
                    self.name()
                ))),
            }
        }
    }
}
