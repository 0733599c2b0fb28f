//! End-to-end request handling: route, generate, validate, execute, format.
//!
//! The pipeline owns its collaborators (oracle, adapter, schema source); none
//! are looked up from process-wide state. Stages run strictly in sequence and
//! every failure comes back tagged with the stage it left.
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::{NativeQuery, QueryAdapter};
use crate::config::Config;
use crate::descriptor::QueryDescriptor;
use crate::error::{Error, PipelineError, Stage};
use crate::format::{format, ResultEnvelope, Timing};
use crate::gate::{validate, Policy, ValidatedDescriptor};
use crate::generator::{generate, GeneratorOptions, Oracle};
use crate::planner::{RouteDecision, Router};
use crate::schema::{Schema, SchemaCache};

/// Where the pipeline reads its schema from on each request.
#[derive(Debug, Clone)]
pub enum SchemaSource {
    Fixed(Arc<Schema>),
    /// Re-read when the schema file changes.
    Cached(Arc<SchemaCache>),
}

impl SchemaSource {
    pub fn current(&self) -> Arc<Schema> {
        match self {
            SchemaSource::Fixed(schema) => Arc::clone(schema),
            SchemaSource::Cached(cache) => cache.get(),
        }
    }
}

impl From<Schema> for SchemaSource {
    fn from(schema: Schema) -> Self {
        SchemaSource::Fixed(Arc::new(schema))
    }
}

impl From<Arc<Schema>> for SchemaSource {
    fn from(schema: Arc<Schema>) -> Self {
        SchemaSource::Fixed(schema)
    }
}

impl From<Arc<SchemaCache>> for SchemaSource {
    fn from(cache: Arc<SchemaCache>) -> Self {
        SchemaSource::Cached(cache)
    }
}

/// Result of [`QueryPipeline::handle`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum Outcome {
    Query {
        decision: RouteDecision,
        envelope: Box<ResultEnvelope>,
    },
    /// The router sent the message elsewhere; nothing was generated or run.
    NonQuery { decision: RouteDecision },
}

/// A validated descriptor and its compiled native form, not yet executed.
#[derive(Debug)]
pub struct Checked<Q> {
    pub validated: ValidatedDescriptor,
    pub compiled: Q,
    pub compile_time: Duration,
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

fn fail(stage: Stage, error: Error) -> PipelineError {
    tracing::error!(
        stage = %stage,
        kind = ?error.kind(),
        retryable = error.is_retryable(),
        error = %error,
        "stage failed"
    );
    PipelineError::new(stage, error)
}

pub struct QueryPipeline<O, A> {
    oracle: O,
    adapter: A,
    schema: SchemaSource,
    policy: Policy,
    router: Router,
    generator: GeneratorOptions,
    query_timeout: Duration,
}

impl<O: Oracle, A: QueryAdapter> QueryPipeline<O, A> {
    pub fn new(oracle: O, adapter: A, schema: impl Into<SchemaSource>, config: &Config) -> Self {
        Self {
            oracle,
            adapter,
            schema: schema.into(),
            policy: Policy::from_config(config),
            router: Router::from_config(config),
            generator: GeneratorOptions {
                timeout: config.oracle.timeout(),
                ..GeneratorOptions::default()
            },
            query_timeout: config.query_timeout(),
        }
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    pub fn with_generator_options(mut self, options: GeneratorOptions) -> Self {
        self.generator = options;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.schema.current()
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Route `message`, and run the query path when the router picks it.
    pub async fn handle(&self, message: &str) -> PipelineResult<Outcome> {
        let schema = self.schema.current();
        let decision = self.router.route(&self.oracle, message, &schema).await;
        if !decision.takes_query_path() {
            return Ok(Outcome::NonQuery { decision });
        }
        let envelope = self.answer(message, &schema).await?;
        Ok(Outcome::Query {
            decision,
            envelope: Box::new(envelope),
        })
    }

    /// Generate a descriptor for `request` and run it, skipping the router.
    pub async fn run_prompt(&self, request: &str) -> PipelineResult<ResultEnvelope> {
        let schema = self.schema.current();
        self.answer(request, &schema).await
    }

    /// Run a descriptor supplied by the caller.
    pub async fn run_descriptor(&self, descriptor: QueryDescriptor) -> PipelineResult<ResultEnvelope> {
        let schema = self.schema.current();
        self.execute(descriptor, &schema).await
    }

    /// Validate and compile without executing.
    pub fn check(&self, descriptor: QueryDescriptor) -> PipelineResult<Checked<A::Compiled>> {
        let schema = self.schema.current();
        self.prepare(descriptor, &schema)
    }

    async fn answer(&self, request: &str, schema: &Schema) -> PipelineResult<ResultEnvelope> {
        let generation = generate(&self.oracle, request, schema, &self.generator)
            .await
            .map_err(|e| fail(Stage::Generate, e))?;
        self.execute(generation.descriptor, schema).await
    }

    fn prepare(&self, descriptor: QueryDescriptor, schema: &Schema) -> PipelineResult<Checked<A::Compiled>> {
        let started = Instant::now();
        let validated = validate(descriptor, schema, &self.policy).map_err(|e| fail(Stage::Validate, e))?;
        let compiled = self
            .adapter
            .compile(&validated)
            .map_err(|e| fail(Stage::Validate, e))?;
        let compile_time = started.elapsed();
        let limit = validated.limit_info();
        tracing::debug!(
            stage = "validate",
            collection = validated.primary_collection(),
            query_type = ?validated.query_type(),
            limit = limit.applied,
            clamped = limit.clamped,
            compile_us = compile_time.as_micros() as u64,
            "descriptor accepted"
        );
        Ok(Checked {
            validated,
            compiled,
            compile_time,
        })
    }

    async fn execute(&self, descriptor: QueryDescriptor, schema: &Schema) -> PipelineResult<ResultEnvelope> {
        let Checked {
            validated,
            compiled,
            compile_time,
        } = self.prepare(descriptor, schema)?;

        let executed_at = Utc::now();
        let started = Instant::now();
        let records = match tokio::time::timeout(
            self.query_timeout,
            self.adapter.run(&compiled, self.query_timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(Stage::Execute, self.query_timeout)),
        }
        .map_err(|e| fail(Stage::Execute, e))?;
        let elapsed = started.elapsed();
        tracing::info!(
            stage = "execute",
            backend = self.adapter.name(),
            collection = validated.primary_collection(),
            records = records.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "query executed"
        );

        let envelope = format(
            &records,
            &validated,
            self.adapter.name(),
            &compiled.render(),
            &Timing {
                executed_at,
                compile_time,
                elapsed,
            },
        );
        tracing::debug!(
            stage = "format",
            results = envelope.results.total_count,
            skipped = envelope.summary.skipped_records,
            "envelope built"
        );
        Ok(envelope)
    }
}
