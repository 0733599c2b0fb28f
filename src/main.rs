use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use querygate::backend::{compile_native, Backend, NativeQuery, RelationalAdapter};
use querygate::db::{acquire, introspect_schema};
use querygate::generator::{NoOracle, ProcessOracle};
use querygate::pipeline::SchemaSource;
use querygate::schema::{parse_with_warnings, SchemaCache};
use querygate::{
    validate, BackendType, Config, Error, PipelineError, Policy, QueryDescriptor, QueryPipeline,
    Stage,
};

/// Compile natural-language requests into validated, read-only queries
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file (default: <config dir>/querygate/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Schema document, overriding `schema_path` from the configuration
    #[arg(long = "schema-file", global = true)]
    schema_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse a schema document and print its summary
    Schema { file: PathBuf },
    /// Validate a descriptor and print the compiled native query
    Check {
        #[arg(long)]
        descriptor: PathBuf,
    },
    /// Validate and execute a descriptor
    Run {
        #[arg(long)]
        descriptor: PathBuf,
    },
    /// Route, generate, validate and execute a natural-language request
    Ask { message: String },
    /// Print the relational backend's catalog as a schema document
    Introspect {
        #[arg(long, default_value = "public")]
        namespace: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref());
    let level = config
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_logging(&level);

    let result = match config {
        Ok(config) => run(cli, config).await,
        Err(e) => Err(e.into()),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr; stdout carries only results.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn report(err: &anyhow::Error) {
    let body = if let Some(e) = err.downcast_ref::<PipelineError>() {
        serde_json::to_value(e.to_response()).unwrap_or_default()
    } else if let Some(e) = err.downcast_ref::<Error>() {
        json!({ "error": {
            "kind": e.kind(),
            "message": e.to_string(),
            "retryable": e.is_retryable(),
        }})
    } else {
        json!({ "error": {
            "kind": "cli",
            "message": format!("{:#}", err),
            "retryable": false,
        }})
    };
    println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Command::Schema { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("cannot read {}", file.display()))?;
            let (schema, warnings) =
                parse_with_warnings(&raw).map_err(|e| PipelineError::new(Stage::Schema, e))?;
            print!("{}", schema.summary());
            for warning in &warnings {
                println!("warning: {}", warning);
            }
        }
        Command::Check { descriptor } => {
            let schema = load_schema(cli.schema_file.as_deref(), &config)?.current();
            let descriptor = read_descriptor(&descriptor)?;
            let validated = validate(descriptor, &schema, &Policy::from_config(&config))
                .map_err(|e| PipelineError::new(Stage::Validate, e))?;
            let compiled = compile_native(config.backend_type, &validated)
                .map_err(|e| PipelineError::new(Stage::Validate, e))?;
            print_json(&json!({
                "backend": config.backend_type.name(),
                "query_type": validated.query_type(),
                "limit": validated.limit_info(),
                "collections_involved": validated.collections_involved(),
                "descriptor": validated.descriptor(),
                "compiled_query": compiled.render(),
            }))?;
        }
        Command::Run { descriptor } => {
            let schema = load_schema(cli.schema_file.as_deref(), &config)?;
            let descriptor = read_descriptor(&descriptor)?;
            let backend = connect(&config).await?;
            let pipeline = QueryPipeline::new(NoOracle, backend, schema, &config);
            print_json(&pipeline.run_descriptor(descriptor).await?)?;
        }
        Command::Ask { message } => {
            let schema = load_schema(cli.schema_file.as_deref(), &config)?;
            let oracle = ProcessOracle::from_config(&config.oracle)
                .map_err(|e| PipelineError::new(Stage::Route, Error::Config(e.to_string())))?;
            let backend = connect(&config).await?;
            let pipeline = QueryPipeline::new(oracle, backend, schema, &config);
            print_json(&pipeline.handle(&message).await?)?;
        }
        Command::Introspect { namespace } => {
            if config.backend_type != BackendType::Relational {
                return Err(Error::Config("introspection needs the relational backend".into()).into());
            }
            config.require_connection()?;
            let adapter = RelationalAdapter::connect(&config)
                .map_err(|e| PipelineError::new(Stage::Schema, e))?;
            let client = acquire(adapter.pool(), config.query_timeout())
                .await
                .map_err(|e| PipelineError::new(Stage::Schema, e))?;
            let schema = introspect_schema(&client, &namespace)
                .await
                .map_err(|e| PipelineError::new(Stage::Schema, e))?;
            print!("{}", schema.to_markdown());
        }
    }
    Ok(())
}

fn load_schema(override_path: Option<&Path>, config: &Config) -> Result<SchemaSource> {
    let path = override_path
        .or(config.schema_path.as_deref())
        .ok_or_else(|| Error::Config("no schema document: pass --schema-file or set schema_path".into()))?;
    let cache = SchemaCache::open(path).map_err(|e| PipelineError::new(Stage::Schema, e))?;
    Ok(SchemaSource::Cached(Arc::new(cache)))
}

fn read_descriptor(path: &Path) -> Result<QueryDescriptor> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let descriptor = QueryDescriptor::decode(&raw).map_err(|e| {
        PipelineError::new(Stage::Validate, Error::InvalidDescriptor(e.to_string()))
    })?;
    Ok(descriptor)
}

async fn connect(config: &Config) -> Result<Backend> {
    Ok(Backend::connect(config)
        .await
        .map_err(|e| PipelineError::new(Stage::Execute, e))?)
}
