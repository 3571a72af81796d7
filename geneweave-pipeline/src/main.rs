//! geneweave command-line entry point.
//!
//! Wires the Postgres store, the two-tier cache and the built-in sources
//! into an `UpdatePipeline`, then runs one command and prints its result as
//! JSON.

use clap::{Parser, Subcommand};
use geneweave_core::{
    CacheConfig, GeneId, GeneweaveResult, PipelineConfig, RunStatus, UpdateRequest, UpdateStrategy,
};
use geneweave_pipeline::{init_tracing, PipelineResult, TelemetryConfig, UpdatePipeline};
use geneweave_sources::{SourceContext, SourceRegistry};
use geneweave_storage::{DbConfig, PgAnnotationStore, PgCacheStore, TwoTierCache};
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "geneweave", version, about = "Multi-source gene annotation update engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run an annotation update
    Run {
        /// full, incremental, forced or selective
        #[arg(long, default_value = "incremental")]
        strategy: UpdateStrategy,
        /// Restrict the run to these sources (repeatable)
        #[arg(long = "source")]
        sources: Vec<String>,
        /// Restrict the run to these gene ids (repeatable)
        #[arg(long = "gene")]
        genes: Vec<GeneId>,
        /// Ignore source schedules and re-download bulk files
        #[arg(long)]
        force: bool,
    },
    /// Show per-source status
    Status,
    /// Validate stored annotations
    Validate {
        #[arg(long)]
        source: Option<String>,
    },
    /// Show cache statistics
    CacheStats {
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Delete expired cache entries
    CacheCleanup,
}

#[tokio::main]
async fn main() -> PipelineResult<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&TelemetryConfig::from_env())?;

    let (store, cache, registry) = connect()?;
    let pipeline = UpdatePipeline::new(store, cache.clone(), registry, PipelineConfig::from_env())?;

    let code = match cli.command {
        Command::Run {
            strategy,
            sources,
            genes,
            force,
        } => {
            let mut request = UpdateRequest::new(strategy);
            if !sources.is_empty() {
                request = request.with_sources(sources);
            }
            if !genes.is_empty() {
                request = request.with_gene_ids(genes);
            }
            if force {
                request = request.forced();
            }
            let summary = pipeline.run_update(request).await?;
            print_json(&summary);
            if summary.status == RunStatus::Failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Command::Status => {
            print_json(&pipeline.check_source_status().await?);
            ExitCode::SUCCESS
        }
        Command::Validate { source } => {
            let report = pipeline.validate_annotations(source.as_deref()).await?;
            print_json(&report);
            if report.is_valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Command::CacheStats { namespace } => {
            let stats = cache.stats(namespace.as_deref()).await?;
            print_json(&stats);
            ExitCode::SUCCESS
        }
        Command::CacheCleanup => {
            let removed = cache.cleanup_expired().await?;
            print_json(&serde_json::json!({ "removed": removed }));
            ExitCode::SUCCESS
        }
    };

    pipeline.shutdown().await;
    Ok(code)
}

/// Build the Postgres-backed store and cache and the built-in sources.
fn connect() -> GeneweaveResult<(Arc<PgAnnotationStore>, Arc<TwoTierCache>, SourceRegistry)> {
    let pool = DbConfig::from_env().create_pool()?;
    let store = Arc::new(PgAnnotationStore::new(pool.clone()));

    let cache_config = CacheConfig::from_env();
    cache_config.validate()?;
    let cache = Arc::new(TwoTierCache::new(Arc::new(PgCacheStore::new(pool)), cache_config));

    let context = SourceContext::from_env(cache.clone());
    let registry = SourceRegistry::from_builtin(&context)?;
    Ok((store, cache, registry))
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(body) => println!("{}", body),
        Err(e) => tracing::error!(error = %e, "Failed to serialize output"),
    }
}
