use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use directories::BaseDirs;
use miette::IntoDiagnostic;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use indicator_ingest::archive;
use indicator_ingest::cancel::CancellationToken;
use indicator_ingest::config::{ConfigLoader, ResolvedConfig};
use indicator_ingest::domain::SourceKind;
use indicator_ingest::error::IngestError;
use indicator_ingest::geo::DEFAULT_GEO_TREE_URL;
use indicator_ingest::orchestrator::FetchOrchestrator;
use indicator_ingest::output::{JsonOutput, SourceList};
use indicator_ingest::registry::SourceRegistry;
use indicator_ingest::transport::{ReqwestBackend, SystemClock};

#[derive(Parser)]
#[command(name = "indicator-ingest")]
#[command(about = "Fetch indicator time series from five upstreams and normalize them into one tidy schema")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch, archive and normalize the configured sources")]
    Fetch(FetchArgs),
    #[command(about = "List the registered source identifiers")]
    Sources,
}

#[derive(Args)]
struct FetchArgs {
    #[arg(long)]
    config: Option<String>,

    /// Restrict the run to these sources (repeatable).
    #[arg(long = "source", value_enum)]
    sources: Vec<SourceKind>,

    #[arg(long)]
    out: Option<Utf8PathBuf>,

    #[arg(long)]
    raw_dir: Option<Utf8PathBuf>,

    #[arg(long)]
    no_raw: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Fetch(args) => run_fetch(args),
        Commands::Sources => {
            let list = SourceList {
                sources: SourceRegistry::standard().kinds().collect(),
            };
            JsonOutput::print_sources(&list).into_diagnostic()
        }
    }
}

fn run_fetch(args: FetchArgs) -> miette::Result<()> {
    let mut resolved = ConfigLoader::resolve(args.config.as_deref())?;
    resolved.restrict_to(&args.sources)?;

    let output_dir = match args.out.or_else(|| resolved.output_dir.clone()) {
        Some(dir) => dir,
        None => default_output_dir()?,
    };
    let raw_dir = if args.no_raw {
        None
    } else {
        args.raw_dir
            .or_else(|| resolved.raw_dir.clone())
            .or_else(|| Some(output_dir.join("raw")))
    };

    let backend = Arc::new(ReqwestBackend::new()?);
    let cancel = CancellationToken::new();
    let env = resolved.session_env(backend, Arc::new(SystemClock), cancel.clone());

    let registry = SourceRegistry::standard();
    let sources = registry.build_all(resolved.source_settings(), &env)?;

    let mut orchestrator = FetchOrchestrator::new(sources, cancel);
    if let Some(url) = geo_tree_url(&resolved) {
        orchestrator = orchestrator.with_geo_tree(&env, url);
    }
    if let Some(dir) = raw_dir {
        orchestrator = orchestrator.with_raw_dir(dir);
    }

    let output = orchestrator.run()?;
    for batch in &output.batches {
        let path = archive::batch_csv_path(&output_dir, batch.source);
        match archive::write_batch_csv(batch, &path) {
            Ok(()) => info!(source = %batch.source, rows = batch.len(), path = %path, "wrote batch"),
            Err(err) => warn!(source = %batch.source, error = %err, "could not write batch"),
        }
    }
    JsonOutput::print_summary(&output.summary).into_diagnostic()?;
    Ok(())
}

fn default_output_dir() -> Result<Utf8PathBuf, IngestError> {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_dir().join("indicator-ingest")).ok())
        .ok_or_else(|| IngestError::Filesystem("unable to resolve data directory".to_string()))
}

fn geo_tree_url(resolved: &ResolvedConfig) -> Option<String> {
    if let Some(url) = &resolved.geo_tree_url {
        return Some(url.clone());
    }
    resolved
        .sources
        .iter()
        .any(|source| source.kind == SourceKind::UnSdg)
        .then(|| DEFAULT_GEO_TREE_URL.to_string())
}
