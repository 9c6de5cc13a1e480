use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use nppes_ingest::archive::ArchiveFetcher;
use nppes_ingest::dedup::dedup_csv;
use nppes_ingest::mapper::load_taxonomy_descriptions;
use nppes_ingest::prelude::*;
use nppes_ingest::sink::JsonLinesSink;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "npingest")]
#[command(about = "NPPES ingestion - filter the bulk file or poll the NPI Registry API and upsert providers", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the per-user config path)
    #[arg(short, long, global = true, env = "NPPES_INGEST_CONFIG")]
    config: Option<PathBuf>,
    /// Hide progress bars
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep rows whose taxonomy codes hit the target set, writing a CSV
    Filter(FilterArgs),
    /// Drop exact duplicate rows from a CSV
    Dedup(DedupArgs),
    /// Run the file pipeline into a sink
    IngestFile(IngestFileArgs),
    /// Run the API pipeline into a sink
    IngestApi(IngestApiArgs),
    /// Download the dissemination archive and extract the main data file
    Download(DownloadArgs),
    /// Show or write the configuration
    Config(ConfigArgs),
}

#[derive(Args)]
struct FilterArgs {
    /// Source NPPES CSV
    input: PathBuf,
    /// Output CSV
    #[arg(short, long, default_value = "filtered_npi_providers.csv")]
    output: PathBuf,
    /// Rows per chunk
    #[arg(long)]
    chunk_size: Option<usize>,
    /// Worker threads (default: all cores)
    #[arg(long)]
    threads: Option<usize>,
    /// Target taxonomy codes, comma separated
    #[arg(long, value_delimiter = ',')]
    codes: Vec<String>,
}

#[derive(Args)]
struct DedupArgs {
    input: PathBuf,
    #[arg(short, long, default_value = "deduped_npi_providers.csv")]
    output: PathBuf,
}

#[derive(Args)]
struct SinkArgs {
    /// Sink format
    #[arg(long, value_enum, default_value_t = SinkKind::Sql)]
    sink: SinkKind,
    /// Sink output file
    #[arg(short, long, default_value = "providers.sql")]
    output: PathBuf,
    /// Records per upsert batch
    #[arg(long)]
    batch_size: Option<usize>,
}

#[derive(Args)]
struct IngestFileArgs {
    /// Local source CSV
    #[arg(required_unless_present = "download")]
    input: Option<PathBuf>,
    /// Fetch the source from the dissemination archive instead
    #[arg(long, conflicts_with = "input")]
    download: bool,
    /// NUCC taxonomy CSV for taxonomy descriptions
    #[arg(long)]
    taxonomy_file: Option<PathBuf>,
    #[command(flatten)]
    sink: SinkArgs,
}

#[derive(Args)]
struct IngestApiArgs {
    /// Query terms (taxonomy descriptions); defaults to the configured terms
    #[arg(short, long = "term")]
    terms: Vec<String>,
    #[command(flatten)]
    sink: SinkArgs,
}

#[derive(Args)]
struct DownloadArgs {
    /// Work directory for the archive and the extracted file
    #[arg(short, long)]
    out_dir: Option<PathBuf>,
    /// Archive URL (default: this month's dissemination file)
    #[arg(long)]
    url: Option<String>,
    /// Keep the zip after extraction
    #[arg(long)]
    keep_archive: bool,
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    action: ConfigAction,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the default config file path
    Path,
    /// Write the default configuration to a file
    Init {
        /// Target file (default: the per-user config path)
        path: Option<PathBuf>,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum SinkKind {
    /// PostgreSQL upsert script
    Sql,
    /// JSON Lines
    Jsonl,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        match e.downcast_ref::<IngestError>() {
            Some(err) => eprintln!("Error: {}", err.user_message()),
            None => eprintln!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = IngestConfig::load(cli.config.as_deref())?;
    if cli.quiet {
        config.filter.show_progress = false;
    }

    match cli.command {
        Commands::Filter(args) => cmd_filter(config, args),
        Commands::Dedup(args) => cmd_dedup(args),
        Commands::IngestFile(args) => runtime()?.block_on(cmd_ingest_file(config, args)),
        Commands::IngestApi(args) => runtime()?.block_on(cmd_ingest_api(config, args)),
        Commands::Download(args) => runtime()?.block_on(cmd_download(config, args)),
        Commands::Config(args) => cmd_config(config, cli.config.as_deref(), args),
    }
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to create tokio runtime")
}

fn cmd_filter(mut config: IngestConfig, args: FilterArgs) -> anyhow::Result<()> {
    if let Some(size) = args.chunk_size {
        config.filter.chunk_size = size;
    }
    if args.threads.is_some() {
        config.filter.parallel_threads = args.threads;
    }
    if !args.codes.is_empty() {
        config.filter.target_codes = args.codes;
    }
    config.validate()?;

    let filter = ChunkedFilter::new(&config.filter)?;
    let stats = filter.filter_to_csv(&args.input, &args.output)?;
    println!(
        "Kept {} of {} rows in {} chunks ({:.1?}) -> {}",
        stats.rows_matched,
        stats.rows_scanned,
        stats.chunks,
        stats.elapsed,
        args.output.display()
    );
    Ok(())
}

fn cmd_dedup(args: DedupArgs) -> anyhow::Result<()> {
    let stats = dedup_csv(&args.input, &args.output)?;
    println!(
        "Rows before deduplication: {}, after: {} -> {}",
        stats.rows_before,
        stats.rows_after,
        args.output.display()
    );
    Ok(())
}

fn open_sink(args: &SinkArgs) -> anyhow::Result<Box<dyn ProviderSink>> {
    let sink: Box<dyn ProviderSink> = match args.sink {
        SinkKind::Sql => Box::new(SqlUpsertSink::create(&args.output)?),
        SinkKind::Jsonl => Box::new(JsonLinesSink::create(&args.output)?),
    };
    Ok(sink)
}

async fn cmd_ingest_file(mut config: IngestConfig, args: IngestFileArgs) -> anyhow::Result<()> {
    if let Some(size) = args.sink.batch_size {
        config.orchestrator.batch_size = size;
    }
    let sink = open_sink(&args.sink)?;
    let mut orchestrator = IngestionOrchestrator::new(config, sink);
    if let Some(path) = &args.taxonomy_file {
        let descriptions = load_taxonomy_descriptions(path)
            .with_context(|| format!("Failed to load taxonomy file {}", path.display()))?;
        orchestrator = orchestrator.with_taxonomy_descriptions(descriptions);
    }

    let report = match &args.input {
        Some(path) if !args.download => orchestrator.run_file_pipeline(path).await?,
        _ => orchestrator.run_downloaded_file_pipeline().await?,
    };

    println!("Source: {}", report.source.display());
    println!("Taxonomy columns: {}", report.taxonomy_columns.len());
    println!("Rows scanned: {}", report.rows_scanned);
    println!("Rows matched: {}", report.rows_matched);
    println!("Duplicates removed: {}", report.duplicates_removed);
    println!(
        "Upserted {} records in {} batches ({:.1?}) -> {}",
        report.upserted,
        report.batches,
        report.elapsed,
        args.sink.output.display()
    );
    Ok(())
}

async fn cmd_ingest_api(mut config: IngestConfig, args: IngestApiArgs) -> anyhow::Result<()> {
    if let Some(size) = args.sink.batch_size {
        config.orchestrator.batch_size = size;
    }
    let terms = if args.terms.is_empty() {
        config.poller.query_terms.clone()
    } else {
        args.terms
    };
    if terms.is_empty() {
        anyhow::bail!("No query terms given; pass --term or set poller.query_terms");
    }

    let sink = open_sink(&args.sink)?;
    let orchestrator = IngestionOrchestrator::new(config, sink);
    let report = orchestrator.run_api_pipeline(&terms).await?;

    for term in &report.terms {
        println!(
            "{} | {} requests | {} results | {:?}",
            term.term, term.requests, term.fetched, term.final_state
        );
    }
    println!(
        "Fetched {} results, upserted {} records in {} batches ({} pauses, {:.1?}) -> {}",
        report.results_fetched,
        report.upserted,
        report.batches,
        report.pauses,
        report.elapsed,
        args.sink.output.display()
    );
    Ok(())
}

async fn cmd_download(mut config: IngestConfig, args: DownloadArgs) -> anyhow::Result<()> {
    if let Some(dir) = args.out_dir {
        config.archive.work_dir = dir;
    }
    if args.url.is_some() {
        config.archive.url = args.url;
    }
    config.archive.keep_archive |= args.keep_archive;

    let fetcher = ArchiveFetcher::new(&config.archive)?.with_progress(config.filter.show_progress);
    let path = fetcher.fetch().await?;
    println!("Source file ready: {}", path.display());
    Ok(())
}

fn cmd_config(config: IngestConfig, explicit: Option<&Path>, args: ConfigArgs) -> anyhow::Result<()> {
    match args.action {
        ConfigAction::Show => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Path => match explicit.map(Path::to_path_buf).or_else(IngestConfig::default_config_path) {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("Could not determine a config directory for this platform"),
        },
        ConfigAction::Init { path } => {
            let target = path
                .or_else(IngestConfig::default_config_path)
                .context("Could not determine a config directory; pass a path")?;
            IngestConfig::default().save(&target)?;
            println!("Wrote default configuration to {}", target.display());
        }
    }
    Ok(())
}
