use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use marcdex::config;
use marcdex::index::IndexService;
use marcdex::link::{AuthorityLinker, Linker};
use marcdex::loader::{self, BatchLoader};
use marcdex::memory::MemoryIndex;
use marcdex::models::RelationScope;
use marcdex::parser::MarcXmlReader;
use marcdex::rules::RuleSet;
use marcdex::solr::SolrClient;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "marcdex")]
#[command(about = "Load MARC/MAB XML into a search index and repair record links")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Map XML records through a rule file and submit them to the index
    Load(LoadArgs),
    /// Restore parent/child links for documents written by one load
    Link(LinkArgs),
    /// Recount authority citations for documents written by one load
    LinkAuthority(LinkAuthorityArgs),
}

#[derive(Args)]
struct IndexArgs {
    /// Index core URL
    #[arg(long, default_value = config::DEFAULT_INDEX_URL)]
    index_url: String,

    /// HTTP timeout in seconds
    #[arg(long, default_value_t = config::HTTP_TIMEOUT_SECS)]
    timeout: u64,

    /// Rows per query page
    #[arg(long, default_value_t = config::QUERY_PAGE_SIZE)]
    page_size: usize,

    /// Partial updates sent per request
    #[arg(long, default_value_t = config::LINK_BATCH_SIZE)]
    link_batch_size: usize,
}

#[derive(Args)]
struct LoadArgs {
    /// Input files (.xml or .xml.bz2)
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Rule file; translation files are resolved next to it
    #[arg(short, long)]
    rules: PathBuf,

    /// Records per bulk submission
    #[arg(long, default_value_t = config::FLUSH_THRESHOLD)]
    flush_threshold: usize,

    /// Run the linker after loading
    #[arg(long)]
    link: bool,

    /// Compact the index after linking
    #[arg(long, requires = "link")]
    optimize: bool,

    /// Map and link against an in-memory index instead of the service
    #[arg(long)]
    dry_run: bool,

    /// Print the load outcome and link report as JSON
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    index: IndexArgs,
}

#[derive(Args)]
struct LinkArgs {
    /// Load timestamp of the run to link
    #[arg(short, long)]
    timestamp: String,

    /// Compact the index after linking
    #[arg(long)]
    optimize: bool,

    #[command(flatten)]
    index: IndexArgs,
}

#[derive(Args)]
struct LinkAuthorityArgs {
    /// Load timestamp of the run to link
    #[arg(short, long)]
    timestamp: String,

    /// Authority index core URL
    #[arg(long, default_value = config::DEFAULT_AUTHORITY_URL)]
    authority_url: String,

    #[command(flatten)]
    index: IndexArgs,
}

fn connect(url: &str, timeout: u64) -> Result<SolrClient> {
    SolrClient::new(url, timeout).with_context(|| format!("Failed to create index client for {url}"))
}

fn run_load(args: LoadArgs) -> Result<()> {
    let start = Instant::now();
    let rules = RuleSet::from_file(&args.rules)
        .with_context(|| format!("Failed to compile rule file: {}", args.rules.display()))?;

    let memory;
    let solr;
    let index: &dyn IndexService = if args.dry_run {
        info!("Dry run, writing to an in-memory index");
        memory = MemoryIndex::new();
        &memory
    } else {
        solr = connect(&args.index.index_url, args.index.timeout)?;
        &solr
    };

    let load_timestamp = loader::new_load_timestamp();
    let mut batch_loader = BatchLoader::new(&rules, index, args.flush_threshold, &load_timestamp);
    let mut unreadable = 0;
    for input in &args.inputs {
        info!(file = %input.display(), "Reading records");
        match MarcXmlReader::open(input, &load_timestamp) {
            Ok(mut reader) => {
                batch_loader.consume(reader.by_ref());
                batch_loader.note_malformed(reader.malformed_count());
            }
            Err(e) => {
                error!(file = %input.display(), error = %e, "Cannot open input, skipped");
                unreadable += 1;
            }
        }
    }

    let stats = batch_loader.stats().to_string();
    let outcome = batch_loader.finish();
    let load_duration = start.elapsed();

    println!();
    println!("=== Load ===");
    println!("Load timestamp:     {}", outcome.load_timestamp);
    println!("Batches:            {}", outcome.batch_results.len());
    println!("Failed batches:     {}", outcome.batch_results.iter().filter(|ok| !**ok).count());
    println!("Summary:            {stats}");
    println!("Time:               {:.2}s", load_duration.as_secs_f64());

    let mut report = None;
    if args.link {
        let scope = RelationScope::new(outcome.load_timestamp.as_str());
        let mut linker = Linker::new(index)
            .page_size(args.index.page_size)
            .batch_size(args.index.link_batch_size);
        let link_report = linker.run(&scope, args.optimize);
        println!();
        println!("=== Link ===");
        println!("Summary:            {}", linker.stats());
        for (phase, ok) in &link_report.phases {
            println!("{:<20}{}", format!("{phase}:"), if *ok { "ok" } else { "FAILED" });
        }
        report = Some(link_report);
    }

    if args.json {
        let summary = serde_json::json!({ "load": &outcome, "link": &report });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    if unreadable > 0 {
        bail!("{unreadable} of {} input files could not be opened", args.inputs.len());
    }
    if !outcome.success {
        bail!("Load {} finished with failures", outcome.load_timestamp);
    }
    if report.is_some_and(|r| !r.success) {
        bail!("Linking for load {} finished with failures", outcome.load_timestamp);
    }
    Ok(())
}

fn run_link(args: LinkArgs) -> Result<()> {
    let index = connect(&args.index.index_url, args.index.timeout)?;
    let scope = RelationScope::new(args.timestamp.as_str());
    let mut linker = Linker::new(&index)
        .page_size(args.index.page_size)
        .batch_size(args.index.link_batch_size);

    let start = Instant::now();
    let report = linker.run(&scope, args.optimize);
    info!(duration_secs = start.elapsed().as_secs_f64(), "Linking complete");

    println!();
    println!("=== Link ===");
    println!("Summary:            {}", linker.stats());
    for (phase, ok) in &report.phases {
        println!("{:<20}{}", format!("{phase}:"), if *ok { "ok" } else { "FAILED" });
    }

    if !report.success {
        bail!("Linking for load {} finished with failures", args.timestamp);
    }
    Ok(())
}

fn run_link_authority(args: LinkAuthorityArgs) -> Result<()> {
    let bib = connect(&args.index.index_url, args.index.timeout)?;
    let authority = connect(&args.authority_url, args.index.timeout)?;
    let scope = RelationScope::new(args.timestamp.as_str());
    let mut linker = AuthorityLinker::new(&bib, &authority)
        .page_size(args.index.page_size)
        .batch_size(args.index.link_batch_size);

    let report = linker.run(&scope);
    println!("Summary:            {}", linker.stats());

    if !report.success {
        bail!("Authority linking for load {} failed", args.timestamp);
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }

    let result = match cli.command {
        Commands::Load(args) => run_load(args),
        Commands::Link(args) => run_link(args),
        Commands::LinkAuthority(args) => run_link_authority(args),
    };

    match result {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
