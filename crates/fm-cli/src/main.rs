mod input;
mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fm_core::{
    FeedbackSignal, FieldMemory, FieldMemoryConfig, Filter, QueryContext, QueryKind, QueryRequest, QueryResponse,
    SimilarOptions, TracingObserver,
};
use fm_store::ProjectStore;
use rmcp::{ServiceExt, transport::stdio};
use tokio::time::MissedTickBehavior;

#[derive(Parser)]
#[command(name = "fm", about = "Field memory retrieval engine CLI and MCP server")]
struct Cli {
    /// Override project auto-detection
    #[arg(long, global = true)]
    project: Option<String>,

    /// TOML configuration file (defaults to $FM_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start MCP server on stdio transport
    Serve,

    /// Store records from a JSON file (one record or an array)
    Store {
        /// JSON file path
        file: PathBuf,
    },

    /// Query memories in a category
    Query {
        category: String,

        /// precision, discovery, hybrid or auto
        #[arg(long, default_value = "auto")]
        mode: String,

        #[arg(long, default_value_t = 0.5)]
        confidence: f64,

        #[arg(long, default_value_t = 0.5)]
        exploration: f64,

        /// Maximum number of results
        #[arg(long)]
        max: Option<usize>,

        /// Only return memories carrying this tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Find memories similar to an existing one
    Similar {
        id: String,

        #[arg(long, default_value_t = 0.0)]
        min_similarity: f64,

        #[arg(long, default_value_t = 10)]
        max: usize,
    },

    /// Force an emergence policy: idle, cascade, uncertainty or synthesis
    Discover { policy: String },

    /// Give relevance feedback on memories
    Feedback {
        /// boost or demote
        signal: String,

        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Show memory statistics
    Stats,

    /// Export state to a JSON file
    Export {
        /// Output file path
        path: PathBuf,
    },

    /// Import state from a JSON file
    Import {
        /// Input file path
        path: PathBuf,
    },

    /// Remove every memory in the project
    Clear,
}

fn load_config(cli: &Cli) -> Result<FieldMemoryConfig> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var("FM_CONFIG").ok().map(PathBuf::from));
    let Some(path) = path else {
        return Ok(FieldMemoryConfig::default());
    };
    let text = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    FieldMemoryConfig::from_toml_str(&text).with_context(|| format!("invalid config {}", path.display()))
}

fn locate_project(cli: &Cli) -> Result<ProjectStore> {
    let base_dir = std::env::var("FM_DATA_DIR").ok().map(PathBuf::from);
    ProjectStore::locate(cli.project.as_deref(), base_dir.as_deref()).context("failed to open project store")
}

/// Project-backed engine with state loaded from disk.
fn open_memory(cli: &Cli) -> Result<(ProjectStore, FieldMemory)> {
    let project = locate_project(cli)?;
    let config = load_config(cli)?;
    let persistence = project
        .open_persistence()
        .context("failed to open project database")?;
    let mut memory = FieldMemory::new(config)
        .context("invalid configuration")?
        .with_persistence(Box::new(persistence));
    memory.subscribe(Arc::new(TracingObserver));
    Ok((project, memory))
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Serve => cmd_serve(&cli).await,
        Commands::Store { file } => cmd_store(&cli, file),
        Commands::Query {
            category,
            mode,
            confidence,
            exploration,
            max,
            tags,
            json,
        } => {
            let kind: QueryKind = mode.parse()?;
            let request = QueryRequest {
                kind,
                category: Some(category.clone()),
                confidence: *confidence,
                exploration: *exploration,
                max_results: *max,
                filters: tags.iter().map(|t| Filter::tag(t.as_str())).collect(),
                ..Default::default()
            };
            cmd_query(&cli, request, *json)
        }
        Commands::Similar {
            id,
            min_similarity,
            max,
        } => cmd_similar(
            &cli,
            id,
            SimilarOptions {
                min_similarity: *min_similarity,
                max_results: *max,
            },
        ),
        Commands::Discover { policy } => cmd_discover(&cli, policy),
        Commands::Feedback { signal, ids } => cmd_feedback(&cli, signal, ids),
        Commands::Stats => cmd_stats(&cli),
        Commands::Export { path } => cmd_export(&cli, path),
        Commands::Import { path } => cmd_import(&cli, path),
        Commands::Clear => cmd_clear(&cli),
    }
}

async fn cmd_serve(cli: &Cli) -> Result<()> {
    let (project, memory) = open_memory(cli)?;
    tracing::info!("starting MCP server for project '{}'", project.project_id());

    let server = server::FmServer::new(memory);
    let service = match server.clone().serve(stdio()).await {
        Ok(service) => service,
        Err(e) => {
            // stdin closed before the handshake finished
            tracing::info!("client left before initialization: {e}");
            server.flush().await;
            return Ok(());
        }
    };

    let period = server.tick_period().await;
    let ticker = tokio::spawn({
        let server = server.clone();
        async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                server.idle_tick().await;
            }
        }
    });

    let outcome = tokio::select! {
        result = service.waiting() => result.map(|_| ()),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            Ok(())
        }
    };

    ticker.abort();
    server.flush().await;
    outcome?;
    Ok(())
}

fn cmd_store(cli: &Cli, file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?;
    let records = input::parse_records(&text).with_context(|| format!("invalid records in {}", file.display()))?;
    let (_, mut memory) = open_memory(cli)?;
    let count = memory.bulk_store(records).context("failed to store records")?;
    memory.flush();
    println!("stored {count} memories. total={}", memory.len());
    warn_if_degraded(&memory);
    Ok(())
}

fn cmd_query(cli: &Cli, request: QueryRequest, json: bool) -> Result<()> {
    let (_, mut memory) = open_memory(cli)?;
    let mut ctx = QueryContext::default();
    let response = memory.query(request, &mut ctx).context("query failed")?;
    memory.flush();

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_response(&response);
    }
    if cli.verbose {
        let m = &response.execution_metrics;
        eprintln!(
            "--- metrics: latency={:.2}ms, candidates={}, ensemble={}, emergence={} ---",
            m.latency_ms, m.candidates_considered, m.ensemble_size, m.emergence_ran
        );
    }
    warn_if_degraded(&memory);
    Ok(())
}

fn print_response(response: &QueryResponse) {
    println!("mode:       {}", response.mode);
    println!("coherence:  {:.2}", response.coherence_level);
    println!("results:    {}", response.memories.len());
    for (i, node) in response.memories.iter().enumerate() {
        println!(
            "  {}. {} [{}] confidence={:.2} {}",
            i + 1,
            node.id,
            node.category(),
            node.confidence(),
            node.content.title
        );
    }
    if !response.emergent_insights.is_empty() {
        println!("insights:   {}", response.emergent_insights.len());
        for insight in &response.emergent_insights {
            println!(
                "  - {} (novelty={:.2}, confidence={:.2})",
                insight.description, insight.novelty, insight.confidence
            );
        }
    }
    if let Some(note) = &response.note {
        println!("note:       {note}");
    }
}

fn cmd_similar(cli: &Cli, id: &str, options: SimilarOptions) -> Result<()> {
    let (_, mut memory) = open_memory(cli)?;
    let response = memory.find_similar(id, options)?;
    memory.flush();
    print_response(&response);
    Ok(())
}

fn cmd_discover(cli: &Cli, policy: &str) -> Result<()> {
    let (_, mut memory) = open_memory(cli)?;
    let insights = memory.trigger_emergent_discovery(policy)?;
    println!("insights:   {}", insights.len());
    for insight in &insights {
        println!(
            "  - {} [{}] (novelty={:.2}, confidence={:.2})",
            insight.description,
            insight.supporting_nodes.join(", "),
            insight.novelty,
            insight.confidence
        );
    }
    Ok(())
}

fn cmd_feedback(cli: &Cli, signal: &str, ids: &[String]) -> Result<()> {
    let signal: FeedbackSignal = signal.parse()?;
    let (_, mut memory) = open_memory(cli)?;
    let result = memory.apply_feedback(ids, signal);
    memory.flush();
    println!("boosted={}, demoted={}", result.boosted, result.demoted);
    if !result.unknown.is_empty() {
        println!("unknown:    {}", result.unknown.join(", "));
    }
    Ok(())
}

fn cmd_stats(cli: &Cli) -> Result<()> {
    let (project, memory) = open_memory(cli)?;
    let stats = memory.stats();

    println!("project:    {}", project.project_id());
    println!("memories:   {}", stats.total_memories);
    let categories: Vec<String> = stats
        .categories
        .iter()
        .map(|(c, n)| format!("{c}={n}"))
        .collect();
    println!("categories: {}", categories.join(", "));
    println!("pairs:      {}", stats.adaptation.tracked_pairs);
    println!("degraded:   {}", stats.degraded);
    Ok(())
}

fn cmd_export(cli: &Cli, path: &Path) -> Result<()> {
    let (_, memory) = open_memory(cli)?;
    let json = memory.export_json().context("failed to serialize state")?;
    std::fs::write(path, &json).with_context(|| format!("failed to write {}", path.display()))?;

    println!("exported {} memories to {}", memory.len(), path.display());
    Ok(())
}

fn cmd_import(cli: &Cli, path: &Path) -> Result<()> {
    let json = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let (_, mut memory) = open_memory(cli)?;
    let count = memory.import_json(&json).context("failed to import JSON")?;
    memory.flush();

    println!(
        "imported {count} memories from {}. total={}",
        path.display(),
        memory.len()
    );
    warn_if_degraded(&memory);
    Ok(())
}

fn cmd_clear(cli: &Cli) -> Result<()> {
    let (project, mut memory) = open_memory(cli)?;
    memory.clear();
    memory.flush();
    println!("cleared project '{}'", project.project_id());
    Ok(())
}

fn warn_if_degraded(memory: &FieldMemory) {
    if memory.is_degraded() {
        eprintln!("warning: persistence unavailable, changes were not saved");
    }
}
