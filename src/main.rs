//! medgraph CLI: query an evidence-annotated medical knowledge graph.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use medgraph::config::EngineConfig;
use medgraph::engine::Engine;
use medgraph::export::to_cypher;

#[derive(Parser)]
#[command(name = "medgraph", version, about = "Medical knowledge-graph query engine")]
struct Cli {
    /// Graph snapshot (JSON with `nodes` and `edges`).
    #[arg(long, global = true, default_value = "graph.json")]
    snapshot: PathBuf,

    /// Engine configuration (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a single query document.
    Query {
        /// Path to the JSON query.
        #[arg(long)]
        file: PathBuf,
    },

    /// Execute a batch request `{"queries": [{"id", "query"}]}`.
    Batch {
        /// Path to the JSON batch request.
        #[arg(long)]
        file: PathBuf,
    },

    /// List contradiction groups in the snapshot.
    Contradictions,

    /// Render a query as Cypher without executing it.
    Cypher {
        /// Path to the JSON query.
        #[arg(long)]
        file: PathBuf,
    },

    /// Show snapshot statistics.
    Stats,
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let engine = Engine::open(&cli.snapshot, config)?;

    match cli.command {
        Commands::Query { file } => {
            let text = std::fs::read_to_string(&file).into_diagnostic()?;
            let body = engine.execute_json(&text);
            println!("{}", serde_json::to_string_pretty(&body).into_diagnostic()?);
        }

        Commands::Batch { file } => {
            let text = std::fs::read_to_string(&file).into_diagnostic()?;
            let body = match serde_json::from_str(&text) {
                Ok(raw) => engine.execute_batch(&raw).unwrap_or_else(|e| e.to_envelope()),
                Err(e) => medgraph::error::EngineError::InvalidJson { message: e.to_string() }.to_envelope(),
            };
            println!("{}", serde_json::to_string_pretty(&body).into_diagnostic()?);
        }

        Commands::Contradictions => {
            let groups = engine.find_contradictions();
            if groups.is_empty() {
                println!("No contradictions.");
            }
            for group in &groups {
                let polarities: Vec<&str> = group.polarities.iter().map(|p| p.as_str()).collect();
                println!(
                    "{} --{}--> {}  [{}]",
                    group.subject_id,
                    group.predicate,
                    group.object_id,
                    polarities.join(", ")
                );
                println!("  papers: {}", group.papers.join(", "));
                println!("  edges:  {}", group.edge_ids().collect::<Vec<_>>().join(", "));
            }
        }

        Commands::Cypher { file } => {
            let text = std::fs::read_to_string(&file).into_diagnostic()?;
            let raw: serde_json::Value = serde_json::from_str(&text).into_diagnostic()?;
            let query = engine.parse(&raw)?;
            println!("{}", to_cypher(&query)?);
        }

        Commands::Stats => {
            let stats = engine.snapshot().stats();
            println!("Nodes: {}", stats.nodes);
            for (node_type, count) in &stats.nodes_by_type {
                println!("  {node_type:<22} {count}");
            }
            println!("Edges: {}", stats.edges);
            for (layer, count) in &stats.edges_by_layer {
                println!("  {layer:<22} {count}");
            }
            println!("Contradiction groups: {}", stats.contradiction_groups);
        }
    }

    Ok(())
}
