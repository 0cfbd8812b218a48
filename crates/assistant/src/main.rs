//! Operations assistant knowledge-base CLI
//!
//! Run with: cargo run --bin ops-assistant -- [OPTIONS] <COMMAND>

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kube_ops_assistant::{
    config::RagConfig,
    metrics::{gather_metrics, register_metrics},
    rag::{context_block, HttpEmbeddingClient, KeyCheck, RagContext},
};

#[derive(Parser)]
#[command(author, version, about = "Knowledge-base tooling for the Kubernetes operations assistant", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Print prometheus metrics after the command finishes
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and embed the knowledge-base documents
    Ingest {
        /// Document directory (defaults to rag.documents.dir)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Ingest, then show the chunks retrieved for a query
    Query {
        text: String,

        /// Number of chunks to retrieve (defaults to rag.retrieval.top_k)
        #[arg(short, long)]
        k: Option<usize>,
    },

    /// Check that the embedding API key is accepted
    CheckKey,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kube_ops_assistant={0},ops_assistant={0},warn", cli.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    register_metrics();

    let mut config = RagConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Ingest { dir } => {
            if let Some(dir) = dir {
                config.documents.dir = dir;
            }
            let rag = RagContext::new(config)?;
            let summary = rag.initialize_from_dir().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !summary.initialized() {
                anyhow::bail!("no chunks were stored");
            }
        }
        Commands::Query { text, k } => {
            if let Some(k) = k {
                config.top_k = k;
            }
            let rag = RagContext::new(config)?;
            let summary = rag.initialize_from_dir().await?;
            info!("Ingested {} of {} chunks", summary.stored, summary.total_chunks);

            let hits = rag.retriever.retrieve_with_scores(&text).await?;
            for (i, hit) in hits.iter().enumerate() {
                println!(
                    "{}. {:.4}  {} #{}",
                    i + 1,
                    hit.score,
                    hit.chunk.origin_filename,
                    hit.chunk.chunk_index
                );
            }
            println!();

            let chunks: Vec<_> = hits.into_iter().map(|hit| hit.chunk).collect();
            println!("{}", context_block(&chunks));
        }
        Commands::CheckKey => {
            let client = HttpEmbeddingClient::new(&config.embedding)?;
            match client.verify_api_key().await? {
                KeyCheck::Valid => println!("API key accepted (model {})", client.model()),
                KeyCheck::Inconclusive(reason) => {
                    println!("API key not rejected, but the probe did not succeed: {}", reason)
                }
            }
        }
    }

    if cli.print_metrics {
        print!("{}", gather_metrics()?);
    }

    Ok(())
}
