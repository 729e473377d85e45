//! # docqa CLI
//!
//! The `docqa` binary runs the HTTP server and exposes the same pipeline for
//! one-off use from a shell.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docqa serve` | Start the HTTP API |
//! | `docqa ingest <FILE>` | Parse, chunk, embed and index one file |
//! | `docqa ask "<question>"` | Answer a question from the index |
//! | `docqa status <JOB_ID>` | Show one ingestion job |
//! | `docqa jobs` | List all ingestion jobs |
//! | `docqa stats` | Summarize the index and job map |
//!
//! ## Examples
//!
//! ```bash
//! docqa --config ./docqa.toml ingest ./handbook.pdf
//! docqa ask "How many vacation days do I get?" --top-k 6
//! RUST_LOG=docqa=debug docqa serve
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docqa::config;
use docqa::jobs::JobTracker;
use docqa::pipeline::RetrievalPipeline;
use docqa::{server, stats};

/// docqa: ask questions about your PDF and text documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. When the file does not exist the built-in defaults are used.
#[derive(Parser)]
#[command(
    name = "docqa",
    about = "docqa: document ingestion and grounded question answering",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./docqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Ingest a single `.pdf` or `.txt` file synchronously.
    Ingest {
        file: PathBuf,

        /// Document id stored with every passage (default: random UUID).
        #[arg(long)]
        doc_id: Option<String>,
    },

    /// Answer a question from the indexed documents.
    Ask {
        question: String,

        /// Number of passages to retrieve (default: `[retrieval].top_k`).
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Show the status of an ingestion job.
    Status { job_id: String },

    /// List all ingestion jobs, oldest first.
    Jobs,

    /// Show index statistics.
    Stats,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ingest { file, doc_id } => {
            let pipeline = RetrievalPipeline::from_config(&cfg)?;
            let doc_id = doc_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let source = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.display().to_string());

            let report = pipeline
                .ingest(&file, &doc_id, &source)
                .await
                .with_context(|| format!("Failed to ingest {}", file.display()))?;
            pipeline.index().wait_for_mirror().await;

            println!("Ingested {}", source);
            println!("  doc_id:   {}", report.doc_id);
            println!("  passages: {}", report.chunks);
            println!("  latency:  {} ms", report.latency_ms);
        }
        Commands::Ask { question, top_k } => {
            let pipeline = RetrievalPipeline::from_config(&cfg)?;
            let resp = pipeline.ask(&question, top_k).await?;

            println!("{}", resp.answer);
            if !resp.contexts.is_empty() {
                println!();
                println!("Sources:");
                for (i, ctx) in resp.contexts.iter().enumerate() {
                    println!("{}. [{:.2}] {} ({})", i + 1, ctx.score, ctx.source, ctx.doc_id);
                }
            }
            println!();
            println!("({} ms)", resp.latency_ms);
        }
        Commands::Status { job_id } => {
            let job = JobTracker::new(cfg.data.jobs_path()).get(&job_id)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Jobs => {
            let jobs = JobTracker::new(cfg.data.jobs_path()).list()?;
            if jobs.is_empty() {
                println!("No jobs.");
            }
            for job in jobs {
                println!(
                    "{}  {:<10}  {}  {}{}",
                    job.id,
                    job.status.to_string(),
                    job.created_at.format("%Y-%m-%d %H:%M:%S"),
                    job.filename,
                    job.error
                        .map(|e| format!("  ({})", e))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
