use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use sessionlens::commands::{
    analyze_media, init_project, score_report, serve, show_schema, show_status, AnalyzeOptions,
    ServeOptions,
};

/// sessionlens - multi-provider session analysis with gap-filling retries
#[derive(Parser)]
#[command(name = "sessionlens")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ./sessionlens.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the number of workers
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Override the targeted pass budget per job
    #[arg(long, global = true)]
    budget: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default sessionlens.toml
    Init {
        /// Project directory (defaults to current directory)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },

    /// Analyze one transcript and print the report
    Analyze {
        /// Media reference, resolved as a path under the transcripts directory
        media_ref: String,

        /// Job priority (higher runs sooner)
        #[arg(short, long, default_value = "0")]
        priority: i32,

        /// Supersede an active job for the same media
        #[arg(long)]
        force: bool,

        /// Directory holding transcripts
        #[arg(short, long, default_value = ".")]
        transcripts: PathBuf,

        /// Print the final job as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the worker pool behind the HTTP API
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,

        /// Directory holding transcripts
        #[arg(short, long, default_value = ".")]
        transcripts: PathBuf,
    },

    /// Summarize finalized jobs in the report store
    Status {
        /// Show every finalized job
        #[arg(short = 'a', long = "all")]
        all: bool,
    },

    /// Print the active report schema
    Schema,

    /// Score a saved report against the active schema
    Score {
        /// Report or finalized job JSON file
        report: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Init { path } => {
            let project_root = match path {
                Some(p) => p,
                None => std::env::current_dir().context("reading current directory")?,
            };
            init_project(&project_root)?;
        }

        Commands::Analyze {
            media_ref,
            priority,
            force,
            transcripts,
            json,
        } => {
            let options = AnalyzeOptions {
                media_ref,
                priority,
                force,
                transcripts,
                config_path: cli.config.clone(),
                workers: cli.workers,
                budget: cli.budget,
                json,
            };
            analyze_media(options).await.context("analysis failed")?;
        }

        Commands::Serve { bind, transcripts } => {
            let options = ServeOptions {
                bind,
                transcripts,
                config_path: cli.config.clone(),
                workers: cli.workers,
                budget: cli.budget,
            };
            serve(options).await.context("server failed")?;
        }

        Commands::Status { all } => {
            show_status(config_path, all).await?;
        }

        Commands::Schema => {
            show_schema(config_path)?;
        }

        Commands::Score { report } => {
            score_report(config_path, &report)
                .with_context(|| format!("scoring {}", report.display()))?;
        }
    }

    Ok(())
}
