mod workflows;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Build and publish Bonsai release artifacts.
#[derive(Parser)]
#[command(name = "bonsai-release")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to release.toml (default: nearest one above the current directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every matrix cell and publish the artifacts
    Release {
        /// Repository running this release (default: $GITHUB_REPOSITORY)
        #[arg(long, env = "GITHUB_REPOSITORY")]
        repository: Option<String>,

        /// Publish a dated prerelease
        #[arg(long, conflicts_with = "stable")]
        nightly: bool,

        /// Publish a stable release
        #[arg(long)]
        stable: bool,

        /// Number of cells built at once
        #[arg(short, long)]
        workers: Option<usize>,

        /// Succeed when at least one cell published
        #[arg(long)]
        tolerate_partial: bool,
    },

    /// Print the expanded build matrix
    Matrix,

    /// Print every variant flag set with its build number offset
    Variants,

    /// Print the build identity of one runtime
    Identity {
        /// Runtime version, e.g. 311
        #[arg(short, long)]
        runtime: String,

        /// Variant flag as axis=value; overrides the configured selection
        #[arg(long = "variant", value_name = "AXIS=VALUE")]
        variants: Vec<String>,

        /// Source tree to hash into the build string
        #[arg(long)]
        source: Option<PathBuf>,
    },

    /// Show the most recent release run
    Runs {
        /// Delete all but the newest N runs
        #[arg(long, value_name = "N")]
        prune: Option<usize>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .without_time()
        .init();

    let config = workflows::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Release {
            repository,
            nightly,
            stable,
            workers,
            tolerate_partial,
        } => workflows::release(
            config,
            workflows::ReleaseArgs {
                repository,
                nightly,
                stable,
                workers,
                tolerate_partial,
            },
        ),
        Commands::Matrix => workflows::print_matrix(&config),
        Commands::Variants => workflows::print_variants(&config),
        Commands::Identity {
            runtime,
            variants,
            source,
        } => workflows::print_identity(&config, &runtime, &variants, source.as_deref()),
        Commands::Runs { prune } => workflows::show_runs(&config, prune),
    }
}
