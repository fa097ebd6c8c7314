mod commands;

use anyhow::Result;
use autograder_common::config::AutograderConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "autograder-cli")]
#[command(about = "Autograder CLI - Run grading containers, write build contexts, and compare files", long_about = None)]
struct Cli {
    /// Config file (JSON); AUTOGRADER_* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true, default_value = "false")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single container to completion and print its output
    RunContainer {
        /// Image to run (pulled if missing)
        #[arg(short, long)]
        image: String,

        /// Bind mount as SOURCE:TARGET or SOURCE:TARGET:ro (repeatable)
        #[arg(short, long)]
        mount: Vec<String>,

        /// Kill the container after this many seconds (0 = no limit)
        #[arg(long, default_value = "0")]
        max_secs: u64,

        /// Container name prefix
        #[arg(long, default_value = "autograder-cli")]
        name: String,

        /// Command and arguments (defaults to the image's CMD)
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Write a Docker build context for an image config
    Dockerfile {
        /// Image config file (JSON); static files resolve relative to its directory
        #[arg(short = 'f', long)]
        image_config: PathBuf,

        /// Image name (tag)
        #[arg(short, long)]
        name: String,

        /// Output directory
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Build an image from its config, skipping the build when nothing changed
    BuildImage {
        /// Image config file (JSON)
        #[arg(short = 'f', long)]
        image_config: PathBuf,

        /// Image name (tag)
        #[arg(short, long)]
        name: String,

        /// Build even if the cache says the image is current
        #[arg(long, default_value = "false")]
        force: bool,
    },

    /// Compare two source files with a similarity engine
    Similarity {
        /// Engine name (dolos, jplag, fake)
        #[arg(short, long, default_value = "dolos")]
        engine: String,

        /// Boilerplate both files started from
        #[arg(short, long)]
        template: Option<PathBuf>,

        /// Scopes the engine's run lock
        #[arg(long, default_value = "cli")]
        lock_base: String,

        first: PathBuf,
        second: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = match &cli.config {
        Some(path) => AutograderConfig::load(path)?,
        None => AutograderConfig::from_env()?,
    };

    match cli.command {
        Commands::RunContainer {
            image,
            mount,
            max_secs,
            name,
            args,
        } => {
            commands::run_container(&config, &image, &mount, max_secs, &name, args).await?;
        }
        Commands::Dockerfile { image_config, name, out } => {
            commands::write_dockerfile(&image_config, &name, &out).await?;
        }
        Commands::BuildImage {
            image_config,
            name,
            force,
        } => {
            commands::build_image(&config, &image_config, &name, force).await?;
        }
        Commands::Similarity {
            engine,
            template,
            lock_base,
            first,
            second,
        } => {
            let paths = [first.as_path(), second.as_path()];
            commands::compute_similarity(&config, &engine, paths, template.as_deref(), &lock_base).await?;
        }
    }

    Ok(())
}
