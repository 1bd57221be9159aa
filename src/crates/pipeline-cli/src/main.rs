//! # pipeline
//!
//! Validates, inspects and runs YAML pipeline definitions using the built-in
//! generic units. Run outputs go to stdout as JSON lines; logs and events go
//! to stderr.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::RunOptions;

#[derive(Parser, Debug)]
#[command(name = "pipeline")]
#[command(about = "Run content-processing pipelines defined in YAML", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that a definition parses and builds into a valid graph
    Validate {
        /// Path to the YAML definition
        file: PathBuf,
    },

    /// Print units, edges, execution order and sinks of a definition
    Inspect {
        /// Path to the YAML definition
        file: PathBuf,
    },

    /// Run a definition against one input item
    Run {
        /// Path to the YAML definition
        file: PathBuf,

        /// Input item as a JSON object
        #[arg(short, long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read the input item from a JSON file
        #[arg(long, value_name = "PATH")]
        input_file: Option<PathBuf>,

        /// Deadline for the whole run (overrides the definition)
        #[arg(long, value_name = "MS", env = "PIPELINE_RUN_TIMEOUT_MS")]
        timeout_ms: Option<u64>,

        /// Write lifecycle events to stderr as JSON lines
        #[arg(long)]
        events: bool,

        /// Print the full run report instead of the outputs
        #[arg(long)]
        report: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut stdout = std::io::stdout().lock();
    let result = match cli.command {
        Command::Validate { file } => commands::validate(&file, &mut stdout).map(|_| ExitCode::SUCCESS),
        Command::Inspect { file } => commands::inspect(&file, &mut stdout).map(|_| ExitCode::SUCCESS),
        Command::Run {
            file,
            input,
            input_file,
            timeout_ms,
            events,
            report,
        } => {
            let options = RunOptions {
                input,
                input_file,
                timeout_ms,
                events,
                report,
            };
            commands::run(&file, options, &mut stdout)
                .await
                .map(commands::exit_code)
        }
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
