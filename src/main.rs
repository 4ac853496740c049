//! # monarch-dl CLI
//!
//! Command-line interface for the monarch-dl library.
//! Provides a curl-like interface for resumable multi-connection downloads.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::error;
use monarch_dl::{
    filename_for_url, CallbackSink, EndCause, Engine, EventSink, OverwriteBehavior, Task,
    TaskOptions,
};

mod cli;

/// Command-line interface for monarch-dl
#[derive(Parser)]
#[command(name = "monarch-dl")]
#[command(about = "Resumable multi-connection downloader with breakpoint support")]
#[command(long_about = "Downloads files over parallel ranged connections:
  monarch-dl https://example.com/big.iso            # Download next to the terminal
  monarch-dl https://example.com/big.iso big.iso    # Explicit output path
  monarch-dl https://example.com/big.iso -c 8       # Force 8 connections

An interrupted download leaves a <output>.resume sidecar and continues from
where it stopped on the next run, as long as the file on the server has not
changed in the meantime.

File Overwrite Behavior:
  By default an existing file is resumed when possible, else replaced
  --force                          # Start over, ignoring saved progress
  --no-clobber                     # Never overwrite, fail if file exists")]
#[command(version = env!("MONARCH_VERSION"))]
struct Cli {
    /// Source url to download
    url: String,

    /// Output file path (defaults to the url's file name)
    #[arg(default_value = "")]
    output: String,

    /// Number of parallel block connections (default: size-based heuristic)
    #[arg(short, long)]
    connections: Option<usize>,

    /// Ignore any saved breakpoint and start from scratch
    #[arg(long)]
    no_resume: bool,

    /// Retries per block and failure cause before the task fails
    #[arg(long)]
    retries: Option<u32>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Start over, discarding existing file and saved progress
    #[arg(short, long)]
    force: bool,

    /// Never overwrite existing files (fail if destination exists)
    #[arg(long)]
    no_clobber: bool,
}

/// Resolve the output path from CLI arguments
fn resolve_output(url: &str, output: &str) -> monarch_dl::Result<PathBuf> {
    if output.is_empty() {
        Ok(PathBuf::from(filename_for_url(url)?))
    } else {
        Ok(PathBuf::from(output))
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("❌ Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging to stderr
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Stderr)
        .init();

    if cli.verbose {
        eprintln!("👑 monarch-dl v{} starting...", env!("MONARCH_VERSION"));
    }

    // Validate conflicting flags
    if cli.force && cli.no_clobber {
        anyhow::bail!("--force and --no-clobber cannot be used together");
    }

    let path = resolve_output(&cli.url, &cli.output)?;
    eprintln!("📁 Saving to: {}", path.display());

    let mut options = TaskOptions {
        block_count: cli.connections,
        resume: !cli.no_resume,
        ..Default::default()
    };
    if cli.force {
        options.overwrite = OverwriteBehavior::Force;
    } else if cli.no_clobber {
        options.overwrite = OverwriteBehavior::NeverOverwrite;
    }
    if let Some(retries) = cli.retries {
        options.retry.max_retries = retries;
    }

    let engine = Engine::new();
    let task = Task::new(cli.url.clone(), path);
    let task_id = task.id;

    let progress =
        Arc::new(cli::ProgressSink::new(&format!("🌐 Downloading {}", cli.url))) as Arc<dyn EventSink>;
    let summary = Arc::new(CallbackSink::new(|_task, cause, _error| match cause {
        EndCause::Completed => {}
        EndCause::Canceled => eprintln!("🛑 Canceled; partial progress saved"),
        cause => eprintln!("❌ Download ended: {cause}"),
    })) as Arc<dyn EventSink>;

    let handle = engine.submit(task, options, vec![progress, summary])?;

    // Ctrl-C cancels the task; the engine keeps the breakpoint for a resume
    let signal_engine = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_engine.cancel(task_id);
        }
    });

    match handle.wait().await? {
        EndCause::Canceled => std::process::exit(130),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_output_auto() {
        let path = resolve_output("https://example.com/pub/data.tar.gz", "").unwrap();
        assert_eq!(path, PathBuf::from("data.tar.gz"));
    }

    #[test]
    fn test_resolve_output_custom_file() {
        let path = resolve_output("https://example.com/pub/data.tar.gz", "my-data.tar.gz").unwrap();
        assert_eq!(path, PathBuf::from("my-data.tar.gz"));
    }

    #[test]
    fn test_resolve_output_rejects_bare_host() {
        assert!(resolve_output("https://example.com", "").is_err());
    }
}
