use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use termshare::{host, viewer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Share a terminal session with remote viewers.")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the sharing server and share piped output as a session.
    Serve(host::Args),
    /// Join a shared session from this terminal.
    View(viewer::Args),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Create ~/.termshare directory if it doesn't exist
    let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let termshare_dir = format!("{home_dir}/.termshare");
    std::fs::create_dir_all(&termshare_dir)?;

    let (log_path, console_output) = match &args.command {
        Commands::Serve(_) => (format!("{termshare_dir}/termshare-serve.log"), true),
        // The viewer owns the terminal in raw mode, so it only logs to file
        Commands::View(_) => (format!("{termshare_dir}/termshare-view.log"), false),
    };

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if console_output {
        // stdout carries viewer input, so console logs go to stderr
        use tracing_subscriber::fmt::writer::MakeWriterExt;
        let writer = std::io::stderr.and(log_file);

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(writer)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(log_file)
            .with_ansi(false)
            .init();
    }

    let result = match args.command {
        Commands::Serve(host_args) => {
            info!("Starting termshare host");
            host::run_host(host_args).await
        }
        Commands::View(viewer_args) => {
            info!("Starting termshare viewer");
            viewer::run_viewer(viewer_args).await
        }
    };

    // Blocking stdin readers would otherwise keep the runtime alive
    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}
