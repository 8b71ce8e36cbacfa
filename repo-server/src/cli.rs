//! Parses the command line arguments and sets up logging.
//!
//! Basic usage for running the server with file logging on:
//!
//! ```cargo run --bin repo-server -- --port 8080 --log```

use crate::{repository::Repository, server::RepositoryServer};
use clap::Parser;
use comm_core::Endpoint;
use std::{
    fs::{create_dir_all, OpenOptions},
    io,
    path::PathBuf,
    sync::Arc,
};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Stores the server's command line arguments.
#[derive(Parser, Debug)]
#[command(version, about = "Serves a versioned file repository")]
pub struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value = "localhost")]
    pub address: String,
    /// Port to listen on.
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,
    /// Directory checked-in files are stored in.
    #[arg(long, default_value = "../Storage")]
    pub storage: PathBuf,
    /// Directory uploads are received into.
    #[arg(long, default_value = "../SaveFiles")]
    pub staging: PathBuf,
    /// Write JSON logs to ./logs instead of the terminal.
    #[arg(short, long)]
    pub log: bool,
    /// Log at debug level.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Parses the arguments, then serves until a client sends `serverQuit` or
/// the process receives Ctrl-C.
pub async fn initialize_from_arguments() {
    let args = Args::parse();
    if let Err(e) = initialize_logging(args.log, args.verbose) {
        eprintln!("Could not set up logging: {e}");
        return;
    }
    if let Err(e) = serve(args).await {
        eprintln!("{e}");
    }
}

async fn serve(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let repository = Repository::new(&args.storage, &args.staging)?;
    let server = RepositoryServer::new(Endpoint::new(args.address, args.port), repository);
    server.start().await?;
    println!("Serving on {}", server.endpoint());

    tokio::select! {
        _ = server.finished() => tracing::info!("Quit requested by a client"),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Interrupted");
        }
    }
    server.stop().await;
    Ok(())
}

/// Installs the global subscriber. Only call this once, from a binary.
///
/// With `to_file` set, events are written as JSON lines to
/// `./logs/debug-<timestamp>.log`; otherwise they go to standard output.
pub fn initialize_logging(to_file: bool, verbose: bool) -> io::Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let result = if to_file {
        let main_path = "./logs";
        create_dir_all(main_path)?;
        let file_path = format!(
            "{}/debug-{}.log",
            main_path,
            chrono::offset::Local::now().format("%y-%m-%d_%H-%M-%S")
        );
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(file_path)?;
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_writer(Arc::new(file))
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
        tracing::subscriber::set_global_default(subscriber)
    };
    result.map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}
