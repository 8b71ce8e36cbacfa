//! Sends one request to a repository server and prints the reply.
//!
//! ```cargo run --bin repo-client -- --command checkIn --file notes.txt```
//!
//! ```cargo run --bin repo-client -- --command checkInFiles --attr name=notes.txt --attr close=true```

use clap::Parser;
use comm_core::{envelope::attr, Comm, CommConfig, Endpoint, Envelope, SERVER_QUIT};
use repo_server::cli::initialize_logging;
use std::{path::PathBuf, time::Duration};

#[derive(Parser, Debug)]
#[command(version, about = "Sends a request to a repository server")]
struct Args {
    /// The server's `address:port`.
    #[arg(short, long, default_value = "localhost:8080")]
    server: Endpoint,
    /// Address this client listens on for the reply.
    #[arg(short, long, default_value = "localhost")]
    address: String,
    /// Port this client listens on for the reply.
    #[arg(short, long, default_value_t = 8081)]
    port: u16,
    /// Command to send.
    #[arg(short, long)]
    command: String,
    /// Extra `key=value` attribute. May be repeated.
    #[arg(long = "attr", value_parser = parse_attr)]
    attrs: Vec<(String, String)>,
    /// File to upload with the request, relative to the send path.
    #[arg(short, long)]
    file: Option<String>,
    #[arg(long, default_value = "./SendFiles")]
    send_path: PathBuf,
    /// Where files sent back by the server are saved.
    #[arg(long, default_value = "./SaveFiles")]
    save_path: PathBuf,
    /// How long to wait for the reply.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
    /// Log at debug level and ask the server to log the exchange.
    #[arg(short, long)]
    verbose: bool,
}

fn parse_attr(text: &str) -> Result<(String, String), String> {
    match text.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got `{text}`")),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = initialize_logging(false, args.verbose) {
        eprintln!("Could not set up logging: {e}");
        return;
    }
    if let Err(e) = run(args).await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = CommConfig::new()
        .send_path(&args.send_path)
        .save_path(&args.save_path);
    let comm = Comm::with_config(Endpoint::new(args.address.clone(), args.port), "client", config);
    comm.start().await?;

    let request = build_request(&args, &comm.local_endpoint());
    comm.post_message(request);
    if args.command == SERVER_QUIT {
        comm.stop().await;
        return Ok(());
    }

    let waited = tokio::time::timeout(Duration::from_secs(args.timeout_secs), comm.get_message()).await;
    comm.stop().await;
    let reply = waited.map_err(|_| format!("No reply within {} seconds", args.timeout_secs))?;
    print!("{reply}");
    if let Some(file) = reply.file() {
        println!("Saved {}", args.save_path.join(file).display());
    }
    match reply.get(attr::ERROR) {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}

fn build_request(args: &Args, me: &Endpoint) -> Envelope {
    let mut request = Envelope::request(&args.command, me, &args.server);
    for (key, value) in &args.attrs {
        request.insert(key, value);
    }
    if let Some(file) = &args.file {
        request.insert(attr::FILE, file);
    }
    if args.verbose {
        request.insert(attr::VERBOSE, "");
    }
    request
}
