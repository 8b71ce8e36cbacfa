use repo_server::cli::initialize_from_arguments;
use std::env;

#[tokio::main]
async fn main() {
    println!("Repository server v{}", env!("CARGO_PKG_VERSION"));
    initialize_from_arguments().await;
    println!("Done");
}
