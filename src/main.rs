use clap::Parser;
use teehee::cli::{commands::Cli, run_cli};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout carries the conversation.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run_cli(cli.command, cli.config).await {
        error!("{}", e);
        if e.requires_reauth() {
            eprintln!("Sign in again with `teehee login --id-token <token>`.");
        }
        std::process::exit(1);
    }
}
