use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mediafix")]
#[command(about = "Media download queue for chat bots", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to $MEDIAFIX_CONFIG or config/mediafix.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the worker pool and the HTTP API
    Serve(ServeArgs),
    /// Download a single URL through the queue and print the result
    Fetch(FetchArgs),
    /// Remove expired and vanished entries from the artifact cache
    PruneCache,
    /// Print the effective configuration as TOML
    Config,
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Address to bind the HTTP server to (overrides server.bind_addr)
    #[arg(long)]
    pub address: Option<SocketAddr>,
}

#[derive(clap::Args, Debug)]
pub struct FetchArgs {
    /// Media URL to download
    pub url: String,

    /// Requester recorded on the job
    #[arg(long, default_value = "cli")]
    pub requester: String,
}
