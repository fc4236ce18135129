use clap::{Parser, Subcommand};

use crate::config::daemon::{DaemonArgs, DiscoveryArgs};

#[derive(Parser)]
#[command(about, long_about, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the allocation daemon
    Daemon(Box<DaemonArgs>),
    /// Run discovery once and print the devices as JSON
    Discover(DiscoverArgs),
}

#[derive(Parser, Clone, Debug)]
pub struct DiscoverArgs {
    #[command(flatten)]
    pub discovery: DiscoveryArgs,

    #[arg(long, help = "Pretty-print the JSON output")]
    pub pretty: bool,
}
