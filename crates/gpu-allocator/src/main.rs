use anyhow::Result;
use clap::Parser;
use gpu_allocator::app::builder::discovery_backend;
use gpu_allocator::app::ApplicationBuilder;
use gpu_allocator::config::{Cli, Commands, DaemonArgs, DiscoverArgs};
use gpu_allocator::platform::DiscoveryBackend;
use utils::logging;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::Discover(discover_args) => run_discover(discover_args).await,
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init();

    tracing::info!("Starting gpu-allocator daemon {}", env!("CARGO_PKG_VERSION"));

    let app = ApplicationBuilder::new(daemon_args).build().await?;

    app.run().await?;
    app.shutdown().await?;

    Ok(())
}

async fn run_discover(discover_args: DiscoverArgs) -> Result<()> {
    let _guard = logging::init();

    let backend = discovery_backend(&discover_args.discovery)?;
    let report = backend.discover().await?;

    let output = if discover_args.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{output}");
    Ok(())
}
