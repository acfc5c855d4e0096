use anyhow::Context;
use clap::Parser;
use stormcloud_server::{init_logging, run, Args, StubConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = StubConfig::from_args(&args).context("Failed to load configuration")?;
    let _log_guard = init_logging(&config.logging).context("Failed to initialize logging")?;

    println!("🚀 StormCloud starting...");
    println!(
        "📡 Stubbing vendor APIs on http://{}:{}",
        config.server.listen_address, config.server.listen_port
    );
    println!("💡 Tip: Use --help to see all available options");
    println!();

    run(config).await.context("StormCloud server failed")?;

    Ok(())
}
