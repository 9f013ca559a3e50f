use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tradebrain::application::bootstrap::App;
use tradebrain::config::Config;

/// Trading platform core: market data fan-in, strategy evolution, the
/// decision brain, paper broker and royalty billing.
#[derive(Parser, Debug)]
#[command(name = "tradebrain", version, about)]
struct Cli {
    /// Run a single evolution cycle and exit.
    #[arg(long)]
    once: bool,

    /// Print the provider hierarchy and current worker status, then exit.
    #[arg(long)]
    status: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let app = App::build(config).await?;

    if cli.status {
        for (slot, provider) in app.router.describe() {
            println!("{:>14}: {}", slot, provider.unwrap_or("-"));
        }
        let status = app.worker.status().await?;
        println!("{}", serde_json::to_string_pretty(&status)?);
        app.shutdown().await;
        return Ok(());
    }

    if cli.once {
        let processed = app.worker.run_cycle().await?;
        info!("Single evolution cycle processed {} strategies", processed);
        app.shutdown().await;
        return Ok(());
    }

    let shutdown = app.shutdown_signal();
    let worker = app.worker.clone();
    let worker_handle = tokio::spawn(async move {
        worker.run(shutdown).await;
    });

    info!("tradebrain running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    app.shutdown().await;
    let _ = worker_handle.await;
    Ok(())
}
