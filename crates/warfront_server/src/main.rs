//! Warfront - Dedicated Server

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warfront_server::{Args, Server, ServerConfig};

#[tokio::main]
async fn main() -> warfront_server::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("Starting Warfront dedicated server");

    let args = Args::parse();
    let config = ServerConfig::from_args(&args)?;
    let server = Server::bind(&config).await?;
    let state = server.run().await?;

    if let Some(path) = &config.replay_path {
        let replay = state.replay();
        replay.save(path)?;
        tracing::info!(path = %path.display(), ticks = replay.final_tick, "replay saved");
    }
    Ok(())
}
