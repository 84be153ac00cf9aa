mod emitter;
mod routing;
mod webhook;

use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).compact().init();

    let cfg_path = std::env::args().nth(1).unwrap_or_else(|| "./config.yaml".to_string());
    let cfg = relay_core::config::AppCfg::load(&cfg_path)?;
    info!("Starting emitter instance {}", cfg.get_name());

    // deps
    let pg = relay_core::ledger::connect_pg(&cfg.postgres.dsn).await?;
    let broker = relay_core::broker::connect(&cfg.nats.url).await?;

    let emitter = emitter::Emitter::new(&cfg, pg, broker).await?;
    emitter.run().await
}
