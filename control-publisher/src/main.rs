//! Reload broadcaster invoked by the administrative layer right after a
//! sources/destinations write commits.
//!
//! Usage: control-publisher <observer|emitter|all> [config.yaml]

use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_core::broker::{self, Component};
use relay_core::config::AppCfg;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).compact().init();

    let target = std::env::args().nth(1).unwrap_or_else(|| "all".to_string());
    let cfg_path = std::env::args().nth(2).unwrap_or_else(|| "./config.yaml".to_string());
    let cfg = AppCfg::load(&cfg_path)?;

    let components = match target.as_str() {
        "observer" => vec![Component::Observer],
        "emitter" => vec![Component::Emitter],
        "all" => vec![Component::Observer, Component::Emitter],
        other => anyhow::bail!("unknown component {other:?}: expected observer, emitter or all"),
    };

    let broker = broker::connect(&cfg.nats.url).await?;
    for component in components {
        broker.publish_reload(component).await?;
        info!("Reload published to {}", component.routing_key());
    }

    Ok(())
}
