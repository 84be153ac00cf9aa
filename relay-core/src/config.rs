use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct ChainCfg {
    pub http_rpc_url: String,
    pub ws_rpc_url: String,
    pub chain_id: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PgCfg {
    pub dsn: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NatsCfg {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FinalityCfg {
    /// A confirmation depth ("12") or a named tag ("safe", "finalized").
    /// Validated against the RPC endpoint at startup.
    pub block_finality: String,
    /// Poll cadence for tag-based finality. Unused with a depth policy.
    pub poll_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppCfg {
    pub name: Option<String>, // Optional name field for instance identification
    pub chain: ChainCfg,
    pub postgres: PgCfg,
    pub nats: NatsCfg,
    pub finality: FinalityCfg,
    pub webhook_timeout_secs: Option<u64>,
}

impl AppCfg {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(&std::fs::read_to_string(path)?)?;
        Ok(config)
    }

    pub fn get_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("relay-{}", chrono::Utc::now().timestamp()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.finality.poll_interval_secs.unwrap_or(12))
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs.unwrap_or(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let yaml = r#"
name: "relay-test"
chain:
  http_rpc_url: "http://localhost:8545"
  ws_rpc_url: "ws://localhost:8546"
  chain_id: 31337
postgres:
  dsn: "host=localhost user=postgres dbname=relay"
nats:
  url: "nats://localhost:4222"
finality:
  block_finality: "12"
  poll_interval_secs: 6
webhook_timeout_secs: 10
"#;
        let cfg: AppCfg = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.get_name(), "relay-test");
        assert_eq!(cfg.chain.chain_id, 31337);
        assert_eq!(cfg.finality.block_finality, "12");
        assert_eq!(cfg.poll_interval(), Duration::from_secs(6));
        assert_eq!(cfg.webhook_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn optional_fields_fall_back_to_defaults() {
        let yaml = r#"
chain:
  http_rpc_url: "http://localhost:8545"
  ws_rpc_url: "ws://localhost:8546"
  chain_id: 1
postgres:
  dsn: "host=localhost"
nats:
  url: "nats://localhost:4222"
finality:
  block_finality: "safe"
"#;
        let cfg: AppCfg = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.poll_interval(), Duration::from_secs(12));
        assert_eq!(cfg.webhook_timeout(), Duration::from_secs(30));
        assert!(cfg.get_name().starts_with("relay-"));
    }
}
