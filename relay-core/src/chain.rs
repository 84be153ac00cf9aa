use std::str::FromStr;

use alloy::providers::fillers::{
    BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller,
};
use alloy::providers::{Identity, Provider, ProviderBuilder, RootProvider, WsConnect};
use tracing::info;

use crate::config::ChainCfg;

pub type RpcProvider = FillProvider<
    JoinFill<
        Identity,
        JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
    >,
    RootProvider,
>;

/// Build WS and HTTP providers. Subscriptions run over WS, point lookups
/// over HTTP.
pub async fn build_providers(cfg: &ChainCfg) -> anyhow::Result<(RpcProvider, RpcProvider)> {
    let ws = WsConnect::new(&cfg.ws_rpc_url);
    let http_rpc = reqwest::Url::from_str(&cfg.http_rpc_url)?;
    info!(
        "Connecting to RPC endpoints: ws: {:?}, http: {:?}",
        cfg.ws_rpc_url, cfg.http_rpc_url
    );

    let ws_rpc_provider = ProviderBuilder::new().connect_ws(ws).await?;
    let http_rpc_provider = ProviderBuilder::new().connect_http(http_rpc);

    Ok((ws_rpc_provider, http_rpc_provider))
}

/// Probe the endpoint's chain id and fail startup on a mismatch with the
/// configured chain definition.
pub async fn check_chain_id(provider: &RpcProvider, expected: u64) -> anyhow::Result<u64> {
    let chain_id = provider.get_chain_id().await?;
    if chain_id != expected {
        anyhow::bail!("Chain ID mismatch: expected {}, got {}", expected, chain_id);
    }
    info!("Chain ID: {}", chain_id);
    Ok(chain_id)
}
