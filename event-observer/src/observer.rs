//! Chain-facing half of the relay: watches logs for registered sources,
//! persists each observation, and forwards finality-confirmed events to the
//! broker. Reorged observations are deleted instead of forwarded.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::eips::RpcBlockHash;
use alloy::providers::Provider;
use alloy::rpc::types::{BlockId, Filter, Log as RpcLog};
use alloy_primitives::{Address, B256};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_postgres::Client as DbClient;
use tracing::{debug, error, info, warn};

use relay_core::broker::{Broker, Component};
use relay_core::chain::{self, RpcProvider};
use relay_core::codec::{ControlMessage, EventMessage};
use relay_core::config::AppCfg;
use relay_core::finality::{self, FinalityPolicy, FinalizationQueue, Verdict};
use relay_core::ledger::{self, InsertOutcome};
use relay_core::types::EventRecord;

const RETRY_DELAY: Duration = Duration::from_secs(3);

/// Registered sources grouped for filter construction: address -> signature
/// hashes watched at that address.
type WatchSet = BTreeMap<Address, Vec<B256>>;

pub struct Observer {
    db: Arc<DbClient>,
    broker: Broker,
    ws_rpc_provider: RpcProvider,
    http_rpc_provider: RpcProvider,
    policy: FinalityPolicy,
    poll_interval: Duration,
    queue: FinalizationQueue<EventRecord>,
}

impl Observer {
    pub async fn new(config: &AppCfg, db: DbClient, broker: Broker) -> anyhow::Result<Self> {
        let (ws_rpc_provider, http_rpc_provider) = chain::build_providers(&config.chain).await?;
        chain::check_chain_id(&http_rpc_provider, config.chain.chain_id).await?;

        // configuration errors are fatal before serving
        let policy = FinalityPolicy::parse(&config.finality.block_finality)?;
        finality::validate_policy(&http_rpc_provider, policy).await?;

        broker.ensure_events_stream().await?;

        Ok(Self {
            db: Arc::new(db),
            broker,
            ws_rpc_provider,
            http_rpc_provider,
            policy,
            poll_interval: config.poll_interval(),
            queue: FinalizationQueue::new(),
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let this = Arc::new(self);

        let (mut finalized_rx, head_task) = finality::spawn_head_watch(
            this.ws_rpc_provider.clone(),
            this.http_rpc_provider.clone(),
            this.policy,
            this.poll_interval,
        );

        let (reload_tx, reload_rx) = mpsc::channel(1);

        let control_task = tokio::spawn({
            let this = Arc::clone(&this);
            async move { this.consume_control(reload_tx).await }
        });

        let watch_task = tokio::spawn({
            let this = Arc::clone(&this);
            async move { this.watch_logs(reload_rx).await }
        });

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
                maybe = finalized_rx.recv() => {
                    match maybe {
                        Some(finalized) => {
                            if let Err(e) = this.finality_pass(finalized).await {
                                error!("Finality pass failed: {:?}", e);
                            }
                        }
                        None => {
                            warn!("Head watch ended; shutting down");
                            break;
                        }
                    }
                }
            }
        }

        // stop intake first; a finality pass in flight has already finished
        // because passes run on this task
        watch_task.abort();
        control_task.abort();
        head_task.abort();
        info!("Observer shutdown complete");
        Ok(())
    }

    async fn load_watch_set(&self) -> anyhow::Result<WatchSet> {
        let sources = ledger::load_sources(&self.db).await?;
        let mut watch: WatchSet = BTreeMap::new();
        for source in sources {
            watch.entry(source.address).or_default().push(source.abi_hash);
        }
        info!(
            "Loaded {} event sources across {} contracts",
            watch.values().map(Vec::len).sum::<usize>(),
            watch.len()
        );
        Ok(watch)
    }

    /// Log watch loop. A reload message swaps the subscription for one built
    /// from the refreshed source set (cancel-then-install; redundant
    /// observer instances cover the swap window).
    async fn watch_logs(&self, mut reload_rx: mpsc::Receiver<()>) -> anyhow::Result<()> {
        loop {
            let watch = match self.load_watch_set().await {
                Ok(watch) => watch,
                Err(e) => {
                    error!("Failed to load event sources: {:?}, retrying...", e);
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };

            if watch.is_empty() {
                info!("No event sources registered; log watch idle until the next reload");
                if reload_rx.recv().await.is_none() {
                    return Ok(());
                }
                continue;
            }

            let addresses: Vec<Address> = watch.keys().copied().collect();
            let filter = Filter::new().address(addresses.clone());

            let sub = match self.ws_rpc_provider.subscribe_logs(&filter).await {
                Ok(sub) => sub,
                Err(e) => {
                    error!("Failed to subscribe to logs: {:?}, retrying...", e);
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };
            info!("Subscribed to logs for {} contracts", addresses.len());
            let mut sub_stream = sub.into_stream();

            loop {
                tokio::select! {
                    maybe_log = sub_stream.next() => {
                        match maybe_log {
                            Some(log) => {
                                if let Err(e) = self.handle_log(&watch, log).await {
                                    error!("Failed to handle log: {:?}", e);
                                }
                            }
                            None => {
                                warn!("Log subscription closed, resubscribing");
                                break;
                            }
                        }
                    }
                    reload = reload_rx.recv() => {
                        match reload {
                            Some(()) => {
                                info!("Reloading event source filter");
                                break;
                            }
                            None => return Ok(()),
                        }
                    }
                }
            }
        }
    }

    async fn handle_log(&self, watch: &WatchSet, log: RpcLog) -> anyhow::Result<()> {
        let address = log.address();
        debug!("Received log from contract: {}", address);

        // malformed RPC response, not a business error
        let (Some(block_number), Some(log_index), Some(block_hash), Some(tx_hash)) = (
            log.block_number,
            log.log_index,
            log.block_hash,
            log.transaction_hash,
        ) else {
            error!(
                "Dropping log from {address}: missing block number, log index, block hash or transaction hash"
            );
            return Ok(());
        };

        let topics = log.inner.topics();
        let Some((&sig_hash, extra_topics)) = topics.split_first() else {
            error!("Dropping anonymous log from {address} at block {block_number}: no signature topic");
            return Ok(());
        };

        match watch.get(&address) {
            Some(hashes) if hashes.contains(&sig_hash) => {}
            _ => {
                debug!("Ignoring log from {address} with unregistered signature {sig_hash:#x}");
                return Ok(());
            }
        }

        // this fetch can race a reorg; the next watch cycle retries implicitly
        let block = self
            .http_rpc_provider
            .get_block(BlockId::Hash(RpcBlockHash::from_hash(block_hash, Some(false))))
            .await?;
        let Some(block) = block else {
            warn!("Block {block_hash:#x} not found while resolving its timestamp; dropping log");
            return Ok(());
        };
        let block_timestamp = block.header.timestamp as i64;

        let record = EventRecord {
            block_timestamp,
            tx_index: log.transaction_index.unwrap_or_default() as i64,
            log_index: log_index as i64,
            block_number: block_number as i64,
            block_hash,
            tx_hash,
            source_address: address,
            abi_hash: sig_hash,
            topics: extra_topics.to_vec(),
            data: log.inner.data.data.clone(),
        };

        match ledger::insert_event(&self.db, &record).await? {
            InsertOutcome::Inserted => {
                debug!(
                    "Recorded event at block {} log {}",
                    record.block_number, record.log_index
                );
                self.queue.push(record).await;
            }
            InsertOutcome::Duplicate => {
                debug!(
                    "Event ({}, {}) already recorded by a redundant observer",
                    record.block_timestamp, record.log_index
                );
            }
        }

        Ok(())
    }

    async fn finality_pass(&self, finalized: u64) -> anyhow::Result<()> {
        let eligible = self.queue.take_eligible(finalized).await;
        if eligible.is_empty() {
            return Ok(());
        }
        debug!(
            "Finality pass at height {finalized}: {} candidates",
            eligible.len()
        );

        for verdict in finality::classify(&self.http_rpc_provider, eligible).await {
            match verdict {
                Verdict::Finalized(record) => {
                    let message = EventMessage::from_record(&record);
                    match self.broker.publish_event(&message).await {
                        Ok(()) => info!(
                            "Confirmed event at block {} log {} published",
                            record.block_number, record.log_index
                        ),
                        Err(e) => error!(
                            "Failed to publish confirmed event at block {} log {}: {:?}",
                            record.block_number, record.log_index, e
                        ),
                    }
                }
                Verdict::Ommer(record) => {
                    warn!(
                        "Event at block {} log {} landed on an ommer block; discarding",
                        record.block_number, record.log_index
                    );
                    if let Err(e) =
                        ledger::delete_event(&self.db, record.block_timestamp, record.log_index)
                            .await
                    {
                        error!("Failed to delete ommer event record: {:?}", e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn consume_control(&self, reload_tx: mpsc::Sender<()>) -> anyhow::Result<()> {
        let mut subscriber = self.broker.subscribe_control(Component::Observer).await?;
        while let Some(message) = subscriber.next().await {
            match ControlMessage::decode(&message.payload) {
                Ok(ControlMessage::Reload) => {
                    info!("Reload control message received");
                    if reload_tx.send(()).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("Undecodable control message: {e}"),
            }
        }
        Ok(())
    }
}
