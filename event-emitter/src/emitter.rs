//! Delivery-facing half of the relay: consumes confirmed events from the
//! broker, routes them against the destination table, re-checks finality
//! against its own head view, and posts the payloads.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::B256;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_postgres::Client as DbClient;
use tracing::{debug, error, info, warn};

use relay_core::broker::{Broker, Component};
use relay_core::chain::{self, RpcProvider};
use relay_core::codec::{ControlMessage, EventMessage};
use relay_core::config::AppCfg;
use relay_core::finality::{self, FinalityPolicy, FinalizationQueue, Finalizable, Verdict};
use relay_core::{abi, ledger};

use crate::routing::RoutingTable;
use crate::webhook::{self, WebhookClient};

const EVENTS_DURABLE: &str = "emitter";
const RETRY_DELAY: Duration = Duration::from_secs(3);

/// A matched event awaiting the emitter's own finality confirmation. The
/// destination URL is captured at enqueue time: a reload between enqueue
/// and finalize does not retarget an in-flight event.
pub struct PendingDelivery {
    pub message: EventMessage,
    pub webhook_url: String,
}

impl Finalizable for PendingDelivery {
    fn block_number(&self) -> u64 {
        self.message.block_number.max(0) as u64
    }

    fn block_hash(&self) -> B256 {
        self.message.block_hash
    }
}

pub struct Emitter {
    db: Arc<DbClient>,
    broker: Broker,
    ws_rpc_provider: RpcProvider,
    http_rpc_provider: RpcProvider,
    policy: FinalityPolicy,
    poll_interval: Duration,
    routing: RoutingTable,
    queue: FinalizationQueue<PendingDelivery>,
    webhook: WebhookClient,
}

impl Emitter {
    pub async fn new(config: &AppCfg, db: DbClient, broker: Broker) -> anyhow::Result<Self> {
        let (ws_rpc_provider, http_rpc_provider) = chain::build_providers(&config.chain).await?;
        chain::check_chain_id(&http_rpc_provider, config.chain.chain_id).await?;

        // configuration errors are fatal before serving
        let policy = FinalityPolicy::parse(&config.finality.block_finality)?;
        finality::validate_policy(&http_rpc_provider, policy).await?;

        broker.ensure_events_stream().await?;

        let destinations = ledger::load_destinations(&db).await?;
        info!("Loaded {} emit destinations", destinations.len());

        Ok(Self {
            db: Arc::new(db),
            broker,
            ws_rpc_provider,
            http_rpc_provider,
            policy,
            poll_interval: config.poll_interval(),
            routing: RoutingTable::new(destinations),
            queue: FinalizationQueue::new(),
            webhook: WebhookClient::new(config.webhook_timeout())?,
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

        let control_task = tokio::spawn({
            let this = Arc::clone(&this);
            async move { this.consume_control().await }
        });

        let consumer_task = tokio::spawn({
            let this = Arc::clone(&this);
            async move { this.consume_events().await }
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

        // unacked queue entries will be redelivered by the broker
        consumer_task.abort();
        control_task.abort();
        head_task.abort();
        info!("Emitter shutdown complete");
        Ok(())
    }

    /// Events-queue consumer. Acks only after every matching destination has
    /// been enqueued, so a crash before the ack leads to redelivery rather
    /// than loss (duplicates are accepted: delivery is at-least-once).
    async fn consume_events(&self) -> anyhow::Result<()> {
        loop {
            let consumer = match self.broker.events_consumer(EVENTS_DURABLE).await {
                Ok(consumer) => consumer,
                Err(e) => {
                    error!("Failed to attach events consumer: {:?}, retrying...", e);
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };
            let mut messages = match consumer.messages().await {
                Ok(messages) => messages,
                Err(e) => {
                    error!("Failed to open events stream: {:?}, retrying...", e);
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };
            info!("Consuming the events queue");

            while let Some(next) = messages.next().await {
                let message = match next {
                    Ok(message) => message,
                    Err(e) => {
                        error!("Events consumer error: {e}");
                        continue;
                    }
                };
                if let Err(e) = self.handle_message(&message.payload).await {
                    error!("Failed to handle event message: {:?}", e);
                }
                if let Err(e) = message.ack().await {
                    error!("Failed to ack event message: {e}");
                }
            }
            warn!("Events consumer stream ended, reattaching");
        }
    }

    async fn handle_message(&self, payload: &[u8]) -> anyhow::Result<()> {
        let message = match EventMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                // poison message; acked by the caller so it is not redelivered forever
                error!("Dropping undecodable event message: {e}");
                return Ok(());
            }
        };

        let matches = self
            .routing
            .matches(message.address, message.sig_hash, &message.topics);
        if matches.is_empty() {
            debug!(
                "No destinations match event from {} sig {:#x}",
                message.address, message.sig_hash
            );
            return Ok(());
        }

        if message.is_test_webhook() {
            // synthetic request: no persistence, no finality wait
            for dest in matches {
                info!("Test webhook request for destination {}", dest.webhook_url);
                let body = webhook::test_payload(&message);
                if let Err(e) = self.webhook.post(&dest.webhook_url, &body).await {
                    error!("Test webhook POST to {} failed: {e}", dest.webhook_url);
                }
            }
            return Ok(());
        }

        for dest in matches {
            info!(
                "Event at block {} log {} queued for {}",
                message.block_number, message.log_index, dest.webhook_url
            );
            self.queue
                .push(PendingDelivery {
                    message: message.clone(),
                    webhook_url: dest.webhook_url,
                })
                .await;
        }
        Ok(())
    }

    async fn finality_pass(&self, finalized: u64) -> anyhow::Result<()> {
        let eligible = self.queue.take_eligible(finalized).await;
        if eligible.is_empty() {
            return Ok(());
        }
        debug!(
            "Finality pass at height {finalized}: {} pending deliveries",
            eligible.len()
        );

        for verdict in finality::classify(&self.http_rpc_provider, eligible).await {
            match verdict {
                Verdict::Finalized(pending) => self.deliver(pending).await,
                Verdict::Ommer(pending) => {
                    warn!(
                        "Event at block {} log {} landed on an ommer block; cleaning up",
                        pending.message.block_number, pending.message.log_index
                    );
                    let block_timestamp = pending.message.block_timestamp as i64;
                    let log_index = pending.message.log_index as i64;
                    if let Err(e) =
                        ledger::delete_event(&self.db, block_timestamp, log_index).await
                    {
                        error!("Failed to delete ommer event record: {:?}", e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn deliver(&self, pending: PendingDelivery) {
        let block_timestamp = pending.message.block_timestamp as i64;
        let log_index = pending.message.log_index as i64;

        let record = match ledger::find_event(&self.db, block_timestamp, log_index).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                // observer insert raced a deletion, or data loss; surfaced, not retried
                error!(
                    "Event record ({block_timestamp}, {log_index}) missing at delivery time; skipping"
                );
                return;
            }
            Err(e) => {
                error!("Failed to load event record ({block_timestamp}, {log_index}): {:?}", e);
                return;
            }
        };

        let entry = match ledger::find_abi(&self.db, record.abi_hash).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                error!(
                    "No ABI entry for {:#x}; skipping delivery of block {} log {}",
                    record.abi_hash, record.block_number, record.log_index
                );
                return;
            }
            Err(e) => {
                error!("Failed to load ABI entry {:#x}: {:?}", record.abi_hash, e);
                return;
            }
        };

        let decoded =
            match abi::decode_event(&entry.abi_json, record.abi_hash, &record.topics, &record.data)
            {
                Ok(decoded) => decoded,
                Err(e) => {
                    error!(
                        "Failed to decode arguments for block {} log {}: {:?}",
                        record.block_number, record.log_index, e
                    );
                    return;
                }
            };

        let payload = webhook::delivery_payload(&record, decoded);
        match self.webhook.post(&pending.webhook_url, &payload).await {
            Ok(()) => info!(
                "Delivered event at block {} log {} to {}",
                record.block_number, record.log_index, pending.webhook_url
            ),
            Err(e) => error!("Webhook POST to {} failed: {e}", pending.webhook_url),
        }
    }

    async fn consume_control(&self) -> anyhow::Result<()> {
        let mut subscriber = self.broker.subscribe_control(Component::Emitter).await?;
        while let Some(message) = subscriber.next().await {
            match ControlMessage::decode(&message.payload) {
                Ok(ControlMessage::Reload) => match ledger::load_destinations(&self.db).await {
                    Ok(destinations) => {
                        info!("Reloaded {} emit destinations", destinations.len());
                        self.routing.replace(destinations);
                    }
                    Err(e) => error!("Failed to reload emit destinations: {:?}", e),
                },
                Err(e) => error!("Undecodable control message: {e}"),
            }
        }
        Ok(())
    }
}
