//! Finality tracking shared by the observer and the emitter.
//!
//! Each component runs its own head watch against its own RPC view; the
//! partition/classify logic is identical on both sides and lives here once.

use std::collections::VecDeque;
use std::time::Duration;

use alloy::providers::Provider;
use alloy::rpc::types::{BlockId, BlockNumberOrTag};
use alloy_primitives::B256;
use anyhow::Context;
use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chain::RpcProvider;
use crate::types::EventRecord;

/// How a block is considered irreversible: a fixed confirmation depth
/// subtracted from the raw head, or a named safety tag resolved by the
/// RPC endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalityPolicy {
    Offset(u64),
    Tag(BlockNumberOrTag),
}

impl FinalityPolicy {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let raw = raw.trim();
        if let Ok(offset) = raw.parse::<u64>() {
            return Ok(Self::Offset(offset));
        }
        match raw.to_ascii_lowercase().as_str() {
            "safe" => Ok(Self::Tag(BlockNumberOrTag::Safe)),
            "finalized" => Ok(Self::Tag(BlockNumberOrTag::Finalized)),
            other => anyhow::bail!(
                "invalid block finality policy {other:?}: expected a confirmation depth or one of \"safe\", \"finalized\""
            ),
        }
    }
}

/// Fatal-at-startup probe: a tag policy must be resolvable by the endpoint.
pub async fn validate_policy(provider: &RpcProvider, policy: FinalityPolicy) -> anyhow::Result<()> {
    if let FinalityPolicy::Tag(tag) = policy {
        let block = provider
            .get_block(BlockId::Number(tag))
            .await
            .with_context(|| format!("RPC endpoint does not support the \"{tag}\" block tag"))?;
        if block.is_none() {
            anyhow::bail!("RPC endpoint returned no block for the \"{tag}\" tag");
        }
    }
    Ok(())
}

/// Anything that can sit in a finalization queue: it remembers the block it
/// was observed on so a later pass can re-check that block still stands.
pub trait Finalizable {
    fn block_number(&self) -> u64;
    fn block_hash(&self) -> B256;
}

impl Finalizable for EventRecord {
    fn block_number(&self) -> u64 {
        self.block_number.max(0) as u64
    }

    fn block_hash(&self) -> B256 {
        self.block_hash
    }
}

/// Resolves the chain's authoritative block hash at a height. Implemented
/// for the RPC provider and for in-memory stubs in tests.
pub trait BlockHashSource {
    fn block_hash_at(
        &self,
        number: u64,
    ) -> impl Future<Output = anyhow::Result<Option<B256>>> + Send;
}

impl BlockHashSource for RpcProvider {
    async fn block_hash_at(&self, number: u64) -> anyhow::Result<Option<B256>> {
        let block = self
            .get_block(BlockId::Number(BlockNumberOrTag::Number(number)))
            .await?;
        Ok(block.map(|block| block.header.hash))
    }
}

/// Ordered buffer of items awaiting finality confirmation. The single tokio
/// mutex is a strict-FIFO ticket queue, which keeps appends and
/// drain-partition passes serialized without losing or reordering entries.
/// Entries never persist across restart; the ledger (observer side) and the
/// broker redelivery (emitter side) are the durable sources of truth.
pub struct FinalizationQueue<T> {
    entries: Mutex<VecDeque<T>>,
}

impl<T: Finalizable> FinalizationQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn push(&self, entry: T) {
        self.entries.lock().await.push_back(entry);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Split off every entry at or below the finalized height, preserving
    /// enqueue order. The removed entries are never revisited by the queue.
    pub async fn take_eligible(&self, finalized: u64) -> Vec<T> {
        let mut entries = self.entries.lock().await;
        let mut eligible = Vec::new();
        let mut waiting = VecDeque::with_capacity(entries.len());
        for entry in entries.drain(..) {
            if entry.block_number() <= finalized {
                eligible.push(entry);
            } else {
                waiting.push_back(entry);
            }
        }
        *entries = waiting;
        eligible
    }
}

impl<T: Finalizable> Default for FinalizationQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub enum Verdict<T> {
    /// The remembered hash still stands at that height.
    Finalized(T),
    /// A different block now occupies that height; the item must be
    /// discarded and its record cleaned up.
    Ommer(T),
}

/// Compare each eligible item's remembered hash against the authoritative
/// hash at its height. Lookup failures drop the item with an error log; the
/// classification is per-item and one failure never affects the others.
pub async fn classify<T, S>(source: &S, eligible: Vec<T>) -> Vec<Verdict<T>>
where
    T: Finalizable,
    S: BlockHashSource,
{
    let mut verdicts = Vec::with_capacity(eligible.len());
    for entry in eligible {
        let number = entry.block_number();
        match source.block_hash_at(number).await {
            Ok(Some(hash)) if hash == entry.block_hash() => {
                verdicts.push(Verdict::Finalized(entry));
            }
            Ok(Some(hash)) => {
                debug!(
                    "Block hash mismatch at height {number}: remembered {:#x}, chain has {hash:#x}",
                    entry.block_hash()
                );
                verdicts.push(Verdict::Ommer(entry));
            }
            Ok(None) => {
                error!("No block found at finalized height {number}; dropping entry");
            }
            Err(e) => {
                error!("Failed to fetch block hash at height {number}: {e:?}");
            }
        }
    }
    verdicts
}

/// Spawn the head watch for the configured policy and deliver strictly
/// increasing finalized block numbers over the returned channel.
pub fn spawn_head_watch(
    ws_provider: RpcProvider,
    http_provider: RpcProvider,
    policy: FinalityPolicy,
    poll_interval: Duration,
) -> (mpsc::Receiver<u64>, JoinHandle<anyhow::Result<()>>) {
    let (tx, rx) = mpsc::channel(16);
    let handle = tokio::spawn(async move {
        match policy {
            FinalityPolicy::Offset(offset) => {
                let sub = ws_provider.subscribe_blocks().await?;
                info!("Subscribed to new heads (confirmation depth {offset})");
                let mut stream = sub.into_stream();
                let mut last: Option<u64> = None;
                while let Some(header) = stream.next().await {
                    let finalized = header.number.saturating_sub(offset);
                    if last.is_some_and(|prev| finalized <= prev) {
                        continue;
                    }
                    last = Some(finalized);
                    if tx.send(finalized).await.is_err() {
                        break;
                    }
                }
                warn!("Head subscription ended");
            }
            FinalityPolicy::Tag(tag) => {
                info!("Polling the \"{tag}\" block every {poll_interval:?}");
                let mut last: Option<u64> = None;
                loop {
                    match http_provider.get_block(BlockId::Number(tag)).await {
                        Ok(Some(block)) => {
                            let finalized = block.header.number;
                            if last.is_none_or(|prev| finalized > prev) {
                                last = Some(finalized);
                                if tx.send(finalized).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(None) => warn!("RPC endpoint returned no block for the \"{tag}\" tag"),
                        Err(e) => warn!("Failed to fetch the \"{tag}\" block: {e:?}"),
                    }
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
        Ok(())
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    struct Entry {
        number: u64,
        hash: B256,
    }

    impl Finalizable for Entry {
        fn block_number(&self) -> u64 {
            self.number
        }

        fn block_hash(&self) -> B256 {
            self.hash
        }
    }

    struct StubHashes(HashMap<u64, B256>);

    impl BlockHashSource for StubHashes {
        async fn block_hash_at(&self, number: u64) -> anyhow::Result<Option<B256>> {
            Ok(self.0.get(&number).copied())
        }
    }

    fn entry(number: u64, fill: u8) -> Entry {
        Entry {
            number,
            hash: B256::repeat_byte(fill),
        }
    }

    #[test]
    fn parses_offset_and_tag_policies() {
        assert_eq!(FinalityPolicy::parse("0").unwrap(), FinalityPolicy::Offset(0));
        assert_eq!(
            FinalityPolicy::parse("12").unwrap(),
            FinalityPolicy::Offset(12)
        );
        assert_eq!(
            FinalityPolicy::parse("safe").unwrap(),
            FinalityPolicy::Tag(BlockNumberOrTag::Safe)
        );
        assert_eq!(
            FinalityPolicy::parse("Finalized").unwrap(),
            FinalityPolicy::Tag(BlockNumberOrTag::Finalized)
        );
        assert!(FinalityPolicy::parse("latest-ish").is_err());
        assert!(FinalityPolicy::parse("-3").is_err());
        assert!(FinalityPolicy::parse("").is_err());
    }

    #[tokio::test]
    async fn partition_respects_the_finalized_height() {
        let queue = FinalizationQueue::new();
        queue.push(entry(99, 1)).await;
        queue.push(entry(100, 2)).await;
        queue.push(entry(101, 3)).await;
        queue.push(entry(100, 4)).await;

        let eligible = queue.take_eligible(100).await;
        assert_eq!(
            eligible.iter().map(|e| e.number).collect::<Vec<_>>(),
            vec![99, 100, 100],
            "enqueue order must be preserved"
        );
        assert_eq!(queue.len().await, 1);

        // the remaining entry leaves on a later pass
        let rest = queue.take_eligible(101).await;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].number, 101);
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn classify_separates_finalized_from_ommers() {
        let chain = StubHashes(HashMap::from([
            (100, B256::repeat_byte(1)),
            (101, B256::repeat_byte(9)),
        ]));
        let verdicts = classify(&chain, vec![entry(100, 1), entry(101, 2)]).await;
        assert_eq!(verdicts.len(), 2);
        assert!(matches!(&verdicts[0], Verdict::Finalized(e) if e.number == 100));
        assert!(matches!(&verdicts[1], Verdict::Ommer(e) if e.number == 101));
    }

    #[tokio::test]
    async fn classify_drops_entries_without_an_authoritative_block() {
        let chain = StubHashes(HashMap::new());
        let verdicts = classify(&chain, vec![entry(100, 1)]).await;
        assert!(verdicts.is_empty());
    }

    #[tokio::test]
    async fn happy_path_confirms_a_buffered_event() {
        // log observed at block 100; head advances to 102 with offset 2
        let queue = FinalizationQueue::new();
        queue.push(entry(100, 7)).await;

        let finalized = 102u64.saturating_sub(2);
        let eligible = queue.take_eligible(finalized).await;
        assert_eq!(eligible.len(), 1);

        let chain = StubHashes(HashMap::from([(100, B256::repeat_byte(7))]));
        let verdicts = classify(&chain, eligible).await;
        assert!(matches!(&verdicts[0], Verdict::Finalized(e) if e.number == 100));
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn reorged_block_is_classified_as_ommer() {
        let queue = FinalizationQueue::new();
        queue.push(entry(100, 7)).await;

        let eligible = queue.take_eligible(100).await;
        let chain = StubHashes(HashMap::from([(100, B256::repeat_byte(8))]));
        let verdicts = classify(&chain, eligible).await;
        assert!(matches!(&verdicts[0], Verdict::Ommer(e) if e.number == 100));
    }
}
