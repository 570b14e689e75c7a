//! The synchronization state machine.
//!
//! Startup compares the highest stored canonical height against the network
//! tip, then runs bounded-parallel historical catch-up, steady-state
//! polling, and fork recovery. All store writes funnel through the
//! [`WriteBatcher`]; the transition from catch-up to polling happens only
//! after every planned height has been flushed, so steady state always
//! begins on contiguous coverage.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use gateway_db::projection::{tx_offset_upsert, BlockRow, TxRow};
use gateway_db::{
    first_tx_index, BucketingScheme, Filter, Select, Store, TableId, Upsert, MAX_TXS_PER_BLOCK,
};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::batcher::WriteBatcher;
use crate::bundle::{BundleCodec, BundleItem, BUNDLE_TYPE_TAG};
use crate::error::{FetchError, SyncError};
use crate::metrics::SyncMetrics;
use crate::node_client::{fetch_transaction_data, tag_value, ChainBlock, NodeApi, NetworkInfo};

/// Progress notifications for whoever wires the engine up.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Historical catch-up flushed every height in `[from, to]`.
    CaughtUp { from: u64, to: u64 },
    BlockIngested { height: u64 },
    /// A reorganization was resolved by re-ingesting `[resync_from, tip]`.
    ForkRecovered { resync_from: u64, tip: u64 },
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// In-flight fetch bound during catch-up.
    pub parallel_fetches: usize,
    pub poll_interval: Duration,
    /// Attempt budget per height before the engine gives up for good.
    pub fetch_retry_limit: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Longest backward divergence walk before a reorg is considered
    /// unresolvable.
    pub max_fork_depth: u64,
    /// Attempt budget for mandatory startup tip discovery.
    pub tip_discovery_attempts: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            parallel_fetches: 36,
            poll_interval: Duration::from_secs(30),
            fetch_retry_limit: 250,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(3),
            max_fork_depth: 100,
            tip_discovery_attempts: 100,
        }
    }
}

#[derive(Debug, Default)]
struct EngineState {
    /// Highest height known to be ingested and flushed.
    last_height: Option<u64>,
}

struct MaterializedHeight {
    statements: Vec<Upsert>,
    tx_count: u64,
    bundle_count: u64,
}

#[derive(bon::Builder)]
pub struct SyncEngine {
    node: Arc<dyn NodeApi>,
    store: Arc<dyn Store>,
    batcher: Arc<WriteBatcher>,
    bundle_codec: Arc<dyn BundleCodec>,
    metrics: Arc<SyncMetrics>,
    #[builder(default)]
    options: SyncOptions,
    shutdown: watch::Receiver<bool>,
    events: Option<flume::Sender<SyncEvent>>,
}

impl SyncEngine {
    /// Runs the engine until a fatal error or a shutdown request. In-flight
    /// fetches and the building batch complete before this returns.
    pub async fn run(self) -> Result<(), SyncError> {
        info!("sync engine started");
        let Some(tip) = self.discover_tip().await? else {
            return Ok(());
        };
        let stored = self.max_stored_height().await?;
        let mut state = EngineState {
            last_height: stored,
        };

        match stored {
            Some(height) if height >= tip.height => {
                info!(
                    stored = height,
                    tip = tip.height,
                    "database was found to be in sync, starting to poll for new blocks"
                );
            }
            _ => {
                let from = stored.map_or(0, |height| height + 1);
                self.catch_up(from, tip.height).await?;
                state.last_height = Some(tip.height);
                self.emit(SyncEvent::CaughtUp {
                    from,
                    to: tip.height,
                });
                info!(
                    height = tip.height,
                    "database fully in sync, starting to poll for new blocks"
                );
            }
        }

        if self.is_shutdown() {
            info!("shutdown requested during startup, exiting");
            return Ok(());
        }
        self.poll_loop(&mut state).await
    }

    /// Mandatory startup tip discovery. `None` means a shutdown request
    /// arrived before any peer answered.
    async fn discover_tip(&self) -> Result<Option<NetworkInfo>, SyncError> {
        for attempt in 0..self.options.tip_discovery_attempts {
            if self.is_shutdown() {
                return Ok(None);
            }
            match self.node.info().await {
                Ok(info) => return Ok(Some(info)),
                Err(err) => {
                    debug!(%err, attempt, "tip discovery attempt failed");
                    tokio::time::sleep(Duration::from_millis(10 + 2 * u64::from(attempt))).await;
                }
            }
        }
        error!(
            attempts = self.options.tip_discovery_attempts,
            "failed to establish a connection to any node"
        );
        Err(SyncError::PeerExhausted)
    }

    async fn max_stored_height(&self) -> Result<Option<u64>, SyncError> {
        let rows = self
            .store
            .execute(Select::max(TableId::Block, "height"))
            .await
            .map_err(SyncError::Store)?;
        Ok(rows.first().and_then(|row| row.number("height")))
    }

    async fn stored_hash_at(&self, height: u64) -> Result<Option<String>, SyncError> {
        let rows = self
            .store
            .execute(
                Select::from_table(TableId::BlockHeightByHash)
                    .filter(Filter::eq("block_height", height))
                    .limit(1),
            )
            .await
            .map_err(SyncError::Store)?;
        Ok(rows
            .first()
            .and_then(|row| row.text("block_hash"))
            .map(str::to_owned))
    }

    /// Fetches and ingests the closed range `[from, to]` with bounded
    /// parallelism, then flushes everything as the transition barrier.
    async fn catch_up(&self, from: u64, to: u64) -> Result<(), SyncError> {
        info!(from, to, total = to - from + 1, "starting historical catch-up");
        {
            let mut heights = futures_util::stream::iter(
                (from..=to).map(|height| self.sync_height_with_retry(height)),
            )
            .buffer_unordered(self.options.parallel_fetches);
            while let Some(result) = heights.next().await {
                result?;
            }
        }
        self.batcher.flush_all().await?;
        info!("{}", self.metrics.snapshot());
        Ok(())
    }

    /// Steady state: one tip probe per interval, single-block ingestion,
    /// fork recovery on linkage mismatch.
    async fn poll_loop(&self, state: &mut EngineState) -> Result<(), SyncError> {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.options.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("shutdown signal received, finishing in-flight writes");
                    self.batcher.flush_all().await?;
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.poll_once(state).await?;
                }
            }
        }
    }

    async fn poll_once(&self, state: &mut EngineState) -> Result<(), SyncError> {
        let info = match self.node.info().await {
            Ok(info) => info,
            Err(err) => {
                debug!(%err, "tip poll failed, waiting for the next tick");
                return Ok(());
            }
        };
        let last = state.last_height.unwrap_or(0);
        if info.height <= last {
            debug!(tip = info.height, last, "no new blocks");
            return Ok(());
        }

        let new_block = match self.node.block_by_height(info.height).await {
            Ok(block) => block,
            Err(err) if err.is_transient() => {
                debug!(%err, height = info.height, "tip block fetch failed, waiting for the next tick");
                return Ok(());
            }
            Err(err) => return Err(SyncError::InconsistentBlockData(err)),
        };
        if new_block.height != info.height {
            return Err(SyncError::InconsistentBlockData(
                FetchError::InconsistentBlockData {
                    hash: new_block.indep_hash,
                    expected: info.height,
                    got: new_block.height,
                },
            ));
        }

        let parent_matches = if new_block.height == 0 {
            true
        } else {
            let stored = self.stored_hash_at(new_block.height - 1).await?;
            stored.as_deref() == Some(new_block.previous_block.as_str())
        };

        if parent_matches {
            info!(height = new_block.height, "new block arrived at height {}", new_block.height);
            let Some(materialized) = self
                .retry_fetch(new_block.height, || self.materialize_block(&new_block))
                .await?
            else {
                return Ok(());
            };
            self.ingest(new_block.height, materialized).await?;
            self.batcher.flush_all().await?;
            state.last_height = Some(new_block.height);
        } else {
            warn!(
                height = new_block.height,
                previous = %new_block.previous_block,
                "new block does not extend the stored chain, starting fork recovery"
            );
            self.recover(state, new_block, info.height).await?;
        }
        Ok(())
    }

    /// Walks backward from the divergence point until the network chain and
    /// the stored chain agree on a hash, then re-ingests forward to the new
    /// tip, overwriting the stale canonical rows height by height.
    async fn recover(
        &self,
        state: &mut EngineState,
        tip_block: ChainBlock,
        tip_height: u64,
    ) -> Result<(), SyncError> {
        let mut cursor = tip_block;
        let mut walked = 0u64;
        let resync_from = loop {
            if cursor.height == 0 {
                break 0;
            }
            let parent_height = cursor.height - 1;
            let parent_hash = cursor.previous_block.clone();
            let parent = self
                .retry_fetch(parent_height, || {
                    let hash = parent_hash.clone();
                    async move {
                        let block = self.node.block_by_hash(&hash).await?;
                        if block.height != parent_height {
                            return Err(FetchError::InconsistentBlockData {
                                hash,
                                expected: parent_height,
                                got: block.height,
                            });
                        }
                        Ok(block)
                    }
                })
                .await?;
            let Some(parent) = parent else {
                return Ok(());
            };
            if self.stored_hash_at(parent_height).await?.as_deref()
                == Some(parent.indep_hash.as_str())
            {
                break cursor.height;
            }
            walked += 1;
            if walked >= self.options.max_fork_depth {
                return Err(SyncError::ForkDepthExceeded {
                    from: tip_height,
                    max_depth: self.options.max_fork_depth,
                });
            }
            cursor = parent;
        };

        info!(
            common_ancestor = resync_from.saturating_sub(1),
            tip = tip_height,
            "found last common ancestor, re-ingesting the replaced heights"
        );
        for height in resync_from..=tip_height {
            if self.is_shutdown() {
                break;
            }
            self.sync_height_with_retry(height).await?;
        }
        self.batcher.flush_all().await?;
        if self.is_shutdown() {
            return Ok(());
        }
        state.last_height = Some(tip_height);
        self.metrics.forks_recovered.fetch_add(1, Ordering::Relaxed);
        self.emit(SyncEvent::ForkRecovered {
            resync_from,
            tip: tip_height,
        });
        info!(tip = tip_height, "blocks are back in sync");
        Ok(())
    }

    /// One height, fetched within the attempt budget, queued and possibly
    /// flushed. Returns without doing anything once shutdown is observed.
    async fn sync_height_with_retry(&self, height: u64) -> Result<(), SyncError> {
        let Some(materialized) = self
            .retry_fetch(height, || self.materialize_height(height))
            .await?
        else {
            return Ok(());
        };
        self.ingest(height, materialized).await
    }

    async fn ingest(&self, height: u64, materialized: MaterializedHeight) -> Result<(), SyncError> {
        self.metrics.blocks_synced.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .transactions_indexed
            .fetch_add(materialized.tx_count, Ordering::Relaxed);
        self.metrics
            .bundles_unpacked
            .fetch_add(materialized.bundle_count, Ordering::Relaxed);
        self.batcher.enqueue(height, materialized.statements);
        self.emit(SyncEvent::BlockIngested { height });
        self.batcher.flush_if_threshold().await
    }

    /// Iterative retry with a bounded attempt budget and bounded backoff.
    /// `Ok(None)` means shutdown was observed between attempts.
    async fn retry_fetch<T, F, Fut>(&self, height: u64, mut op: F) -> Result<Option<T>, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempts = 0u32;
        loop {
            if self.is_shutdown() {
                return Ok(None);
            }
            match op().await {
                Ok(value) => return Ok(Some(value)),
                Err(err) if err.is_transient() => {
                    attempts += 1;
                    self.metrics.fetch_retries.fetch_add(1, Ordering::Relaxed);
                    if attempts >= self.options.fetch_retry_limit {
                        error!(height, attempts, %err, "could not retrieve block, giving up");
                        return Err(SyncError::RetriesExhausted { height, attempts });
                    }
                    debug!(height, attempts, %err, "fetch failed, retrying");
                    tokio::time::sleep(self.backoff_delay(attempts)).await;
                }
                Err(err) => return Err(SyncError::InconsistentBlockData(err)),
            }
        }
    }

    async fn materialize_height(&self, height: u64) -> Result<MaterializedHeight, FetchError> {
        let block = self.node.block_by_height(height).await?;
        if block.height != height {
            return Err(FetchError::InconsistentBlockData {
                hash: block.indep_hash,
                expected: height,
                got: block.height,
            });
        }
        self.materialize_block(&block).await
    }

    /// Turns one block and everything it contains into projection upserts:
    /// the block rows, one row set per transaction at its global index, and
    /// the members of any bundles, numbered after the direct transactions.
    async fn materialize_block(&self, block: &ChainBlock) -> Result<MaterializedHeight, FetchError> {
        let block_row = BlockRow {
            indep_hash: block.indep_hash.clone(),
            height: block.height,
            previous: block.previous_block.clone(),
            timestamp: block.timestamp,
            txs: block.txs.clone(),
        };
        let mut statements = block_row.upserts(&BucketingScheme::BLOCK_HEIGHT);
        let mut tx_count = 0u64;
        let mut bundle_count = 0u64;
        let mut bundle_members: Vec<(String, BundleItem)> = Vec::new();

        for (position, tx_id) in block.txs.iter().enumerate() {
            if position as u64 >= MAX_TXS_PER_BLOCK {
                warn!(
                    height = block.height,
                    txs = block.txs.len(),
                    "block overflows its index slot range, skipping the remainder"
                );
                break;
            }
            let tx = self.node.transaction(tx_id).await?;
            let tags: Vec<(String, String)> = tx
                .tags
                .iter()
                .map(|tag| (tag.name.clone(), tag.value.clone()))
                .collect();
            let row = TxRow {
                tx_id: tx.id.clone(),
                tx_index: first_tx_index(block.height) + position as u64,
                block_height: block.height,
                block_hash: block.indep_hash.clone(),
                owner: tx.owner.clone(),
                target: none_if_empty(&tx.target),
                bundled_in: None,
                quantity: tx.quantity,
                reward: tx.reward,
                signature: tx.signature.clone(),
                data_size: tx.data_size,
                format: tx.format,
                tags,
            };
            statements.extend(row.upserts(&BucketingScheme::TX_INDEX));
            tx_count += 1;

            if tag_value(&tx.tags, BUNDLE_TYPE_TAG).is_some() {
                if let Some((offset, items)) = self.unpack_bundle(&tx.id).await {
                    statements.push(tx_offset_upsert(&tx.id, offset.size, offset.offset));
                    bundle_count += 1;
                    bundle_members.extend(items.into_iter().map(|item| (tx.id.clone(), item)));
                }
            }
        }

        let mut slot = block.txs.len() as u64;
        for (bundle_id, item) in bundle_members {
            if slot >= MAX_TXS_PER_BLOCK {
                warn!(
                    height = block.height,
                    "bundle members overflow the index slot range, skipping the remainder"
                );
                break;
            }
            let row = TxRow {
                tx_id: item.id,
                tx_index: first_tx_index(block.height) + slot,
                block_height: block.height,
                block_hash: block.indep_hash.clone(),
                owner: item.owner,
                target: none_if_empty(&item.target),
                bundled_in: Some(bundle_id),
                quantity: 0,
                reward: 0,
                signature: item.signature,
                data_size: 0,
                format: 0,
                tags: item
                    .tags
                    .iter()
                    .map(|tag| (tag.name.clone(), tag.value.clone()))
                    .collect(),
            };
            statements.extend(row.upserts(&BucketingScheme::TX_INDEX));
            slot += 1;
            tx_count += 1;
        }

        Ok(MaterializedHeight {
            statements,
            tx_count,
            bundle_count,
        })
    }

    /// Retrieves and unpacks one bundle payload. One retry, then the
    /// payload is logged and skipped; a bundle that stays malformed must
    /// not wedge the height.
    async fn unpack_bundle(&self, tx_id: &str) -> Option<(crate::node_client::TxOffsetInfo, Vec<BundleItem>)> {
        for attempt in 0..2 {
            let result = async {
                let (offset, payload) = fetch_transaction_data(self.node.as_ref(), tx_id).await?;
                let items = self
                    .bundle_codec
                    .unpack(&payload)
                    .map_err(|e| FetchError::Transient(e.to_string()))?;
                Ok::<_, FetchError>((offset, items))
            }
            .await;
            match result {
                Ok(unpacked) => return Some(unpacked),
                Err(err) if attempt == 0 => {
                    debug!(%err, tx_id, "bundle retrieval failed, retrying once");
                }
                Err(err) => {
                    warn!(%err, tx_id, "malformed bundle payload, skipping");
                }
            }
        }
        None
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let millis = self.options.retry_base_delay.as_millis() as u64 * u64::from(attempt);
        Duration::from_millis(millis).min(self.options.retry_max_delay)
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(events) = &self.events {
            let _ = events.try_send(event);
        }
    }
}

fn none_if_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}
