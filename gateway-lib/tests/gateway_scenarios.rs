//! End-to-end scenarios: catch-up, polling, fork recovery and the
//! paginated query surface, run against a scripted node and the embedded
//! store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gateway_db::{MemoryStore, SortOrder, TableId};
use gateway_lib::error::{FetchError, SyncError};
use gateway_lib::node_client::{ChainBlock, ChainTag, ChainTransaction, NetworkInfo, NodeApi, TxOffsetInfo};
use gateway_lib::query_planner::{BlockQueryParams, TagFilterParam, TxQueryParams};
use gateway_lib::{
    JsonBundleCodec, PeerPool, QueryRunner, SyncEngine, SyncEvent, SyncMetrics, SyncOptions,
    WriteBatcher,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn test_block(prefix: &str, height: u64, previous: String) -> (ChainBlock, ChainTransaction) {
    let hash = format!("{prefix}{height}");
    let tx_id = format!("tx-{hash}");
    let block = ChainBlock {
        indep_hash: hash.clone(),
        height,
        previous_block: previous,
        timestamp: 1_600_000_000 + height,
        txs: vec![tx_id.clone()],
    };
    let tx = ChainTransaction {
        id: tx_id,
        owner: format!("owner-{}", height % 3),
        target: String::new(),
        quantity: 0,
        reward: 1,
        signature: "sig".into(),
        data_size: 0,
        format: 2,
        tags: vec![ChainTag {
            name: "App-Name".into(),
            value: "scenario".into(),
        }],
    };
    (block, tx)
}

#[derive(Default)]
struct MockChain {
    blocks: Vec<ChainBlock>,
    txs: HashMap<String, ChainTransaction>,
}

/// A scripted network: one canonical chain, mutable under a lock so tests
/// can extend it or reorganize it mid-run.
#[derive(Default)]
struct MockNode {
    chain: Mutex<MockChain>,
}

impl MockNode {
    fn with_chain(prefix: &str, heights: std::ops::RangeInclusive<u64>) -> Self {
        let node = Self::default();
        node.extend_chain(prefix, heights);
        node
    }

    /// Appends blocks `heights` continuing the current tip.
    fn extend_chain(&self, prefix: &str, heights: std::ops::RangeInclusive<u64>) {
        let mut chain = self.chain.lock();
        for height in heights {
            let previous = chain
                .blocks
                .last()
                .map(|b| b.indep_hash.clone())
                .unwrap_or_default();
            let (block, tx) = test_block(prefix, height, previous);
            chain.txs.insert(tx.id.clone(), tx);
            chain.blocks.push(block);
        }
    }

    /// Drops every block at `from_height` and above, then grafts a new
    /// branch on top of the surviving tip.
    fn reorg(&self, from_height: u64, prefix: &str, new_tip: u64) {
        {
            let mut chain = self.chain.lock();
            chain.blocks.retain(|b| b.height < from_height);
        }
        self.extend_chain(prefix, from_height..=new_tip);
    }
}

#[async_trait]
impl NodeApi for MockNode {
    async fn info(&self) -> Result<NetworkInfo, FetchError> {
        let chain = self.chain.lock();
        let tip = chain
            .blocks
            .last()
            .ok_or_else(|| FetchError::Transient("empty chain".into()))?;
        Ok(NetworkInfo {
            network: "mocknet".into(),
            height: tip.height,
            current: tip.indep_hash.clone(),
            blocks: chain.blocks.len() as u64,
            peers: 1,
            queue_length: 0,
        })
    }

    async fn block_by_height(&self, height: u64) -> Result<ChainBlock, FetchError> {
        self.chain
            .lock()
            .blocks
            .iter()
            .find(|b| b.height == height)
            .cloned()
            .ok_or_else(|| FetchError::Transient(format!("no block at height {height}")))
    }

    async fn block_by_hash(&self, hash: &str) -> Result<ChainBlock, FetchError> {
        self.chain
            .lock()
            .blocks
            .iter()
            .find(|b| b.indep_hash == hash)
            .cloned()
            .ok_or_else(|| FetchError::Transient(format!("no block with hash {hash}")))
    }

    async fn current_block(&self) -> Result<ChainBlock, FetchError> {
        self.chain
            .lock()
            .blocks
            .last()
            .cloned()
            .ok_or_else(|| FetchError::Transient("empty chain".into()))
    }

    async fn transaction(&self, id: &str) -> Result<ChainTransaction, FetchError> {
        self.chain
            .lock()
            .txs
            .get(id)
            .cloned()
            .ok_or_else(|| FetchError::Transient(format!("no transaction {id}")))
    }

    async fn tx_offset(&self, id: &str) -> Result<TxOffsetInfo, FetchError> {
        Err(FetchError::Transient(format!("no offset for {id}")))
    }

    async fn chunk(&self, offset: u64) -> Result<Vec<u8>, FetchError> {
        Err(FetchError::Transient(format!("no chunk at {offset}")))
    }
}

fn test_options() -> SyncOptions {
    SyncOptions {
        parallel_fetches: 8,
        poll_interval: Duration::from_millis(25),
        fetch_retry_limit: 5,
        retry_base_delay: Duration::from_millis(1),
        retry_max_delay: Duration::from_millis(5),
        max_fork_depth: 20,
        tip_discovery_attempts: 3,
    }
}

struct Harness {
    shutdown_tx: watch::Sender<bool>,
    events: flume::Receiver<SyncEvent>,
    handle: JoinHandle<Result<(), SyncError>>,
}

impl Harness {
    fn spawn(node: Arc<MockNode>, store: Arc<MemoryStore>) -> Self {
        let metrics = Arc::new(SyncMetrics::new());
        let batcher = Arc::new(WriteBatcher::new(store.clone(), 5, metrics.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events) = flume::unbounded();
        let engine = SyncEngine::builder()
            .node(node)
            .store(store.clone())
            .batcher(batcher)
            .bundle_codec(Arc::new(JsonBundleCodec))
            .metrics(metrics)
            .options(test_options())
            .shutdown(shutdown_rx)
            .events(events_tx)
            .build();
        let handle = tokio::spawn(engine.run());
        Self {
            shutdown_tx,
            events,
            handle,
        }
    }

    async fn wait_for(&self, description: &str, predicate: impl Fn(&SyncEvent) -> bool) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                let event = self
                    .events
                    .recv_async()
                    .await
                    .expect("engine dropped its event channel");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {description}"))
    }

    async fn stop(self) -> Result<(), SyncError> {
        let _ = self.shutdown_tx.send(true);
        self.handle.await.expect("engine task panicked")
    }
}

async fn canonical_hash_at(runner: &QueryRunner, height: u64) -> Option<String> {
    runner
        .block_at_height(height)
        .await
        .unwrap()
        .map(|b| b.indep_hash)
}

#[tokio::test]
async fn catch_up_fills_every_height_and_resumes_from_stored_height() {
    let node = Arc::new(MockNode::with_chain("x", 0..=50));
    let store = Arc::new(MemoryStore::new());

    let harness = Harness::spawn(node.clone(), store.clone());
    harness
        .wait_for("initial catch-up", |e| {
            matches!(e, SyncEvent::CaughtUp { to: 50, .. })
        })
        .await;
    harness.stop().await.unwrap();
    assert_eq!(store.row_count(TableId::Block), 51);

    // A restarted engine resumes from the highest stored height.
    node.extend_chain("x", 51..=100);
    let harness = Harness::spawn(node.clone(), store.clone());
    let event = harness
        .wait_for("resumed catch-up", |e| matches!(e, SyncEvent::CaughtUp { .. }))
        .await;
    assert!(matches!(event, SyncEvent::CaughtUp { from: 51, to: 100 }));
    harness.stop().await.unwrap();

    // Exactly one canonical row per height, carrying the network's hash.
    assert_eq!(store.row_count(TableId::BlockGqlAsc), 101);
    assert_eq!(store.row_count(TableId::BlockGqlDesc), 101);
    let runner = QueryRunner::new(store.clone());
    for height in 0..=100 {
        assert_eq!(
            canonical_hash_at(&runner, height).await.as_deref(),
            Some(format!("x{height}").as_str()),
            "wrong canonical hash at height {height}"
        );
    }
}

#[tokio::test]
async fn polling_ingests_new_blocks_one_at_a_time() {
    let node = Arc::new(MockNode::with_chain("x", 0..=10));
    let store = Arc::new(MemoryStore::new());
    let harness = Harness::spawn(node.clone(), store.clone());
    harness
        .wait_for("catch-up", |e| matches!(e, SyncEvent::CaughtUp { .. }))
        .await;

    node.extend_chain("x", 11..=11);
    harness
        .wait_for("tip ingestion", |e| {
            matches!(e, SyncEvent::BlockIngested { height: 11 })
        })
        .await;
    harness.stop().await.unwrap();

    let runner = QueryRunner::new(store);
    assert_eq!(canonical_hash_at(&runner, 11).await.as_deref(), Some("x11"));
}

#[tokio::test]
async fn fork_recovery_overwrites_the_replaced_heights() {
    let node = Arc::new(MockNode::with_chain("x", 0..=100));
    let store = Arc::new(MemoryStore::new());
    let harness = Harness::spawn(node.clone(), store.clone());
    harness
        .wait_for("catch-up", |e| matches!(e, SyncEvent::CaughtUp { .. }))
        .await;

    // The network replaces heights 90..=100 with a heavier branch rooted at
    // x89 and extends past the old tip.
    node.reorg(90, "y", 104);
    let event = harness
        .wait_for("fork recovery", |e| matches!(e, SyncEvent::ForkRecovered { .. }))
        .await;
    assert!(matches!(
        event,
        SyncEvent::ForkRecovered {
            resync_from: 90,
            tip: 104
        }
    ));
    harness.stop().await.unwrap();

    let runner = QueryRunner::new(store.clone());
    for height in 86..=89 {
        assert_eq!(
            canonical_hash_at(&runner, height).await,
            Some(format!("x{height}"))
        );
    }
    for height in 90..=104 {
        assert_eq!(
            canonical_hash_at(&runner, height).await,
            Some(format!("y{height}"))
        );
    }

    // No residual x-branch rows are reachable through the canonical tables.
    let params = BlockQueryParams {
        min_height: Some(85),
        max_height: Some(104),
        first: Some(50),
        sort: SortOrder::HeightAsc,
        ..Default::default()
    };
    let page = runner.blocks(&params).await.unwrap();
    assert!(page
        .edges
        .iter()
        .all(|edge| !edge.node.indep_hash.starts_with('x') || edge.node.height <= 89));
}

#[tokio::test]
async fn end_to_end_fork_scenario_over_the_query_surface() {
    let node = Arc::new(MockNode::with_chain("x", 0..=100));
    let store = Arc::new(MemoryStore::new());
    let harness = Harness::spawn(node.clone(), store.clone());
    harness
        .wait_for("catch-up", |e| matches!(e, SyncEvent::CaughtUp { .. }))
        .await;

    // Default sort is descending: the freshest transaction comes first.
    let runner = QueryRunner::new(store.clone());
    let page = runner
        .transactions(&TxQueryParams {
            first: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.edges[0].node.id, "tx-x100");
    assert!(page.has_next_page);

    node.reorg(90, "y", 104);
    harness
        .wait_for("fork recovery", |e| matches!(e, SyncEvent::ForkRecovered { .. }))
        .await;
    harness.stop().await.unwrap();

    let page = runner
        .blocks(&BlockQueryParams {
            min_height: Some(86),
            max_height: Some(94),
            first: Some(20),
            sort: SortOrder::HeightAsc,
            ..Default::default()
        })
        .await
        .unwrap();
    let hashes: Vec<&str> = page
        .edges
        .iter()
        .map(|edge| edge.node.indep_hash.as_str())
        .collect();
    assert_eq!(
        &hashes[..7],
        &["x86", "x87", "x88", "x89", "y90", "y91", "y92"]
    );
    assert!(!hashes.contains(&"x90"));
}

#[tokio::test]
async fn pagination_round_trips_without_duplicates_or_gaps() {
    let node = Arc::new(MockNode::with_chain("x", 0..=59));
    let store = Arc::new(MemoryStore::new());
    let harness = Harness::spawn(node.clone(), store.clone());
    harness
        .wait_for("catch-up", |e| matches!(e, SyncEvent::CaughtUp { .. }))
        .await;
    harness.stop().await.unwrap();
    let runner = QueryRunner::new(store);

    for sort in [SortOrder::HeightAsc, SortOrder::HeightDesc] {
        let mut seen = Vec::new();
        let mut after = None;
        loop {
            let page = runner
                .transactions(&TxQueryParams {
                    first: Some(7),
                    after: after.clone(),
                    sort,
                    ..Default::default()
                })
                .await
                .unwrap();
            let expect_more = page.has_next_page;
            for edge in &page.edges {
                seen.push(edge.node.id.clone());
            }
            if !expect_more {
                break;
            }
            after = page.edges.last().map(|edge| edge.cursor.clone());
        }

        let mut expected: Vec<String> = (0..=59).map(|h| format!("tx-x{h}")).collect();
        if sort == SortOrder::HeightDesc {
            expected.reverse();
        }
        assert_eq!(seen, expected, "bad page sequence for {sort:?}");
    }
}

#[tokio::test]
async fn filters_restrict_the_paginated_results() {
    let node = Arc::new(MockNode::with_chain("x", 0..=30));
    let store = Arc::new(MemoryStore::new());
    let harness = Harness::spawn(node.clone(), store.clone());
    harness
        .wait_for("catch-up", |e| matches!(e, SyncEvent::CaughtUp { .. }))
        .await;
    harness.stop().await.unwrap();
    let runner = QueryRunner::new(store);

    // Owner rotates height % 3; owner-1 owns heights 1, 4, 7, ...
    let page = runner
        .transactions(&TxQueryParams {
            owners: vec!["owner-1".into()],
            first: Some(100),
            sort: SortOrder::HeightAsc,
            ..Default::default()
        })
        .await
        .unwrap();
    let heights: Vec<u64> = page.edges.iter().map(|e| e.node.block_height()).collect();
    assert_eq!(heights, (0..=30).filter(|h| h % 3 == 1).collect::<Vec<_>>());

    // Every scripted transaction carries the scenario tag; a disjunctive
    // value list matches, a foreign value list does not.
    let matching = runner
        .transactions(&TxQueryParams {
            tags: vec![TagFilterParam {
                name: "App-Name".into(),
                values: vec!["other".into(), "scenario".into()],
            }],
            first: Some(100),
            sort: SortOrder::HeightAsc,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(matching.edges.len(), 31);

    let empty = runner
        .transactions(&TxQueryParams {
            tags: vec![TagFilterParam {
                name: "App-Name".into(),
                values: vec!["other".into()],
            }],
            first: Some(100),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(empty.edges.is_empty());
    assert!(!empty.has_next_page);
}

/// A node whose info endpoint answers but whose block endpoints never do.
struct UnreachableBlocks;

#[async_trait]
impl NodeApi for UnreachableBlocks {
    async fn info(&self) -> Result<NetworkInfo, FetchError> {
        Ok(NetworkInfo {
            network: "mocknet".into(),
            height: 5,
            current: "x5".into(),
            blocks: 6,
            peers: 1,
            queue_length: 0,
        })
    }
    async fn block_by_height(&self, height: u64) -> Result<ChainBlock, FetchError> {
        Err(FetchError::Transient(format!("unreachable block {height}")))
    }
    async fn block_by_hash(&self, hash: &str) -> Result<ChainBlock, FetchError> {
        Err(FetchError::Transient(format!("unreachable block {hash}")))
    }
    async fn current_block(&self) -> Result<ChainBlock, FetchError> {
        Err(FetchError::Transient("unreachable".into()))
    }
    async fn transaction(&self, id: &str) -> Result<ChainTransaction, FetchError> {
        Err(FetchError::Transient(format!("unreachable tx {id}")))
    }
    async fn tx_offset(&self, id: &str) -> Result<TxOffsetInfo, FetchError> {
        Err(FetchError::Transient(format!("unreachable offset {id}")))
    }
    async fn chunk(&self, offset: u64) -> Result<Vec<u8>, FetchError> {
        Err(FetchError::Transient(format!("unreachable chunk {offset}")))
    }
}

#[tokio::test]
async fn exhausted_block_retries_are_fatal() {
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(SyncMetrics::new());
    let batcher = Arc::new(WriteBatcher::new(store.clone(), 5, metrics.clone()));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = SyncEngine::builder()
        .node(Arc::new(UnreachableBlocks))
        .store(store)
        .batcher(batcher)
        .bundle_codec(Arc::new(JsonBundleCodec))
        .metrics(metrics.clone())
        .options(test_options())
        .shutdown(shutdown_rx)
        .build();

    let err = engine.run().await.unwrap_err();
    assert!(matches!(err, SyncError::RetriesExhausted { .. }));
    assert!(metrics.snapshot().fetch_retries > 0);
}

#[tokio::test]
async fn startup_without_reachable_peers_is_fatal() {
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(SyncMetrics::new());
    let batcher = Arc::new(WriteBatcher::new(store.clone(), 5, metrics.clone()));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    // An empty scripted chain never answers the info probe.
    let engine = SyncEngine::builder()
        .node(Arc::new(MockNode::default()))
        .store(store)
        .batcher(batcher)
        .bundle_codec(Arc::new(JsonBundleCodec))
        .metrics(metrics)
        .options(test_options())
        .shutdown(shutdown_rx)
        .build();

    let err = engine.run().await.unwrap_err();
    assert!(matches!(err, SyncError::PeerExhausted));
}

#[test]
fn peer_pool_is_shared_state_not_module_state() {
    // Two pools never interfere; weights are owned by the instance.
    let a = PeerPool::new(vec![url::Url::parse("http://peer-a:1984").unwrap()]);
    let b = PeerPool::new(vec![url::Url::parse("http://peer-b:1984").unwrap()]);
    a.report_failure(&url::Url::parse("http://peer-a:1984").unwrap(), true);
    assert_eq!(b.escalation_count(), 0);
}
