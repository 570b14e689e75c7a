mod config;

use std::sync::Arc;
use std::time::Duration;

use gateway_db::MemoryStore;
use gateway_lib::{
    HttpNodeClient, JsonBundleCodec, PeerPool, SyncEngine, SyncEvent, SyncMetrics, WriteBatcher,
};
use tokio::sync::watch;
use tracing::{debug, error, info};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    dotenv::dotenv().ok();
    let config = config::get_gateway_config()?;
    let peers = config.peer_urls()?;
    info!(peers = peers.len(), keyspace = %config.keyspace, "starting gateway");

    for statement in gateway_db::schema::create_statements(&config.keyspace) {
        debug!(%statement, "schema statement");
    }

    // The networked store driver lives behind the Store trait; this process
    // runs against the embedded store.
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(SyncMetrics::new());
    let peer_pool = Arc::new(PeerPool::new(peers));
    let node = Arc::new(HttpNodeClient::new(
        peer_pool.clone(),
        Duration::from_secs(config.http_timeout_seconds),
    )?);
    let batcher = Arc::new(WriteBatcher::new(
        store.clone(),
        config.batch_size,
        metrics.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = flume::bounded(256);

    let engine = SyncEngine::builder()
        .node(node)
        .store(store)
        .batcher(batcher)
        .bundle_codec(Arc::new(JsonBundleCodec))
        .metrics(metrics.clone())
        .options(config.sync_options())
        .shutdown(shutdown_rx)
        .events(events_tx)
        .build();

    let mut engine_handle = tokio::spawn(engine.run());

    let reporter_metrics = metrics.clone();
    let reporter_handle = tokio::spawn(async move {
        while let Ok(event) = events_rx.recv_async().await {
            match event {
                SyncEvent::CaughtUp { from, to } => {
                    info!(from, to, "historical catch-up complete");
                    info!("{}", reporter_metrics.snapshot());
                }
                SyncEvent::ForkRecovered { resync_from, tip } => {
                    info!(resync_from, tip, "fork recovery complete");
                    info!("{}", reporter_metrics.snapshot());
                }
                SyncEvent::BlockIngested { .. } => {}
            }
        }
    });

    let early_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Termination signal received. Shutting down...");
            _ = shutdown_tx
                .send(true)
                .inspect_err(|_| error!("failed to signal shutdown to sync engine"));
            info!("waiting for sync engine to finish");
            None
        }
        result = &mut engine_handle => Some(result),
    };
    match early_result {
        Some(result) => result??,
        None => engine_handle.await??,
    }

    _ = reporter_handle.await;
    info!("{}", metrics.snapshot());
    info!("All tasks shut down.");

    Ok(())
}
