//! The long-lived cooperating tasks behind the gateway: discovery,
//! sync, aggregation, reconciliation and retention.
//!
//! [`Node::start`] spawns every task; [`Node::shutdown`] cancels them
//! cooperatively in order: pool first, then the ingest worker (which
//! drains and flushes cursors), then the stores fall out of scope.

pub mod aggregator;
pub mod graph;
pub mod retention;
pub mod stats;
pub mod sync;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use nophr_cache::Cache;
use nophr_config::Config;
use nophr_db::Database;
use nophr_relay::{Discovery, DiscoveryOptions, PoolOptions, RelayPool};

use crate::retention::RetentionEngine;
use crate::stats::Stats;
use crate::sync::SyncEngine;

const LOG_TARGET: &str = "nophr::node";

const INGEST_CHANNEL_CAPACITY: usize = 4_096;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Node {
    pub db: Arc<Database>,
    pub cache: Arc<dyn Cache>,
    pub pool: Arc<RelayPool>,
    pub stats: Arc<Stats>,
    pub config: Arc<Config>,
    cancel_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

fn discovery_options(config: &Config) -> DiscoveryOptions {
    DiscoveryOptions {
        seeds: config.relays.seeds.clone(),
        refresh_interval: Duration::from_secs(config.discovery.refresh_seconds.max(30)),
        use_owner_hints: config.discovery.use_owner_hints,
        use_author_hints: config.discovery.use_author_hints,
        fallback_to_seeds: config.discovery.fallback_to_seeds,
        max_relays_per_author: config.discovery.max_relays_per_author.max(1),
    }
}

fn pool_options(config: &Config) -> PoolOptions {
    PoolOptions {
        connect_timeout: Duration::from_millis(config.relays.policy.connect_timeout_ms.max(100)),
        backoff: config
            .relays
            .policy
            .backoff_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect(),
        max_concurrent_subs: config.relays.policy.max_concurrent_subs.max(1),
        queue_capacity: 1_024,
    }
}

impl Node {
    /// Spawn the whole task tree.
    pub async fn start(
        config: Arc<Config>,
        db: Arc<Database>,
        cache: Arc<dyn Cache>,
    ) -> Arc<Node> {
        let stats = Arc::new(Stats::default());
        let pool = Arc::new(RelayPool::new(pool_options(&config)));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let (ingest_tx, ingest_rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);
        let (discovery_refresh_tx, discovery_refresh_rx) = mpsc::channel(64);
        let (graph_dirty_tx, graph_dirty_rx) = mpsc::channel(1);

        let discovery_opts = discovery_options(&config);
        let retention = Arc::new(RetentionEngine::new(
            db.clone(),
            stats.clone(),
            config.sync.retention.clone(),
            config.owner,
        ));
        let engine = Arc::new(SyncEngine::new(
            db.clone(),
            cache.clone(),
            pool.clone(),
            config.clone(),
            stats.clone(),
            retention.clone(),
            discovery_opts.clone(),
            ingest_tx.clone(),
            discovery_refresh_tx,
            graph_dirty_tx.clone(),
            cancel_rx.clone(),
        ));

        let mut tasks = Vec::new();

        if config.sync.enabled {
            let discovery = Discovery::new(
                db.clone(),
                pool.clone(),
                config.owner,
                discovery_opts,
                ingest_tx,
                discovery_refresh_rx,
                cancel_rx.clone(),
            );
            tasks.push(tokio::spawn(discovery.run()));
        }

        tasks.push(tokio::spawn(engine.clone().run_ingest(ingest_rx)));
        tasks.push(tokio::spawn(engine.clone().run_cursor_flusher()));
        tasks.push(tokio::spawn(engine.clone().run_subscription_manager()));
        tasks.push(tokio::spawn(run_graph_updater(
            db.clone(),
            config.clone(),
            graph_dirty_rx,
            cancel_rx.clone(),
        )));

        let aggregates = &config.caching.aggregates;
        if aggregates.enabled {
            let reconciler = aggregator::Reconciler::new(
                db.clone(),
                stats.clone(),
                config.inbox.noise_filters.clone(),
                Duration::from_secs(aggregates.reconciler_interval_seconds.max(30)),
                aggregates.reconciler_batch_size.max(1),
                cancel_rx.clone(),
            );
            tasks.push(tokio::spawn(reconciler.run()));
        }

        tasks.push(tokio::spawn(retention.run(cancel_rx)));

        // Kick the first graph build so the engine has authors to sync.
        let _ = graph_dirty_tx.try_send(());

        info!(target: LOG_TARGET, tasks = tasks.len(), "Node started");
        Arc::new(Node {
            db,
            cache,
            pool,
            stats,
            config,
            cancel_tx,
            tasks: std::sync::Mutex::new(tasks),
        })
    }

    /// Cooperative shutdown: cancel, close the pool, wait for the task
    /// tree (the ingest worker flushes cursors on its way out).
    pub async fn shutdown(&self) {
        info!(target: LOG_TARGET, "Shutting down");
        let _ = self.cancel_tx.send(true);
        self.pool.close();

        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("Locking failed"));
        let joined = futures_join_all(tasks);
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, joined).await.is_err() {
            warn!(target: LOG_TARGET, "Shutdown grace window expired with tasks still running");
        }

        self.cache.close().await;
        info!(target: LOG_TARGET, "Node stopped");
    }
}

async fn futures_join_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        let _ = task.await;
    }
}

/// Debounced graph recomputation triggered by kind-3 ingests.
async fn run_graph_updater(
    db: Arc<Database>,
    config: Arc<Config>,
    mut dirty_rx: mpsc::Receiver<()>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            dirty = dirty_rx.recv() => match dirty {
                Some(()) => {
                    // Coalesce bursts of contact-list updates.
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    while dirty_rx.try_recv().is_ok() {}
                    if let Err(err) =
                        graph::recompute(&db, &config.owner, &config.sync.scope).await
                    {
                        warn!(target: LOG_TARGET, %err, "Graph recompute failed");
                    }
                }
                None => break,
            },
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
