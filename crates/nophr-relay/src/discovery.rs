//! Dynamic relay discovery (NIP-65).
//!
//! Bootstraps the owner's profile, contact list and relay list from
//! the configured seed relays, then keeps per-author relay hints fresh:
//! periodically, and opportunistically whenever the sync engine sees a
//! newer kind-10002 for a tracked author.
//!
//! Fetched events are not interpreted here; they go through the same
//! ingest channel as everything else so hints, graph and aggregates
//! all derive from one pipeline.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use nostr::{Event, PublicKey};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, trace};

use nophr_core::{kinds, unix_now, EventFilter, PubkeyKey};
use nophr_db::Database;

use crate::nip11;
use crate::pool::{RelayPool, SubEvent};

const LOG_TARGET: &str = "nophr::discovery";

/// How long a short-lived discovery subscription may run.
const FETCH_WINDOW: Duration = Duration::from_secs(10);

/// Authors per discovery filter batch.
const AUTHOR_BATCH: usize = 500;

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub seeds: Vec<String>,
    pub refresh_interval: Duration,
    pub use_owner_hints: bool,
    pub use_author_hints: bool,
    pub fallback_to_seeds: bool,
    pub max_relays_per_author: usize,
}

/// An event received from a relay, on its way into the ingest pipeline.
pub type IngestItem = (String, Box<Event>);

pub struct Discovery {
    db: Arc<Database>,
    pool: Arc<RelayPool>,
    owner: PublicKey,
    opts: DiscoveryOptions,
    ingest_tx: mpsc::Sender<IngestItem>,
    refresh_rx: mpsc::Receiver<PublicKey>,
    cancel: watch::Receiver<bool>,
}

impl Discovery {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        pool: Arc<RelayPool>,
        owner: PublicKey,
        opts: DiscoveryOptions,
        ingest_tx: mpsc::Sender<IngestItem>,
        refresh_rx: mpsc::Receiver<PublicKey>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            pool,
            owner,
            opts,
            ingest_tx,
            refresh_rx,
            cancel,
        }
    }

    pub async fn run(mut self) {
        info!(target: LOG_TARGET, seeds = self.opts.seeds.len(), "Discovery task starting");
        let mut interval = tokio::time::interval(self.opts.refresh_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.refresh().await;
                }
                author = self.refresh_rx.recv() => match author {
                    Some(author) => self.refresh_author(author).await,
                    None => break,
                },
                _ = self.cancel.changed() => {
                    if *self.cancel.borrow() {
                        break;
                    }
                }
            }
        }
        info!(target: LOG_TARGET, "Discovery task stopped");
    }

    /// Full refresh: owner bootstrap, tracked-author relay lists, and
    /// capability probes for every relay in play.
    pub async fn refresh(&self) {
        self.bootstrap_owner().await;

        if self.opts.use_author_hints {
            let members = match self.db.graph_members(PubkeyKey::from(self.owner)).await {
                Ok(members) => members,
                Err(err) => {
                    debug!(target: LOG_TARGET, %err, "Graph read failed");
                    return;
                }
            };
            let authors: Vec<String> = members
                .iter()
                .filter(|(member, _)| *member != PubkeyKey::from(self.owner))
                .map(|(member, _)| member.to_hex())
                .collect();
            for batch in authors.chunks(AUTHOR_BATCH) {
                let filter = EventFilter::new()
                    .authors(batch.iter().cloned())
                    .kind(kinds::RELAY_LIST)
                    .limit(batch.len());
                for seed in &self.opts.seeds {
                    self.fetch_into_ingest(seed, vec![filter.clone()]).await;
                }
            }
        }

        // Capability probes for the seeds and every hinted read relay.
        let now = unix_now();
        let mut relays: BTreeSet<String> = self.opts.seeds.iter().cloned().collect();
        if let Ok(hints) = self
            .db
            .relay_hints_for(PubkeyKey::from(self.owner))
            .await
        {
            relays.extend(
                hints
                    .into_iter()
                    .filter(|(_, record)| record.can_read)
                    .map(|(url, _)| url),
            );
        }
        for relay in relays {
            nip11::probe_if_due(&self.db, &relay, now).await;
        }
    }

    /// Seed-only bootstrap of the owner's kind 0, 3 and 10002.
    async fn bootstrap_owner(&self) {
        let owner_hex = self.owner.to_hex();
        let filters: Vec<EventFilter> = [kinds::METADATA, kinds::CONTACTS, kinds::RELAY_LIST]
            .into_iter()
            .map(|kind| {
                EventFilter::new()
                    .author(owner_hex.clone())
                    .kind(kind)
                    .limit(1)
            })
            .collect();
        for seed in &self.opts.seeds {
            self.fetch_into_ingest(seed, filters.clone()).await;
        }
    }

    /// Opportunistic refresh for one author's relay list.
    async fn refresh_author(&self, author: PublicKey) {
        trace!(target: LOG_TARGET, author = %author, "Refreshing author hints");
        let filter = EventFilter::new()
            .author(author.to_hex())
            .kind(kinds::RELAY_LIST)
            .limit(1);
        for seed in &self.opts.seeds {
            self.fetch_into_ingest(seed, vec![filter.clone()]).await;
        }
    }

    /// Run a short-lived subscription and forward received events.
    async fn fetch_into_ingest(&self, relay: &str, filters: Vec<EventFilter>) {
        let sub_id = format!("nophr-disc-{:08x}", rand::random::<u32>());
        let subscription = match self.pool.subscribe(relay, &sub_id, filters) {
            Ok(subscription) => subscription,
            Err(err) => {
                debug!(target: LOG_TARGET, relay, %err, "Discovery subscribe failed");
                return;
            }
        };

        let deadline = tokio::time::Instant::now() + FETCH_WINDOW;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, subscription.recv()).await {
                Ok(Some(SubEvent::Event(event))) => {
                    let _ = self.ingest_tx.send((relay.to_owned(), event)).await;
                }
                Ok(Some(SubEvent::Eose)) | Ok(Some(SubEvent::Closed(_))) | Ok(None) => break,
                Err(_elapsed) => break,
            }
        }
        self.pool.unsubscribe(relay, &sub_id);
    }
}

/// The active read set for an author.
///
/// Hints with `can_read`, freshest first; within equal freshness,
/// already-connected relays are preferred to reduce churn. Truncated to
/// `max_relays_per_author`; empty hint sets fall back to the seeds.
pub async fn read_relays_for(
    db: &Database,
    pool: &RelayPool,
    opts: &DiscoveryOptions,
    author: PubkeyKey,
) -> Vec<String> {
    let hints = db.relay_hints_for(author).await.unwrap_or_default();
    let connected: BTreeSet<String> = pool.connected_relays().into_iter().collect();

    let mut candidates: Vec<(u64, bool, String)> = hints
        .into_iter()
        .filter(|(_, record)| record.can_read)
        .map(|(url, record)| (record.freshness, connected.contains(&url), url))
        .collect();
    // Freshness descending, then connected-first, then url for stability.
    candidates.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then_with(|| b.1.cmp(&a.1))
            .then_with(|| a.2.cmp(&b.2))
    });

    let relays: Vec<String> = candidates
        .into_iter()
        .take(opts.max_relays_per_author)
        .map(|(_, _, url)| url)
        .collect();

    if relays.is_empty() && opts.fallback_to_seeds {
        opts.seeds.clone()
    } else {
        relays
    }
}
