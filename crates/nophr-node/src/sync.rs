//! The sync engine: builds subscriptions from (graph ⋈ kinds ⋈
//! cursors), drains relay event streams through the ingest pipeline,
//! and keeps cursors, hints, aggregates, retention records and the
//! cache in step.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nostr::{Event, PublicKey};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use nophr_cache::{keys, Cache};
use nophr_config::Config;
use nophr_core::{kinds, refs, unix_now, EventFilter, EventIdKey, PubkeyKey};
use nophr_db::{Database, DbError, StoreError};
use nophr_relay::{read_relays_for, DiscoveryOptions, IngestItem, RelayPool, SubEvent};

use crate::aggregator;
use crate::retention::RetentionEngine;
use crate::stats::Stats;

const LOG_TARGET: &str = "nophr::sync";

/// How often the desired subscription set is re-derived.
const SYNC_TICK: Duration = Duration::from_secs(30);

/// Authors per subscription filter.
const AUTHOR_BATCH: usize = 500;

/// Default per-subscription result bound.
const DEFAULT_LIMIT: usize = 500;

/// Thread roots tracked for the threads-of-mine modifier filter.
const THREAD_ROOTS_LIMIT: usize = 128;

/// Grace window for draining in-flight events at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// The kinds swept by the mention modifier filter.
const MENTION_KINDS: [u16; 5] = [
    kinds::TEXT_NOTE,
    kinds::REPOST,
    kinds::REACTION,
    kinds::ZAP_RECEIPT,
    kinds::LONG_FORM,
];

pub struct SyncEngine {
    db: Arc<Database>,
    cache: Arc<dyn Cache>,
    pool: Arc<RelayPool>,
    config: Arc<Config>,
    stats: Arc<Stats>,
    retention: Arc<RetentionEngine>,
    discovery_opts: DiscoveryOptions,
    ingest_tx: mpsc::Sender<IngestItem>,
    discovery_refresh_tx: mpsc::Sender<PublicKey>,
    graph_dirty_tx: mpsc::Sender<()>,
    cancel: watch::Receiver<bool>,
    /// Unflushed cursor advances.
    pending_cursors: Mutex<HashMap<(String, u16), u64>>,
    /// Active subscriptions and the filters they were opened with.
    active_subs: Mutex<HashMap<(String, String), Vec<EventFilter>>>,
    /// Pubkeys dropped at ingest.
    denied: BTreeSet<PubkeyKey>,
    /// Sections whose ordering depends on interaction counts.
    popularity_sections: Vec<String>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        cache: Arc<dyn Cache>,
        pool: Arc<RelayPool>,
        config: Arc<Config>,
        stats: Arc<Stats>,
        retention: Arc<RetentionEngine>,
        discovery_opts: DiscoveryOptions,
        ingest_tx: mpsc::Sender<IngestItem>,
        discovery_refresh_tx: mpsc::Sender<PublicKey>,
        graph_dirty_tx: mpsc::Sender<()>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let mut denied: BTreeSet<PubkeyKey> = config
            .sync
            .scope
            .denylist_pubkeys
            .iter()
            .map(PubkeyKey::from)
            .collect();
        if config.security.denylist.enabled {
            denied.extend(config.security.denylist.pubkeys.iter().map(PubkeyKey::from));
        }
        let popularity_sections: Vec<String> = config
            .layout
            .sections
            .iter()
            .filter(|(_, section)| {
                matches!(section.sort_by.as_str(), "interactions" | "popularity")
            })
            .map(|(name, _)| name.clone())
            .collect();
        Self {
            db,
            cache,
            pool,
            config,
            stats,
            retention,
            discovery_opts,
            ingest_tx,
            discovery_refresh_tx,
            graph_dirty_tx,
            cancel,
            pending_cursors: Mutex::new(HashMap::new()),
            active_subs: Mutex::new(HashMap::new()),
            denied,
            popularity_sections,
        }
    }

    // -- ingest pipeline ---------------------------------------------------

    /// Drain the ingest channel until cancellation, then drain what is
    /// already in flight within a bounded grace window and flush.
    pub async fn run_ingest(self: Arc<Self>, mut rx: mpsc::Receiver<IngestItem>) {
        info!(target: LOG_TARGET, "Ingest worker starting");
        let mut cancel = self.cancel.clone();
        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some((relay, event)) => self.process_item(&relay, *event).await,
                    None => break,
                },
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
            }
        }

        // Bounded drain of whatever the pumps managed to enqueue.
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while let Ok(Some((relay, event))) =
            tokio::time::timeout_at(deadline, rx.recv()).await
        {
            self.process_item(&relay, *event).await;
        }

        if let Err(err) = self.flush_cursors().await {
            warn!(target: LOG_TARGET, %err, "Final cursor flush failed");
        }
        info!(target: LOG_TARGET, "Ingest worker stopped");
    }

    /// One event through the full pipeline.
    pub async fn process_item(&self, relay: &str, event: Event) {
        let kind = event.kind.as_u16();

        // Signature first: everything after this point may trust the
        // event's author and timestamp. The store verifies again per
        // its own contract; this is the pipeline's pre-filter.
        if event.verify().is_err() {
            self.stats.count_invalid_signature();
            trace!(target: LOG_TARGET, relay, "Dropped event with bad signature");
            return;
        }

        if self.denied.contains(&PubkeyKey::from(event.pubkey)) {
            self.stats.count_denylisted();
            self.buffer_cursor(relay, kind, event.created_at.as_u64());
            return;
        }
        if self.content_banned(&event) {
            self.stats.count_content_filtered();
            self.buffer_cursor(relay, kind, event.created_at.as_u64());
            return;
        }

        let outcome = match self.db.store_event(&event).await {
            Ok(outcome) => outcome,
            Err(DbError::Store {
                source: StoreError::InvalidSignature,
                ..
            }) => {
                self.stats.count_invalid_signature();
                return;
            }
            Err(err) => {
                warn!(target: LOG_TARGET, relay, %err, "Store failed");
                return;
            }
        };

        self.buffer_cursor(relay, kind, event.created_at.as_u64());

        if !outcome.is_newly_stored() {
            match outcome {
                nophr_db::StoreOutcome::Stale => self.stats.count_stale_replaceable(),
                _ => self.stats.count_duplicate(),
            }
            return;
        }
        self.stats.count_stored();
        trace!(
            target: LOG_TARGET,
            relay,
            kind,
            event_id = %event.id,
            "Event ingested"
        );

        if kind == kinds::CONTACTS
            && crate::graph::affects_graph(
                &self.db,
                &self.config.owner,
                &self.config.sync.scope,
                &event.pubkey,
            )
            .await
        {
            let _ = self.graph_dirty_tx.try_send(());
        }

        if kind == kinds::RELAY_LIST {
            let entries = refs::relay_list(&event);
            if !entries.is_empty() {
                let changed = self
                    .db
                    .upsert_relay_hints(
                        PubkeyKey::from(event.pubkey),
                        &entries,
                        event.created_at.as_u64(),
                        EventIdKey::from(event.id),
                    )
                    .await
                    .unwrap_or(false);
                if changed {
                    let _ = self.discovery_refresh_tx.try_send(event.pubkey);
                }
            }
        }

        let aggregates_cfg = &self.config.caching.aggregates;
        if aggregates_cfg.enabled && aggregates_cfg.update_on_ingest {
            if let Err(err) =
                aggregator::apply_reference(&self.db, &event, &self.config.inbox.noise_filters)
                    .await
            {
                warn!(target: LOG_TARGET, %err, "Aggregate update failed");
            }
        }

        if let Err(err) = self.retention.on_ingest(&event).await {
            warn!(target: LOG_TARGET, %err, "Retention record failed");
        }

        for pattern in keys::invalidation_patterns(&event, &self.popularity_sections) {
            self.cache.delete_pattern(&pattern).await;
        }
    }

    fn content_banned(&self, event: &Event) -> bool {
        let filter = &self.config.security.content_filter;
        if !filter.enabled || filter.banned_words.is_empty() {
            return false;
        }
        if filter.case_sensitive {
            filter
                .banned_words
                .iter()
                .any(|word| event.content.contains(word))
        } else {
            let content = event.content.to_lowercase();
            filter
                .banned_words
                .iter()
                .any(|word| content.contains(&word.to_lowercase()))
        }
    }

    // -- cursors -----------------------------------------------------------

    fn buffer_cursor(&self, relay: &str, kind: u16, created_at: u64) {
        let mut pending = self.pending_cursors.lock().expect("Locking failed");
        let entry = pending.entry((relay.to_owned(), kind)).or_insert(0);
        *entry = (*entry).max(created_at);
    }

    /// Write buffered cursor advances in one transaction.
    pub async fn flush_cursors(&self) -> Result<(), DbError> {
        let batch: Vec<(String, u16, u64)> = {
            let mut pending = self.pending_cursors.lock().expect("Locking failed");
            pending
                .drain()
                .map(|((relay, kind), since)| (relay, kind, since))
                .collect()
        };
        if batch.is_empty() {
            return Ok(());
        }
        trace!(target: LOG_TARGET, cursors = batch.len(), "Flushing cursors");
        self.db.advance_cursors(&batch, unix_now()).await
    }

    /// Periodic cursor persistence, amortizing aux-store writes.
    pub async fn run_cursor_flusher(self: Arc<Self>) {
        let mut cancel = self.cancel.clone();
        let period = Duration::from_secs(self.config.sync.cursor_flush_seconds.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.flush_cursors().await {
                        warn!(target: LOG_TARGET, %err, "Cursor flush failed");
                    }
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
            }
        }
    }

    // -- subscription management -------------------------------------------

    /// Periodically re-derive the desired subscription set and diff it
    /// against what is open.
    pub async fn run_subscription_manager(self: Arc<Self>) {
        if !self.config.sync.enabled {
            info!(target: LOG_TARGET, "Sync disabled, serving stored events only");
            return;
        }
        info!(target: LOG_TARGET, "Subscription manager starting");
        let mut cancel = self.cancel.clone();
        let mut ticker = tokio::time::interval(SYNC_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sync_subscriptions().await;
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
            }
        }
        info!(target: LOG_TARGET, "Subscription manager stopped");
    }

    async fn sync_subscriptions(self: &Arc<Self>) {
        let desired = self.desired_subscriptions().await;

        let (to_close, to_open) = {
            let active = self.active_subs.lock().expect("Locking failed");
            let to_close: Vec<(String, String)> = active
                .iter()
                .filter(|(key, filters)| desired.get(*key) != Some(*filters))
                .map(|(key, _)| key.clone())
                .collect();
            let to_open: Vec<((String, String), Vec<EventFilter>)> = desired
                .iter()
                .filter(|(key, filters)| active.get(*key) != Some(*filters))
                .map(|(key, filters)| (key.clone(), filters.clone()))
                .collect();
            (to_close, to_open)
        };

        for key in &to_close {
            debug!(target: LOG_TARGET, relay = %key.0, sub = %key.1, "Closing subscription");
            self.pool.unsubscribe(&key.0, &key.1);
            self.active_subs
                .lock()
                .expect("Locking failed")
                .remove(key);
        }

        for ((relay, sub_id), filters) in to_open {
            match self.pool.subscribe(&relay, &sub_id, filters.clone()) {
                Ok(subscription) => {
                    debug!(target: LOG_TARGET, relay = %relay, sub = %sub_id, "Opened subscription");
                    self.active_subs
                        .lock()
                        .expect("Locking failed")
                        .insert((relay.clone(), sub_id.clone()), filters);
                    tokio::spawn(self.clone().pump(subscription));
                }
                Err(err) => {
                    debug!(target: LOG_TARGET, relay = %relay, sub = %sub_id, %err, "Subscribe failed");
                }
            }
        }
    }

    /// Forward one subscription's stream into the ingest channel.
    async fn pump(self: Arc<Self>, subscription: nophr_relay::Subscription) {
        let mut cancel = self.cancel.clone();
        loop {
            tokio::select! {
                event = subscription.recv() => match event {
                    Some(SubEvent::Event(event)) => {
                        if self
                            .ingest_tx
                            .send((subscription.relay.clone(), event))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(SubEvent::Eose) => {
                        // Backlog complete for this subscription; make
                        // the cursor durable.
                        if let Err(err) = self.flush_cursors().await {
                            warn!(target: LOG_TARGET, %err, "Cursor flush on EOSE failed");
                        }
                    }
                    Some(SubEvent::Closed(message)) => {
                        warn!(
                            target: LOG_TARGET,
                            relay = %subscription.relay,
                            sub = %subscription.id,
                            %message,
                            "Subscription terminated by relay"
                        );
                        self.active_subs
                            .lock()
                            .expect("Locking failed")
                            .remove(&(subscription.relay.clone(), subscription.id.clone()));
                        break;
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

    /// Build the full desired `(relay, sub_id) -> filters` map.
    async fn desired_subscriptions(&self) -> BTreeMap<(String, String), Vec<EventFilter>> {
        let mut desired = BTreeMap::new();
        let owner_key = PubkeyKey::from(self.config.owner);

        let members = self.db.graph_members(owner_key).await.unwrap_or_default();
        if members.is_empty() {
            // Bootstrap: ask for a recompute; meanwhile sync the owner
            // alone from the seeds.
            let _ = self.graph_dirty_tx.try_send(());
        }
        let mut authors: Vec<PubkeyKey> = members.iter().map(|(member, _)| *member).collect();
        if authors.is_empty() {
            authors.push(owner_key);
        }
        authors.sort();

        // relay -> authors routed there.
        let mut routes: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for author in &authors {
            let use_hints = if *author == owner_key {
                self.config.discovery.use_owner_hints
            } else {
                self.config.discovery.use_author_hints
            };
            let relays = if use_hints {
                read_relays_for(&self.db, &self.pool, &self.discovery_opts, *author).await
            } else {
                self.discovery_opts.seeds.clone()
            };
            for relay in relays {
                routes.entry(relay).or_default().push(author.to_hex());
            }
        }

        let sync_kinds = self.config.sync.kinds.enabled_kinds();
        for (relay, relay_authors) in &routes {
            for kind in &sync_kinds {
                let since = self.cursor_since(relay, *kind).await;
                for (batch_no, batch) in relay_authors.chunks(AUTHOR_BATCH).enumerate() {
                    let mut filter = EventFilter::new()
                        .authors(batch.iter().cloned())
                        .kind(*kind)
                        .limit(DEFAULT_LIMIT);
                    if since > 0 {
                        filter = filter.since(since);
                    }
                    desired.insert(
                        (relay.clone(), format!("sync-k{kind}-b{batch_no}")),
                        vec![filter],
                    );
                }
            }
        }

        // Modifier filters run on the owner's read relays.
        let owner_relays =
            read_relays_for(&self.db, &self.pool, &self.discovery_opts, owner_key).await;
        let owner_hex = self.config.owner.to_hex();

        if self.config.sync.scope.include_direct_mentions {
            for relay in &owner_relays {
                let since = self.min_cursor_since(relay, &MENTION_KINDS).await;
                let mut filter = EventFilter::new()
                    .kinds(MENTION_KINDS)
                    .tag('p', owner_hex.clone())
                    .limit(DEFAULT_LIMIT);
                if since > 0 {
                    filter = filter.since(since);
                }
                desired.insert((relay.clone(), "mentions".to_owned()), vec![filter]);
            }
        }

        if self.config.sync.scope.include_threads_of_mine {
            let roots = self.owner_thread_roots().await;
            if !roots.is_empty() {
                for relay in &owner_relays {
                    let mut filter = EventFilter::new()
                        .kind(kinds::TEXT_NOTE)
                        .limit(DEFAULT_LIMIT);
                    for root in &roots {
                        filter = filter.tag('e', root);
                    }
                    desired.insert((relay.clone(), "threads".to_owned()), vec![filter]);
                }
            }
        }

        desired
    }

    async fn cursor_since(&self, relay: &str, kind: u16) -> u64 {
        let persisted = self
            .db
            .cursor(relay, kind)
            .await
            .ok()
            .flatten()
            .map(|cursor| cursor.since)
            .unwrap_or(0);
        let pending = self
            .pending_cursors
            .lock()
            .expect("Locking failed")
            .get(&(relay.to_owned(), kind))
            .copied()
            .unwrap_or(0);
        persisted.max(pending)
    }

    async fn min_cursor_since(&self, relay: &str, kinds: &[u16]) -> u64 {
        let mut min = u64::MAX;
        for kind in kinds {
            min = min.min(self.cursor_since(relay, *kind).await);
        }
        if min == u64::MAX {
            0
        } else {
            min
        }
    }

    /// Root notes authored by the owner, for thread participation.
    async fn owner_thread_roots(&self) -> Vec<String> {
        let events = self
            .db
            .query(
                &EventFilter::new()
                    .author(self.config.owner.to_hex())
                    .kind(kinds::TEXT_NOTE)
                    .limit(THREAD_ROOTS_LIMIT),
            )
            .await
            .unwrap_or_default();
        events
            .into_iter()
            .filter(|event| refs::thread_refs(event).is_none())
            .map(|event| event.id.to_hex())
            .collect()
    }
}
