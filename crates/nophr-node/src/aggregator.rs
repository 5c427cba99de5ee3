//! Interaction aggregation.
//!
//! Incremental updates run inside the ingest pipeline; the periodic
//! reconciler recomputes rows from the event store and silently repairs
//! drift, so a missed or double-counted update never sticks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use nostr::Event;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use nophr_config::NoiseFilters;
use nophr_core::{kinds, refs, EventFilter, EventIdKey};
use nophr_db::{AggregateRecord, Database, DbResult, Interaction};

use crate::stats::Stats;

const LOG_TARGET: &str = "nophr::aggregator";

/// Classify a referencing event under the configured noise filters.
///
/// `None` means the event contributes nothing (not a reference, filtered
/// reaction token, dust zap).
pub fn classify(event: &Event, noise: &NoiseFilters) -> Option<(EventIdKey, Interaction)> {
    match event.kind.as_u16() {
        kinds::TEXT_NOTE => {
            let thread = refs::thread_refs(event)?;
            Some((EventIdKey::from(thread.parent), Interaction::Reply))
        }
        kinds::REACTION => {
            let target = refs::reaction_target(event)?;
            let token = refs::reaction_token(event);
            if !noise.allowed_reaction_chars.is_empty()
                && !noise.allowed_reaction_chars.contains(&token)
            {
                return None;
            }
            Some((EventIdKey::from(target), Interaction::Reaction { token }))
        }
        kinds::ZAP_RECEIPT => {
            let zap = refs::zap_receipt(event)?;
            let target = zap.target?;
            if zap.amount_sats < noise.min_zap_sats {
                return None;
            }
            Some((
                EventIdKey::from(target),
                Interaction::Zap {
                    sats: zap.amount_sats,
                },
            ))
        }
        _ => None,
    }
}

/// Incremental aggregate update for one ingested event.
pub async fn apply_reference(
    db: &Database,
    event: &Event,
    noise: &NoiseFilters,
) -> DbResult<bool> {
    let Some((target, interaction)) = classify(event, noise) else {
        return Ok(false);
    };
    db.apply_interaction(
        target,
        EventIdKey::from(event.id),
        event.created_at.as_u64(),
        interaction,
    )
    .await
}

/// Recompute one aggregate row from the event store.
///
/// Returns the canonical row and the referencing ids that produced it.
pub async fn recompute(
    db: &Database,
    target: EventIdKey,
    noise: &NoiseFilters,
) -> DbResult<(AggregateRecord, Vec<EventIdKey>)> {
    let referencing = db
        .query(
            &EventFilter::new()
                .kinds([kinds::TEXT_NOTE, kinds::REACTION, kinds::ZAP_RECEIPT])
                .tag('e', target.to_hex()),
        )
        .await?;

    let mut record = AggregateRecord::default();
    let mut reaction_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut refs_seen = Vec::new();

    for event in &referencing {
        let Some((classified_target, interaction)) = classify(event, noise) else {
            continue;
        };
        if classified_target != target {
            // The e-tag matched but the reference rules point elsewhere
            // (e.g. a root marker in a deep thread).
            continue;
        }
        match interaction {
            Interaction::Reply => record.reply_count += 1,
            Interaction::Reaction { token } => {
                *reaction_counts.entry(token).or_default() += 1;
            }
            Interaction::Zap { sats } => record.zap_sats_total += sats,
        }
        record.last_interaction_at = record.last_interaction_at.max(event.created_at.as_u64());
        refs_seen.push(EventIdKey::from(event.id));
    }
    record.reaction_total = reaction_counts.values().sum();
    record.reaction_counts = reaction_counts;
    Ok((record, refs_seen))
}

/// Periodic aggregate reconciliation task.
pub struct Reconciler {
    db: Arc<Database>,
    stats: Arc<Stats>,
    noise: NoiseFilters,
    interval: Duration,
    batch_size: usize,
    cancel: watch::Receiver<bool>,
    /// Round-robin position in the aggregates table.
    position: Option<EventIdKey>,
}

impl Reconciler {
    pub fn new(
        db: Arc<Database>,
        stats: Arc<Stats>,
        noise: NoiseFilters,
        interval: Duration,
        batch_size: usize,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            stats,
            noise,
            interval,
            batch_size,
            cancel,
            position: None,
        }
    }

    pub async fn run(mut self) {
        info!(
            target: LOG_TARGET,
            interval_secs = self.interval.as_secs(),
            batch = self.batch_size,
            "Reconciler starting"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would race initial sync.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.reconcile_batch().await {
                        warn!(target: LOG_TARGET, %err, "Reconcile batch failed");
                    }
                }
                _ = self.cancel.changed() => {
                    if *self.cancel.borrow() {
                        break;
                    }
                }
            }
        }
        info!(target: LOG_TARGET, "Reconciler stopped");
    }

    pub async fn reconcile_batch(&mut self) -> DbResult<usize> {
        let page = self
            .db
            .aggregates_page(self.position, self.batch_size)
            .await?;
        if page.is_empty() {
            self.position = None;
            return Ok(0);
        }
        self.position = page.last().map(|(target, _)| *target);

        let mut repaired = 0;
        for (target, stored) in page {
            let (canonical, refs_seen) = recompute(&self.db, target, &self.noise).await?;
            if canonical != stored {
                self.stats.count_reconcile_drift();
                debug!(
                    target: LOG_TARGET,
                    %target,
                    stored_replies = stored.reply_count,
                    canonical_replies = canonical.reply_count,
                    stored_reactions = stored.reaction_total,
                    canonical_reactions = canonical.reaction_total,
                    "Aggregate drift repaired"
                );
                self.db
                    .replace_aggregate(target, canonical, refs_seen)
                    .await?;
                repaired += 1;
            }
        }
        Ok(repaired)
    }
}
