//! Retention: age-based pruning or the rule engine, plus global caps.
//!
//! Events are evaluated once at ingest (so every event carries a
//! retention record) and re-evaluated on a schedule. Deletion cascades
//! through [`Database::delete_event`]; dangling auxiliary rows from
//! out-of-band deletions are swept during the periodic run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use nostr::{Event, PublicKey};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use nophr_config::{Retention as RetentionConfig, RetentionRule};
use nophr_core::{kinds, refs, unix_now, EventFilter, EventIdKey, PubkeyKey};
use nophr_db::{AggregateRecord, Database, DbResult, RetentionRecord};

use crate::stats::Stats;

const LOG_TARGET: &str = "nophr::retention";

const SWEEP_PAGE: usize = 512;
const PRUNE_BATCH: usize = 1_000;

/// Inputs the rule engine needs besides the event itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventContext {
    pub social_distance: Option<u16>,
    pub reply_count: u64,
    pub reaction_total: u64,
    pub zap_sats_total: u64,
}

impl EventContext {
    fn interactions(&self) -> u64 {
        self.reply_count + self.reaction_total + u64::from(self.zap_sats_total != 0)
    }
}

/// Stable deletion order under caps: ascending score, then age, then id.
pub fn score(event_created_at: u64, now: u64, ctx: &EventContext) -> i64 {
    let age_days = now.saturating_sub(event_created_at) / 86_400;
    let interaction_weight = (2 * ctx.reply_count
        + ctx.reaction_total
        + ctx.zap_sats_total / 1_000)
        .min(100) as i64;
    let distance_weight = match ctx.social_distance {
        Some(depth) => (50i64 - 10 * i64::from(depth)).max(0),
        None => 0,
    };
    interaction_weight + distance_weight - age_days as i64
}

fn rule_matches(
    rule: &RetentionRule,
    event: &Event,
    ctx: &EventContext,
    owner: &PublicKey,
    now: u64,
) -> bool {
    let conditions = &rule.conditions;
    if let Some(author_is_owner) = conditions.author_is_owner {
        if (event.pubkey == *owner) != author_is_owner {
            return false;
        }
    }
    if let Some(max) = conditions.social_distance_max {
        match ctx.social_distance {
            Some(depth) if depth <= max => {}
            _ => return false,
        }
    }
    if let Some(rule_kinds) = &conditions.kinds {
        if !rule_kinds.contains(&event.kind.as_u16()) {
            return false;
        }
    }
    if let Some(min) = conditions.min_interactions {
        if ctx.interactions() < min {
            return false;
        }
    }
    if let Some(max_days) = conditions.age_days_max {
        let age_days = now.saturating_sub(event.created_at.as_u64()) / 86_400;
        if max_days < age_days {
            return false;
        }
    }
    if let Some(min_len) = conditions.content_length_min {
        if event.content.len() < min_len {
            return false;
        }
    }
    if let Some(is_root) = conditions.is_thread_root {
        let root = event.kind.as_u16() == kinds::TEXT_NOTE && refs::thread_refs(event).is_none();
        if root != is_root {
            return false;
        }
    }
    if let Some(has_replies) = conditions.has_replies {
        if (ctx.reply_count > 0) != has_replies {
            return false;
        }
    }
    if let Some(all) = conditions.all {
        if !all {
            return false;
        }
    }
    true
}

/// Evaluate an event against the configured retention policy.
pub fn evaluate(
    config: &RetentionConfig,
    owner: &PublicKey,
    event: &Event,
    ctx: &EventContext,
    now: u64,
) -> RetentionRecord {
    let event_score = score(event.created_at.as_u64(), now, ctx);
    let kind = event.kind.as_u16();
    let age_exempt = kinds::is_age_exempt(kind) || kinds::is_param_replaceable(kind);

    let advanced = config
        .advanced
        .as_ref()
        .filter(|advanced| advanced.enabled);
    if let Some(advanced) = advanced {
        let mut rules: Vec<&RetentionRule> = advanced.rules.iter().collect();
        rules.sort_by_key(|rule| std::cmp::Reverse(rule.priority));
        for rule in rules {
            if !rule_matches(rule, event, ctx, owner, now) {
                continue;
            }
            let (retain_until, protected) = if !rule.action.retain {
                (Some(now), false)
            } else {
                match rule.action.retain_days {
                    Some(days) => (
                        Some(event.created_at.as_u64() + days * 86_400),
                        age_exempt,
                    ),
                    None => (None, true),
                }
            };
            return RetentionRecord {
                rule_name: rule.name.clone(),
                rule_priority: rule.priority,
                retain_until,
                last_evaluated_at: now,
                score: event_score,
                protected,
            };
        }
        // No rule matched; keep by default.
        return RetentionRecord {
            rule_name: "default".to_owned(),
            rule_priority: i64::MIN,
            retain_until: None,
            last_evaluated_at: now,
            score: event_score,
            protected: age_exempt,
        };
    }

    // Simple mode: age-based with the replaceable exemptions.
    let retain_until = if age_exempt {
        None
    } else {
        Some(event.created_at.as_u64() + config.keep_days * 86_400)
    };
    RetentionRecord {
        rule_name: "keep-days".to_owned(),
        rule_priority: 0,
        retain_until,
        last_evaluated_at: now,
        score: event_score,
        protected: age_exempt,
    }
}

pub struct RetentionEngine {
    db: Arc<Database>,
    stats: Arc<Stats>,
    config: RetentionConfig,
    owner: PublicKey,
}

impl RetentionEngine {
    pub fn new(
        db: Arc<Database>,
        stats: Arc<Stats>,
        config: RetentionConfig,
        owner: PublicKey,
    ) -> Self {
        Self {
            db,
            stats,
            config,
            owner,
        }
    }

    /// Record retention metadata for a freshly ingested event.
    pub async fn on_ingest(&self, event: &Event) -> DbResult<()> {
        let ctx = self.context_for(event).await;
        let record = evaluate(&self.config, &self.owner, event, &ctx, unix_now());
        self.db
            .upsert_retention(EventIdKey::from(event.id), record)
            .await
    }

    async fn context_for(&self, event: &Event) -> EventContext {
        let aggregate = self
            .db
            .aggregate(EventIdKey::from(event.id))
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        let social_distance = self
            .db
            .social_distance(PubkeyKey::from(self.owner), PubkeyKey::from(event.pubkey))
            .await
            .ok()
            .flatten();
        EventContext {
            social_distance,
            reply_count: aggregate.reply_count,
            reaction_total: aggregate.reaction_total,
            zap_sats_total: aggregate.zap_sats_total,
        }
    }

    pub async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        info!(
            target: LOG_TARGET,
            interval_secs = self.config.reevaluate_interval_seconds,
            advanced = self.config.advanced.as_ref().is_some_and(|advanced| advanced.enabled),
            "Retention task starting"
        );
        if self.config.prune_on_start {
            if let Err(err) = self.run_once().await {
                warn!(target: LOG_TARGET, %err, "Startup prune failed");
            }
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.config.reevaluate_interval_seconds.max(60),
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        warn!(target: LOG_TARGET, %err, "Retention run failed");
                    }
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
            }
        }
        info!(target: LOG_TARGET, "Retention task stopped");
    }

    /// One full pass: re-evaluate, delete expired, enforce caps, sweep
    /// dangling rows.
    pub async fn run_once(&self) -> DbResult<u64> {
        let now = unix_now();
        let mut deleted = 0u64;
        let mut position: Option<EventIdKey> = None;

        loop {
            let page = self.db.retention_page(position, SWEEP_PAGE).await?;
            if page.is_empty() {
                break;
            }
            position = page.last().map(|(id, _)| *id);

            for (id, record) in page {
                let events = self
                    .db
                    .query(&EventFilter::new().id(id.to_hex()).limit(1))
                    .await?;
                let Some(event) = events.into_iter().next() else {
                    // Dangling row from an out-of-band delete.
                    self.db.remove_retention(id).await?;
                    self.db.remove_aggregate(id).await?;
                    continue;
                };

                let ctx = self.context_for(&event).await;
                let fresh = evaluate(&self.config, &self.owner, &event, &ctx, now);
                let expired =
                    !fresh.protected && fresh.retain_until.is_some_and(|until| until <= now);
                if expired {
                    debug!(target: LOG_TARGET, event_id = %id, rule = %fresh.rule_name, "Pruning expired event");
                    self.db.delete_event(id).await?;
                    self.stats.count_retention_deleted();
                    deleted += 1;
                } else {
                    self.db.upsert_retention(id, fresh).await?;
                }
            }
        }

        // Simple-mode events ingested before retention existed may lack
        // records; prune them straight from the store by age.
        deleted += self.prune_unrecorded(now).await?;

        deleted += self.enforce_caps().await?;
        if deleted > 0 {
            info!(target: LOG_TARGET, deleted, "Retention pass complete");
        }
        Ok(deleted)
    }

    async fn prune_unrecorded(&self, now: u64) -> DbResult<u64> {
        let advanced = self
            .config
            .advanced
            .as_ref()
            .is_some_and(|advanced| advanced.enabled);
        if advanced {
            return Ok(0);
        }
        let cutoff = now.saturating_sub(self.config.keep_days * 86_400);
        if cutoff == 0 {
            return Ok(0);
        }
        let old = self
            .db
            .query(&EventFilter::new().until(cutoff).limit(PRUNE_BATCH))
            .await?;
        let mut deleted = 0;
        for event in old {
            let kind = event.kind.as_u16();
            if kinds::is_age_exempt(kind) || kinds::is_param_replaceable(kind) {
                continue;
            }
            if let Some(record) = self.db.retention(EventIdKey::from(event.id)).await? {
                if record.protected {
                    continue;
                }
            }
            self.db.delete_event(EventIdKey::from(event.id)).await?;
            self.stats.count_retention_deleted();
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Delete lowest-score events while any global cap is exceeded.
    async fn enforce_caps(&self) -> DbResult<u64> {
        let Some(advanced) = self
            .config
            .advanced
            .as_ref()
            .filter(|advanced| advanced.enabled)
        else {
            return Ok(0);
        };

        let mut deleted = 0u64;

        let over_total = |count: u64| advanced.max_total_events.is_some_and(|max| max < count);
        let over_storage = |bytes: u64| {
            advanced
                .max_storage_mb
                .is_some_and(|max| max * 1024 * 1024 < bytes)
        };

        let mut count = self.db.event_count().await?;
        let mut bytes = self.db.store_size_bytes().await?;
        let per_kind_excess: BTreeMap<u16, u64> = match advanced.max_events_per_kind {
            Some(max) => self
                .db
                .event_counts_by_kind()
                .await?
                .into_iter()
                .filter_map(|(kind, kind_count)| {
                    (max < kind_count).then_some((kind, kind_count - max))
                })
                .collect(),
            None => BTreeMap::new(),
        };

        if !over_total(count) && !over_storage(bytes) && per_kind_excess.is_empty() {
            return Ok(0);
        }

        // Candidates in ascending score order, protected rows skipped;
        // ties break on id so equal inputs delete in a stable order.
        let mut candidates: Vec<(i64, EventIdKey, u16)> = Vec::new();
        let mut position: Option<EventIdKey> = None;
        loop {
            let page = self.db.retention_page(position, SWEEP_PAGE).await?;
            if page.is_empty() {
                break;
            }
            position = page.last().map(|(id, _)| *id);
            for (id, record) in page {
                if record.protected {
                    continue;
                }
                let kind = self
                    .db
                    .query(&EventFilter::new().id(id.to_hex()).limit(1))
                    .await?
                    .first()
                    .map(|event| event.kind.as_u16());
                if let Some(kind) = kind {
                    candidates.push((record.score, id, kind));
                }
            }
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let mut per_kind_excess = per_kind_excess;
        for (_score, id, kind) in candidates {
            let kind_over = per_kind_excess.get(&kind).copied().unwrap_or(0) > 0;
            if !over_total(count) && !over_storage(bytes) && !kind_over {
                if per_kind_excess.values().all(|excess| *excess == 0) {
                    break;
                }
                continue;
            }
            if self.db.delete_event(id).await? {
                self.stats.count_retention_deleted();
                deleted += 1;
                count = count.saturating_sub(1);
                bytes = self.db.store_size_bytes().await?;
                if let Some(excess) = per_kind_excess.get_mut(&kind) {
                    *excess = excess.saturating_sub(1);
                }
            }
        }

        Ok(deleted)
    }
}
