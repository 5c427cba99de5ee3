use std::sync::Arc;
use std::time::Duration;

use nostr::{Event, EventBuilder, Keys, Kind, Tag, Timestamp};
use tokio::sync::{mpsc, watch};

use nophr_cache::{Cache as _, MemoryCache};
use nophr_config::{
    Caching, Config, Denylist, Layout, Logging, NoiseFilters, Protocols, Relays, RetentionRule,
    RuleAction, RuleConditions, Scope, ScopeMode, Security, Site, Storage, StorageDriver, Sync,
};
use nophr_core::{kinds, EventFilter, EventIdKey, PubkeyKey};
use nophr_db::Database;
use nophr_relay::{PoolOptions, RelayPool};

use super::*;
use crate::retention::{evaluate, EventContext, RetentionEngine};
use crate::stats::Stats;
use crate::sync::SyncEngine;

fn tag(parts: &[&str]) -> Tag {
    Tag::parse(parts).expect("valid tag")
}

fn signed_at(keys: &Keys, kind: u16, content: &str, created_at: u64, tags: Vec<Tag>) -> Event {
    EventBuilder::new(Kind::from(kind), content, tags)
        .custom_created_at(Timestamp::from(created_at))
        .to_event(keys)
        .expect("signable")
}

fn contact_list(keys: &Keys, created_at: u64, follows: &[&Keys]) -> Event {
    let tags = follows
        .iter()
        .map(|followee| tag(&["p", &followee.public_key().to_hex()]))
        .collect();
    signed_at(keys, kinds::CONTACTS, "", created_at, tags)
}

fn test_config(owner: &Keys) -> Config {
    Config {
        site: Site {
            title: "test".to_owned(),
            description: "test".to_owned(),
            operator: "op".to_owned(),
        },
        owner: owner.public_key(),
        nsec: None,
        protocols: Protocols::default(),
        relays: Relays {
            seeds: vec!["wss://seed.example".to_owned()],
            policy: Default::default(),
        },
        discovery: Default::default(),
        sync: Sync {
            enabled: true,
            kinds: Default::default(),
            scope: Scope {
                mode: ScopeMode::Following,
                include_direct_mentions: true,
                include_threads_of_mine: true,
                max_authors: 1_000,
                allowlist_pubkeys: Vec::new(),
                denylist_pubkeys: Vec::new(),
            },
            cursor_flush_seconds: 5,
            retention: Default::default(),
        },
        inbox: Default::default(),
        storage: Storage {
            driver: StorageDriver::Sqlite,
            data_dir: std::path::PathBuf::from("."),
            lmdb_max_size_mb: 64,
        },
        rendering: Default::default(),
        caching: Caching {
            enabled: true,
            engine: nophr_config::CacheEngine::Memory,
            redis_url: None,
            max_size_mb: 16,
            default_ttl_seconds: 300,
            cleanup_interval_seconds: 0,
            ttl: Default::default(),
            aggregates: Default::default(),
        },
        security: Security {
            denylist: Denylist {
                enabled: false,
                pubkeys: Vec::new(),
            },
            content_filter: Default::default(),
            ratelimit: Default::default(),
            validation: Default::default(),
        },
        layout: Layout {
            sections: Default::default(),
        },
        logging: Logging {
            level: "info".to_owned(),
        },
    }
}

struct Harness {
    db: Arc<Database>,
    cache: Arc<MemoryCache>,
    engine: Arc<SyncEngine>,
    _cancel_tx: watch::Sender<bool>,
}

async fn harness(config: Config) -> Harness {
    let db = Arc::new(Database::new_in_memory().await.expect("db"));
    let cache = Arc::new(MemoryCache::new(4 * 1024 * 1024));
    let config = Arc::new(config);
    let stats = Arc::new(Stats::default());
    let pool = Arc::new(RelayPool::new(PoolOptions::default()));
    let retention = Arc::new(RetentionEngine::new(
        db.clone(),
        stats.clone(),
        config.sync.retention.clone(),
        config.owner,
    ));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (ingest_tx, _ingest_rx) = mpsc::channel(64);
    let (discovery_tx, _discovery_rx) = mpsc::channel(64);
    let (graph_tx, _graph_rx) = mpsc::channel(1);
    let engine = Arc::new(SyncEngine::new(
        db.clone(),
        cache.clone(),
        pool,
        config,
        stats,
        retention,
        nophr_relay::DiscoveryOptions {
            seeds: vec!["wss://seed.example".to_owned()],
            refresh_interval: Duration::from_secs(900),
            use_owner_hints: true,
            use_author_hints: true,
            fallback_to_seeds: true,
            max_relays_per_author: 4,
        },
        ingest_tx,
        discovery_tx,
        graph_tx,
        cancel_rx,
    ));
    Harness {
        db,
        cache,
        engine,
        _cancel_tx: cancel_tx,
    }
}

// -- graph (spec property 6) ------------------------------------------------

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn graph_following_mode() {
    let owner = Keys::generate();
    let alice = Keys::generate();
    let bob = Keys::generate();
    let db = Database::new_in_memory().await.unwrap();

    db.store_event(&contact_list(&owner, 100, &[&alice, &bob]))
        .await
        .unwrap();

    let mut scope = test_config(&owner).sync.scope;
    scope.mode = ScopeMode::Following;
    let rows = graph::recompute(&db, &owner.public_key(), &scope)
        .await
        .unwrap();

    assert_eq!(rows.len(), 3);
    let depth_of = |keys: &Keys| {
        rows.iter()
            .find(|(member, _)| *member == PubkeyKey::from(keys.public_key()))
            .map(|(_, record)| record.depth)
    };
    assert_eq!(depth_of(&owner), Some(0));
    assert_eq!(depth_of(&alice), Some(1));
    assert_eq!(depth_of(&bob), Some(1));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn graph_mutual_mode_requires_both_edges() {
    let owner = Keys::generate();
    let alice = Keys::generate();
    let bob = Keys::generate();
    let db = Database::new_in_memory().await.unwrap();

    db.store_event(&contact_list(&owner, 100, &[&alice, &bob]))
        .await
        .unwrap();
    // Alice follows back; Bob does not.
    db.store_event(&contact_list(&alice, 100, &[&owner]))
        .await
        .unwrap();
    db.store_event(&contact_list(&bob, 100, &[&alice]))
        .await
        .unwrap();

    let mut scope = test_config(&owner).sync.scope;
    scope.mode = ScopeMode::Mutual;
    let rows = graph::recompute(&db, &owner.public_key(), &scope)
        .await
        .unwrap();

    let members: Vec<PubkeyKey> = rows.iter().map(|(member, _)| *member).collect();
    assert!(members.contains(&PubkeyKey::from(owner.public_key())));
    assert!(members.contains(&PubkeyKey::from(alice.public_key())));
    assert!(!members.contains(&PubkeyKey::from(bob.public_key())));
    let alice_row = rows
        .iter()
        .find(|(member, _)| *member == PubkeyKey::from(alice.public_key()))
        .unwrap();
    assert!(alice_row.1.mutual);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn graph_foaf_reaches_two_hops_and_respects_cap() {
    let owner = Keys::generate();
    let alice = Keys::generate();
    let carol = Keys::generate();
    let db = Database::new_in_memory().await.unwrap();

    db.store_event(&contact_list(&owner, 100, &[&alice]))
        .await
        .unwrap();
    db.store_event(&contact_list(&alice, 100, &[&carol]))
        .await
        .unwrap();

    let mut scope = test_config(&owner).sync.scope;
    scope.mode = ScopeMode::Foaf { depth: 2 };
    let rows = graph::recompute(&db, &owner.public_key(), &scope)
        .await
        .unwrap();
    let depth_of = |keys: &Keys| {
        rows.iter()
            .find(|(member, _)| *member == PubkeyKey::from(keys.public_key()))
            .map(|(_, record)| record.depth)
    };
    assert_eq!(depth_of(&carol), Some(2));

    // Cap of one author: deterministic truncation keeps the BFS level 1
    // entry and drops the rest.
    scope.max_authors = 1;
    let rows = graph::recompute(&db, &owner.public_key(), &scope)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2); // owner + alice
    assert_eq!(
        rows.iter()
            .find(|(member, _)| *member == PubkeyKey::from(alice.public_key()))
            .map(|(_, record)| record.depth),
        Some(1)
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn graph_denylist_wins_over_allowlist() {
    let owner = Keys::generate();
    let alice = Keys::generate();
    let extra = Keys::generate();
    let db = Database::new_in_memory().await.unwrap();

    db.store_event(&contact_list(&owner, 100, &[&alice]))
        .await
        .unwrap();

    let mut scope = test_config(&owner).sync.scope;
    scope.allowlist_pubkeys = vec![extra.public_key()];
    scope.denylist_pubkeys = vec![alice.public_key(), extra.public_key()];
    let rows = graph::recompute(&db, &owner.public_key(), &scope)
        .await
        .unwrap();
    let members: Vec<PubkeyKey> = rows.iter().map(|(member, _)| *member).collect();
    assert_eq!(members, vec![PubkeyKey::from(owner.public_key())]);
}

// -- ingest pipeline (spec S2, S3, S4, properties 2, 5, 7) -------------------

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn reply_aggregation_is_idempotent() {
    let owner = Keys::generate();
    let alice = Keys::generate();
    let h = harness(test_config(&owner)).await;

    let note = signed_at(&owner, 1, "hello", 100, vec![]);
    h.engine.process_item("wss://r1", note.clone()).await;

    let reply = signed_at(
        &alice,
        1,
        "hi back",
        150,
        vec![tag(&["e", &note.id.to_hex(), "", "reply"])],
    );
    h.engine.process_item("wss://r1", reply.clone()).await;

    let aggregate = h
        .db
        .aggregate(EventIdKey::from(note.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregate.reply_count, 1);
    assert_eq!(aggregate.last_interaction_at, 150);

    // Relays replay; nothing may change.
    h.engine.process_item("wss://r2", reply).await;
    let aggregate = h
        .db
        .aggregate(EventIdKey::from(note.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregate.reply_count, 1);
    assert_eq!(h.db.event_count().await.unwrap(), 2);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn reaction_histogram_with_noise_filter() {
    let owner = Keys::generate();
    let h = harness(test_config(&owner)).await;

    let note = signed_at(&owner, 1, "hello", 100, vec![]);
    h.engine.process_item("wss://r1", note.clone()).await;

    for (i, token) in ["+", "+", "🔥"].iter().enumerate() {
        let reactor = Keys::generate();
        let reaction = signed_at(
            &reactor,
            7,
            token,
            110 + i as u64,
            vec![tag(&["e", &note.id.to_hex()])],
        );
        h.engine.process_item("wss://r1", reaction).await;
    }

    let aggregate = h
        .db
        .aggregate(EventIdKey::from(note.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregate.reaction_total, 3);
    assert_eq!(aggregate.reaction_counts.get("+"), Some(&2));
    assert_eq!(aggregate.reaction_counts.get("🔥"), Some(&1));
    assert!(aggregate.is_consistent());

    // Restricted tokens: only "+" counts.
    let mut config = test_config(&owner);
    config.inbox.noise_filters = NoiseFilters {
        min_zap_sats: 0,
        allowed_reaction_chars: vec!["+".to_owned()],
    };
    let h2 = harness(config).await;
    h2.engine.process_item("wss://r1", note.clone()).await;
    for token in ["+", "+", "🔥"] {
        let reactor = Keys::generate();
        let reaction = signed_at(
            &reactor,
            7,
            token,
            120,
            vec![tag(&["e", &note.id.to_hex()])],
        );
        h2.engine.process_item("wss://r1", reaction).await;
    }
    let aggregate = h2
        .db
        .aggregate(EventIdKey::from(note.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregate.reaction_total, 2);
    assert_eq!(aggregate.reaction_counts.get("🔥"), None);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn zap_receipts_add_sats_with_minimum() {
    let owner = Keys::generate();
    let mut config = test_config(&owner);
    config.inbox.noise_filters.min_zap_sats = 10;
    let h = harness(config).await;

    let note = signed_at(&owner, 1, "hello", 100, vec![]);
    h.engine.process_item("wss://r1", note.clone()).await;

    // 21 sats: counted. 1 sat: dust, dropped.
    let zapper = Keys::generate();
    let zap_big = signed_at(
        &zapper,
        9735,
        "",
        130,
        vec![
            tag(&["e", &note.id.to_hex()]),
            tag(&["bolt11", "lnbc210n1pabcdef"]),
        ],
    );
    let zap_dust = signed_at(
        &zapper,
        9735,
        "",
        140,
        vec![
            tag(&["e", &note.id.to_hex()]),
            tag(&["bolt11", "lnbc10n1pabcdef"]),
        ],
    );
    h.engine.process_item("wss://r1", zap_big).await;
    h.engine.process_item("wss://r1", zap_dust).await;

    let aggregate = h
        .db
        .aggregate(EventIdKey::from(note.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregate.zap_sats_total, 21);
    assert_eq!(aggregate.last_interaction_at, 130);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn cursors_advance_and_never_regress() {
    let owner = Keys::generate();
    let h = harness(test_config(&owner)).await;

    let newer = signed_at(&owner, 1, "new", 200, vec![]);
    h.engine.process_item("wss://r1", newer).await;
    h.engine.flush_cursors().await.unwrap();
    assert_eq!(h.db.cursor("wss://r1", 1).await.unwrap().unwrap().since, 200);

    // A replayed older event is accepted but the cursor stays.
    let older = signed_at(&owner, 1, "old", 100, vec![]);
    h.engine.process_item("wss://r1", older).await;
    h.engine.flush_cursors().await.unwrap();
    assert_eq!(h.db.cursor("wss://r1", 1).await.unwrap().unwrap().since, 200);
    assert_eq!(h.db.event_count().await.unwrap(), 2);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn denylisted_authors_are_dropped() {
    let owner = Keys::generate();
    let spammer = Keys::generate();
    let mut config = test_config(&owner);
    config.security.denylist = Denylist {
        enabled: true,
        pubkeys: vec![spammer.public_key()],
    };
    let h = harness(config).await;

    h.engine
        .process_item("wss://r1", signed_at(&spammer, 1, "spam", 100, vec![]))
        .await;
    assert_eq!(h.db.event_count().await.unwrap(), 0);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn banned_content_is_dropped() {
    let owner = Keys::generate();
    let mut config = test_config(&owner);
    config.security.content_filter.enabled = true;
    config.security.content_filter.banned_words = vec!["Casino".to_owned()];
    let h = harness(config).await;

    h.engine
        .process_item(
            "wss://r1",
            signed_at(&owner, 1, "visit my CASINO now", 100, vec![]),
        )
        .await;
    h.engine
        .process_item("wss://r1", signed_at(&owner, 1, "innocent note", 101, vec![]))
        .await;
    assert_eq!(h.db.event_count().await.unwrap(), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn replaceable_ingest_invalidates_profile_cache() {
    let owner = Keys::generate();
    let h = harness(test_config(&owner)).await;
    let pubkey = owner.public_key().to_hex();

    let ttl = Duration::from_secs(60);
    h.cache
        .set(&format!("kind0:{pubkey}"), b"cached".to_vec(), ttl)
        .await;
    h.cache
        .set(&format!("profile:{pubkey}:gopher"), b"cached".to_vec(), ttl)
        .await;

    let profile_v1 = signed_at(&owner, 0, r#"{"name":"old"}"#, 1000, vec![]);
    let profile_v2 = signed_at(&owner, 0, r#"{"name":"new"}"#, 1001, vec![]);
    h.engine.process_item("wss://r1", profile_v1).await;
    h.engine.process_item("wss://r1", profile_v2).await;

    assert!(h.cache.get(&format!("kind0:{pubkey}")).await.is_none());
    assert!(h
        .cache
        .get(&format!("profile:{pubkey}:gopher"))
        .await
        .is_none());

    let profiles = h
        .db
        .query(&EventFilter::new().author(&pubkey).kind(0))
        .await
        .unwrap();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].created_at.as_u64(), 1001);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn relay_list_ingest_writes_hints() {
    let owner = Keys::generate();
    let h = harness(test_config(&owner)).await;

    let relay_list = signed_at(
        &owner,
        10002,
        "",
        500,
        vec![
            tag(&["r", "wss://r2.example", "read"]),
            tag(&["r", "wss://w.example", "write"]),
        ],
    );
    h.engine.process_item("wss://seed.example", relay_list).await;

    let hints = h
        .db
        .relay_hints_for(PubkeyKey::from(owner.public_key()))
        .await
        .unwrap();
    assert_eq!(hints.len(), 2);
    let read_hint = hints
        .iter()
        .find(|(url, _)| url == "wss://r2.example")
        .unwrap();
    assert!(read_hint.1.can_read);
    assert!(!read_hint.1.can_write);
    assert_eq!(read_hint.1.freshness, 500);
}

// -- reconciler (spec property 4) --------------------------------------------

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn reconciler_repairs_drift() {
    let owner = Keys::generate();
    let alice = Keys::generate();
    let h = harness(test_config(&owner)).await;

    let note = signed_at(&owner, 1, "hello", 100, vec![]);
    h.engine.process_item("wss://r1", note.clone()).await;
    let reply = signed_at(
        &alice,
        1,
        "re",
        150,
        vec![tag(&["e", &note.id.to_hex(), "", "reply"])],
    );
    h.engine.process_item("wss://r1", reply).await;

    // Inject drift: a phantom reply that is not in the event store.
    let target = EventIdKey::from(note.id);
    h.db.apply_interaction(
        target,
        EventIdKey([0xAA; 32]),
        160,
        nophr_db::Interaction::Reply,
    )
    .await
    .unwrap();
    assert_eq!(h.db.aggregate(target).await.unwrap().unwrap().reply_count, 2);

    let stats = Arc::new(Stats::default());
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let mut reconciler = aggregator::Reconciler::new(
        h.db.clone(),
        stats.clone(),
        NoiseFilters::default(),
        Duration::from_secs(900),
        64,
        cancel_rx,
    );
    let repaired = reconciler.reconcile_batch().await.unwrap();
    assert!(repaired >= 1);
    assert_eq!(stats.reconcile_drift_total(), 1);

    let aggregate = h.db.aggregate(target).await.unwrap().unwrap();
    assert_eq!(aggregate.reply_count, 1);
    assert_eq!(aggregate.last_interaction_at, 150);
    assert!(aggregate.is_consistent());

    // A clean second pass finds nothing to repair.
    let mut reconciler = aggregator::Reconciler::new(
        h.db.clone(),
        stats,
        NoiseFilters::default(),
        Duration::from_secs(900),
        64,
        watch::channel(false).1,
    );
    assert_eq!(reconciler.reconcile_batch().await.unwrap(), 0);
}

// -- retention ----------------------------------------------------------------

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn simple_retention_prunes_by_age_with_exemptions() {
    let owner = Keys::generate();
    let mut config = test_config(&owner);
    config.sync.retention.keep_days = 1;
    let h = harness(config.clone()).await;

    let now = nophr_core::unix_now();
    let stale_note = signed_at(&owner, 1, "old note", now - 3 * 86_400, vec![]);
    let fresh_note = signed_at(&owner, 1, "fresh note", now - 3_600, vec![]);
    let old_profile = signed_at(&owner, 0, "{}", now - 30 * 86_400, vec![]);
    for event in [&stale_note, &fresh_note, &old_profile] {
        h.engine.process_item("wss://r1", (*event).clone()).await;
    }

    let stats = Arc::new(Stats::default());
    let retention = RetentionEngine::new(
        h.db.clone(),
        stats,
        config.sync.retention.clone(),
        owner.public_key(),
    );
    let deleted = retention.run_once().await.unwrap();
    assert_eq!(deleted, 1);

    let remaining = h.db.query(&EventFilter::new()).await.unwrap();
    let ids: Vec<_> = remaining.iter().map(|event| event.id).collect();
    assert!(!ids.contains(&stale_note.id));
    assert!(ids.contains(&fresh_note.id));
    // Replaceable kinds are never pruned by age.
    assert!(ids.contains(&old_profile.id));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn advanced_rules_match_in_priority_order() {
    let owner = Keys::generate();
    let alice = Keys::generate();
    let now = nophr_core::unix_now();

    let mut config = test_config(&owner).sync.retention;
    config.advanced = Some(nophr_config::AdvancedRetention {
        enabled: true,
        rules: vec![
            RetentionRule {
                name: "own-forever".to_owned(),
                priority: 100,
                conditions: RuleConditions {
                    author_is_owner: Some(true),
                    ..Default::default()
                },
                action: RuleAction {
                    retain: true,
                    retain_days: None,
                },
            },
            RetentionRule {
                name: "everything-else".to_owned(),
                priority: 0,
                conditions: RuleConditions {
                    all: Some(true),
                    ..Default::default()
                },
                action: RuleAction {
                    retain: true,
                    retain_days: Some(7),
                },
            },
        ],
        max_total_events: None,
        max_storage_mb: None,
        max_events_per_kind: None,
    });

    let own_note = signed_at(&owner, 1, "mine", now - 100 * 86_400, vec![]);
    let other_note = signed_at(&alice, 1, "theirs", now - 100 * 86_400, vec![]);

    let own_record = evaluate(
        &config,
        &owner.public_key(),
        &own_note,
        &EventContext::default(),
        now,
    );
    assert_eq!(own_record.rule_name, "own-forever");
    assert!(own_record.protected);

    let other_record = evaluate(
        &config,
        &owner.public_key(),
        &other_note,
        &EventContext::default(),
        now,
    );
    assert_eq!(other_record.rule_name, "everything-else");
    assert!(!other_record.protected);
    assert!(other_record.retain_until.is_some_and(|until| until <= now));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn retention_score_is_stable_for_equal_inputs() {
    let ctx = EventContext {
        social_distance: Some(1),
        reply_count: 3,
        reaction_total: 5,
        zap_sats_total: 2_000,
    };
    let now = 1_000_000_000;
    assert_eq!(
        retention::score(now - 86_400, now, &ctx),
        retention::score(now - 86_400, now, &ctx)
    );
    // More interactions never lower the score.
    let quieter = EventContext {
        reply_count: 0,
        ..ctx
    };
    assert!(retention::score(now - 86_400, now, &quieter) <= retention::score(now - 86_400, now, &ctx));
}
