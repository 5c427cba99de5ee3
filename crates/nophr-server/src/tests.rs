use std::sync::Arc;

use nostr::{Event, EventBuilder, Keys, Kind, Tag, Timestamp};

use nophr_cache::MemoryCache;
use nophr_config::{
    Caching, Config, Denylist, Layout, Logging, Protocols, Relays, Scope, ScopeMode, Section,
    Security, Site, Storage, StorageDriver, Sync,
};
use nophr_db::Database;
use nophr_node::Node;

use super::handlers::{respond_finger, respond_gemini, respond_gopher};
use super::*;

fn signed_at(keys: &Keys, kind: u16, content: &str, created_at: u64, tags: Vec<Tag>) -> Event {
    EventBuilder::new(Kind::from(kind), content, tags)
        .custom_created_at(Timestamp::from(created_at))
        .to_event(keys)
        .expect("signable")
}

fn test_config(owner: &Keys) -> Config {
    let mut sections = std::collections::BTreeMap::new();
    sections.insert(
        "notes".to_owned(),
        Section {
            title: "Notes".to_owned(),
            description: "Short notes".to_owned(),
            order: 1,
            limit: 10,
            filters: nophr_config::SectionFilters {
                kinds: vec![1],
                ..Default::default()
            },
            ..Default::default()
        },
    );
    Config {
        site: Site {
            title: "test gateway".to_owned(),
            description: "a test".to_owned(),
            operator: "op@example.org".to_owned(),
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
            // Keep the network stack quiet in tests.
            enabled: false,
            kinds: Default::default(),
            scope: Scope {
                mode: ScopeMode::Following,
                include_direct_mentions: true,
                include_threads_of_mine: true,
                max_authors: 100,
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
        layout: Layout { sections },
        logging: Logging {
            level: "info".to_owned(),
        },
    }
}

async fn state_with_events(owner: &Keys, events: &[Event]) -> SharedState {
    let config = Arc::new(test_config(owner));
    let db = Arc::new(Database::new_in_memory().await.expect("db"));
    for event in events {
        db.store_event(event).await.expect("stores");
    }
    let cache = Arc::new(MemoryCache::new(4 * 1024 * 1024));
    let node = Node::start(config.clone(), db, cache).await;
    AppState::new(node, config)
}

fn assert_valid_gophermap(response: &str) {
    assert!(response.ends_with(".\r\n"), "missing terminator: {response:?}");
    for line in response.split("\r\n") {
        if line.is_empty() || line == "." {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(fields.len(), 4, "line {line:?} must have four fields");
    }
}

fn status_line(response: &[u8]) -> String {
    let text = String::from_utf8_lossy(response);
    let (header, _) = text
        .split_once("\r\n")
        .expect("response must contain CRLF header");
    header.to_owned()
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn gopher_root_is_a_valid_gophermap() {
    let owner = Keys::generate();
    let state = state_with_events(&owner, &[]).await;

    let response = respond_gopher(&state, "/").await;
    let text = String::from_utf8(response).unwrap();
    assert_valid_gophermap(&text);
    assert!(text.contains("test gateway"));
    assert!(text.contains("\t/notes\t"));
    assert!(text.contains("\t/diagnostics\t"));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn gopher_unknown_selector_is_an_error_menu() {
    let owner = Keys::generate();
    let state = state_with_events(&owner, &[]).await;

    let response = respond_gopher(&state, "/does/not/exist").await;
    let text = String::from_utf8(response).unwrap();
    assert_valid_gophermap(&text);
    let first = text.split("\r\n").next().unwrap();
    assert!(first.starts_with('3'), "first line must be an error: {first:?}");
    // Link back to the root.
    assert!(text.contains("\t/\t"));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn gopher_serves_notes_and_single_events() {
    let owner = Keys::generate();
    let note = signed_at(&owner, 1, "hello gopherspace", 1_700_000_000, vec![]);
    let state = state_with_events(&owner, std::slice::from_ref(&note)).await;

    let listing = String::from_utf8(respond_gopher(&state, "/notes").await).unwrap();
    assert_valid_gophermap(&listing);
    assert!(listing.contains("hello gopherspace"));
    assert!(listing.contains(&format!("/event/{}", note.id.to_hex())));

    let doc = String::from_utf8(
        respond_gopher(&state, &format!("/event/{}", note.id.to_hex())).await,
    )
    .unwrap();
    assert!(doc.contains("hello gopherspace"));
    assert!(doc.ends_with(".\r\n"));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn gemini_status_lines_are_well_formed() {
    let owner = Keys::generate();
    let state = state_with_events(&owner, &[]).await;

    for (path, expected) in [
        ("/", "20 "),
        ("/notes", "20 "),
        ("/diagnostics", "20 "),
        ("/no/such/path", "51 "),
    ] {
        let response = respond_gemini(&state, path, None).await;
        let header = status_line(&response);
        assert!(
            header.starts_with(expected),
            "{path}: unexpected header {header:?}"
        );
        let code = &header[..2];
        assert!(code.chars().all(|c| c.is_ascii_digit()));
        assert!(("10".."70").contains(&code));
    }

    let ok = respond_gemini(&state, "/", None).await;
    assert_eq!(status_line(&ok), "20 text/gemini; charset=utf-8");
    let body = String::from_utf8(ok).unwrap();
    let body = body.split_once("\r\n").unwrap().1;
    assert!(body.starts_with("# test gateway"));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn gemini_redirects_legacy_outbox() {
    let owner = Keys::generate();
    let state = state_with_events(&owner, &[]).await;
    let response = respond_gemini(&state, "/outbox", None).await;
    assert_eq!(status_line(&response), "31 /notes");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn gemini_rejects_traversal_in_strict_mode() {
    let owner = Keys::generate();
    let state = state_with_events(&owner, &[]).await;
    let response = respond_gemini(&state, "/../secret", None).await;
    assert!(status_line(&response).starts_with("59 "));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn finger_serves_the_owner_plan() {
    let owner = Keys::generate();
    let profile = signed_at(
        &owner,
        0,
        r#"{"name":"operator","about":"runs this gateway"}"#,
        1_700_000_000,
        vec![],
    );
    let note = signed_at(&owner, 1, "fresh note", 1_700_000_100, vec![]);
    let state = state_with_events(&owner, &[profile, note]).await;

    let plan = String::from_utf8(respond_finger(&state, "").await).unwrap();
    assert!(plan.contains("Login: operator"));
    assert!(plan.contains("Plan:"));
    assert!(plan.contains("runs this gateway"));
    assert!(plan.contains("fresh note"));
    assert!(plan.lines().all(|line| !line.contains('\u{0}')));

    let by_name = String::from_utf8(respond_finger(&state, "operator").await).unwrap();
    assert!(by_name.contains("Login: operator"));

    let missing = String::from_utf8(respond_finger(&state, "nobody").await).unwrap();
    assert!(missing.contains("no such user"));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn responses_are_cached_and_invalidated_by_section_pattern() {
    use nophr_cache::Cache as _;

    let owner = Keys::generate();
    let state = state_with_events(&owner, &[]).await;

    let first = respond_gopher(&state, "/notes").await;
    let second = respond_gopher(&state, "/notes").await;
    assert_eq!(first, second);
    assert!(state.node.cache.stats().hits >= 1);

    // Rendered pages live under the section key family, which is what
    // the ingest pipeline invalidates.
    assert!(state
        .node
        .cache
        .has("section:notes:gopher:p1")
        .await);
    state.node.cache.delete_pattern("section:notes:*").await;
    assert!(!state.node.cache.has("section:notes:gopher:p1").await);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn thread_view_nests_replies() {
    let owner = Keys::generate();
    let alice = Keys::generate();
    let root = signed_at(&owner, 1, "thread root", 1_700_000_000, vec![]);
    let reply = signed_at(
        &alice,
        1,
        "a reply",
        1_700_000_050,
        vec![Tag::parse(&["e", &root.id.to_hex(), "", "reply"]).unwrap()],
    );
    let state = state_with_events(&owner, &[root.clone(), reply]).await;

    let doc = String::from_utf8(
        respond_gopher(&state, &format!("/thread/{}", root.id.to_hex())).await,
    )
    .unwrap();
    assert!(doc.contains("thread root"));
    assert!(doc.contains("a reply"));
}
