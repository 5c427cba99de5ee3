//! Config document shape.
//!
//! `Raw*` structs mirror the TOML document with everything optional or
//! defaulted; `Config` and friends are the validated forms handed to the
//! rest of the system.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::PathBuf;

use nostr::{PublicKey, SecretKey};
use serde::Deserialize;

use nophr_core::kinds;

// ---------------------------------------------------------------------------
// Validated configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub site: Site,
    pub owner: PublicKey,
    pub nsec: Option<SecretKey>,
    pub protocols: Protocols,
    pub relays: Relays,
    pub discovery: Discovery,
    pub sync: Sync,
    pub inbox: Inbox,
    pub storage: Storage,
    pub rendering: Rendering,
    pub caching: Caching,
    pub security: Security,
    pub layout: Layout,
    pub logging: Logging,
}

#[derive(Debug, Clone)]
pub struct Site {
    pub title: String,
    pub description: String,
    pub operator: String,
}

#[derive(Debug, Clone)]
pub struct Sync {
    pub enabled: bool,
    pub kinds: Kinds,
    pub scope: Scope,
    pub cursor_flush_seconds: u64,
    pub retention: Retention,
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub mode: ScopeMode,
    pub include_direct_mentions: bool,
    pub include_threads_of_mine: bool,
    pub max_authors: usize,
    pub allowlist_pubkeys: Vec<PublicKey>,
    pub denylist_pubkeys: Vec<PublicKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeMode {
    OwnerOnly,
    Following,
    Mutual,
    Foaf { depth: u16 },
}

#[derive(Debug, Clone)]
pub struct Storage {
    pub driver: StorageDriver,
    pub data_dir: PathBuf,
    pub lmdb_max_size_mb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageDriver {
    Sqlite,
    Redb,
}

#[derive(Debug, Clone)]
pub struct Caching {
    pub enabled: bool,
    pub engine: CacheEngine,
    pub redis_url: Option<String>,
    pub max_size_mb: u64,
    pub default_ttl_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub ttl: CacheTtl,
    pub aggregates: Aggregates,
}

#[derive(Debug, Clone)]
pub struct Security {
    pub denylist: Denylist,
    pub content_filter: ContentFilter,
    pub ratelimit: RateLimit,
    pub validation: Validation,
}

#[derive(Debug, Clone)]
pub struct Denylist {
    pub enabled: bool,
    pub pubkeys: Vec<PublicKey>,
}

#[derive(Debug, Clone)]
pub struct Layout {
    pub sections: BTreeMap<String, Section>,
}

#[derive(Debug, Clone)]
pub struct Logging {
    pub level: String,
}

// ---------------------------------------------------------------------------
// Shapes shared between raw and validated forms
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Protocols {
    pub gopher: GopherProtocol,
    pub gemini: GeminiProtocol,
    pub finger: FingerProtocol,
}

impl Default for Protocols {
    fn default() -> Self {
        Self {
            gopher: GopherProtocol::default(),
            gemini: GeminiProtocol::default(),
            finger: FingerProtocol::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GopherProtocol {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub bind: String,
}

impl Default for GopherProtocol {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_owned(),
            port: 70,
            bind: "0.0.0.0".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeminiProtocol {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub bind: String,
    pub tls: GeminiTls,
}

impl Default for GeminiProtocol {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_owned(),
            port: 1965,
            bind: "0.0.0.0".to_owned(),
            tls: GeminiTls::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct GeminiTls {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub auto_generate: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FingerProtocol {
    pub enabled: bool,
    pub port: u16,
    pub bind: String,
    pub max_users: usize,
}

impl Default for FingerProtocol {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 79,
            bind: "0.0.0.0".to_owned(),
            max_users: 32,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Relays {
    pub seeds: Vec<String>,
    pub policy: RelayPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayPolicy {
    pub connect_timeout_ms: u64,
    pub max_concurrent_subs: usize,
    pub backoff_ms: Vec<u64>,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            max_concurrent_subs: 20,
            backoff_ms: vec![500, 1_500, 5_000, 15_000, 60_000],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Discovery {
    pub refresh_seconds: u64,
    pub use_owner_hints: bool,
    pub use_author_hints: bool,
    pub fallback_to_seeds: bool,
    pub max_relays_per_author: usize,
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            refresh_seconds: 900,
            use_owner_hints: true,
            use_author_hints: true,
            fallback_to_seeds: true,
            max_relays_per_author: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Kinds {
    pub metadata: bool,
    pub contacts: bool,
    pub relay_lists: bool,
    pub notes: bool,
    pub articles: bool,
    pub reposts: bool,
    pub reactions: bool,
    pub zaps: bool,
    pub allowlist: Vec<u16>,
}

impl Default for Kinds {
    fn default() -> Self {
        Self {
            metadata: true,
            contacts: true,
            relay_lists: true,
            notes: true,
            articles: true,
            reposts: true,
            reactions: true,
            zaps: true,
            allowlist: Vec::new(),
        }
    }
}

impl Kinds {
    /// The set of kinds the sync engine subscribes to.
    pub fn enabled_kinds(&self) -> BTreeSet<u16> {
        let mut set = BTreeSet::new();
        if self.metadata {
            set.insert(kinds::METADATA);
        }
        if self.contacts {
            set.insert(kinds::CONTACTS);
        }
        if self.relay_lists {
            set.insert(kinds::RELAY_LIST);
        }
        if self.notes {
            set.insert(kinds::TEXT_NOTE);
        }
        if self.articles {
            set.insert(kinds::LONG_FORM);
        }
        if self.reposts {
            set.insert(kinds::REPOST);
        }
        if self.reactions {
            set.insert(kinds::REACTION);
        }
        if self.zaps {
            set.insert(kinds::ZAP_RECEIPT);
        }
        set.extend(self.allowlist.iter().copied());
        set
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Retention {
    pub keep_days: u64,
    pub prune_on_start: bool,
    pub reevaluate_interval_seconds: u64,
    pub advanced: Option<AdvancedRetention>,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            keep_days: 365,
            prune_on_start: false,
            reevaluate_interval_seconds: 3_600,
            advanced: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdvancedRetention {
    pub enabled: bool,
    pub rules: Vec<RetentionRule>,
    pub max_total_events: Option<u64>,
    pub max_storage_mb: Option<u64>,
    pub max_events_per_kind: Option<u64>,
}

impl Default for AdvancedRetention {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: Vec::new(),
            max_total_events: None,
            max_storage_mb: None,
            max_events_per_kind: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionRule {
    pub name: String,
    pub priority: i64,
    #[serde(default)]
    pub conditions: RuleConditions,
    pub action: RuleAction,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RuleConditions {
    pub author_is_owner: Option<bool>,
    pub social_distance_max: Option<u16>,
    pub kinds: Option<Vec<u16>>,
    pub min_interactions: Option<u64>,
    pub age_days_max: Option<u64>,
    pub content_length_min: Option<usize>,
    pub is_thread_root: Option<bool>,
    pub has_replies: Option<bool>,
    pub all: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleAction {
    pub retain: bool,
    pub retain_days: Option<u64>,
}

impl Default for RuleAction {
    fn default() -> Self {
        Self {
            retain: true,
            retain_days: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Inbox {
    pub include_replies: bool,
    pub include_reactions: bool,
    pub include_zaps: bool,
    pub group_by_thread: bool,
    pub collapse_reposts: bool,
    pub noise_filters: NoiseFilters,
}

impl Default for Inbox {
    fn default() -> Self {
        Self {
            include_replies: true,
            include_reactions: true,
            include_zaps: true,
            group_by_thread: true,
            collapse_reposts: true,
            noise_filters: NoiseFilters::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct NoiseFilters {
    pub min_zap_sats: u64,
    /// Reaction tokens that count; empty accepts all.
    pub allowed_reaction_chars: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Rendering {
    pub gopher: RenderStyle,
    pub gemini: RenderStyle,
    pub finger: RenderStyle,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderStyle {
    pub max_line_length: usize,
    pub show_timestamps: bool,
    pub date_format: String,
    pub thread_indent: usize,
    pub plan_source: Option<String>,
    pub recent_notes_count: usize,
    pub emoji: bool,
}

impl Default for RenderStyle {
    fn default() -> Self {
        Self {
            max_line_length: 70,
            show_timestamps: true,
            date_format: "[year]-[month]-[day]".to_owned(),
            thread_indent: 2,
            plan_source: None,
            recent_notes_count: 5,
            emoji: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheEngine {
    #[default]
    Memory,
    Redis,
    None,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct CacheTtl {
    pub sections: BTreeMap<String, u64>,
    pub render: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Aggregates {
    pub enabled: bool,
    pub update_on_ingest: bool,
    pub reconciler_interval_seconds: u64,
    pub reconciler_batch_size: usize,
}

impl Default for Aggregates {
    fn default() -> Self {
        Self {
            enabled: true,
            update_on_ingest: true,
            reconciler_interval_seconds: 900,
            reconciler_batch_size: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ContentFilter {
    pub enabled: bool,
    pub banned_words: Vec<String>,
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimit {
    pub enabled: bool,
    pub global: RateLimitQuota,
    pub per_protocol: BTreeMap<String, RateLimitQuota>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitQuota {
    pub requests_per_minute: u32,
    pub burst_size: u32,
}

impl Default for RateLimitQuota {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_size: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Validation {
    pub enabled: bool,
    pub max_selector_length: usize,
    pub max_query_length: usize,
    pub max_path_length: usize,
    pub strict_mode: bool,
}

impl Default for Validation {
    fn default() -> Self {
        Self {
            enabled: true,
            max_selector_length: 255,
            max_query_length: 1_024,
            max_path_length: 1_024,
            strict_mode: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Section {
    pub title: String,
    pub description: String,
    pub path: Option<String>,
    pub order: u32,
    pub filters: SectionFilters,
    pub sort_by: String,
    pub sort_order: String,
    pub limit: usize,
    pub show_dates: bool,
    pub show_authors: bool,
    pub group_by: Option<String>,
    pub more_link: Option<MoreLink>,
}

impl Default for Section {
    fn default() -> Self {
        Self {
            title: String::new(),
            description: String::new(),
            path: None,
            order: 100,
            filters: SectionFilters::default(),
            sort_by: "created_at".to_owned(),
            sort_order: "desc".to_owned(),
            limit: 20,
            show_dates: true,
            show_authors: false,
            group_by: None,
            more_link: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct SectionFilters {
    pub kinds: Vec<u16>,
    pub authors: Vec<String>,
    pub tags: BTreeMap<String, Vec<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
    /// `owner` (default) or `graph`: who the section covers when
    /// `authors` is empty.
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MoreLink {
    pub text: String,
    pub section_ref: String,
}

// ---------------------------------------------------------------------------
// Raw (file-shaped) structs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RawConfig {
    pub site: RawSite,
    pub identity: RawIdentity,
    pub protocols: Protocols,
    pub relays: Relays,
    pub discovery: Discovery,
    pub sync: RawSync,
    pub inbox: Inbox,
    pub storage: RawStorage,
    pub rendering: Rendering,
    pub caching: RawCaching,
    pub security: RawSecurity,
    pub layout: RawLayout,
    pub logging: RawLogging,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RawSite {
    pub title: Option<String>,
    pub description: Option<String>,
    pub operator: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RawIdentity {
    pub npub: Option<String>,
    /// Rejected when present; the secret comes from the environment.
    pub nsec: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawSync {
    pub enabled: bool,
    pub kinds: Kinds,
    pub scope: RawScope,
    pub cursor_flush_seconds: u64,
    pub retention: Retention,
}

impl Default for RawSync {
    fn default() -> Self {
        Self {
            enabled: true,
            kinds: Kinds::default(),
            scope: RawScope::default(),
            cursor_flush_seconds: 5,
            retention: Retention::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawScope {
    pub mode: String,
    pub depth: u16,
    pub include_direct_mentions: bool,
    pub include_threads_of_mine: bool,
    pub max_authors: usize,
    pub allowlist_pubkeys: Vec<String>,
    pub denylist_pubkeys: Vec<String>,
}

impl Default for RawScope {
    fn default() -> Self {
        Self {
            mode: "following".to_owned(),
            depth: 2,
            include_direct_mentions: true,
            include_threads_of_mine: true,
            max_authors: 1_000,
            allowlist_pubkeys: Vec::new(),
            denylist_pubkeys: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawStorage {
    pub driver: String,
    pub data_dir: PathBuf,
    pub lmdb_max_size_mb: u64,
}

impl Default for RawStorage {
    fn default() -> Self {
        Self {
            driver: "sqlite".to_owned(),
            data_dir: PathBuf::from("./data"),
            lmdb_max_size_mb: 1_024,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawCaching {
    pub enabled: bool,
    pub engine: CacheEngine,
    /// Rejected when present; comes from the environment.
    pub redis_url: Option<String>,
    pub max_size_mb: u64,
    pub default_ttl_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub ttl: CacheTtl,
    pub aggregates: Aggregates,
}

impl Default for RawCaching {
    fn default() -> Self {
        Self {
            enabled: true,
            engine: CacheEngine::Memory,
            redis_url: None,
            max_size_mb: 64,
            default_ttl_seconds: 300,
            cleanup_interval_seconds: 60,
            ttl: CacheTtl::default(),
            aggregates: Aggregates::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RawSecurity {
    pub denylist: RawDenylist,
    pub content_filter: ContentFilter,
    pub ratelimit: RateLimit,
    pub validation: Validation,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RawDenylist {
    pub enabled: bool,
    pub pubkeys: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RawLayout {
    pub sections: BTreeMap<String, Section>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawLogging {
    pub level: String,
}

impl Default for RawLogging {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}
