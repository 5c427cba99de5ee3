//! Auxiliary table definitions.
//!
//! These sit beside the event store in their own redb file and carry
//! everything the gateway derives from the event stream: relay hints,
//! the social graph, sync cursors, interaction aggregates, retention
//! metadata, and relay capabilities.

use std::collections::BTreeMap;

use bincode::{Decode, Encode};
use serde::Serialize;

use nophr_core::{EventIdKey, PubkeyKey};

#[macro_export]
macro_rules! def_table {
    ($(#[$outer:meta])*
        $name:ident : $k:ty => $v:ty) => {
        #[allow(unused)]
        $(#[$outer])*
        pub mod $name {
            use super::*;
            pub type Key = $k;
            pub type Value = $v;
            pub type Definition<'a> = redb_bincode::TableDefinition<'a, Key, Value>;
            pub trait ReadableTable: redb_bincode::ReadableTable<Key, Value> {}
            impl<RT> ReadableTable for RT where RT: redb_bincode::ReadableTable<Key, Value> {}
            pub type Table<'a> = redb_bincode::Table<'a, Key, Value>;
            pub const TABLE: Definition = redb_bincode::TableDefinition::new(stringify!($name));
        }
    };
}

def_table! {
    /// NIP-65 relay hints per author.
    ///
    /// Key: (author, relay url). `freshness` is the `created_at` of the
    /// kind-10002 that produced the row; writes only win with strictly
    /// newer freshness.
    relay_hints: (PubkeyKey, String) => RelayHintRecord
}

def_table! {
    /// The computed social graph.
    ///
    /// Key: (root pubkey, member pubkey). Depth 0 is the root itself,
    /// 1 direct follows, higher values FOAF hops. Rebuilt atomically
    /// per root.
    graph_nodes: (PubkeyKey, PubkeyKey) => GraphNodeRecord
}

def_table! {
    /// Sync cursors per (relay url, kind).
    ///
    /// `since` is the greatest `created_at` ingested from that pair and
    /// never moves backward.
    sync_cursors: (String, u16) => CursorRecord
}

def_table! {
    /// Interaction rollups per referenced event.
    ///
    /// A row may exist before its referent arrives; the aggregate is
    /// keyed by id only.
    aggregates: EventIdKey => AggregateRecord
}

def_table! {
    /// Referencing events already counted into an aggregate.
    ///
    /// Key: (target id, referencing id). Guards incremental updates so
    /// re-ingesting a reference never double-counts.
    aggregate_refs: (EventIdKey, EventIdKey) => ()
}

def_table! {
    /// Retention decision per event.
    retention_metadata: EventIdKey => RetentionRecord
}

def_table! {
    /// NIP-11 capability probe results per relay url, cached for a TTL.
    relay_capabilities: String => RelayCapabilityRecord
}

#[derive(Debug, Encode, Decode, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayHintRecord {
    pub can_read: bool,
    pub can_write: bool,
    pub freshness: u64,
    pub last_seen_event_id: Option<EventIdKey>,
}

#[derive(Debug, Encode, Decode, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GraphNodeRecord {
    pub depth: u16,
    pub mutual: bool,
    pub last_seen: u64,
}

#[derive(Debug, Encode, Decode, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CursorRecord {
    pub since: u64,
    pub updated_at: u64,
}

#[derive(Debug, Encode, Decode, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateRecord {
    pub reply_count: u64,
    pub reaction_total: u64,
    pub reaction_counts: BTreeMap<String, u64>,
    pub zap_sats_total: u64,
    pub last_interaction_at: u64,
}

impl AggregateRecord {
    /// `reaction_total` must always equal the histogram sum.
    pub fn is_consistent(&self) -> bool {
        self.reaction_total == self.reaction_counts.values().sum::<u64>()
    }

    pub fn interactions(&self) -> u64 {
        self.reply_count + self.reaction_total + u64::from(self.zap_sats_total != 0)
    }
}

#[derive(Debug, Encode, Decode, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionRecord {
    pub rule_name: String,
    pub rule_priority: i64,
    pub retain_until: Option<u64>,
    pub last_evaluated_at: u64,
    pub score: i64,
    pub protected: bool,
}

#[derive(Debug, Encode, Decode, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayCapabilityRecord {
    pub supports_negentropy: bool,
    pub software: Option<String>,
    pub version: Option<String>,
    pub last_checked: u64,
    pub check_expiry: u64,
}
