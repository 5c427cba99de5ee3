//! The pluggable event store behind `Store/Query/Delete`.
//!
//! Three backends implement the same narrow trait: `sqlite` (rusqlite),
//! `redb` (also answering to the legacy `lmdb` driver name), and an
//! in-memory double for tests. Signature verification happens above the
//! trait, in [`crate::Database::store_event`]; backends may assume
//! events are verified.

use std::collections::BTreeMap;

use nostr::Event;
use snafu::{Location, Snafu};

use nophr_core::{kinds, EventFilter, EventIdKey, PubkeyKey};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("Event failed id/signature verification"))]
    InvalidSignature,
    #[snafu(display("sqlite error: {source}"))]
    Sqlite {
        source: rusqlite::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("storage backend error: {message}"))]
    Backend {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Stored event does not parse: {message}"))]
    Corrupt { message: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// What `store` did with the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// New event persisted.
    Inserted,
    /// Same id was already present; nothing changed.
    AlreadyPresent,
    /// A replaceable event displaced an older version.
    Replaced,
    /// An older replaceable version than the stored one; dropped.
    Stale,
}

impl StoreOutcome {
    pub fn is_newly_stored(self) -> bool {
        matches!(self, StoreOutcome::Inserted | StoreOutcome::Replaced)
    }
}

pub trait EventStore: Send + Sync + 'static {
    fn store(&self, event: &Event) -> StoreResult<StoreOutcome>;
    fn query(&self, filter: &EventFilter) -> StoreResult<Vec<Event>>;
    fn delete(&self, id: EventIdKey) -> StoreResult<bool>;
    fn count(&self) -> StoreResult<u64>;
    fn counts_by_kind(&self) -> StoreResult<BTreeMap<u16, u64>>;
    fn approximate_size_bytes(&self) -> StoreResult<u64>;
}

/// Replaceable-group key `(pubkey, kind, d-tag)`.
///
/// Plain events return `None`; replaceable kinds use the empty d-tag.
pub fn replaceable_group(event: &Event) -> Option<(PubkeyKey, u16, String)> {
    let kind = event.kind.as_u16();
    if kinds::is_replaceable(kind) {
        Some((PubkeyKey::from(event.pubkey), kind, String::new()))
    } else if kinds::is_param_replaceable(kind) {
        Some((
            PubkeyKey::from(event.pubkey),
            kind,
            nophr_core::d_tag(event),
        ))
    } else {
        None
    }
}

/// Whether `candidate` supersedes `current` within a replaceable group.
///
/// Newest `created_at` wins; ties break to the lexicographically lower id
/// so that all peers converge on the same survivor.
pub fn supersedes(
    candidate: (u64, &EventIdKey),
    current: (u64, &EventIdKey),
) -> bool {
    match candidate.0.cmp(&current.0) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => candidate.1 < current.1,
    }
}

/// Canonical result order: `created_at` descending, id descending.
pub fn sort_and_limit(mut events: Vec<Event>, limit: Option<usize>) -> Vec<Event> {
    events.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    events.dedup_by(|a, b| a.id == b.id);
    if let Some(limit) = limit {
        events.truncate(limit);
    }
    events
}
