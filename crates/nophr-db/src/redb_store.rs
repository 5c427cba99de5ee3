//! redb event store backend.
//!
//! Also answers to the legacy `lmdb` driver name in config: same
//! file-per-instance, memory-mapped B-tree model.

use std::collections::BTreeMap;
use std::path::Path;

use nostr::{Event, JsonUtil as _};
use snafu::location;
use tracing::debug;

use nophr_core::{EventFilter, EventIdKey, PubkeyKey};

use crate::def_table;
use crate::event_store::{
    replaceable_group, sort_and_limit, supersedes, EventStore, StoreError, StoreOutcome,
    StoreResult,
};

const LOG_TARGET: &str = "nophr::db::redb";

def_table! {
    /// Events by id, stored as their canonical JSON.
    ev_events: EventIdKey => String
}

def_table! {
    /// Time-ordered index over all events.
    ev_by_time: (u64, EventIdKey) => ()
}

def_table! {
    /// Latest event per replaceable group `(pubkey, kind, d-tag)`.
    ev_replaceable: (PubkeyKey, u16, String) => (u64, EventIdKey)
}

pub struct RedbStore {
    inner: redb_bincode::Database,
}

fn backend_err(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend {
        message: err.to_string(),
        location: location!(),
    }
}

impl RedbStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let raw = redb::Database::create(path).map_err(backend_err)?;
        debug!(target: LOG_TARGET, path = %path.display(), "Opened redb event store");
        Self::from_raw(raw)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let raw = redb::Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(backend_err)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: redb::Database) -> StoreResult<Self> {
        let inner = redb_bincode::Database::from(raw);
        let store = Self { inner };
        // Create tables up front so reads never race table creation.
        let tx = store.inner.begin_write().map_err(backend_err)?;
        tx.open_table(&ev_events::TABLE).map_err(backend_err)?;
        tx.open_table(&ev_by_time::TABLE).map_err(backend_err)?;
        tx.open_table(&ev_replaceable::TABLE).map_err(backend_err)?;
        tx.commit().map_err(backend_err)?;
        Ok(store)
    }
}

impl EventStore for RedbStore {
    fn store(&self, event: &Event) -> StoreResult<StoreOutcome> {
        let tx = self.inner.begin_write().map_err(backend_err)?;
        let outcome = {
            let mut events_tbl = tx.open_table(&ev_events::TABLE).map_err(backend_err)?;
            let mut by_time_tbl = tx.open_table(&ev_by_time::TABLE).map_err(backend_err)?;
            let mut replaceable_tbl = tx
                .open_table(&ev_replaceable::TABLE)
                .map_err(backend_err)?;

            let id = EventIdKey::from(event.id);
            let created_at = event.created_at.as_u64();

            if events_tbl.get(&id).map_err(backend_err)?.is_some() {
                StoreOutcome::AlreadyPresent
            } else {
                let mut outcome = StoreOutcome::Inserted;
                let group = replaceable_group(event);
                if let Some(group) = &group {
                    let current = replaceable_tbl
                        .get(group)
                        .map_err(backend_err)?
                        .map(|guard| guard.value());
                    if let Some((current_ts, current_id)) = current {
                        if supersedes((created_at, &id), (current_ts, &current_id)) {
                            if let Some(json) = events_tbl
                                .remove(&current_id)
                                .map_err(backend_err)?
                                .map(|guard| guard.value())
                            {
                                if let Ok(old) = Event::from_json(&json) {
                                    by_time_tbl
                                        .remove(&(old.created_at.as_u64(), current_id))
                                        .map_err(backend_err)?;
                                }
                            }
                            outcome = StoreOutcome::Replaced;
                        } else {
                            return Ok(StoreOutcome::Stale);
                        }
                    }
                    replaceable_tbl
                        .insert(group, &(created_at, id))
                        .map_err(backend_err)?;
                }
                events_tbl
                    .insert(&id, &event.as_json())
                    .map_err(backend_err)?;
                by_time_tbl
                    .insert(&(created_at, id), &())
                    .map_err(backend_err)?;
                outcome
            }
        };
        tx.commit().map_err(backend_err)?;
        Ok(outcome)
    }

    fn query(&self, filter: &EventFilter) -> StoreResult<Vec<Event>> {
        let tx = self.inner.begin_read().map_err(backend_err)?;
        let events_tbl = tx.open_table(&ev_events::TABLE).map_err(backend_err)?;

        let mut matching = Vec::new();

        if let Some(ids) = &filter.ids {
            for id_hex in ids {
                let Ok(id) = id_hex.parse::<EventIdKey>() else {
                    continue;
                };
                if let Some(json) = events_tbl
                    .get(&id)
                    .map_err(backend_err)?
                    .map(|guard| guard.value())
                {
                    let event = Event::from_json(&json).map_err(|err| StoreError::Corrupt {
                        message: err.to_string(),
                    })?;
                    if filter.matches(&event) {
                        matching.push(event);
                    }
                }
            }
            return Ok(sort_and_limit(matching, filter.limit));
        }

        let by_time_tbl = tx.open_table(&ev_by_time::TABLE).map_err(backend_err)?;
        for entry in by_time_tbl.range(..).map_err(backend_err)?.rev() {
            let entry = entry.map_err(backend_err)?;
            let (created_at, id) = entry.0.value();
            if let Some(until) = filter.until {
                if until < created_at {
                    continue;
                }
            }
            if let Some(since) = filter.since {
                // Reverse time order: past the lower bound, nothing
                // further back can match.
                if created_at < since {
                    break;
                }
            }
            let Some(json) = events_tbl
                .get(&id)
                .map_err(backend_err)?
                .map(|guard| guard.value())
            else {
                continue;
            };
            let event = Event::from_json(&json).map_err(|err| StoreError::Corrupt {
                message: err.to_string(),
            })?;
            if filter.matches(&event) {
                matching.push(event);
                if let Some(limit) = filter.limit {
                    if limit <= matching.len() {
                        break;
                    }
                }
            }
        }
        Ok(sort_and_limit(matching, filter.limit))
    }

    fn delete(&self, id: EventIdKey) -> StoreResult<bool> {
        let tx = self.inner.begin_write().map_err(backend_err)?;
        let removed = {
            let mut events_tbl = tx.open_table(&ev_events::TABLE).map_err(backend_err)?;
            let mut by_time_tbl = tx.open_table(&ev_by_time::TABLE).map_err(backend_err)?;
            let mut replaceable_tbl = tx
                .open_table(&ev_replaceable::TABLE)
                .map_err(backend_err)?;

            let removed_json = events_tbl
                .remove(&id)
                .map_err(backend_err)?
                .map(|guard| guard.value());
            match removed_json {
                None => false,
                Some(json) => {
                    if let Ok(event) = Event::from_json(&json) {
                        by_time_tbl
                            .remove(&(event.created_at.as_u64(), id))
                            .map_err(backend_err)?;
                        if let Some(group) = replaceable_group(&event) {
                            let points_here = replaceable_tbl
                                .get(&group)
                                .map_err(backend_err)?
                                .map(|guard| guard.value().1 == id)
                                .unwrap_or(false);
                            if points_here {
                                replaceable_tbl.remove(&group).map_err(backend_err)?;
                            }
                        }
                    }
                    true
                }
            }
        };
        tx.commit().map_err(backend_err)?;
        Ok(removed)
    }

    fn count(&self) -> StoreResult<u64> {
        let tx = self.inner.begin_read().map_err(backend_err)?;
        let events_tbl = tx.open_table(&ev_events::TABLE).map_err(backend_err)?;
        let mut count = 0;
        for entry in events_tbl.range(..).map_err(backend_err)? {
            entry.map_err(backend_err)?;
            count += 1;
        }
        Ok(count)
    }

    fn counts_by_kind(&self) -> StoreResult<BTreeMap<u16, u64>> {
        let tx = self.inner.begin_read().map_err(backend_err)?;
        let events_tbl = tx.open_table(&ev_events::TABLE).map_err(backend_err)?;
        let mut counts = BTreeMap::new();
        for entry in events_tbl.range(..).map_err(backend_err)? {
            let entry = entry.map_err(backend_err)?;
            if let Ok(event) = Event::from_json(&entry.1.value()) {
                *counts.entry(event.kind.as_u16()).or_default() += 1;
            }
        }
        Ok(counts)
    }

    fn approximate_size_bytes(&self) -> StoreResult<u64> {
        let tx = self.inner.begin_read().map_err(backend_err)?;
        let events_tbl = tx.open_table(&ev_events::TABLE).map_err(backend_err)?;
        let mut total = 0u64;
        for entry in events_tbl.range(..).map_err(backend_err)? {
            let entry = entry.map_err(backend_err)?;
            total += entry.1.value().len() as u64 + 64;
        }
        Ok(total)
    }
}
