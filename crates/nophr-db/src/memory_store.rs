//! In-memory event store used by tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use nostr::Event;

use nophr_core::{EventFilter, EventIdKey, PubkeyKey};

use crate::event_store::{
    replaceable_group, sort_and_limit, supersedes, EventStore, StoreOutcome, StoreResult,
};

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    events: BTreeMap<EventIdKey, Event>,
    replaceable: BTreeMap<(PubkeyKey, u16, String), (u64, EventIdKey)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for MemoryStore {
    fn store(&self, event: &Event) -> StoreResult<StoreOutcome> {
        let mut inner = self.inner.lock().expect("Locking failed");
        let id = EventIdKey::from(event.id);
        if inner.events.contains_key(&id) {
            return Ok(StoreOutcome::AlreadyPresent);
        }

        let mut outcome = StoreOutcome::Inserted;
        if let Some(group) = replaceable_group(event) {
            if let Some((current_ts, current_id)) = inner.replaceable.get(&group).copied() {
                if supersedes((event.created_at.as_u64(), &id), (current_ts, &current_id)) {
                    inner.events.remove(&current_id);
                    outcome = StoreOutcome::Replaced;
                } else {
                    return Ok(StoreOutcome::Stale);
                }
            }
            inner
                .replaceable
                .insert(group, (event.created_at.as_u64(), id));
        }
        inner.events.insert(id, event.clone());
        Ok(outcome)
    }

    fn query(&self, filter: &EventFilter) -> StoreResult<Vec<Event>> {
        let inner = self.inner.lock().expect("Locking failed");
        let matching = inner
            .events
            .values()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        Ok(sort_and_limit(matching, filter.limit))
    }

    fn delete(&self, id: EventIdKey) -> StoreResult<bool> {
        let mut inner = self.inner.lock().expect("Locking failed");
        let Some(event) = inner.events.remove(&id) else {
            return Ok(false);
        };
        if let Some(group) = replaceable_group(&event) {
            if inner.replaceable.get(&group).map(|(_, current)| *current) == Some(id) {
                inner.replaceable.remove(&group);
            }
        }
        Ok(true)
    }

    fn count(&self) -> StoreResult<u64> {
        Ok(self.inner.lock().expect("Locking failed").events.len() as u64)
    }

    fn counts_by_kind(&self) -> StoreResult<BTreeMap<u16, u64>> {
        let inner = self.inner.lock().expect("Locking failed");
        let mut counts = BTreeMap::new();
        for event in inner.events.values() {
            *counts.entry(event.kind.as_u16()).or_default() += 1;
        }
        Ok(counts)
    }

    fn approximate_size_bytes(&self) -> StoreResult<u64> {
        let inner = self.inner.lock().expect("Locking failed");
        Ok(inner
            .events
            .values()
            .map(|event| event.content.len() as u64 + 256)
            .sum())
    }
}
