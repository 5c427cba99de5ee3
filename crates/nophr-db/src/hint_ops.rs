//! Relay hint table operations.

use redb_bincode::{ReadTransaction, WriteTransaction};

use nophr_core::refs::RelayListEntry;
use nophr_core::{EventIdKey, PubkeyKey};

use crate::{relay_hints, Database, DbResult, RelayHintRecord};

impl Database {
    /// Upsert hints parsed from a kind-10002 event.
    ///
    /// Rows only change when `freshness` is strictly newer than what is
    /// stored. Returns true when anything was written.
    pub async fn upsert_relay_hints(
        &self,
        author: PubkeyKey,
        entries: &[RelayListEntry],
        freshness: u64,
        source_event: EventIdKey,
    ) -> DbResult<bool> {
        let entries = entries.to_vec();
        self.write_with(move |tx| {
            Self::upsert_relay_hints_tx(author, &entries, freshness, source_event, tx)
        })
        .await
    }

    pub fn upsert_relay_hints_tx(
        author: PubkeyKey,
        entries: &[RelayListEntry],
        freshness: u64,
        source_event: EventIdKey,
        tx: &WriteTransaction,
    ) -> DbResult<bool> {
        let mut table = tx.open_table(&relay_hints::TABLE)?;
        let mut changed = false;
        for entry in entries {
            let key = (author, entry.url.clone());
            let stale = table
                .get(&key)?
                .map(|guard| freshness <= guard.value().freshness)
                .unwrap_or(false);
            if stale {
                continue;
            }
            table.insert(
                &key,
                &RelayHintRecord {
                    can_read: entry.read,
                    can_write: entry.write,
                    freshness,
                    last_seen_event_id: Some(source_event),
                },
            )?;
            changed = true;
        }
        Ok(changed)
    }

    /// All hints for an author, freshest first.
    pub async fn relay_hints_for(
        &self,
        author: PubkeyKey,
    ) -> DbResult<Vec<(String, RelayHintRecord)>> {
        self.read_with(|tx| Self::relay_hints_for_tx(author, tx))
            .await
    }

    pub fn relay_hints_for_tx(
        author: PubkeyKey,
        tx: &ReadTransaction,
    ) -> DbResult<Vec<(String, RelayHintRecord)>> {
        let table = tx.open_table(&relay_hints::TABLE)?;
        let mut rows = Vec::new();
        for entry in table.range((author, String::new())..)? {
            let entry = entry?;
            let (owner, url) = entry.0.value();
            if owner != author {
                break;
            }
            rows.push((url, entry.1.value()));
        }
        rows.sort_by(|a, b| b.1.freshness.cmp(&a.1.freshness).then_with(|| a.0.cmp(&b.0)));
        Ok(rows)
    }

    /// Freshness of the newest hint row for an author, if any.
    pub async fn relay_hint_freshness(&self, author: PubkeyKey) -> DbResult<Option<u64>> {
        Ok(self
            .relay_hints_for(author)
            .await?
            .first()
            .map(|(_, record)| record.freshness))
    }
}
