//! Sync cursor table operations.

use redb_bincode::WriteTransaction;

use crate::{sync_cursors, CursorRecord, Database, DbResult};

impl Database {
    pub async fn cursor(&self, relay: &str, kind: u16) -> DbResult<Option<CursorRecord>> {
        let key = (relay.to_owned(), kind);
        self.read_with(|tx| {
            let table = tx.open_table(&sync_cursors::TABLE)?;
            let result = table.get(&key)?.map(|guard| guard.value());
            Ok(result)
        })
        .await
    }

    /// Persist a batch of cursor advances in one transaction.
    ///
    /// `since` never moves backward: stale updates in the batch are
    /// ignored row by row.
    pub async fn advance_cursors(
        &self,
        updates: &[(String, u16, u64)],
        now: u64,
    ) -> DbResult<()> {
        let updates = updates.to_vec();
        self.write_with(move |tx| Self::advance_cursors_tx(&updates, now, tx))
            .await
    }

    pub fn advance_cursors_tx(
        updates: &[(String, u16, u64)],
        now: u64,
        tx: &WriteTransaction,
    ) -> DbResult<()> {
        let mut table = tx.open_table(&sync_cursors::TABLE)?;
        for (relay, kind, since) in updates {
            let key = (relay.clone(), *kind);
            let current = table.get(&key)?.map(|guard| guard.value());
            let next = match current {
                Some(record) if *since <= record.since => continue,
                _ => CursorRecord {
                    since: *since,
                    updated_at: now,
                },
            };
            table.insert(&key, &next)?;
        }
        Ok(())
    }

    pub async fn all_cursors(&self) -> DbResult<Vec<((String, u16), CursorRecord)>> {
        self.read_with(|tx| {
            let table = tx.open_table(&sync_cursors::TABLE)?;
            let mut rows = Vec::new();
            for entry in table.range(..)? {
                let entry = entry?;
                rows.push((entry.0.value(), entry.1.value()));
            }
            Ok(rows)
        })
        .await
    }
}
