//! Retention metadata operations.

use nophr_core::EventIdKey;

use crate::{retention_metadata, Database, DbResult, RetentionRecord};

impl Database {
    pub async fn upsert_retention(
        &self,
        id: EventIdKey,
        record: RetentionRecord,
    ) -> DbResult<()> {
        self.write_with(move |tx| {
            let mut table = tx.open_table(&retention_metadata::TABLE)?;
            table.insert(&id, &record)?;
            Ok(())
        })
        .await
    }

    pub async fn retention(&self, id: EventIdKey) -> DbResult<Option<RetentionRecord>> {
        self.read_with(|tx| {
            let table = tx.open_table(&retention_metadata::TABLE)?;
            let result = table.get(&id)?.map(|guard| guard.value());
            Ok(result)
        })
        .await
    }

    pub async fn remove_retention(&self, id: EventIdKey) -> DbResult<()> {
        self.write_with(move |tx| {
            let mut table = tx.open_table(&retention_metadata::TABLE)?;
            table.remove(&id)?;
            Ok(())
        })
        .await
    }

    /// A page of retention rows starting after `start`.
    pub async fn retention_page(
        &self,
        start: Option<EventIdKey>,
        limit: usize,
    ) -> DbResult<Vec<(EventIdKey, RetentionRecord)>> {
        self.read_with(|tx| {
            let table = tx.open_table(&retention_metadata::TABLE)?;
            let mut rows = Vec::new();
            let iter = match start {
                Some(start) => table.range(start..)?,
                None => table.range(..)?,
            };
            for entry in iter {
                let entry = entry?;
                let key = entry.0.value();
                if Some(key) == start {
                    continue;
                }
                rows.push((key, entry.1.value()));
                if limit <= rows.len() {
                    break;
                }
            }
            Ok(rows)
        })
        .await
    }
}
