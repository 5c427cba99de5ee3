//! Relay capability cache operations.

use crate::{relay_capabilities, Database, DbResult, RelayCapabilityRecord};

impl Database {
    pub async fn capability(&self, url: &str) -> DbResult<Option<RelayCapabilityRecord>> {
        let url = url.to_owned();
        self.read_with(|tx| {
            let table = tx.open_table(&relay_capabilities::TABLE)?;
            let result = table.get(&url)?.map(|guard| guard.value());
            Ok(result)
        })
        .await
    }

    pub async fn upsert_capability(
        &self,
        url: &str,
        record: RelayCapabilityRecord,
    ) -> DbResult<()> {
        let url = url.to_owned();
        self.write_with(move |tx| {
            let mut table = tx.open_table(&relay_capabilities::TABLE)?;
            table.insert(&url, &record)?;
            Ok(())
        })
        .await
    }

    pub async fn capabilities(&self) -> DbResult<Vec<(String, RelayCapabilityRecord)>> {
        self.read_with(|tx| {
            let table = tx.open_table(&relay_capabilities::TABLE)?;
            let mut rows = Vec::new();
            for entry in table.range::<String>(..)? {
                let entry = entry?;
                rows.push((entry.0.value(), entry.1.value()));
            }
            Ok(rows)
        })
        .await
    }
}
