//! Interaction aggregate operations.

use redb_bincode::WriteTransaction;

use nophr_core::EventIdKey;

use crate::{
    aggregate_refs, aggregates, AggregateRecord, Database, DbResult, Interaction,
};

impl Database {
    /// Apply one referencing event to its target's aggregate row.
    ///
    /// Idempotent: the `(target, reference)` pair is recorded and a
    /// second application of the same reference is a no-op. Returns
    /// whether the row changed.
    pub async fn apply_interaction(
        &self,
        target: EventIdKey,
        reference: EventIdKey,
        created_at: u64,
        interaction: Interaction,
    ) -> DbResult<bool> {
        self.write_with(move |tx| {
            Self::apply_interaction_tx(target, reference, created_at, &interaction, tx)
        })
        .await
    }

    pub fn apply_interaction_tx(
        target: EventIdKey,
        reference: EventIdKey,
        created_at: u64,
        interaction: &Interaction,
        tx: &WriteTransaction,
    ) -> DbResult<bool> {
        let mut refs_tbl = tx.open_table(&aggregate_refs::TABLE)?;
        if refs_tbl.get(&(target, reference))?.is_some() {
            return Ok(false);
        }
        refs_tbl.insert(&(target, reference), &())?;

        let mut aggregates_tbl = tx.open_table(&aggregates::TABLE)?;
        let mut record = aggregates_tbl
            .get(&target)?
            .map(|guard| guard.value())
            .unwrap_or_default();

        match interaction {
            Interaction::Reply => {
                record.reply_count += 1;
            }
            Interaction::Reaction { token } => {
                *record.reaction_counts.entry(token.clone()).or_default() += 1;
                record.reaction_total += 1;
            }
            Interaction::Zap { sats } => {
                record.zap_sats_total += sats;
            }
        }
        record.last_interaction_at = record.last_interaction_at.max(created_at);

        aggregates_tbl.insert(&target, &record)?;
        Ok(true)
    }

    pub async fn aggregate(&self, target: EventIdKey) -> DbResult<Option<AggregateRecord>> {
        self.read_with(|tx| {
            let table = tx.open_table(&aggregates::TABLE)?;
            let result = table.get(&target)?.map(|guard| guard.value());
            Ok(result)
        })
        .await
    }

    /// Overwrite an aggregate with a reconciled row and its reference set.
    pub async fn replace_aggregate(
        &self,
        target: EventIdKey,
        record: AggregateRecord,
        refs: Vec<EventIdKey>,
    ) -> DbResult<()> {
        self.write_with(move |tx| {
            Self::clear_refs_tx(target, tx)?;
            let mut refs_tbl = tx.open_table(&aggregate_refs::TABLE)?;
            for reference in &refs {
                refs_tbl.insert(&(target, *reference), &())?;
            }
            let mut aggregates_tbl = tx.open_table(&aggregates::TABLE)?;
            aggregates_tbl.insert(&target, &record)?;
            Ok(())
        })
        .await
    }

    /// Remove an aggregate row and its reference set.
    pub async fn remove_aggregate(&self, target: EventIdKey) -> DbResult<()> {
        self.write_with(move |tx| Self::remove_aggregate_tx(target, tx))
            .await
    }

    pub fn remove_aggregate_tx(target: EventIdKey, tx: &WriteTransaction) -> DbResult<()> {
        Self::clear_refs_tx(target, tx)?;
        let mut aggregates_tbl = tx.open_table(&aggregates::TABLE)?;
        aggregates_tbl.remove(&target)?;
        Ok(())
    }

    fn clear_refs_tx(target: EventIdKey, tx: &WriteTransaction) -> DbResult<()> {
        let mut refs_tbl = tx.open_table(&aggregate_refs::TABLE)?;
        let mut stale = Vec::new();
        for entry in refs_tbl.range((target, EventIdKey::ZERO)..)? {
            let entry = entry?;
            let key = entry.0.value();
            if key.0 != target {
                break;
            }
            stale.push(key);
        }
        for key in stale {
            refs_tbl.remove(&key)?;
        }
        Ok(())
    }

    /// A page of aggregates starting after `start`, for the reconciler.
    pub async fn aggregates_page(
        &self,
        start: Option<EventIdKey>,
        limit: usize,
    ) -> DbResult<Vec<(EventIdKey, AggregateRecord)>> {
        self.read_with(|tx| {
            let table = tx.open_table(&aggregates::TABLE)?;
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
