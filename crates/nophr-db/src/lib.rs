//! Storage for nophr: the pluggable event store plus the auxiliary
//! tables that live beside it.
//!
//! [`Database`] is the only handle the rest of the system holds. Event
//! reads and writes go to the configured [`EventStore`] backend;
//! auxiliary state (relay hints, graph, cursors, aggregates, retention,
//! capabilities) lives in a redb file and every multi-row update is one
//! write transaction.

mod aggregate_ops;
mod capability_ops;
mod cursor_ops;
mod event_store;
mod graph_ops;
mod hint_ops;
mod memory_store;
mod redb_store;
mod retention_ops;
mod sqlite_store;
mod tables;

use std::path::Path;
use std::sync::Arc;

use nostr::Event;
use redb_bincode::{ReadTransaction, WriteTransaction};
use snafu::{Location, ResultExt as _, Snafu};
use tracing::{debug, info};

use nophr_core::{EventFilter, EventIdKey};

pub use self::event_store::{EventStore, StoreError, StoreOutcome, StoreResult};
pub use self::memory_store::MemoryStore;
pub use self::redb_store::RedbStore;
pub use self::sqlite_store::SqliteStore;
pub use self::tables::*;

const LOG_TARGET: &str = "nophr::db";

#[derive(Debug, Snafu)]
pub enum DbError {
    Database {
        source: redb::DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Table {
        source: redb::TableError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage {
        source: redb::StorageError,
        #[snafu(implicit)]
        location: Location,
    },
    Transaction {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
        #[snafu(implicit)]
        location: Location,
    },
    Commit {
        source: redb::CommitError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Store {
        source: StoreError,
        #[snafu(implicit)]
        location: Location,
    },
    Io {
        source: std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type DbResult<T> = std::result::Result<T, DbError>;

/// Which event-store backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStoreDriver {
    Sqlite,
    Redb,
}

/// Kind of interaction a referencing event contributes to an aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interaction {
    Reply,
    Reaction { token: String },
    Zap { sats: u64 },
}

pub struct Database {
    events: Arc<dyn EventStore>,
    aux: redb_bincode::Database,
}

impl Database {
    /// Open the event store and auxiliary tables under `data_dir`.
    pub async fn open(driver: EventStoreDriver, data_dir: &Path) -> DbResult<Database> {
        tokio::fs::create_dir_all(data_dir).await.context(IoSnafu)?;

        let events: Arc<dyn EventStore> = match driver {
            EventStoreDriver::Sqlite => {
                Arc::new(SqliteStore::open(&data_dir.join("events.sqlite"))?)
            }
            EventStoreDriver::Redb => Arc::new(RedbStore::open(&data_dir.join("events.redb"))?),
        };

        let aux_path = data_dir.join("aux.redb");
        debug!(target: LOG_TARGET, path = %aux_path.display(), "Opening auxiliary store");
        let aux = tokio::task::spawn_blocking(move || redb::Database::create(aux_path))
            .await
            .expect("Join failed")
            .context(DatabaseSnafu)?;
        let db = Self {
            events,
            aux: redb_bincode::Database::from(aux),
        };
        db.init_tables().await?;
        info!(target: LOG_TARGET, ?driver, "Storage ready");
        Ok(db)
    }

    /// Fully in-memory database for tests.
    pub async fn new_in_memory() -> DbResult<Database> {
        let aux = redb::Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .context(DatabaseSnafu)?;
        let db = Self {
            events: Arc::new(MemoryStore::new()),
            aux: redb_bincode::Database::from(aux),
        };
        db.init_tables().await?;
        Ok(db)
    }

    /// In-memory auxiliary tables over a caller-provided event store.
    pub async fn with_event_store(events: Arc<dyn EventStore>) -> DbResult<Database> {
        let aux = redb::Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .context(DatabaseSnafu)?;
        let db = Self {
            events,
            aux: redb_bincode::Database::from(aux),
        };
        db.init_tables().await?;
        Ok(db)
    }

    async fn init_tables(&self) -> DbResult<()> {
        self.write_with(|tx| {
            tx.open_table(&relay_hints::TABLE)?;
            tx.open_table(&graph_nodes::TABLE)?;
            tx.open_table(&sync_cursors::TABLE)?;
            tx.open_table(&aggregates::TABLE)?;
            tx.open_table(&aggregate_refs::TABLE)?;
            tx.open_table(&retention_metadata::TABLE)?;
            tx.open_table(&relay_capabilities::TABLE)?;
            Ok(())
        })
        .await
    }

    // -- event store ------------------------------------------------------

    /// Verify and store an event.
    ///
    /// A failed id/signature check surfaces as
    /// [`StoreError::InvalidSignature`]; callers on the ingest path drop
    /// and count it, never abort.
    pub async fn store_event(&self, event: &Event) -> DbResult<StoreOutcome> {
        if event.verify().is_err() {
            return Err(StoreError::InvalidSignature.into());
        }
        let events = self.events.clone();
        let event = event.clone();
        Ok(tokio::task::block_in_place(move || events.store(&event))?)
    }

    pub async fn query(&self, filter: &EventFilter) -> DbResult<Vec<Event>> {
        let events = self.events.clone();
        let filter = filter.clone();
        Ok(tokio::task::block_in_place(move || events.query(&filter))?)
    }

    /// Delete an event and cascade to its aggregate and retention rows.
    pub async fn delete_event(&self, id: EventIdKey) -> DbResult<bool> {
        let events = self.events.clone();
        let removed = tokio::task::block_in_place(move || events.delete(id))?;
        self.write_with(|tx| {
            Self::remove_aggregate_tx(id, tx)?;
            let mut retention_tbl = tx.open_table(&retention_metadata::TABLE)?;
            retention_tbl.remove(&id)?;
            Ok(())
        })
        .await?;
        Ok(removed)
    }

    pub async fn event_count(&self) -> DbResult<u64> {
        let events = self.events.clone();
        Ok(tokio::task::block_in_place(move || events.count())?)
    }

    pub async fn event_counts_by_kind(
        &self,
    ) -> DbResult<std::collections::BTreeMap<u16, u64>> {
        let events = self.events.clone();
        Ok(tokio::task::block_in_place(move || {
            events.counts_by_kind()
        })?)
    }

    pub async fn store_size_bytes(&self) -> DbResult<u64> {
        let events = self.events.clone();
        Ok(tokio::task::block_in_place(move || {
            events.approximate_size_bytes()
        })?)
    }

    // -- auxiliary store transactions -------------------------------------

    pub async fn write_with<T>(
        &self,
        f: impl FnOnce(&'_ WriteTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let tx = self.aux.begin_write().context(TransactionSnafu)?;
            let res = f(&tx)?;
            tx.commit().context(CommitSnafu)?;
            Ok(res)
        })
    }

    pub async fn read_with<T>(
        &self,
        f: impl FnOnce(&'_ ReadTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let tx = self.aux.begin_read().context(TransactionSnafu)?;
            f(&tx)
        })
    }
}

#[cfg(test)]
mod tests;
