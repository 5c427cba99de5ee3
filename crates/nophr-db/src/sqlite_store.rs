//! SQLite event store backend.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use nostr::{Event, JsonUtil as _};
use rusqlite::{params, Connection, OpenFlags};
use snafu::ResultExt as _;
use tracing::debug;

use nophr_core::{tag_fields, EventFilter, EventIdKey};

use crate::event_store::{
    replaceable_group, sort_and_limit, supersedes, EventStore, SqliteSnafu, StoreOutcome,
    StoreResult,
};

const LOG_TARGET: &str = "nophr::db::sqlite";

const INIT_SQL: &str = r#"
PRAGMA encoding = "UTF-8";
PRAGMA journal_mode = WAL;
PRAGMA main.synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS events (
  id TEXT PRIMARY KEY,
  pubkey TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  kind INTEGER NOT NULL,
  d_tag TEXT NOT NULL DEFAULT '',
  json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS events_created_at ON events(created_at);
CREATE INDEX IF NOT EXISTS events_pubkey_kind ON events(pubkey, kind, created_at);

CREATE TABLE IF NOT EXISTS event_tags (
  event_id TEXT NOT NULL,
  name TEXT NOT NULL,
  value TEXT NOT NULL,
  FOREIGN KEY(event_id) REFERENCES events(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS event_tags_lookup ON event_tags(name, value);
CREATE INDEX IF NOT EXISTS event_tags_by_event ON event_tags(event_id);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .context(SqliteSnafu)?;
        conn.execute_batch(INIT_SQL).context(SqliteSnafu)?;
        debug!(target: LOG_TARGET, path = %path.display(), "Opened sqlite event store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

}

impl EventStore for SqliteStore {
    fn store(&self, event: &Event) -> StoreResult<StoreOutcome> {
        let mut conn = self.conn.lock().expect("Locking failed");
        let tx = conn.transaction().context(SqliteSnafu)?;

        let id_hex = event.id.to_hex();
        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM events WHERE id = ?1)",
                params![id_hex],
                |row| row.get(0),
            )
            .context(SqliteSnafu)?;
        if exists {
            return Ok(StoreOutcome::AlreadyPresent);
        }

        let mut outcome = StoreOutcome::Inserted;
        let group = replaceable_group(event);
        if let Some((pubkey, kind, d_tag)) = &group {
            let current: Option<(u64, String)> = tx
                .query_row(
                    "SELECT created_at, id FROM events
                     WHERE pubkey = ?1 AND kind = ?2 AND d_tag = ?3",
                    params![pubkey.to_hex(), kind, d_tag],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map(Some)
                .or_else(|err| match err {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })
                .context(SqliteSnafu)?;

            if let Some((current_ts, current_id_hex)) = current {
                let current_id: EventIdKey = current_id_hex.parse().map_err(|_| {
                    crate::event_store::StoreError::Backend {
                        message: format!("bad id in events table: {current_id_hex}"),
                        location: snafu::location!(),
                    }
                })?;
                let candidate_id = EventIdKey::from(event.id);
                if supersedes(
                    (event.created_at.as_u64(), &candidate_id),
                    (current_ts, &current_id),
                ) {
                    tx.execute("DELETE FROM events WHERE id = ?1", params![current_id_hex])
                        .context(SqliteSnafu)?;
                    outcome = StoreOutcome::Replaced;
                } else {
                    return Ok(StoreOutcome::Stale);
                }
            }
        }

        let d_tag = group.map(|(_, _, d)| d).unwrap_or_default();
        tx.execute(
            "INSERT INTO events (id, pubkey, created_at, kind, d_tag, json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id_hex,
                event.pubkey.to_hex(),
                event.created_at.as_u64(),
                event.kind.as_u16(),
                d_tag,
                event.as_json(),
            ],
        )
        .context(SqliteSnafu)?;

        for tag in event.tags.iter() {
            let fields = tag_fields(tag);
            let (Some(name), Some(value)) = (fields.first(), fields.get(1)) else {
                continue;
            };
            if name.len() != 1 {
                continue;
            }
            tx.execute(
                "INSERT INTO event_tags (event_id, name, value) VALUES (?1, ?2, ?3)",
                params![id_hex, name, value],
            )
            .context(SqliteSnafu)?;
        }

        tx.commit().context(SqliteSnafu)?;
        Ok(outcome)
    }

    fn query(&self, filter: &EventFilter) -> StoreResult<Vec<Event>> {
        let conn = self.conn.lock().expect("Locking failed");

        let mut sql = String::from("SELECT json FROM events WHERE 1 = 1");
        let mut args: Vec<rusqlite::types::Value> = Vec::new();

        fn add_in_clause(
            sql: &mut String,
            args: &mut Vec<rusqlite::types::Value>,
            column: &str,
            values: Vec<rusqlite::types::Value>,
        ) {
            let placeholders = vec!["?"; values.len()].join(", ");
            sql.push_str(&format!(" AND {column} IN ({placeholders})"));
            args.extend(values);
        }

        if let Some(ids) = &filter.ids {
            add_in_clause(
                &mut sql,
                &mut args,
                "id",
                ids.iter().cloned().map(Into::into).collect(),
            );
        }
        if let Some(authors) = &filter.authors {
            add_in_clause(
                &mut sql,
                &mut args,
                "pubkey",
                authors.iter().cloned().map(Into::into).collect(),
            );
        }
        if let Some(kinds) = &filter.kinds {
            add_in_clause(
                &mut sql,
                &mut args,
                "kind",
                kinds.iter().map(|kind| i64::from(*kind).into()).collect(),
            );
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND created_at >= ?");
            args.push((since as i64).into());
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND created_at <= ?");
            args.push((until as i64).into());
        }
        for (letter, values) in &filter.tags {
            let placeholders = vec!["?"; values.len()].join(", ");
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM event_tags t
                   WHERE t.event_id = events.id AND t.name = ? AND t.value IN ({placeholders}))"
            ));
            args.push(letter.to_string().into());
            for value in values {
                args.push(value.clone().into());
            }
        }

        sql.push_str(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            args.push((limit as i64).into());
        }

        let mut stmt = conn.prepare(&sql).context(SqliteSnafu)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), |row| {
                row.get::<_, String>(0)
            })
            .context(SqliteSnafu)?;

        let mut events = Vec::new();
        for json in rows {
            let json = json.context(SqliteSnafu)?;
            let event =
                Event::from_json(&json).map_err(|err| crate::event_store::StoreError::Corrupt {
                    message: err.to_string(),
                })?;
            events.push(event);
        }
        Ok(sort_and_limit(events, filter.limit))
    }

    fn delete(&self, id: EventIdKey) -> StoreResult<bool> {
        let conn = self.conn.lock().expect("Locking failed");
        let changed = conn
            .execute("DELETE FROM events WHERE id = ?1", params![id.to_hex()])
            .context(SqliteSnafu)?;
        Ok(changed > 0)
    }

    fn count(&self) -> StoreResult<u64> {
        let conn = self.conn.lock().expect("Locking failed");
        conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .context(SqliteSnafu)
    }

    fn counts_by_kind(&self) -> StoreResult<BTreeMap<u16, u64>> {
        let conn = self.conn.lock().expect("Locking failed");
        let mut stmt = conn
            .prepare("SELECT kind, COUNT(*) FROM events GROUP BY kind")
            .context(SqliteSnafu)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, u16>(0)?, row.get::<_, u64>(1)?)))
            .context(SqliteSnafu)?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (kind, count) = row.context(SqliteSnafu)?;
            counts.insert(kind, count);
        }
        Ok(counts)
    }

    fn approximate_size_bytes(&self) -> StoreResult<u64> {
        let conn = self.conn.lock().expect("Locking failed");
        let page_count: u64 = conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))
            .context(SqliteSnafu)?;
        let page_size: u64 = conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .context(SqliteSnafu)?;
        Ok(page_count * page_size)
    }
}
