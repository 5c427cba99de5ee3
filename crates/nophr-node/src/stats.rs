//! Ingest and maintenance counters surfaced on `/diagnostics`.

use std::sync::atomic::{AtomicU64, Ordering};

use nophr_core::unix_now;

#[derive(Debug)]
pub struct Stats {
    pub started_at: u64,
    invalid_signatures: AtomicU64,
    denylisted: AtomicU64,
    content_filtered: AtomicU64,
    stored: AtomicU64,
    duplicates: AtomicU64,
    stale_replaceable: AtomicU64,
    reconcile_drift: AtomicU64,
    retention_deleted: AtomicU64,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            started_at: unix_now(),
            invalid_signatures: AtomicU64::new(0),
            denylisted: AtomicU64::new(0),
            content_filtered: AtomicU64::new(0),
            stored: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            stale_replaceable: AtomicU64::new(0),
            reconcile_drift: AtomicU64::new(0),
            retention_deleted: AtomicU64::new(0),
        }
    }
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Stats {
    counter!(count_invalid_signature, invalid_signatures_total, invalid_signatures);
    counter!(count_denylisted, denylisted_total, denylisted);
    counter!(count_content_filtered, content_filtered_total, content_filtered);
    counter!(count_stored, stored_total, stored);
    counter!(count_duplicate, duplicates_total, duplicates);
    counter!(count_stale_replaceable, stale_replaceable_total, stale_replaceable);
    counter!(count_reconcile_drift, reconcile_drift_total, reconcile_drift);
    counter!(count_retention_deleted, retention_deleted_total, retention_deleted);

    pub fn uptime_seconds(&self) -> u64 {
        unix_now().saturating_sub(self.started_at)
    }
}
