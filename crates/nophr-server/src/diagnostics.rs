//! The `/diagnostics` view: server status, relay health, event counts,
//! cache statistics.

use nostr::nips::nip19::ToBech32 as _;

use nophr_core::fmt::{format_bytes, format_duration};
use nophr_core::unix_now;

use crate::AppState;

pub async fn build(state: &AppState) -> String {
    let mut out = String::new();
    let stats = &state.node.stats;

    out.push_str(&format!("{}\n", state.config.site.title));
    out.push_str(&format!("operator: {}\n", state.config.site.operator));
    let owner = state
        .config
        .owner
        .to_bech32()
        .unwrap_or_else(|_| state.config.owner.to_hex());
    out.push_str(&format!("identity: {owner}\n"));
    out.push_str(&format!(
        "uptime: {}\n",
        format_duration(stats.uptime_seconds())
    ));
    out.push('\n');

    out.push_str("events\n");
    let total = state.node.db.event_count().await.unwrap_or(0);
    out.push_str(&format!("  total: {total}\n"));
    if let Ok(counts) = state.node.db.event_counts_by_kind().await {
        for (kind, count) in counts {
            out.push_str(&format!("  kind {kind}: {count}\n"));
        }
    }
    if let Ok(bytes) = state.node.db.store_size_bytes().await {
        out.push_str(&format!("  storage: {}\n", format_bytes(bytes)));
    }
    out.push('\n');

    out.push_str("ingest\n");
    out.push_str(&format!("  stored: {}\n", stats.stored_total()));
    out.push_str(&format!("  duplicates: {}\n", stats.duplicates_total()));
    out.push_str(&format!(
        "  stale replaceable: {}\n",
        stats.stale_replaceable_total()
    ));
    out.push_str(&format!(
        "  invalid signatures: {}\n",
        stats.invalid_signatures_total()
    ));
    out.push_str(&format!("  denylisted: {}\n", stats.denylisted_total()));
    out.push_str(&format!(
        "  content filtered: {}\n",
        stats.content_filtered_total()
    ));
    out.push_str(&format!(
        "  reconcile repairs: {}\n",
        stats.reconcile_drift_total()
    ));
    out.push_str(&format!(
        "  retention deletions: {}\n",
        stats.retention_deleted_total()
    ));
    out.push('\n');

    out.push_str("relays\n");
    let statuses = state.node.pool.statuses();
    if statuses.is_empty() {
        out.push_str("  (no connections yet)\n");
    }
    for status in statuses {
        out.push_str(&format!(
            "  {} [{}] subs={} reconnects={} received={} dropped={}\n",
            status.url,
            status.state.as_str(),
            status.subscriptions,
            status.reconnects.saturating_sub(1),
            status.events_received,
            status.dropped_events,
        ));
        if let Some(error) = status.last_error {
            out.push_str(&format!("    last error: {error}\n"));
        }
    }
    if let Ok(capabilities) = state.node.db.capabilities().await {
        for (url, record) in capabilities {
            if record.supports_negentropy {
                out.push_str(&format!("  {url} supports negentropy\n"));
            }
        }
    }
    out.push('\n');

    out.push_str("cursors\n");
    let now = unix_now();
    match state.node.db.all_cursors().await {
        Ok(cursors) if !cursors.is_empty() => {
            for ((relay, kind), cursor) in cursors {
                out.push_str(&format!(
                    "  {relay} kind {kind}: since={} lag={}\n",
                    cursor.since,
                    format_duration(now.saturating_sub(cursor.since)),
                ));
            }
        }
        _ => out.push_str("  (none)\n"),
    }
    out.push('\n');

    out.push_str("cache\n");
    let cache_stats = state.node.cache.stats();
    out.push_str(&format!(
        "  hits={} misses={} evictions={} entries={} bytes={}\n",
        cache_stats.hits,
        cache_stats.misses,
        cache_stats.evictions,
        cache_stats.entries,
        format_bytes(cache_stats.bytes),
    ));

    out
}
