//! Social graph computation.
//!
//! The graph is derived from kind-3 contact lists already in the event
//! store and rewritten atomically per root. Truncation under
//! `max_authors` is deterministic: breadth-first, then lexicographic by
//! pubkey within a level.

use std::collections::{BTreeMap, BTreeSet};

use nostr::PublicKey;
use tracing::{debug, info};

use nophr_config::{Scope, ScopeMode};
use nophr_core::{kinds, refs, unix_now, EventFilter, PubkeyKey};
use nophr_db::{Database, DbResult, GraphNodeRecord};

const LOG_TARGET: &str = "nophr::graph";

/// Latest contact list for an author, as pubkeys.
async fn contacts_of(db: &Database, author: &PublicKey) -> DbResult<Vec<PublicKey>> {
    let events = db
        .query(
            &EventFilter::new()
                .author(author.to_hex())
                .kind(kinds::CONTACTS)
                .limit(1),
        )
        .await?;
    Ok(events.first().map(refs::contact_list).unwrap_or_default())
}

/// Recompute and persist the graph rooted at `owner`.
///
/// Returns the stored rows (including the root itself at depth 0).
pub async fn recompute(
    db: &Database,
    owner: &PublicKey,
    scope: &Scope,
) -> DbResult<Vec<(PubkeyKey, GraphNodeRecord)>> {
    let now = unix_now();
    let owner_key = PubkeyKey::from(owner);

    // depth -> members, insertion-deterministic.
    let mut depths: BTreeMap<PubkeyKey, u16> = BTreeMap::new();
    let mut mutuals: BTreeSet<PubkeyKey> = BTreeSet::new();
    depths.insert(owner_key, 0);

    let max_depth = match scope.mode {
        ScopeMode::OwnerOnly => 0,
        ScopeMode::Following | ScopeMode::Mutual => 1,
        ScopeMode::Foaf { depth } => depth.max(1),
    };

    if max_depth > 0 {
        let following = contacts_of(db, owner).await?;

        // BFS over contact lists, level by level.
        let mut frontier: Vec<PublicKey> = following.clone();
        let mut level = 1u16;
        let mut capped = false;
        while level <= max_depth && !frontier.is_empty() && !capped {
            // Deterministic within a level.
            let mut sorted: Vec<PublicKey> = frontier.clone();
            sorted.sort_by_key(|pk| pk.to_hex());

            let mut next = Vec::new();
            for member in sorted {
                let key = PubkeyKey::from(member);
                if depths.contains_key(&key) {
                    continue;
                }
                if scope.max_authors <= depths.len().saturating_sub(1) {
                    capped = true;
                    break;
                }
                depths.insert(key, level);

                if level < max_depth || scope.mode == ScopeMode::Mutual {
                    let their_contacts = contacts_of(db, &member).await?;
                    if level == 1 && their_contacts.contains(owner) {
                        mutuals.insert(key);
                    }
                    next.extend(their_contacts);
                }
            }
            frontier = next;
            level += 1;
        }

        if scope.mode == ScopeMode::Mutual {
            depths.retain(|key, depth| *depth == 0 || mutuals.contains(key));
        }
    }

    // Modifiers: allowlist union, denylist subtraction last.
    for allowed in &scope.allowlist_pubkeys {
        depths.entry(PubkeyKey::from(allowed)).or_insert(1);
    }
    for denied in &scope.denylist_pubkeys {
        let key = PubkeyKey::from(denied);
        if key != owner_key {
            depths.remove(&key);
        }
    }

    let rows: Vec<(PubkeyKey, GraphNodeRecord)> = depths
        .into_iter()
        .map(|(member, depth)| {
            (
                member,
                GraphNodeRecord {
                    depth,
                    mutual: mutuals.contains(&member),
                    last_seen: now,
                },
            )
        })
        .collect();

    db.replace_graph(owner_key, rows.clone()).await?;
    info!(
        target: LOG_TARGET,
        members = rows.len(),
        mode = ?scope.mode,
        "Graph recomputed"
    );
    debug!(target: LOG_TARGET, root = %owner_key, "Graph rows written");
    Ok(rows)
}

/// Whether a kind-3 by `author` can change the graph rooted at `owner`.
///
/// True for the owner and for members at depth < max BFS depth.
pub async fn affects_graph(
    db: &Database,
    owner: &PublicKey,
    scope: &Scope,
    author: &PublicKey,
) -> bool {
    if author == owner {
        return true;
    }
    let max_depth = match scope.mode {
        ScopeMode::OwnerOnly => return false,
        ScopeMode::Following => 1,
        // A followee's list determines mutuality.
        ScopeMode::Mutual => 1,
        ScopeMode::Foaf { depth } => depth.max(1),
    };
    match db
        .social_distance(PubkeyKey::from(owner), PubkeyKey::from(author))
        .await
    {
        Ok(Some(depth)) => match scope.mode {
            ScopeMode::Mutual => depth <= 1,
            _ => depth < max_depth,
        },
        _ => false,
    }
}
