//! Storage queries behind the routed views.
//!
//! Everything here returns domain data; the per-protocol handlers do
//! the formatting. Aggregate lookups go through the cache under the
//! `aggregate:` key family.

use std::time::Duration;

use nostr::{Event, PublicKey};

use nophr_cache::keys;
use nophr_config::Section;
use nophr_core::{kinds, refs, EventFilter, EventIdKey, PubkeyKey};
use nophr_render::{Interactions, ProfileFields};

use crate::router::Feed;
use crate::AppState;

/// An event paired with its interaction rollup.
#[derive(Debug, Clone)]
pub struct EventView {
    pub event: Event,
    pub interactions: Interactions,
}

fn parse_interactions(bytes: &[u8]) -> Option<Interactions> {
    let text = std::str::from_utf8(bytes).ok()?;
    let mut parts = text.split(':');
    Some(Interactions {
        replies: parts.next()?.parse().ok()?,
        reactions: parts.next()?.parse().ok()?,
        sats: parts.next()?.parse().ok()?,
    })
}

fn encode_interactions(interactions: &Interactions) -> Vec<u8> {
    format!(
        "{}:{}:{}",
        interactions.replies, interactions.reactions, interactions.sats
    )
    .into_bytes()
}

impl AppState {
    /// Interaction rollup for an event, via the aggregate cache.
    pub async fn interactions_for(&self, id: &nostr::EventId) -> Interactions {
        let key = keys::aggregate(&id.to_hex());
        if let Some(bytes) = self.node.cache.get(&key).await {
            if let Some(interactions) = parse_interactions(&bytes) {
                return interactions;
            }
        }
        let record = self
            .node
            .db
            .aggregate(EventIdKey::from(*id))
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        let interactions = Interactions {
            replies: record.reply_count,
            reactions: record.reaction_total,
            sats: record.zap_sats_total,
        };
        self.node
            .cache
            .set(
                &key,
                encode_interactions(&interactions),
                Duration::from_secs(self.config.caching.default_ttl_seconds.max(1)),
            )
            .await;
        interactions
    }

    async fn with_interactions(&self, events: Vec<Event>) -> Vec<EventView> {
        let mut views = Vec::with_capacity(events.len());
        for event in events {
            let interactions = self.interactions_for(&event.id).await;
            views.push(EventView {
                event,
                interactions,
            });
        }
        views
    }

    /// Page of a built-in feed.
    pub async fn feed_events(&self, feed: Feed, page: usize, per_page: usize) -> Vec<EventView> {
        let owner_hex = self.config.owner.to_hex();
        let fetch = page * per_page + per_page;

        let events: Vec<Event> = match feed {
            Feed::Notes => {
                let notes = self
                    .node
                    .db
                    .query(
                        &EventFilter::new()
                            .author(&owner_hex)
                            .kind(kinds::TEXT_NOTE)
                            .limit(fetch * 2),
                    )
                    .await
                    .unwrap_or_default();
                notes
                    .into_iter()
                    .filter(|event| refs::thread_refs(event).is_none())
                    .collect()
            }
            Feed::Articles => self
                .node
                .db
                .query(
                    &EventFilter::new()
                        .author(&owner_hex)
                        .kind(kinds::LONG_FORM)
                        .limit(fetch),
                )
                .await
                .unwrap_or_default(),
            Feed::Replies => {
                if !self.config.inbox.include_replies {
                    Vec::new()
                } else {
                    let replies = self
                        .node
                        .db
                        .query(
                            &EventFilter::new()
                                .kind(kinds::TEXT_NOTE)
                                .tag('p', &owner_hex)
                                .limit(fetch * 2),
                        )
                        .await
                        .unwrap_or_default();
                    let mut replies: Vec<Event> = replies
                        .into_iter()
                        .filter(|event| event.pubkey != self.config.owner)
                        .filter(|event| refs::thread_refs(event).is_some())
                        .collect();
                    if self.config.inbox.group_by_thread {
                        // Keep threads together: order by root id, then
                        // time within the thread.
                        replies.sort_by_key(|event| {
                            let root = refs::thread_refs(event)
                                .and_then(|thread| thread.root)
                                .unwrap_or(event.id);
                            (root, event.created_at.as_u64())
                        });
                    }
                    replies
                }
            }
            Feed::Mentions => {
                let inbox = &self.config.inbox;
                let mut mention_kinds = vec![kinds::TEXT_NOTE, kinds::REPOST, kinds::LONG_FORM];
                if inbox.include_reactions {
                    mention_kinds.push(kinds::REACTION);
                }
                if inbox.include_zaps {
                    mention_kinds.push(kinds::ZAP_RECEIPT);
                }
                let mentions = self
                    .node
                    .db
                    .query(
                        &EventFilter::new()
                            .kinds(mention_kinds)
                            .tag('p', &owner_hex)
                            .limit(fetch * 2),
                    )
                    .await
                    .unwrap_or_default();
                let mut mentions: Vec<Event> = mentions
                    .into_iter()
                    .filter(|event| event.pubkey != self.config.owner)
                    .collect();
                if inbox.collapse_reposts {
                    // One repost per reposted event is plenty.
                    let mut seen_reposts = std::collections::BTreeSet::new();
                    mentions.retain(|event| {
                        if event.kind.as_u16() != kinds::REPOST {
                            return true;
                        }
                        let target = nophr_core::tag_values(event, 'e')
                            .next()
                            .unwrap_or_default()
                            .to_owned();
                        seen_reposts.insert(target)
                    });
                }
                mentions
            }
        };

        let start = (page - 1) * per_page;
        let events: Vec<Event> = events.into_iter().skip(start).take(per_page).collect();
        self.with_interactions(events).await
    }

    /// Page of an operator-defined section, optionally time-sliced.
    pub async fn section_events(
        &self,
        section: &Section,
        page: usize,
        bounds: Option<(u64, u64)>,
    ) -> Vec<EventView> {
        let per_page = section.limit.max(1);
        let fetch = page * per_page + per_page;

        let mut filter = EventFilter::new().limit(fetch);
        if !section.filters.kinds.is_empty() {
            filter = filter.kinds(section.filters.kinds.iter().copied());
        }

        let authors: Vec<String> = if !section.filters.authors.is_empty() {
            section
                .filters
                .authors
                .iter()
                .filter_map(|author| parse_author(author))
                .collect()
        } else if section.filters.scope.as_deref() == Some("graph") {
            self.node
                .db
                .graph_members(PubkeyKey::from(self.config.owner))
                .await
                .unwrap_or_default()
                .into_iter()
                .map(|(member, _)| member.to_hex())
                .collect()
        } else {
            vec![self.config.owner.to_hex()]
        };
        filter = filter.authors(authors);

        for (name, values) in &section.filters.tags {
            if let Some(letter) = single_letter(name) {
                for value in values {
                    filter = filter.tag(letter, value);
                }
            }
        }
        let since = bounds.map(|(since, _)| since).or(section.filters.since);
        let until = bounds.map(|(_, until)| until).or(section.filters.until);
        if let Some(since) = since {
            filter = filter.since(since);
        }
        if let Some(until) = until {
            filter = filter.until(until);
        }
        if let Some(limit) = section.filters.limit {
            filter = filter.limit(limit.max(fetch));
        }

        let events = self.node.db.query(&filter).await.unwrap_or_default();
        let mut views = self.with_interactions(events).await;

        match section.sort_by.as_str() {
            "interactions" | "popularity" => {
                views.sort_by_key(|view| {
                    std::cmp::Reverse(
                        view.interactions.replies
                            + view.interactions.reactions
                            + view.interactions.sats / 1_000,
                    )
                });
            }
            _ => {
                // Store order is already created_at descending.
            }
        }
        if section.sort_order == "asc" {
            views.reverse();
        }

        let start = (page - 1) * per_page;
        views.into_iter().skip(start).take(per_page).collect()
    }

    /// A single event.
    pub async fn event_by_id(&self, id: &nostr::EventId) -> Option<EventView> {
        let events = self
            .node
            .db
            .query(&EventFilter::new().id(id.to_hex()).limit(1))
            .await
            .ok()?;
        let event = events.into_iter().next()?;
        let interactions = self.interactions_for(&event.id).await;
        Some(EventView {
            event,
            interactions,
        })
    }

    /// A thread: the requested event plus replies to it, oldest first.
    pub async fn thread_view(
        &self,
        id: &nostr::EventId,
    ) -> Option<(EventView, Vec<EventView>)> {
        let root = self.event_by_id(id).await?;
        let replies = self
            .node
            .db
            .query(
                &EventFilter::new()
                    .kind(kinds::TEXT_NOTE)
                    .tag('e', id.to_hex()),
            )
            .await
            .unwrap_or_default();
        let mut replies: Vec<Event> = replies
            .into_iter()
            .filter(|event| {
                refs::thread_refs(event).is_some_and(|thread| {
                    thread.parent == *id || thread.root == Some(*id)
                })
            })
            .collect();
        replies.sort_by_key(|event| (event.created_at.as_u64(), event.id));
        Some((root, self.with_interactions(replies).await))
    }

    /// Profile fields and recent notes for an author.
    pub async fn profile_view(
        &self,
        pubkey: &PublicKey,
        recent: usize,
    ) -> (ProfileFields, Vec<EventView>) {
        let metadata = self
            .node
            .db
            .query(
                &EventFilter::new()
                    .author(pubkey.to_hex())
                    .kind(kinds::METADATA)
                    .limit(1),
            )
            .await
            .unwrap_or_default();
        let fields = metadata
            .first()
            .map(|event| ProfileFields::from_metadata_content(&event.content))
            .unwrap_or_default();

        let notes = self
            .node
            .db
            .query(
                &EventFilter::new()
                    .author(pubkey.to_hex())
                    .kind(kinds::TEXT_NOTE)
                    .limit(recent),
            )
            .await
            .unwrap_or_default();
        (fields, self.with_interactions(notes).await)
    }

    /// Sections in display order.
    pub fn ordered_sections(&self) -> Vec<(String, Section)> {
        let mut sections: Vec<(String, Section)> = self
            .config
            .layout
            .sections
            .iter()
            .map(|(name, section)| (name.clone(), section.clone()))
            .collect();
        sections.sort_by_key(|(name, section)| (section.order, name.clone()));
        sections
    }
}

fn parse_author(input: &str) -> Option<String> {
    use nostr::nips::nip19::FromBech32 as _;
    PublicKey::from_hex(input)
        .ok()
        .or_else(|| PublicKey::from_bech32(input).ok())
        .map(|pk| pk.to_hex())
}

fn single_letter(name: &str) -> Option<char> {
    let mut chars = name.trim_start_matches('#').chars();
    match (chars.next(), chars.next()) {
        (Some(letter), None) => Some(letter),
        _ => None,
    }
}
