//! The standard Nostr filter shape (NIP-01).
//!
//! Serialized form uses `#`-prefixed keys for tag constraints
//! (`{"#e": ["…"]}`); the in-memory form keys tags by their single
//! letter. Matching treats every present field as a conjunct.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use nostr::Event;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::tag_fields;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub ids: Option<BTreeSet<String>>,
    pub authors: Option<BTreeSet<String>>,
    pub kinds: Option<BTreeSet<u16>>,
    pub tags: BTreeMap<char, BTreeSet<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl fmt::Display) -> Self {
        self.ids
            .get_or_insert_with(BTreeSet::new)
            .insert(id.to_string());
        self
    }

    pub fn author(mut self, author: impl fmt::Display) -> Self {
        self.authors
            .get_or_insert_with(BTreeSet::new)
            .insert(author.to_string());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: fmt::Display,
    {
        let set = self.authors.get_or_insert_with(BTreeSet::new);
        for author in authors {
            set.insert(author.to_string());
        }
        self
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.get_or_insert_with(BTreeSet::new).insert(kind);
        self
    }

    pub fn kinds<I: IntoIterator<Item = u16>>(mut self, kinds: I) -> Self {
        self.kinds.get_or_insert_with(BTreeSet::new).extend(kinds);
        self
    }

    pub fn tag(mut self, letter: char, value: impl fmt::Display) -> Self {
        self.tags
            .entry(letter)
            .or_default()
            .insert(value.to_string());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether the event satisfies every present constraint.
    ///
    /// `limit` is a result-count bound, not a per-event predicate, and is
    /// ignored here.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id.to_hex()) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey.to_hex()) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind.as_u16()) {
                return false;
            }
        }
        let created_at = event.created_at.as_u64();
        if let Some(since) = self.since {
            if created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if until < created_at {
                return false;
            }
        }
        for (letter, wanted) in &self.tags {
            let name = letter.to_string();
            let found = event.tags.iter().any(|tag| {
                let fields = tag_fields(tag);
                fields.first().map(String::as_str) == Some(name.as_str())
                    && fields
                        .get(1)
                        .is_some_and(|value| wanted.contains(value.as_str()))
            });
            if !found {
                return false;
            }
        }
        true
    }
}

impl Serialize for EventFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(ids) = &self.ids {
            map.serialize_entry("ids", ids)?;
        }
        if let Some(authors) = &self.authors {
            map.serialize_entry("authors", authors)?;
        }
        if let Some(kinds) = &self.kinds {
            map.serialize_entry("kinds", kinds)?;
        }
        for (letter, values) in &self.tags {
            map.serialize_entry(&format!("#{letter}"), values)?;
        }
        if let Some(since) = self.since {
            map.serialize_entry("since", &since)?;
        }
        if let Some(until) = self.until {
            map.serialize_entry("until", &until)?;
        }
        if let Some(limit) = self.limit {
            map.serialize_entry("limit", &limit)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for EventFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FilterVisitor;

        impl<'de> Visitor<'de> for FilterVisitor {
            type Value = EventFilter;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a Nostr filter object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut filter = EventFilter::default();
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "ids" => filter.ids = Some(map.next_value()?),
                        "authors" => filter.authors = Some(map.next_value()?),
                        "kinds" => filter.kinds = Some(map.next_value()?),
                        "since" => filter.since = Some(map.next_value()?),
                        "until" => filter.until = Some(map.next_value()?),
                        "limit" => filter.limit = Some(map.next_value()?),
                        tag if tag.starts_with('#') => {
                            let mut chars = tag.chars();
                            chars.next();
                            match (chars.next(), chars.next()) {
                                (Some(letter), None) => {
                                    filter.tags.insert(letter, map.next_value()?);
                                }
                                _ => {
                                    let _: serde::de::IgnoredAny = map.next_value()?;
                                }
                            }
                        }
                        _ => {
                            let _: serde::de::IgnoredAny = map.next_value()?;
                        }
                    }
                }
                Ok(filter)
            }
        }

        deserializer.deserialize_map(FilterVisitor)
    }
}

#[cfg(test)]
mod tests {
    use nostr::{EventBuilder, Keys, Kind, Tag, Timestamp};

    use super::*;

    fn note(keys: &Keys, created_at: u64, tags: Vec<Tag>) -> Event {
        EventBuilder::new(Kind::TextNote, "hello", tags)
            .custom_created_at(Timestamp::from(created_at))
            .to_event(keys)
            .expect("signable")
    }

    #[test]
    fn serializes_with_hash_tag_keys() {
        let filter = EventFilter::new()
            .kind(1)
            .tag('e', "abcd")
            .since(10)
            .limit(5);
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kinds": [1], "#e": ["abcd"], "since": 10, "limit": 5})
        );

        let back: EventFilter = serde_json::from_value(json).unwrap();
        assert_eq!(back, filter);
    }

    #[test]
    fn matches_conjunction_of_fields() {
        let keys = Keys::generate();
        let target = Keys::generate().public_key();
        let event = note(
            &keys,
            100,
            vec![Tag::parse(&["p", &target.to_hex()]).unwrap()],
        );

        assert!(EventFilter::new().kind(1).matches(&event));
        assert!(EventFilter::new()
            .author(keys.public_key().to_hex())
            .since(100)
            .until(100)
            .matches(&event));
        assert!(EventFilter::new().tag('p', target.to_hex()).matches(&event));

        assert!(!EventFilter::new().kind(7).matches(&event));
        assert!(!EventFilter::new().since(101).matches(&event));
        assert!(!EventFilter::new().until(99).matches(&event));
        assert!(!EventFilter::new().tag('e', "00").matches(&event));
        assert!(!EventFilter::new()
            .author(Keys::generate().public_key().to_hex())
            .matches(&event));
    }
}
