//! Shared domain primitives for nophr.
//!
//! Everything in here is a pure function of its inputs: kind
//! classification, the Nostr filter shape, reference extraction from
//! event tags, and the fixed-width key newtypes the storage layer uses.

pub mod filter;
pub mod fmt;
pub mod id;
pub mod kinds;
pub mod refs;

pub use filter::EventFilter;
pub use id::{EventIdKey, PubkeyKey};

use nostr::Tag;

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Tag fields as a plain string slice.
///
/// Single point of contact with the `nostr` tag representation.
pub fn tag_fields(tag: &Tag) -> &[String] {
    tag.as_slice()
}

/// Values of all tags with the given single-letter name.
pub fn tag_values<'e>(
    event: &'e nostr::Event,
    letter: char,
) -> impl Iterator<Item = &'e str> + 'e {
    let name = letter.to_string();
    event.tags.iter().filter_map(move |tag| {
        let fields = tag_fields(tag);
        if fields.first().map(String::as_str) == Some(name.as_str()) {
            fields.get(1).map(String::as_str)
        } else {
            None
        }
    })
}

/// The `d`-tag identifier of a parameterized-replaceable event.
///
/// Absent or empty `d`-tags are both the empty identifier.
pub fn d_tag(event: &nostr::Event) -> String {
    tag_values(event, 'd').next().unwrap_or("").to_owned()
}
