//! The selector/path algebra shared by all three protocols.
//!
//! A request path (gopher selector, gemini URL path, or finger query
//! mapped onto it) resolves to a [`Route`]. Validation happens first:
//! control characters and traversal sequences are rejected in strict
//! mode and stripped otherwise.

use nostr::nips::nip19::FromBech32 as _;
use nostr::{EventId, PublicKey};

use nophr_config::Validation;

/// Built-in feed views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    Notes,
    Articles,
    Replies,
    Mentions,
}

impl Feed {
    pub fn path(self) -> &'static str {
        match self {
            Feed::Notes => "/notes",
            Feed::Articles => "/articles",
            Feed::Replies => "/replies",
            Feed::Mentions => "/mentions",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Feed::Notes => "Notes",
            Feed::Articles => "Articles",
            Feed::Replies => "Replies",
            Feed::Mentions => "Mentions",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Root,
    Feed { feed: Feed, page: usize },
    Section { name: String, page: usize },
    Event { id: EventId },
    Thread { id: EventId },
    Profile { pubkey: PublicKey },
    Archive {
        section: String,
        year: i32,
        month: Option<u8>,
        day: Option<u8>,
    },
    Diagnostics,
    /// A legacy alias; gemini answers with a redirect to `canonical`.
    Legacy {
        target: Box<Route>,
        canonical: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    /// Malformed input (control bytes, traversal, over-long).
    Invalid,
    /// Well-formed but matching nothing.
    NotFound,
}

/// Apply the input validation policy to a raw path.
///
/// Strict mode rejects; lenient mode strips the offending bytes.
pub fn validate_path(raw: &str, validation: &Validation) -> Result<String, RouteError> {
    if !validation.enabled {
        return Ok(raw.to_owned());
    }
    if validation.max_path_length < raw.len() {
        return Err(RouteError::Invalid);
    }
    let has_control = raw.contains(['\r', '\n', '\0']);
    let has_traversal = raw.contains("../") || raw.ends_with("..");
    if validation.strict_mode {
        if has_control || has_traversal {
            return Err(RouteError::Invalid);
        }
        return Ok(raw.to_owned());
    }
    let mut cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '\r' | '\n' | '\0'))
        .collect();
    while cleaned.contains("../") {
        cleaned = cleaned.replace("../", "");
    }
    Ok(cleaned)
}

fn parse_page(segment: Option<&str>) -> Result<usize, RouteError> {
    match segment {
        None => Ok(1),
        Some(segment) => segment
            .parse::<usize>()
            .ok()
            .filter(|page| (1..=10_000).contains(page))
            .ok_or(RouteError::NotFound),
    }
}

fn parse_event_id(segment: &str) -> Result<EventId, RouteError> {
    EventId::from_hex(segment)
        .ok()
        .or_else(|| EventId::from_bech32(segment).ok())
        .ok_or(RouteError::NotFound)
}

fn parse_pubkey(segment: &str) -> Result<PublicKey, RouteError> {
    PublicKey::from_hex(segment)
        .ok()
        .or_else(|| PublicKey::from_bech32(segment).ok())
        .ok_or(RouteError::NotFound)
}

/// Resolve a validated path to a route.
pub fn resolve(path: &str, validation: &Validation) -> Result<Route, RouteError> {
    let path = validate_path(path, validation)?;
    let trimmed = path.trim();
    let trimmed = trimmed.trim_end_matches('/');

    if trimmed.is_empty() || trimmed == "/" {
        return Ok(Route::Root);
    }

    let segments: Vec<&str> = trimmed.trim_start_matches('/').split('/').collect();
    match segments.as_slice() {
        ["notes", rest @ ..] => Ok(Route::Feed {
            feed: Feed::Notes,
            page: parse_page(rest.first().copied())?,
        }),
        ["articles", rest @ ..] => Ok(Route::Feed {
            feed: Feed::Articles,
            page: parse_page(rest.first().copied())?,
        }),
        ["replies", rest @ ..] => Ok(Route::Feed {
            feed: Feed::Replies,
            page: parse_page(rest.first().copied())?,
        }),
        ["mentions", rest @ ..] => Ok(Route::Feed {
            feed: Feed::Mentions,
            page: parse_page(rest.first().copied())?,
        }),
        // Older deployments used /outbox for the notes feed.
        ["outbox", rest @ ..] => Ok(Route::Legacy {
            target: Box::new(Route::Feed {
                feed: Feed::Notes,
                page: parse_page(rest.first().copied())?,
            }),
            canonical: "/notes",
        }),
        ["section", name] => Ok(Route::Section {
            name: (*name).to_owned(),
            page: 1,
        }),
        ["section", name, page] => Ok(Route::Section {
            name: (*name).to_owned(),
            page: parse_page(Some(page))?,
        }),
        ["event", id] => Ok(Route::Event {
            id: parse_event_id(id)?,
        }),
        ["thread", id] => Ok(Route::Thread {
            id: parse_event_id(id)?,
        }),
        ["profile", pubkey] => Ok(Route::Profile {
            pubkey: parse_pubkey(pubkey)?,
        }),
        ["archive", section, year] => Ok(Route::Archive {
            section: (*section).to_owned(),
            year: year.parse().map_err(|_| RouteError::NotFound)?,
            month: None,
            day: None,
        }),
        ["archive", section, year, month] => Ok(Route::Archive {
            section: (*section).to_owned(),
            year: year.parse().map_err(|_| RouteError::NotFound)?,
            month: Some(parse_unit(month, 1..=12)?),
            day: None,
        }),
        ["archive", section, year, month, day] => Ok(Route::Archive {
            section: (*section).to_owned(),
            year: year.parse().map_err(|_| RouteError::NotFound)?,
            month: Some(parse_unit(month, 1..=12)?),
            day: Some(parse_unit(day, 1..=31)?),
        }),
        ["diagnostics"] => Ok(Route::Diagnostics),
        _ => Err(RouteError::NotFound),
    }
}

fn parse_unit(
    segment: &str,
    range: std::ops::RangeInclusive<u8>,
) -> Result<u8, RouteError> {
    segment
        .parse::<u8>()
        .ok()
        .filter(|unit| range.contains(unit))
        .ok_or(RouteError::NotFound)
}

/// UTC bounds `[since, until]` for an archive slice.
pub fn archive_bounds(year: i32, month: Option<u8>, day: Option<u8>) -> Option<(u64, u64)> {
    use time::{Date, Month};

    let start_month = Month::try_from(month.unwrap_or(1)).ok()?;
    let start = Date::from_calendar_date(year, start_month, day.unwrap_or(1)).ok()?;
    let end = match (month, day) {
        (Some(_), Some(_)) => start.next_day()?,
        (Some(m), None) => {
            let next_month = Month::try_from(m).ok()?.next();
            let next_year = if next_month == Month::January {
                year + 1
            } else {
                year
            };
            Date::from_calendar_date(next_year, next_month, 1).ok()?
        }
        _ => Date::from_calendar_date(year + 1, Month::January, 1).ok()?,
    };

    let to_unix = |date: Date| date.midnight().assume_utc().unix_timestamp();
    let since = to_unix(start);
    let until = to_unix(end) - 1;
    if since < 0 || until < since {
        return None;
    }
    Some((since as u64, until as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict() -> Validation {
        Validation::default()
    }

    fn lenient() -> Validation {
        Validation {
            strict_mode: false,
            ..Validation::default()
        }
    }

    #[test]
    fn resolves_core_routes() {
        assert_eq!(resolve("/", &strict()), Ok(Route::Root));
        assert_eq!(resolve("", &strict()), Ok(Route::Root));
        assert_eq!(
            resolve("/notes", &strict()),
            Ok(Route::Feed {
                feed: Feed::Notes,
                page: 1
            })
        );
        assert_eq!(
            resolve("/section/links/3", &strict()),
            Ok(Route::Section {
                name: "links".to_owned(),
                page: 3
            })
        );
        assert_eq!(resolve("/diagnostics", &strict()), Ok(Route::Diagnostics));
        assert_eq!(
            resolve("/archive/notes/2024/02", &strict()),
            Ok(Route::Archive {
                section: "notes".to_owned(),
                year: 2024,
                month: Some(2),
                day: None,
            })
        );
    }

    #[test]
    fn legacy_outbox_maps_to_notes() {
        match resolve("/outbox", &strict()) {
            Ok(Route::Legacy { target, canonical }) => {
                assert_eq!(canonical, "/notes");
                assert_eq!(
                    *target,
                    Route::Feed {
                        feed: Feed::Notes,
                        page: 1
                    }
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn ids_accept_hex_and_bech32() {
        let hex = "5c83da77af1dec6d7289834998ad7aafbd9e2191396d75ec3cc27f5a77226f36";
        match resolve(&format!("/event/{hex}"), &strict()) {
            Ok(Route::Event { id }) => assert_eq!(id.to_hex(), hex),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(resolve("/event/zzzz", &strict()), Err(RouteError::NotFound));
    }

    #[test]
    fn strict_mode_rejects_malicious_input() {
        assert_eq!(
            resolve("/notes\r\n", &strict()),
            Err(RouteError::Invalid)
        );
        assert_eq!(
            resolve("/../etc/passwd", &strict()),
            Err(RouteError::Invalid)
        );
        assert_eq!(resolve("/notes\0", &strict()), Err(RouteError::Invalid));
        let long = format!("/{}", "a".repeat(2_000));
        assert_eq!(resolve(&long, &strict()), Err(RouteError::Invalid));
    }

    #[test]
    fn lenient_mode_sanitizes() {
        assert_eq!(
            resolve("/notes\r\n", &lenient()),
            Ok(Route::Feed {
                feed: Feed::Notes,
                page: 1
            })
        );
        // Traversal collapses away and the remainder resolves.
        assert_eq!(resolve("/../diagnostics", &lenient()), Ok(Route::Diagnostics));
    }

    #[test]
    fn unknown_selector_is_not_found() {
        assert_eq!(
            resolve("/does/not/exist", &strict()),
            Err(RouteError::NotFound)
        );
    }

    #[test]
    fn archive_bounds_cover_slices() {
        let (since, until) = archive_bounds(2024, None, None).unwrap();
        assert_eq!(until - since + 1, 366 * 86_400); // leap year
        let (since, until) = archive_bounds(2024, Some(2), None).unwrap();
        assert_eq!(until - since + 1, 29 * 86_400);
        let (since, until) = archive_bounds(2024, Some(2), Some(29)).unwrap();
        assert_eq!(until - since + 1, 86_400);
        assert!(archive_bounds(2024, Some(2), Some(30)).is_none());
    }
}
