//! Rendering: events and menus to each protocol's native text form.
//!
//! Everything here is a pure function of `(event, interactions,
//! protocol, options)`, with no storage access and no clocks. The server crate
//! owns routing and composes these pieces into responses.

pub mod gemtext;
pub mod gophermap;
pub mod markdown;
mod wrap;

use nostr::Event;

pub use self::wrap::wrap_text;

/// Which wire protocol a rendering targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Gopher,
    Gemini,
    Finger,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Gopher => "gopher",
            Protocol::Gemini => "gemini",
            Protocol::Finger => "finger",
        }
    }
}

/// Per-protocol rendering knobs, mirrored from config.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// 0 disables wrapping.
    pub max_line_length: usize,
    pub show_timestamps: bool,
    pub date_format: String,
    pub thread_indent: usize,
    pub emoji: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            max_line_length: 70,
            show_timestamps: true,
            date_format: "[year]-[month]-[day]".to_owned(),
            thread_indent: 2,
            emoji: true,
        }
    }
}

/// Interaction rollup shown under an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interactions {
    pub replies: u64,
    pub reactions: u64,
    pub sats: u64,
}

impl Interactions {
    pub fn is_empty(&self) -> bool {
        self.replies == 0 && self.reactions == 0 && self.sats == 0
    }

    fn summary(&self) -> String {
        let mut parts = Vec::new();
        if self.replies > 0 {
            parts.push(format!(
                "{} repl{}",
                self.replies,
                if self.replies == 1 { "y" } else { "ies" }
            ));
        }
        if self.reactions > 0 {
            parts.push(format!(
                "{} reaction{}",
                self.reactions,
                if self.reactions == 1 { "" } else { "s" }
            ));
        }
        if self.sats > 0 {
            parts.push(format!("{} sats", self.sats));
        }
        parts.join(", ")
    }
}

fn is_emoji(c: char) -> bool {
    matches!(
        u32::from(c),
        0x1F000..=0x1FAFF | 0x2600..=0x27BF | 0x2B00..=0x2BFF | 0xFE00..=0xFE0F | 0x200D
    )
}

/// Remove emoji for terminals that cannot render them.
pub fn strip_emoji(text: &str) -> String {
    text.chars().filter(|c| !is_emoji(*c)).collect()
}

/// Format a unix timestamp with the configured `time` format string.
///
/// Falls back to the raw number when the format string does not parse.
pub fn format_timestamp(timestamp: u64, format: &str) -> String {
    let Ok(parsed) = time::format_description::parse(format) else {
        return timestamp.to_string();
    };
    time::OffsetDateTime::from_unix_timestamp(timestamp as i64)
        .ok()
        .and_then(|dt| dt.format(&parsed).ok())
        .unwrap_or_else(|| timestamp.to_string())
}

/// Strip markdown and collapse whitespace into a one-line summary.
pub fn summary_line(event: &Event, max_len: usize) -> String {
    let plain = markdown::to_plain(&event.content, 0);
    let mut line: String = plain
        .lines
        .iter()
        .flat_map(|line| line.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ");
    if max_len > 0 && line.chars().count() > max_len {
        line = line.chars().take(max_len.saturating_sub(1)).collect();
        line.push('…');
    }
    line
}

/// Render a full event as plain text (gopher text views and finger).
pub fn event_to_plain(
    event: &Event,
    interactions: Interactions,
    opts: &RenderOptions,
) -> String {
    let mut out = String::new();

    if opts.show_timestamps {
        out.push_str(&format_timestamp(
            event.created_at.as_u64(),
            &opts.date_format,
        ));
        out.push('\n');
        out.push('\n');
    }

    let content = if opts.emoji {
        event.content.clone()
    } else {
        strip_emoji(&event.content)
    };
    let plain = markdown::to_plain(&content, opts.max_line_length);
    for line in &plain.lines {
        out.push_str(line);
        out.push('\n');
    }
    if !plain.links.is_empty() {
        out.push('\n');
        for (i, link) in plain.links.iter().enumerate() {
            out.push_str(&format!("[{}] {}\n", i + 1, link));
        }
    }

    if !interactions.is_empty() {
        out.push('\n');
        out.push_str(&interactions.summary());
        out.push('\n');
    }

    out
}

/// Render a full event as a gemtext body fragment.
pub fn event_to_gemtext(
    event: &Event,
    interactions: Interactions,
    opts: &RenderOptions,
) -> String {
    let mut out = String::new();

    if opts.show_timestamps {
        out.push_str(&format_timestamp(
            event.created_at.as_u64(),
            &opts.date_format,
        ));
        out.push('\n');
        out.push('\n');
    }

    let content = if opts.emoji {
        event.content.clone()
    } else {
        strip_emoji(&event.content)
    };
    out.push_str(&markdown::to_gemtext(&content));

    if !interactions.is_empty() {
        out.push('\n');
        out.push_str(&interactions.summary());
        out.push('\n');
    }

    out
}

/// Owner profile fields pulled from a kind-0 event's JSON content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileFields {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub about: Option<String>,
    pub website: Option<String>,
    pub lud16: Option<String>,
    pub nip05: Option<String>,
}

impl ProfileFields {
    /// Parse kind-0 content; malformed JSON yields the empty profile.
    pub fn from_metadata_content(content: &str) -> Self {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(content) else {
            return Self::default();
        };
        let get = |key: &str| {
            value
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_owned)
                .filter(|s| !s.is_empty())
        };
        Self {
            name: get("name"),
            display_name: get("display_name"),
            about: get("about"),
            website: get("website"),
            lud16: get("lud16"),
            nip05: get("nip05"),
        }
    }

    pub fn best_name(&self) -> Option<&str> {
        self.display_name.as_deref().or(self.name.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use nostr::{EventBuilder, Keys, Kind, Timestamp};

    use super::*;

    fn note(content: &str) -> Event {
        EventBuilder::new(Kind::TextNote, content, Vec::<nostr::Tag>::new())
            .custom_created_at(Timestamp::from(1_700_000_000))
            .to_event(&Keys::generate())
            .expect("signable")
    }

    #[test]
    fn timestamps_format_with_time_crate() {
        assert_eq!(
            format_timestamp(1_700_000_000, "[year]-[month]-[day]"),
            "2023-11-14"
        );
        // Bad format string degrades to the raw value.
        assert_eq!(format_timestamp(12, "[badtoken"), "12");
    }

    #[test]
    fn summary_is_one_line_and_capped() {
        let event = note("# Title\n\nA first paragraph\nwith a soft break.");
        let summary = summary_line(&event, 20);
        assert!(!summary.contains('\n'));
        assert!(summary.chars().count() <= 20);
        assert!(summary.ends_with('…'));
    }

    #[test]
    fn plain_event_carries_interactions_line() {
        let event = note("hello [world](https://example.org)");
        let rendered = event_to_plain(
            &event,
            Interactions {
                replies: 1,
                reactions: 2,
                sats: 21,
            },
            &RenderOptions::default(),
        );
        assert!(rendered.contains("2023-11-14"));
        assert!(rendered.contains("hello world[1]"));
        assert!(rendered.contains("[1] https://example.org"));
        assert!(rendered.contains("1 reply, 2 reactions, 21 sats"));
    }

    #[test]
    fn emoji_stripping_is_optional() {
        let event = note("fire 🔥 content");
        let with = event_to_plain(&event, Interactions::default(), &RenderOptions::default());
        assert!(with.contains('🔥'));
        let without = event_to_plain(
            &event,
            Interactions::default(),
            &RenderOptions {
                emoji: false,
                ..RenderOptions::default()
            },
        );
        assert!(!without.contains('🔥'));
        assert!(without.contains("fire"));
    }

    #[test]
    fn profile_fields_parse_kind0_content() {
        let fields = ProfileFields::from_metadata_content(
            r#"{"name":"op","about":"gateway operator","display_name":""}"#,
        );
        assert_eq!(fields.best_name(), Some("op"));
        assert_eq!(fields.about.as_deref(), Some("gateway operator"));
        assert_eq!(ProfileFields::from_metadata_content("not json"), ProfileFields::default());
    }
}
