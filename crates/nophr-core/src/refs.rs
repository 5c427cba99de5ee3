//! Reference extraction from event tags.
//!
//! The aggregation subsystem only ever sees events through these
//! functions: which earlier event a note replies to (NIP-10), which
//! event a reaction targets, and what a zap receipt pays for and how
//! much.

use nostr::{Event, EventId, PublicKey};

use crate::{kinds, tag_fields, tag_values};

/// Thread position of a reply per NIP-10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRefs {
    /// Root of the thread, when distinguishable from the parent.
    pub root: Option<EventId>,
    /// Direct parent being replied to.
    pub parent: EventId,
}

/// Resolve NIP-10 threading for a kind-1 event.
///
/// Marked form: the `e`-tag with marker `"reply"` names the parent; with
/// only a `"root"` marker, root is also the parent. `"mention"` tags do
/// not participate. Positional form (no markers anywhere): the last
/// `e`-tag is the parent, the first is the root.
pub fn thread_refs(event: &Event) -> Option<ThreadRefs> {
    if event.kind.as_u16() != kinds::TEXT_NOTE {
        return None;
    }

    let e_tags: Vec<&[String]> = event
        .tags
        .iter()
        .map(tag_fields)
        .filter(|fields| fields.first().map(String::as_str) == Some("e"))
        .collect();
    if e_tags.is_empty() {
        return None;
    }

    fn marker_of(fields: &[String]) -> Option<&str> {
        fields.get(3).map(String::as_str)
    }
    let id_of = |fields: &[String]| fields.get(1).and_then(|id| EventId::from_hex(id).ok());

    let any_marked = e_tags.iter().any(|fields| {
        matches!(marker_of(fields), Some("reply") | Some("root") | Some("mention"))
    });

    if any_marked {
        let root = e_tags
            .iter()
            .find(|fields| marker_of(fields) == Some("root"))
            .and_then(|fields| id_of(fields));
        let reply = e_tags
            .iter()
            .find(|fields| marker_of(fields) == Some("reply"))
            .and_then(|fields| id_of(fields));
        match (reply, root) {
            (Some(parent), root) => Some(ThreadRefs { root, parent }),
            (None, Some(parent)) => Some(ThreadRefs {
                root: Some(parent),
                parent,
            }),
            (None, None) => None,
        }
    } else {
        let parent = id_of(e_tags.last()?)?;
        let root = if e_tags.len() > 1 {
            id_of(e_tags.first()?)
        } else {
            Some(parent)
        };
        Some(ThreadRefs { root, parent })
    }
}

/// Target of a kind-7 reaction: the last `e`-tag.
pub fn reaction_target(event: &Event) -> Option<EventId> {
    if event.kind.as_u16() != kinds::REACTION {
        return None;
    }
    tag_values(event, 'e')
        .last()
        .and_then(|id| EventId::from_hex(id).ok())
}

/// The reaction token, normalized: empty and `"+"` are the implicit like.
pub fn reaction_token(event: &Event) -> String {
    let content = event.content.trim();
    if content.is_empty() {
        "+".to_owned()
    } else {
        content.to_owned()
    }
}

/// Parsed kind-9735 zap receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZapReceipt {
    /// The zapped event, when the receipt carries an `e`-tag.
    pub target: Option<EventId>,
    /// Zapped pubkey (`p`-tag).
    pub recipient: Option<PublicKey>,
    /// Amount in sats from the bolt11 invoice.
    pub amount_sats: u64,
}

/// Parse a zap receipt, reading the amount from the `bolt11` tag or,
/// failing that, from an invoice embedded in the `description` tag.
pub fn zap_receipt(event: &Event) -> Option<ZapReceipt> {
    if event.kind.as_u16() != kinds::ZAP_RECEIPT {
        return None;
    }

    let tag_value = |name: &str| {
        event.tags.iter().map(tag_fields).find_map(|fields| {
            if fields.first().map(String::as_str) == Some(name) {
                fields.get(1).cloned()
            } else {
                None
            }
        })
    };

    let msats = tag_value("bolt11")
        .and_then(|invoice| bolt11_amount_msats(&invoice))
        .or_else(|| {
            let description = tag_value("description")?;
            let request: serde_json::Value = serde_json::from_str(&description).ok()?;
            let invoice = request.get("bolt11")?.as_str()?;
            bolt11_amount_msats(invoice)
        })?;

    Some(ZapReceipt {
        target: tag_values(event, 'e')
            .next()
            .and_then(|id| EventId::from_hex(id).ok()),
        recipient: tag_values(event, 'p')
            .next()
            .and_then(|pk| PublicKey::from_hex(pk).ok()),
        amount_sats: msats / 1000,
    })
}

/// Amount in millisats encoded in a bolt11 invoice's human-readable part.
///
/// `lnbc<amount><multiplier>…` where the multiplier is one of
/// `m`/`u`/`n`/`p`; an absent amount yields `None`.
pub fn bolt11_amount_msats(invoice: &str) -> Option<u64> {
    let invoice = invoice.trim().to_ascii_lowercase();
    // The bech32 separator is the last '1'; the data charset excludes it.
    let hrp = &invoice[..invoice.rfind('1')?];
    let rest = hrp.strip_prefix("ln")?;

    // Strip the currency prefix: letters up to the first digit.
    let digits_start = rest.find(|c: char| c.is_ascii_digit())?;
    let amount_part = &rest[digits_start..];

    let (digits, multiplier) = match amount_part.chars().last()? {
        c @ ('m' | 'u' | 'n' | 'p') => (&amount_part[..amount_part.len() - 1], Some(c)),
        c if c.is_ascii_digit() => (amount_part, None),
        _ => return None,
    };
    let value: u64 = digits.parse().ok()?;

    // 1 BTC = 100_000_000_000 msat.
    match multiplier {
        None => value.checked_mul(100_000_000_000),
        Some('m') => value.checked_mul(100_000_000),
        Some('u') => value.checked_mul(100_000),
        Some('n') => value.checked_mul(100),
        Some('p') => {
            if value % 10 != 0 {
                None
            } else {
                Some(value / 10)
            }
        }
        Some(_) => None,
    }
}

/// Relay list entry from a kind-10002 event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayListEntry {
    pub url: String,
    pub read: bool,
    pub write: bool,
}

/// Parse the `r`-tags of a kind-10002 relay list.
///
/// A missing usage field means read+write.
pub fn relay_list(event: &Event) -> Vec<RelayListEntry> {
    if event.kind.as_u16() != kinds::RELAY_LIST {
        return Vec::new();
    }
    event
        .tags
        .iter()
        .map(tag_fields)
        .filter(|fields| fields.first().map(String::as_str) == Some("r"))
        .filter_map(|fields| {
            let url = fields.get(1)?.trim_end_matches('/').to_owned();
            let (read, write) = match fields.get(2).map(String::as_str) {
                None | Some("") => (true, true),
                Some("read") => (true, false),
                Some("write") => (false, true),
                Some(_) => return None,
            };
            Some(RelayListEntry { url, read, write })
        })
        .collect()
}

/// Followed pubkeys from a kind-3 contact list, in tag order.
pub fn contact_list(event: &Event) -> Vec<PublicKey> {
    if event.kind.as_u16() != kinds::CONTACTS {
        return Vec::new();
    }
    tag_values(event, 'p')
        .filter_map(|pk| PublicKey::from_hex(pk).ok())
        .collect()
}

/// The event another event refers to for aggregation purposes, if any.
pub fn aggregation_target(event: &Event) -> Option<EventId> {
    match event.kind.as_u16() {
        kinds::TEXT_NOTE => thread_refs(event).map(|refs| refs.parent),
        kinds::REACTION => reaction_target(event),
        kinds::ZAP_RECEIPT => zap_receipt(event).and_then(|zap| zap.target),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use nostr::{EventBuilder, Keys, Kind, Tag};

    use super::*;

    fn tag(parts: &[&str]) -> Tag {
        Tag::parse(parts).expect("valid tag")
    }

    fn signed(kind: u16, content: &str, tags: Vec<Tag>) -> Event {
        EventBuilder::new(Kind::from(kind), content, tags)
            .to_event(&Keys::generate())
            .expect("signable")
    }

    fn hex_id(byte: u8) -> String {
        EventId::from_slice(&[byte; 32]).unwrap().to_hex()
    }

    #[test]
    fn marked_reply_wins_over_root() {
        let root = hex_id(1);
        let parent = hex_id(2);
        let event = signed(
            1,
            "reply",
            vec![
                tag(&["e", &root, "", "root"]),
                tag(&["e", &parent, "", "reply"]),
            ],
        );
        let refs = thread_refs(&event).unwrap();
        assert_eq!(refs.parent.to_hex(), parent);
        assert_eq!(refs.root.unwrap().to_hex(), root);
    }

    #[test]
    fn root_only_marker_is_parent() {
        let root = hex_id(1);
        let event = signed(1, "reply", vec![tag(&["e", &root, "", "root"])]);
        let refs = thread_refs(&event).unwrap();
        assert_eq!(refs.parent.to_hex(), root);
        assert_eq!(refs.root.unwrap().to_hex(), root);
    }

    #[test]
    fn positional_last_is_parent_first_is_root() {
        let root = hex_id(1);
        let mid = hex_id(2);
        let parent = hex_id(3);
        let event = signed(
            1,
            "reply",
            vec![tag(&["e", &root]), tag(&["e", &mid]), tag(&["e", &parent])],
        );
        let refs = thread_refs(&event).unwrap();
        assert_eq!(refs.parent.to_hex(), parent);
        assert_eq!(refs.root.unwrap().to_hex(), root);
    }

    #[test]
    fn mention_markers_are_ignored() {
        let mentioned = hex_id(9);
        let event = signed(1, "see this", vec![tag(&["e", &mentioned, "", "mention"])]);
        assert_eq!(thread_refs(&event), None);
    }

    #[test]
    fn reaction_targets_last_e_tag() {
        let first = hex_id(1);
        let last = hex_id(2);
        let event = signed(7, "+", vec![tag(&["e", &first]), tag(&["e", &last])]);
        assert_eq!(reaction_target(&event).unwrap().to_hex(), last);
        assert_eq!(reaction_token(&event), "+");
    }

    #[test]
    fn empty_reaction_content_is_a_like() {
        let event = signed(7, "", vec![tag(&["e", &hex_id(1)])]);
        assert_eq!(reaction_token(&event), "+");
    }

    #[test]
    fn bolt11_amounts() {
        assert_eq!(bolt11_amount_msats("lnbc1u1pabcdef"), Some(100_000));
        assert_eq!(bolt11_amount_msats("lnbc2500u1pabcdef"), Some(250_000_000));
        assert_eq!(bolt11_amount_msats("lnbc1m1pabcdef"), Some(100_000_000));
        assert_eq!(bolt11_amount_msats("lnbc10n1pabcdef"), Some(1_000));
        assert_eq!(bolt11_amount_msats("lnbc100p1pabcdef"), Some(10));
        // Sub-msat precision is not representable.
        assert_eq!(bolt11_amount_msats("lnbc101p1pabcdef"), None);
        // Amountless invoice.
        assert_eq!(bolt11_amount_msats("lnbc1pabcdef"), None);
        assert_eq!(bolt11_amount_msats("nonsense"), None);
    }

    #[test]
    fn zap_receipt_amount_from_bolt11_tag() {
        let target = hex_id(4);
        let event = signed(
            9735,
            "",
            vec![
                tag(&["e", &target]),
                tag(&["bolt11", "lnbc210n1pabcdef"]),
            ],
        );
        let zap = zap_receipt(&event).unwrap();
        assert_eq!(zap.target.unwrap().to_hex(), target);
        assert_eq!(zap.amount_sats, 21);
    }

    #[test]
    fn relay_list_usage_parsing() {
        let event = signed(
            10002,
            "",
            vec![
                tag(&["r", "wss://relay.one"]),
                tag(&["r", "wss://relay.two", "read"]),
                tag(&["r", "wss://relay.three", "write"]),
            ],
        );
        let entries = relay_list(&event);
        assert_eq!(entries.len(), 3);
        assert!(entries[0].read && entries[0].write);
        assert!(entries[1].read && !entries[1].write);
        assert!(!entries[2].read && entries[2].write);
    }
}
