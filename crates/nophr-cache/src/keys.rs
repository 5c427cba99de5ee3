//! Cache key grammar and invalidation derivation.
//!
//! Keys are colon-delimited; anything longer than 200 bytes collapses
//! to a fingerprint so backends with key-length limits stay happy.
//!
//! ```text
//! gopher:<selector>
//! gemini:<path>[:q:<query>]
//! finger:<user>
//! event:<id>:<protocol>:<variant>
//! section:<name>:<protocol>:p<n>
//! thread:<root_id>:<protocol>
//! profile:<pubkey>:<protocol>
//! aggregate:<event_id>
//! kind0:<pubkey>
//! kind3:<pubkey>
//! ```

use std::hash::{Hash as _, Hasher as _};

use nostr::Event;

use nophr_core::{kinds, refs};

const MAX_KEY_LEN: usize = 200;

/// Collapse over-long keys to a stable fingerprint.
pub fn normalize(key: String) -> String {
    if key.len() <= MAX_KEY_LEN {
        return key;
    }
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    let prefix: String = key.chars().take(32).collect();
    format!("h:{prefix}:{:016x}:{}", hasher.finish(), key.len())
}

pub fn gopher(selector: &str) -> String {
    normalize(format!("gopher:{selector}"))
}

pub fn gemini(path: &str, query: Option<&str>) -> String {
    normalize(match query {
        Some(query) => format!("gemini:{path}:q:{query}"),
        None => format!("gemini:{path}"),
    })
}

pub fn finger(user: &str) -> String {
    normalize(format!("finger:{user}"))
}

pub fn event(id: &str, protocol: &str, variant: &str) -> String {
    normalize(format!("event:{id}:{protocol}:{variant}"))
}

pub fn section(name: &str, protocol: &str, page: usize) -> String {
    normalize(format!("section:{name}:{protocol}:p{page}"))
}

pub fn thread(root_id: &str, protocol: &str) -> String {
    normalize(format!("thread:{root_id}:{protocol}"))
}

pub fn profile(pubkey: &str, protocol: &str) -> String {
    normalize(format!("profile:{pubkey}:{protocol}"))
}

pub fn aggregate(event_id: &str) -> String {
    normalize(format!("aggregate:{event_id}"))
}

pub fn kind0(pubkey: &str) -> String {
    normalize(format!("kind0:{pubkey}"))
}

pub fn kind3(pubkey: &str) -> String {
    normalize(format!("kind3:{pubkey}"))
}

/// Patterns invalidated by ingesting `event`.
///
/// `popularity_sections` lists section names whose ordering depends on
/// interaction counts; reactions and zaps must flush their pages.
pub fn invalidation_patterns(event: &Event, popularity_sections: &[String]) -> Vec<String> {
    let id = event.id.to_hex();
    let pubkey = event.pubkey.to_hex();
    let mut patterns = vec![format!("event:{id}:*"), aggregate(&id)];

    match event.kind.as_u16() {
        kinds::METADATA => {
            patterns.push(kind0(&pubkey));
            patterns.push(format!("profile:{pubkey}:*"));
        }
        kinds::TEXT_NOTE => {
            patterns.push("section:notes:*".to_owned());
            if let Some(thread_refs) = refs::thread_refs(event) {
                let parent = thread_refs.parent.to_hex();
                patterns.push(aggregate(&parent));
                patterns.push(format!("thread:{parent}:*"));
                if let Some(root) = thread_refs.root {
                    let root = root.to_hex();
                    if root != parent {
                        patterns.push(format!("thread:{root}:*"));
                    }
                }
            }
        }
        kinds::CONTACTS => {
            patterns.push(kind3(&pubkey));
            patterns.push("section:*".to_owned());
        }
        kinds::REACTION => {
            if let Some(target) = refs::reaction_target(event) {
                patterns.push(aggregate(&target.to_hex()));
            }
            for name in popularity_sections {
                patterns.push(format!("section:{name}:*"));
            }
        }
        kinds::ZAP_RECEIPT => {
            if let Some(target) = refs::zap_receipt(event).and_then(|zap| zap.target) {
                patterns.push(aggregate(&target.to_hex()));
            }
            for name in popularity_sections {
                patterns.push(format!("section:{name}:*"));
            }
        }
        kinds::LONG_FORM => {
            patterns.push("section:articles:*".to_owned());
        }
        _ => {}
    }

    patterns.sort();
    patterns.dedup();
    patterns
}

#[cfg(test)]
mod tests {
    use nostr::{EventBuilder, Keys, Kind, Tag};

    use super::*;

    fn signed(kind: u16, content: &str, tags: Vec<Tag>) -> Event {
        EventBuilder::new(Kind::from(kind), content, tags)
            .to_event(&Keys::generate())
            .expect("signable")
    }

    #[test]
    fn long_keys_are_fingerprinted() {
        let short = normalize("gopher:/notes".to_owned());
        assert_eq!(short, "gopher:/notes");

        let long = normalize(format!("gemini:{}", "x".repeat(300)));
        assert!(long.len() < 300);
        assert!(long.starts_with("h:"));
        // Stable for equal inputs.
        assert_eq!(long, normalize(format!("gemini:{}", "x".repeat(300))));
    }

    #[test]
    fn kind0_invalidates_profile_keys() {
        let event = signed(0, "{}", vec![]);
        let pubkey = event.pubkey.to_hex();
        let patterns = invalidation_patterns(&event, &[]);
        assert!(patterns.contains(&format!("event:{}:*", event.id.to_hex())));
        assert!(patterns.contains(&format!("aggregate:{}", event.id.to_hex())));
        assert!(patterns.contains(&format!("kind0:{pubkey}")));
        assert!(patterns.contains(&format!("profile:{pubkey}:*")));
    }

    #[test]
    fn reply_invalidates_parent_aggregate_and_thread() {
        let parent_hex = "2222222222222222222222222222222222222222222222222222222222222222";
        let event = signed(
            1,
            "re",
            vec![Tag::parse(&["e", parent_hex, "", "reply"]).unwrap()],
        );
        let patterns = invalidation_patterns(&event, &[]);
        assert!(patterns.contains(&"section:notes:*".to_owned()));
        assert!(patterns.contains(&format!("aggregate:{parent_hex}")));
        assert!(patterns.contains(&format!("thread:{parent_hex}:*")));
    }

    #[test]
    fn reaction_invalidates_popularity_sections() {
        let target = "3333333333333333333333333333333333333333333333333333333333333333";
        let event = signed(7, "+", vec![Tag::parse(&["e", target]).unwrap()]);
        let patterns = invalidation_patterns(&event, &["hot".to_owned()]);
        assert!(patterns.contains(&format!("aggregate:{target}")));
        assert!(patterns.contains(&"section:hot:*".to_owned()));
    }

    #[test]
    fn contact_list_invalidates_graph_sections() {
        let event = signed(3, "", vec![]);
        let patterns = invalidation_patterns(&event, &[]);
        assert!(patterns.contains(&format!("kind3:{}", event.pubkey.to_hex())));
        assert!(patterns.contains(&"section:*".to_owned()));
    }
}
