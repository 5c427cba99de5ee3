//! NIP-01 wire messages.
//!
//! Outbound frames are assembled as JSON arrays; inbound frames are
//! parsed leniently; anything unrecognized is `None` and the
//! connection keeps going.

use nostr::{Event, JsonUtil as _};
use serde_json::{json, Value};

use nophr_core::EventFilter;

/// `["REQ", <sub_id>, <filter>…]`
pub fn req_message(sub_id: &str, filters: &[EventFilter]) -> String {
    let mut frame = vec![json!("REQ"), json!(sub_id)];
    for filter in filters {
        frame.push(serde_json::to_value(filter).expect("filters serialize"));
    }
    Value::Array(frame).to_string()
}

/// `["CLOSE", <sub_id>]`
pub fn close_message(sub_id: &str) -> String {
    json!(["CLOSE", sub_id]).to_string()
}

/// Relay-to-client message types the gateway reacts to.
#[derive(Debug)]
pub enum RelayMessage {
    Event {
        sub_id: String,
        event: Box<Event>,
    },
    Eose {
        sub_id: String,
    },
    /// Terminal subscription status (auth required, rate limited, …).
    Closed {
        sub_id: String,
        message: String,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: Option<String>,
    },
    Notice {
        message: String,
    },
}

pub fn parse_relay_message(text: &str) -> Option<RelayMessage> {
    let frame: Vec<Value> = serde_json::from_str(text).ok()?;
    let kind = frame.first()?.as_str()?;
    match kind {
        "EVENT" => {
            let sub_id = frame.get(1)?.as_str()?.to_owned();
            let event = Event::from_json(frame.get(2)?.to_string()).ok()?;
            Some(RelayMessage::Event {
                sub_id,
                event: Box::new(event),
            })
        }
        "EOSE" => Some(RelayMessage::Eose {
            sub_id: frame.get(1)?.as_str()?.to_owned(),
        }),
        "CLOSED" => Some(RelayMessage::Closed {
            sub_id: frame.get(1)?.as_str()?.to_owned(),
            message: frame
                .get(2)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
        }),
        "OK" => Some(RelayMessage::Ok {
            event_id: frame.get(1)?.as_str()?.to_owned(),
            accepted: frame.get(2)?.as_bool()?,
            message: frame.get(3).and_then(Value::as_str).map(str::to_owned),
        }),
        "NOTICE" => Some(RelayMessage::Notice {
            message: frame.get(1)?.as_str()?.to_owned(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use nostr::{EventBuilder, Keys, Kind, Tag};

    use super::*;

    #[test]
    fn req_frames_include_all_filters() {
        let filters = vec![
            EventFilter::new().kind(1).limit(10),
            EventFilter::new().kind(7),
        ];
        let frame = req_message("sub-1", &filters);
        let parsed: Vec<Value> = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed.len(), 4);
        assert_eq!(parsed[0], "REQ");
        assert_eq!(parsed[1], "sub-1");
        assert_eq!(parsed[2]["kinds"][0], 1);
    }

    #[test]
    fn event_frames_roundtrip() {
        let event = EventBuilder::new(Kind::TextNote, "hi", Vec::<Tag>::new())
            .to_event(&Keys::generate())
            .unwrap();
        let frame = json!(["EVENT", "sub-1", serde_json::from_str::<Value>(&event.as_json()).unwrap()])
            .to_string();
        match parse_relay_message(&frame) {
            Some(RelayMessage::Event { sub_id, event: parsed }) => {
                assert_eq!(sub_id, "sub-1");
                assert_eq!(parsed.id, event.id);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn terminal_and_noise_frames() {
        match parse_relay_message(r#"["CLOSED","sub-1","auth-required: do auth"]"#) {
            Some(RelayMessage::Closed { sub_id, message }) => {
                assert_eq!(sub_id, "sub-1");
                assert!(message.starts_with("auth-required"));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
        assert!(parse_relay_message(r#"["EOSE","sub-1"]"#).is_some());
        assert!(parse_relay_message(r#"["NOTICE","slow down"]"#).is_some());
        assert!(parse_relay_message(r#"["AUTH","challenge"]"#).is_none());
        assert!(parse_relay_message("not json").is_none());
    }
}
