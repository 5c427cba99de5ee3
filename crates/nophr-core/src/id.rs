//! Fixed-width key newtypes used by the storage layer.
//!
//! Auxiliary tables key rows by pubkey and event id. The `nostr` types do
//! not encode with `bincode`, so the database keys are 32-byte wrappers
//! that convert losslessly in both directions.

use std::fmt;
use std::str::FromStr;

use bincode::{Decode, Encode};
use nostr::{EventId, PublicKey};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(display("Invalid 32-byte hex key: {input}"))]
pub struct KeyParseError {
    pub input: String,
}

fn decode_hex_32(s: &str) -> Result<[u8; 32], KeyParseError> {
    let err = || KeyParseError {
        input: s.to_owned(),
    };
    if s.len() != 64 {
        return Err(err());
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).map_err(|_| err())?;
    }
    Ok(out)
}

fn encode_hex_32(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

macro_rules! key_type {
    ($(#[$outer:meta])* $name:ident, $nostr_ty:ty) => {
        $(#[$outer])*
        #[derive(
            Encode,
            Decode,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
        )]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub const ZERO: Self = Self([0u8; 32]);

            pub fn to_hex(self) -> String {
                encode_hex_32(&self.0)
            }
        }

        impl From<$nostr_ty> for $name {
            fn from(value: $nostr_ty) -> Self {
                Self(value.to_bytes())
            }
        }

        impl From<&$nostr_ty> for $name {
            fn from(value: &$nostr_ty) -> Self {
                Self(value.to_bytes())
            }
        }

        impl FromStr for $name {
            type Err = KeyParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(decode_hex_32(s)?))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), &self.to_hex()[..8])
            }
        }
    };
}

key_type! {
    /// A pubkey as a storage key.
    PubkeyKey, PublicKey
}

key_type! {
    /// An event id as a storage key.
    EventIdKey, EventId
}

impl PubkeyKey {
    pub fn to_public_key(self) -> Option<PublicKey> {
        PublicKey::from_slice(&self.0).ok()
    }
}

impl EventIdKey {
    pub fn to_event_id(self) -> Option<EventId> {
        EventId::from_slice(&self.0).ok()
    }
}
