//! NIP-11 relay information probe.
//!
//! Fetched over HTTP with `Accept: application/nostr+json`, cached in
//! the relay-capability table, and re-fetched at most once per TTL.

use std::time::Duration;

use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

use nophr_db::{Database, RelayCapabilityRecord};

const LOG_TARGET: &str = "nophr::nip11";

/// NIP-77 advertises negentropy sync support.
const NEGENTROPY_NIP: u16 = 77;

pub const PROBE_TTL: Duration = Duration::from_secs(6 * 3600);

#[derive(Debug, Snafu)]
pub enum Nip11Error {
    #[snafu(display("Relay url {url} is not probeable over http"))]
    BadUrl { url: String },
    #[snafu(display("NIP-11 request failed: {source}"))]
    Request { source: reqwest::Error },
    #[snafu(display("NIP-11 document does not parse: {source}"))]
    Document { source: reqwest::Error },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayInformation {
    pub name: Option<String>,
    pub description: Option<String>,
    pub software: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub supported_nips: Vec<u16>,
}

impl RelayInformation {
    pub fn supports_negentropy(&self) -> bool {
        self.supported_nips.contains(&NEGENTROPY_NIP)
    }
}

fn http_url(relay_url: &str) -> Option<String> {
    let url = url::Url::parse(relay_url).ok()?;
    let scheme = match url.scheme() {
        "wss" => "https",
        "ws" => "http",
        _ => return None,
    };
    let mut http = url;
    http.set_scheme(scheme).ok()?;
    Some(http.to_string())
}

pub async fn fetch_relay_information(
    relay_url: &str,
    timeout: Duration,
) -> Result<RelayInformation, Nip11Error> {
    let target = http_url(relay_url).ok_or_else(|| {
        BadUrlSnafu {
            url: relay_url.to_owned(),
        }
        .build()
    })?;
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context(RequestSnafu)?;
    let info = client
        .get(target)
        .header("Accept", "application/nostr+json")
        .send()
        .await
        .context(RequestSnafu)?
        .json::<RelayInformation>()
        .await
        .context(DocumentSnafu)?;
    Ok(info)
}

/// Probe a relay unless its cached capability record is still fresh.
///
/// Probe failures are recorded (with an empty document) so the relay is
/// not hammered; negentropy support is informational only.
pub async fn probe_if_due(db: &Database, relay_url: &str, now: u64) {
    match db.capability(relay_url).await {
        Ok(Some(record)) if now < record.check_expiry => return,
        Ok(_) => {}
        Err(err) => {
            debug!(target: LOG_TARGET, relay = relay_url, %err, "Capability lookup failed");
            return;
        }
    }

    let info = match fetch_relay_information(relay_url, Duration::from_secs(10)).await {
        Ok(info) => {
            debug!(
                target: LOG_TARGET,
                relay = relay_url,
                software = info.software.as_deref().unwrap_or("-"),
                negentropy = info.supports_negentropy(),
                "NIP-11 probe complete"
            );
            info
        }
        Err(err) => {
            debug!(target: LOG_TARGET, relay = relay_url, %err, "NIP-11 probe failed");
            RelayInformation::default()
        }
    };

    let record = RelayCapabilityRecord {
        supports_negentropy: info.supports_negentropy(),
        software: info.software,
        version: info.version,
        last_checked: now,
        check_expiry: now + PROBE_TTL.as_secs(),
    };
    if let Err(err) = db.upsert_capability(relay_url, record).await {
        debug!(target: LOG_TARGET, relay = relay_url, %err, "Capability upsert failed");
    }
}
