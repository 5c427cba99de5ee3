//! Configuration loading for nophr.
//!
//! A single TOML document is the config source. Loading goes through
//! three stages: parse the file into a `toml::Value`, splice in
//! `NOPHR_*` environment overrides, then deserialize and validate.
//!
//! Secrets never live in the file: the identity secret key is read only
//! from `NOPHR_NSEC`, the remote cache URL only from `NOPHR_REDIS_URL`.
//! Any other leaf can be overridden with `NOPHR_<PATH>` where path
//! segments are joined by double underscores, e.g.
//! `NOPHR_PROTOCOLS__GOPHER__PORT=7070`.

mod example;
mod model;

use std::collections::BTreeMap;
use std::path::Path;

use nostr::nips::nip19::FromBech32;
use nostr::{PublicKey, SecretKey};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tracing::warn;

pub use self::example::EXAMPLE_CONFIG;
pub use self::model::*;

const LOG_TARGET: &str = "nophr::config";

pub const ENV_PREFIX: &str = "NOPHR_";
pub const ENV_NSEC: &str = "NOPHR_NSEC";
pub const ENV_REDIS_URL: &str = "NOPHR_REDIS_URL";

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Failed to read config file {path}: {source}"))]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Config file does not parse as TOML: {source}"))]
    Parse { source: toml::de::Error },
    #[snafu(display("Config does not match the expected shape: {source}"))]
    Shape { source: toml::de::Error },
    #[snafu(display("Missing required option `{option}`"))]
    MissingOption { option: &'static str },
    #[snafu(display("Invalid value for `{option}`: {reason}"))]
    InvalidOption { option: &'static str, reason: String },
    #[snafu(display("`identity.nsec` must not be set in the config file; use {ENV_NSEC}"))]
    NsecInFile,
    #[snafu(display("`caching.redis_url` must not be set in the config file; use {ENV_REDIS_URL}"))]
    RedisUrlInFile,
    #[snafu(display("Environment override {var} is not valid TOML: {value}"))]
    EnvOverride { var: String, value: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl Config {
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Config> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).context(ReadSnafu {
            path: path.display().to_string(),
        })?;
        Self::load_with_env(&text, &collect_env_overrides(std::env::vars()))
    }

    pub fn load_str(text: &str) -> ConfigResult<Config> {
        Self::load_with_env(text, &EnvOverrides::default())
    }

    pub fn load_with_env(text: &str, env: &EnvOverrides) -> ConfigResult<Config> {
        let mut value: toml::Value = toml::from_str(text).context(ParseSnafu)?;

        for (path, override_value) in &env.overrides {
            apply_override(&mut value, path, override_value.clone());
        }

        let raw: RawConfig = value.try_into().context(ShapeSnafu)?;
        Config::validate(raw, env)
    }

    fn validate(raw: RawConfig, env: &EnvOverrides) -> ConfigResult<Config> {
        if raw.identity.nsec.is_some() {
            return NsecInFileSnafu.fail();
        }
        if raw.caching.redis_url.is_some() {
            return RedisUrlInFileSnafu.fail();
        }

        let site = Site {
            title: raw.site.title.context(MissingOptionSnafu {
                option: "site.title",
            })?,
            description: raw.site.description.context(MissingOptionSnafu {
                option: "site.description",
            })?,
            operator: raw.site.operator.context(MissingOptionSnafu {
                option: "site.operator",
            })?,
        };

        let npub = raw.identity.npub.context(MissingOptionSnafu {
            option: "identity.npub",
        })?;
        let owner = parse_pubkey(&npub).map_err(|reason| {
            InvalidOptionSnafu {
                option: "identity.npub",
                reason,
            }
            .build()
        })?;
        let nsec = env
            .nsec
            .as_deref()
            .map(|raw_nsec| {
                SecretKey::from_bech32(raw_nsec)
                    .ok()
                    .or_else(|| SecretKey::from_hex(raw_nsec).ok())
                    .ok_or_else(|| {
                        InvalidOptionSnafu {
                            option: "identity.nsec",
                            reason: "not a valid nsec".to_owned(),
                        }
                        .build()
                    })
            })
            .transpose()?;

        if raw.relays.seeds.is_empty() {
            return MissingOptionSnafu {
                option: "relays.seeds",
            }
            .fail();
        }
        for seed in &raw.relays.seeds {
            let parsed = url::Url::parse(seed).map_err(|err| {
                InvalidOptionSnafu {
                    option: "relays.seeds",
                    reason: format!("{seed}: {err}"),
                }
                .build()
            })?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                return InvalidOptionSnafu {
                    option: "relays.seeds",
                    reason: format!("{seed}: scheme must be ws:// or wss://"),
                }
                .fail();
            }
        }
        if raw.relays.policy.backoff_ms.is_empty() {
            return InvalidOptionSnafu {
                option: "relays.policy.backoff_ms",
                reason: "at least one backoff step required".to_owned(),
            }
            .fail();
        }

        let scope_mode = match raw.sync.scope.mode.as_str() {
            "self" => ScopeMode::OwnerOnly,
            "following" => ScopeMode::Following,
            "mutual" => ScopeMode::Mutual,
            "foaf" => ScopeMode::Foaf {
                depth: raw.sync.scope.depth,
            },
            other => {
                return InvalidOptionSnafu {
                    option: "sync.scope.mode",
                    reason: format!("unknown mode `{other}`"),
                }
                .fail();
            }
        };

        let allowlist_pubkeys = parse_pubkey_list(
            &raw.sync.scope.allowlist_pubkeys,
            "sync.scope.allowlist_pubkeys",
        )?;
        let denylist_pubkeys = parse_pubkey_list(
            &raw.sync.scope.denylist_pubkeys,
            "sync.scope.denylist_pubkeys",
        )?;
        let denied_pubkeys =
            parse_pubkey_list(&raw.security.denylist.pubkeys, "security.denylist.pubkeys")?;

        let driver = match raw.storage.driver.as_str() {
            "sqlite" => StorageDriver::Sqlite,
            "redb" => StorageDriver::Redb,
            "lmdb" => {
                warn!(
                    target: LOG_TARGET,
                    "storage.driver = \"lmdb\" is served by the redb backend"
                );
                StorageDriver::Redb
            }
            other => {
                return InvalidOptionSnafu {
                    option: "storage.driver",
                    reason: format!("unknown driver `{other}`"),
                }
                .fail();
            }
        };

        let mut sections = BTreeMap::new();
        for (name, section) in raw.layout.sections {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                return InvalidOptionSnafu {
                    option: "layout.sections",
                    reason: format!("section name `{name}` must be alphanumeric/dashes"),
                }
                .fail();
            }
            for author in &section.filters.authors {
                parse_pubkey(author).map_err(|reason| {
                    InvalidOptionSnafu {
                        option: "layout.sections",
                        reason: format!("section `{name}` filter author: {reason}"),
                    }
                    .build()
                })?;
            }
            sections.insert(name, section);
        }

        let level = match raw.logging.level.as_str() {
            "debug" | "info" | "warn" | "error" => raw.logging.level,
            other => {
                return InvalidOptionSnafu {
                    option: "logging.level",
                    reason: format!("unknown level `{other}`"),
                }
                .fail();
            }
        };

        Ok(Config {
            site,
            owner,
            nsec,
            protocols: raw.protocols,
            relays: raw.relays,
            discovery: raw.discovery,
            sync: Sync {
                enabled: raw.sync.enabled,
                kinds: raw.sync.kinds,
                scope: Scope {
                    mode: scope_mode,
                    include_direct_mentions: raw.sync.scope.include_direct_mentions,
                    include_threads_of_mine: raw.sync.scope.include_threads_of_mine,
                    max_authors: raw.sync.scope.max_authors,
                    allowlist_pubkeys,
                    denylist_pubkeys,
                },
                cursor_flush_seconds: raw.sync.cursor_flush_seconds,
                retention: raw.sync.retention,
            },
            inbox: raw.inbox,
            storage: Storage {
                driver,
                data_dir: raw.storage.data_dir,
                lmdb_max_size_mb: raw.storage.lmdb_max_size_mb,
            },
            rendering: raw.rendering,
            caching: Caching {
                enabled: raw.caching.enabled,
                engine: raw.caching.engine,
                redis_url: env.redis_url.clone(),
                max_size_mb: raw.caching.max_size_mb,
                default_ttl_seconds: raw.caching.default_ttl_seconds,
                cleanup_interval_seconds: raw.caching.cleanup_interval_seconds,
                ttl: raw.caching.ttl,
                aggregates: raw.caching.aggregates,
            },
            security: Security {
                denylist: Denylist {
                    enabled: raw.security.denylist.enabled,
                    pubkeys: denied_pubkeys,
                },
                content_filter: raw.security.content_filter,
                ratelimit: raw.security.ratelimit,
                validation: raw.security.validation,
            },
            layout: Layout { sections },
            logging: Logging { level },
        })
    }
}

fn parse_pubkey(input: &str) -> Result<PublicKey, String> {
    PublicKey::from_bech32(input)
        .ok()
        .or_else(|| PublicKey::from_hex(input).ok())
        .ok_or_else(|| format!("`{input}` is neither an npub nor 64-char hex"))
}

fn parse_pubkey_list(
    inputs: &[String],
    option: &'static str,
) -> ConfigResult<Vec<PublicKey>> {
    inputs
        .iter()
        .map(|input| {
            parse_pubkey(input).map_err(|reason| InvalidOptionSnafu { option, reason }.build())
        })
        .collect()
}

/// Environment overrides captured before config parsing.
#[derive(Debug, Default, Clone)]
pub struct EnvOverrides {
    pub nsec: Option<String>,
    pub redis_url: Option<String>,
    /// (config path, parsed TOML value) pairs from `NOPHR_A__B__C` vars.
    pub overrides: Vec<(Vec<String>, toml::Value)>,
}

pub fn collect_env_overrides(vars: impl Iterator<Item = (String, String)>) -> EnvOverrides {
    let mut env = EnvOverrides::default();
    for (key, value) in vars {
        if key == ENV_NSEC {
            env.nsec = Some(value);
            continue;
        }
        if key == ENV_REDIS_URL {
            env.redis_url = Some(value);
            continue;
        }
        let Some(path) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        if !path.contains("__") {
            // Single-segment vars (NOPHR_LOG etc.) are not config paths.
            continue;
        }
        let segments: Vec<String> = path
            .split("__")
            .map(|segment| segment.to_ascii_lowercase())
            .collect();
        if segments.iter().any(String::is_empty) {
            continue;
        }
        // Try scalar TOML first (numbers, booleans, arrays), then fall
        // back to a plain string.
        let parsed = parse_env_value(&value);
        env.overrides.push((segments, parsed));
    }
    env
}

fn parse_env_value(value: &str) -> toml::Value {
    let wrapped = format!("v = {value}");
    if let Ok(table) = toml::from_str::<toml::Table>(&wrapped) {
        if let Some(v) = table.get("v") {
            return v.clone();
        }
    }
    toml::Value::String(value.to_owned())
}

fn apply_override(root: &mut toml::Value, path: &[String], value: toml::Value) {
    let Some((leaf, parents)) = path.split_last() else {
        return;
    };
    let mut node = root;
    for parent in parents {
        if !node.is_table() {
            return;
        }
        let table = node.as_table_mut().expect("checked above");
        node = table
            .entry(parent.clone())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    }
    if let Some(table) = node.as_table_mut() {
        table.insert(leaf.clone(), value);
    }
}

#[cfg(test)]
mod tests;
