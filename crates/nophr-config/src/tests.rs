use nostr::Keys;

use super::*;

fn example_with_real_npub() -> String {
    let keys = Keys::generate();
    let npub_line = format!("npub = \"{}\"", keys.public_key().to_hex());
    EXAMPLE_CONFIG
        .lines()
        .map(|line| {
            if line.starts_with("npub = ") {
                npub_line.clone()
            } else {
                line.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[test]
fn example_config_loads() {
    let config = Config::load_str(&example_with_real_npub()).expect("example config must load");
    assert_eq!(config.protocols.gopher.port, 70);
    assert_eq!(config.protocols.gemini.port, 1965);
    assert_eq!(config.protocols.finger.port, 79);
    assert_eq!(config.discovery.refresh_seconds, 900);
    assert_eq!(config.sync.cursor_flush_seconds, 5);
    assert_eq!(config.layout.sections.len(), 2);
    assert_eq!(config.layout.sections["notes"].filters.kinds, vec![1]);
    assert!(config.nsec.is_none());
    assert_eq!(config.logging.level, "info");
}

#[test]
fn missing_required_fields_fail() {
    let err = Config::load_str("[site]\ntitle = \"t\"").unwrap_err();
    assert!(matches!(err, ConfigError::MissingOption { .. }), "{err}");
}

#[test]
fn nsec_in_file_is_rejected() {
    let text = example_with_real_npub().replace(
        "[protocols.gopher]",
        "nsec = \"deadbeef\"\n[protocols.gopher]",
    );
    let err = Config::load_str(&text).unwrap_err();
    assert!(matches!(err, ConfigError::NsecInFile), "{err}");
}

#[test]
fn seeds_must_be_websocket_urls() {
    let text = example_with_real_npub().replace(
        "seeds = [\"wss://relay.damus.io\", \"wss://nos.lol\"]",
        "seeds = [\"https://relay.damus.io\"]",
    );
    let err = Config::load_str(&text).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidOption { .. }), "{err}");
}

#[test]
fn lmdb_driver_maps_to_redb() {
    let text = example_with_real_npub().replace("driver = \"sqlite\"", "driver = \"lmdb\"");
    let config = Config::load_str(&text).unwrap();
    assert_eq!(config.storage.driver, StorageDriver::Redb);
}

#[test]
fn unknown_scope_mode_fails() {
    let text = example_with_real_npub().replace("mode = \"following\"", "mode = \"everyone\"");
    assert!(Config::load_str(&text).is_err());
}

#[test]
fn env_overrides_leaf_fields() {
    let env = collect_env_overrides(
        [
            ("NOPHR_PROTOCOLS__GOPHER__PORT".to_owned(), "7070".to_owned()),
            ("NOPHR_SYNC__SCOPE__MODE".to_owned(), "mutual".to_owned()),
            ("NOPHR_LOG".to_owned(), "debug".to_owned()),
            ("PATH".to_owned(), "/usr/bin".to_owned()),
        ]
        .into_iter(),
    );
    let config = Config::load_with_env(&example_with_real_npub(), &env).unwrap();
    assert_eq!(config.protocols.gopher.port, 7070);
    assert_eq!(config.sync.scope.mode, ScopeMode::Mutual);
}

#[test]
fn secrets_come_from_env_only() {
    let keys = Keys::generate();
    let env = collect_env_overrides(
        [(
            "NOPHR_NSEC".to_owned(),
            keys.secret_key().expect("generated").to_secret_hex(),
        )]
        .into_iter(),
    );
    let config = Config::load_with_env(&example_with_real_npub(), &env).unwrap();
    assert!(config.nsec.is_some());
}

#[test]
fn enabled_kinds_reflect_flags_and_allowlist() {
    let text = example_with_real_npub()
        .replace("reposts = true", "reposts = false")
        .replace("allowlist = []", "allowlist = [1984]");
    let config = Config::load_str(&text).unwrap();
    let kinds = config.sync.kinds.enabled_kinds();
    assert!(!kinds.contains(&6));
    assert!(kinds.contains(&1984));
    assert!(kinds.contains(&1));
}
