//! The commented example config emitted by `nophr init`.

pub const EXAMPLE_CONFIG: &str = r#"# nophr configuration
#
# Secrets are never read from this file:
#   NOPHR_NSEC      - identity secret key (only needed for future publishing)
#   NOPHR_REDIS_URL - remote cache URL when caching.engine = "redis"
# Any other option can be overridden with NOPHR_<SECTION>__<KEY>, e.g.
#   NOPHR_PROTOCOLS__GOPHER__PORT=7070

[site]
title = "my gateway"
description = "notes over old wires"
operator = "operator@example.org"

[identity]
# The Nostr identity this gateway republishes (npub or 64-char hex).
npub = "npub1xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx"

[protocols.gopher]
enabled = true
host = "gopher.example.org"
port = 70
bind = "0.0.0.0"

[protocols.gemini]
enabled = true
host = "gemini.example.org"
port = 1965
bind = "0.0.0.0"

[protocols.gemini.tls]
# Either point at a certificate pair or let the server generate one.
# cert_path = "/etc/nophr/cert.pem"
# key_path = "/etc/nophr/key.pem"
auto_generate = true

[protocols.finger]
enabled = true
port = 79
bind = "0.0.0.0"
max_users = 32

[relays]
seeds = ["wss://relay.damus.io", "wss://nos.lol"]

[relays.policy]
connect_timeout_ms = 10000
max_concurrent_subs = 20
backoff_ms = [500, 1500, 5000, 15000, 60000]

[discovery]
refresh_seconds = 900
use_owner_hints = true
use_author_hints = true
fallback_to_seeds = true
max_relays_per_author = 4

[sync]
enabled = true
cursor_flush_seconds = 5

[sync.kinds]
metadata = true
contacts = true
relay_lists = true
notes = true
articles = true
reposts = true
reactions = true
zaps = true
allowlist = []

[sync.scope]
# One of: self, following, mutual, foaf
mode = "following"
depth = 2
include_direct_mentions = true
include_threads_of_mine = true
max_authors = 1000
allowlist_pubkeys = []
denylist_pubkeys = []

[sync.retention]
keep_days = 365
prune_on_start = false
reevaluate_interval_seconds = 3600

# Rule-based retention; remove this table to stay on the simple mode.
# [sync.retention.advanced]
# enabled = true
# max_total_events = 200000
# max_storage_mb = 2048
#
# [[sync.retention.advanced.rules]]
# name = "own-notes"
# priority = 100
# conditions = { author_is_owner = true }
# action = { retain = true }
#
# [[sync.retention.advanced.rules]]
# name = "everything-else"
# priority = 0
# conditions = { all = true }
# action = { retain = true, retain_days = 90 }

[inbox]
include_replies = true
include_reactions = true
include_zaps = true
group_by_thread = true
collapse_reposts = true

[inbox.noise_filters]
min_zap_sats = 0
allowed_reaction_chars = []

[storage]
# sqlite or lmdb (lmdb is served by the redb backend)
driver = "sqlite"
data_dir = "./data"
lmdb_max_size_mb = 1024

[rendering.gopher]
max_line_length = 70
show_timestamps = true
date_format = "[year]-[month]-[day]"

[rendering.gemini]
max_line_length = 0
show_timestamps = true
date_format = "[year]-[month]-[day]"

[rendering.finger]
max_line_length = 79
show_timestamps = false
recent_notes_count = 5
date_format = "[year]-[month]-[day]"

[caching]
enabled = true
# memory, redis or none
engine = "memory"
max_size_mb = 64
default_ttl_seconds = 300
cleanup_interval_seconds = 60

[caching.ttl.sections]
notes = 120
articles = 600

[caching.aggregates]
enabled = true
update_on_ingest = true
reconciler_interval_seconds = 900
reconciler_batch_size = 256

[security.denylist]
enabled = false
pubkeys = []

[security.content_filter]
enabled = false
banned_words = []
case_sensitive = false

[security.ratelimit]
enabled = true

[security.ratelimit.global]
requests_per_minute = 60
burst_size = 10

[security.validation]
enabled = true
max_selector_length = 255
max_query_length = 1024
max_path_length = 1024
strict_mode = true

[layout.sections.notes]
title = "Notes"
description = "Short notes"
order = 1
limit = 20
filters = { kinds = [1] }

[layout.sections.articles]
title = "Articles"
description = "Long-form writing"
order = 2
limit = 10
filters = { kinds = [30023] }

[logging]
level = "info"
"#;
