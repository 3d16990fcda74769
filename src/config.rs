//! Relay configuration
//!
//! Settings are loaded from a TOML file (default `config.toml`) via the
//! `config` crate, with a handful of values overridable by environment
//! variable or `--config`/CLI flags in `main`.
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Command-line arguments accepted by the relay binary.
#[derive(Parser, Debug)]
#[command(name = "nostr-relay-core", about = "A Nostr relay with a Blossom blob store")]
pub struct Args {
    /// Path to a TOML configuration file.
    #[arg(long, env = "RELAY_CONFIG", default_value = "config.toml")]
    pub config: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub database: Database,
    #[serde(default)]
    pub authorization: Authorization,
    #[serde(default)]
    pub blossom: Blossom,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Network {
    pub address: String,
    pub port: u16,
    pub ping_interval_seconds: u32,
}

impl Default for Network {
    fn default() -> Self {
        Network {
            address: "0.0.0.0".to_owned(),
            port: 8080,
            ping_interval_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_event_bytes: Option<usize>,
    pub max_ws_message_bytes: Option<usize>,
    pub max_ws_frame_bytes: Option<usize>,
    pub max_blocking_threads: usize,
    pub broadcast_buffer: usize,
    pub event_persist_buffer: usize,
    /// How many times a write is retried after a retryable storage error.
    pub write_retry_attempts: u32,
    /// How long the fan-out dispatcher pauses between deliveries.
    pub fanout_pacing_millis: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_event_bytes: Some(256_000),
            max_ws_message_bytes: Some(512_000),
            max_ws_frame_bytes: Some(256_000),
            max_blocking_threads: 16,
            broadcast_buffer: 4096,
            event_persist_buffer: 4096,
            write_retry_attempts: 3,
            fanout_pacing_millis: 3,
        }
    }
}

impl Limits {
    pub fn fanout_pacing(&self) -> Duration {
        Duration::from_millis(self.fanout_pacing_millis)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Database {
    pub data_directory: String,
}

impl Default for Database {
    fn default() -> Self {
        Database {
            data_directory: ".".to_owned(),
        }
    }
}

/// One entry in the publisher allow-list: either unrestricted, or scoped to
/// a set of `d`-tag prefixes/exact-matches (see `validator::check_d_tag`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AllowListEntry {
    #[serde(default)]
    pub d_tags: Vec<String>,
}

impl AllowListEntry {
    pub fn is_unrestricted(&self) -> bool {
        self.d_tags.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Authorization {
    /// Publisher pubkey (lowercase hex) -> allow-list entry.
    pub pubkey_allowlist: HashMap<String, AllowListEntry>,
    /// Kinds a REQ filter must intersect with to pass the C3 admission gate.
    pub admitted_kinds: Vec<u16>,
}

impl Default for Authorization {
    fn default() -> Self {
        Authorization {
            pubkey_allowlist: HashMap::new(),
            admitted_kinds: vec![0, 1, 3, 30063, 32267],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Blossom {
    pub directory: String,
    pub max_upload_bytes: u64,
}

impl Default for Blossom {
    fn default() -> Self {
        Blossom {
            directory: "./blobs".to_owned(),
            max_upload_bytes: 100_000_000,
        }
    }
}

impl Settings {
    /// Load settings from `path`, falling back to defaults for anything the
    /// file does not specify. Environment variables prefixed `RELAY__` (with
    /// `__` as the section separator, e.g. `RELAY__NETWORK__PORT`) override
    /// file values.
    ///
    /// A malformed file or env var is a startup-time `Error::Config`, not a
    /// silent fallback to defaults - defaults would mean running with an
    /// empty `authorization.pubkey_allowlist`, which is worse than refusing
    /// to start.
    pub fn load(path: &str) -> crate::error::Result<Settings> {
        let c = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("RELAY").separator("__"))
            .build()?;
        let settings: Settings = c.try_deserialize().map_err(crate::error::Error::Config)?;
        Ok(settings)
    }
}
