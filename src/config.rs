//! Service configuration read from `SIGNER_*` environment variables.
//!
//! Unparseable values fall back to their defaults; only the token secret is
//! mandatory, and only for commands that issue or check tokens.

use crate::coordinator::{CoordinatorConfig, DEFAULT_TX_TIMEOUT, DEFAULT_WRITE_QUEUE_DEPTH};
use crate::store::{StoreKind, StoreOptions};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
/// Default SQLite database file.
pub const DEFAULT_DB_PATH: &str = "signer.sqlite";
/// Default bearer token lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);
/// Default time a client has to deliver the HTTP request head.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Configuration problems reported before any work starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `SIGNER_TOKEN_SECRET` is unset or empty.
    #[error("SIGNER_TOKEN_SECRET must be set to a non-empty value")]
    MissingSecret,
}

/// Runtime settings for the service and the CLI.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HTTP listen address.
    pub listen: SocketAddr,
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Storage backend.
    pub store: StoreKind,
    /// Token signing secret.
    pub token_secret: Option<String>,
    /// Bearer token lifetime.
    pub token_ttl: Duration,
    /// Sign/verify deadline, also the SQLite busy timeout.
    pub tx_timeout: Duration,
    /// Per-read HTTP timeout.
    pub request_timeout: Duration,
    /// Bound on queued writes per signing operation.
    pub write_queue_depth: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            store: StoreKind::Sqlite,
            token_secret: None,
            token_ttl: DEFAULT_TOKEN_TTL,
            tx_timeout: DEFAULT_TX_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            write_queue_depth: DEFAULT_WRITE_QUEUE_DEPTH,
        }
    }
}

impl ServiceConfig {
    /// Reads the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, fallback: Duration| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };
        let listen = lookup("SIGNER_LISTEN")
            .and_then(|v| v.trim().parse::<SocketAddr>().ok())
            .unwrap_or(defaults.listen);
        let db_path = lookup("SIGNER_DB_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let store = lookup("SIGNER_STORE")
            .and_then(|v| parse_store_kind(&v))
            .unwrap_or(defaults.store);
        let token_secret = lookup("SIGNER_TOKEN_SECRET").filter(|v| !v.is_empty());
        let token_ttl = lookup("SIGNER_TOKEN_TTL_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.token_ttl);
        let write_queue_depth = lookup("SIGNER_WRITE_QUEUE_DEPTH")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|depth| *depth > 0)
            .unwrap_or(defaults.write_queue_depth);
        Self {
            listen,
            db_path,
            store,
            token_secret,
            token_ttl,
            tx_timeout: millis("SIGNER_TX_TIMEOUT_MS", defaults.tx_timeout),
            request_timeout: millis("SIGNER_REQUEST_TIMEOUT_MS", defaults.request_timeout),
            write_queue_depth,
        }
    }

    /// The token secret, or [`ConfigError::MissingSecret`].
    pub fn require_secret(&self) -> Result<&str, ConfigError> {
        self.token_secret
            .as_deref()
            .ok_or(ConfigError::MissingSecret)
    }

    /// Coordinator settings derived from this config.
    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            tx_timeout: self.tx_timeout,
            write_queue_depth: self.write_queue_depth,
        }
    }

    /// Store settings derived from this config.
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            kind: self.store,
            path: self.db_path.clone(),
            busy_timeout: self.tx_timeout,
        }
    }
}

fn parse_store_kind(value: &str) -> Option<StoreKind> {
    match value.trim().to_ascii_lowercase().as_str() {
        "sqlite" => Some(StoreKind::Sqlite),
        "memory" | "mem" => Some(StoreKind::Memory),
        _ => None,
    }
}
