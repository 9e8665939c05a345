//! Error taxonomy for the gateway.
//!
//! - **Link failures** are transient: the caller reconnects and carries on.
//! - **Card data errors** never leave the codec; they end up as an
//!   unauthorized attempt in the card log.
//! - **Configuration errors** are fatal and surface before the first frame.
//! - **Store errors** make the current operation fail safe (no access granted,
//!   no break assumed).

use thiserror::Error;

/// Errors raised while loading or validating the gateway configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Reasons a block0 cannot yield a UID.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CardDataError {
    #[error("block0 is not valid hex: {0}")]
    InvalidHex(String),

    #[error("block0 has {len} bytes, {needed} needed for this UID length")]
    TooShort { len: usize, needed: usize },

    #[error("BCC mismatch at byte {position}: expected {expected:#04x}, found {found:#04x}")]
    ChecksumMismatch {
        position: usize,
        expected: u8,
        found: u8,
    },
}

/// Failures of the external store collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("malformed stored JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid stored value: {0}")]
    Invalid(String),

    #[error("store closed")]
    Closed,
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("serial link failure: {0}")]
    Link(#[from] std::io::Error),

    #[error("serial link is not connected")]
    NotConnected,

    #[error("no reset line configured")]
    NoResetLine,

    #[error("reset line failure: {0}")]
    ResetLine(#[source] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("gateway task failed: {0}")]
    TaskFailed(String),

    #[error("operation cancelled by shutdown")]
    Cancelled,
}

impl GatewayError {
    /// Whether the failure should trigger a reconnect of the serial link.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, GatewayError::Link(_) | GatewayError::NotConnected)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
