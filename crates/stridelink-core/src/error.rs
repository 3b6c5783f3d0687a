//! Error types for the stridelink core library.
//!
//! Each module has its own error enum; [`StrideError`] unifies them at the
//! crate boundary. The classification helpers mirror the failure taxonomy
//! the coordinator is built around:
//!
//! - *transient*: a scan attempt timed out and will be retried
//! - *fatal to one role*: discovery found no matching service or
//!   characteristic; recoverable only by a fresh scan
//! - *terminal*: the retry budget is exhausted and the measurement needs an
//!   explicit restart
//! - *platform*: the underlying stack denied an operation (missing
//!   permission, adapter gone)
//!
//! Malformed notification payloads are deliberately *not* represented
//! here as session failures: the decoder reports them as
//! [`DecodeError`] and the session drops them without any state change.

use thiserror::Error;
use uuid::Uuid;

use crate::types::ConnectionState;

/// Configuration loading, saving, and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config at {path}: {source}")]
    Read {
        /// Path that was read.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration file could not be written.
    #[error("failed to write config at {path}: {source}")]
    Write {
        /// Path that was written.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file exists but is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be serialized.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The configuration parsed but violates an invariant.
    #[error("invalid config field `{field}`: {message}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What was wrong with it.
        message: String,
    },
}

/// A notification payload that contained a closing brace but did not parse
/// as a JSON object. Recoverable steady-state noise: counted and logged,
/// never propagated into connection state.
#[derive(Debug, Error)]
#[error("notification payload is not a valid JSON object: {reason}")]
pub struct DecodeError {
    /// Parser diagnostic for the log line.
    pub reason: String,
}

/// Failures raised by the platform transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// No usable Bluetooth adapter was found.
    #[error("no Bluetooth adapter found")]
    AdapterNotFound,

    /// The platform refused to start or stop a scan.
    #[error("scan failed: {0}")]
    ScanFailed(String),

    /// The connect request was rejected outright.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The advertisement handle no longer refers to a reachable peripheral.
    #[error("advertisement handle is stale")]
    StaleAdvertisement,

    /// A GATT operation was rejected or the link dropped mid-request.
    #[error("transport operation failed: {0}")]
    Operation(String),

    /// The platform denied the operation, typically a missing runtime
    /// permission. Surfaced as a role-level error, never a crash.
    #[error("platform denied the operation: {0}")]
    PermissionDenied(String),
}

/// Failures local to one peripheral session.
///
/// These are absorbed into a `Disconnected` transition plus an error value
/// on the session; they are never thrown past the session boundary.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// Discovery completed but the role's configured service was absent.
    #[error("service {0} not found on peripheral")]
    ServiceNotFound(Uuid),

    /// The notify characteristic was absent from the discovered service.
    #[error("characteristic {0} not found on peripheral")]
    CharacteristicNotFound(Uuid),

    /// A write was attempted outside the `Ready` state.
    #[error("session is not ready for writes (state: {0})")]
    NotReady(ConnectionState),

    /// The identity declares no write characteristic, or discovery did not
    /// find one; the role cannot receive commands.
    #[error("peripheral exposes no write channel")]
    NoWriteChannel,

    /// The session was closed; late callbacks and writes are rejected.
    #[error("session is closed")]
    Closed,

    /// The peer disconnected or a platform operation failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures surfaced by the dual-session coordinator.
#[derive(Debug, Clone, Error)]
pub enum CoordinatorError {
    /// Every scan attempt in the budget elapsed without both roles
    /// reaching `Ready`. Terminal until `start_measurement` is called
    /// again.
    #[error("no connection after {attempts} scan attempts")]
    RetryBudgetExhausted {
        /// Attempts consumed (equals the configured maximum).
        attempts: u32,
    },

    /// The coordinator task is gone; the handle is unusable.
    #[error("coordinator task has shut down")]
    Shutdown,

    /// The scan could not be started at all.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Unified error type for the crate boundary.
#[derive(Debug, Error)]
pub enum StrideError {
    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Frame decode error.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Session error.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Coordinator error.
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// Specialized `Result` for stridelink operations.
pub type Result<T> = std::result::Result<T, StrideError>;

impl StrideError {
    /// A scan-attempt failure that the coordinator retries on its own.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(TransportError::ScanFailed(_)))
    }

    /// Fatal for one role's session but recoverable by a rescan.
    #[must_use]
    pub const fn is_fatal_to_role(&self) -> bool {
        matches!(
            self,
            Self::Session(SessionError::ServiceNotFound(_))
                | Self::Session(SessionError::CharacteristicNotFound(_))
        )
    }

    /// Requires an explicit operator restart.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Coordinator(CoordinatorError::RetryBudgetExhausted { .. })
        )
    }

    /// The platform denied an operation (permissions, adapter state).
    #[must_use]
    pub const fn is_platform(&self) -> bool {
        matches!(
            self,
            Self::Transport(TransportError::PermissionDenied(_))
                | Self::Transport(TransportError::AdapterNotFound)
        )
    }
}
