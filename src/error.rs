//! Error types for the motion subsystem.
//!
//! The taxonomy follows the recovery story, not the call site:
//!
//! - [`TransportError`]: the serial channel itself failed (port missing,
//!   write/read error, response timeout). Recoverable by reconnecting.
//! - [`ProtocolError`]: the channel delivered bytes we cannot interpret.
//!   Recoverable by retrying; the cached axis state is left untouched so
//!   callers can fall back to the last good snapshot.
//! - [`DriverError`]: the per-axis contract was violated or an underlying
//!   failure was promoted to the axis boundary. Soft-limit violations are
//!   rejected before any byte reaches the wire and are never retried
//!   automatically.
//! - [`InitError`]: aggregate of per-axis connect failures during stage
//!   initialization; failed axes are excluded from the live set.

use crate::axis::{AxisId, DriverState};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for axis-driver results.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Failures of the shared serial channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial port '{port}' unavailable: {source}")]
    PortUnavailable {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("serial write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("serial read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("no response to '{command}' within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("transport not connected")]
    NotConnected,

    #[error("serial I/O task failed: {0}")]
    TaskJoin(String),
}

/// Responses the codec refuses to interpret.
///
/// Malformed or empty responses never decode to a defaulted value; the
/// caller decides whether to retry with the last good snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty response to '{command}'")]
    EmptyResponse { command: String },

    #[error("malformed response '{response}' to '{command}': {reason}")]
    Malformed {
        command: String,
        response: String,
        reason: String,
    },
}

/// Per-axis operation failures.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("target {target} outside soft limits [{lo}, {hi}] on {axis}")]
    LimitViolation {
        axis: AxisId,
        target: f64,
        lo: f64,
        hi: f64,
    },

    #[error("axis {0} not initialized")]
    NotInitialized(AxisId),

    #[error("axis {0} has no configuration entry")]
    NotConfigured(AxisId),

    #[error("axis {axis} cannot accept the operation in state {state:?}")]
    InvalidState { axis: AxisId, state: DriverState },

    #[error("axis {axis} must be homed first")]
    NotHomed { axis: AxisId },

    #[error("homing failed on {axis}: {reason}")]
    Homing { axis: AxisId, reason: String },

    #[error("move on {axis} timed out after {elapsed:?}")]
    MoveTimeout { axis: AxisId, elapsed: Duration },

    #[error("internal driver failure on {axis}: {reason}")]
    Internal { axis: AxisId, reason: String },
}

/// Aggregate failure of [`StageManager::initialize`](crate::manager::StageManager::initialize).
///
/// Axes listed here were not added to the live set; axes that connected
/// remain usable.
#[derive(Debug, Error)]
#[error("{}", describe_init_failure(.failed))]
pub struct InitError {
    pub failed: Vec<(AxisId, DriverError)>,
}

fn describe_init_failure(failed: &[(AxisId, DriverError)]) -> String {
    let parts: Vec<String> = failed
        .iter()
        .map(|(axis, err)| format!("{axis}: {err}"))
        .collect();
    format!("stage initialization failed on [{}]", parts.join("; "))
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("configuration serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("configuration I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration validation error: {0}")]
    Validation(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

/// Shared snapshot region failures.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot region I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot payload of {len} bytes exceeds region capacity {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("region at '{path}' is not a stage snapshot")]
    BadMagic { path: String },

    #[error("snapshot has not been published yet")]
    NotPublished,

    #[error("snapshot read kept tearing after {attempts} attempts")]
    Torn { attempts: u32 },

    #[error("snapshot decode error: {0}")]
    Decode(#[from] serde_json::Error),
}
