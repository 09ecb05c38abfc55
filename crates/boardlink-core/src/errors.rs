//! Error types for the boardlink session layer
//!
//! Per-concern error enums (decode, transport, engine) unified into the
//! top-level [`BoardError`]. Every variant is cloneable so a single failure
//! can be fanned out to all waiters of a connection attempt or stream.

use crate::gatt::ServiceId;
use crate::payload::TypeTag;

// ----------------------------------------------------------------------------
// Decode Errors
// ----------------------------------------------------------------------------

/// Failure decoding a single data frame. Scoped to that frame: never tears
/// down the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Tag unknown to this client. Indicates firmware/client version skew;
    /// the payload cannot be safely interpreted.
    #[error("unsupported type tag 0x{0:02X}")]
    UnsupportedTag(u8),

    /// Payload length does not match the fixed size the tag dictates.
    #[error("payload for {tag:?} is {actual} bytes, expected {expected}")]
    ShapeMismatch {
        tag: TypeTag,
        expected: usize,
        actual: usize,
    },

    /// Payload length matched but the content is invalid for the shape.
    #[error("malformed payload for {tag:?}: {detail}")]
    Malformed { tag: TypeTag, detail: &'static str },
}

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Failure reported by the transport capability. Generally retryable by the
/// caller via a fresh `connect()`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("service discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("device exposed an unexpected service {0}")]
    UnexpectedService(ServiceId),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("characteristic read failed: {0}")]
    ReadFailed(String),

    #[error("notification state change failed: {0}")]
    NotifyFailed(String),

    #[error("link lost: {0}")]
    LinkLost(String),

    #[error("operation not supported by this transport: {0}")]
    NotSupported(&'static str),
}

// ----------------------------------------------------------------------------
// Engine Errors
// ----------------------------------------------------------------------------

/// Failure reported by the protocol engine capability.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The engine's initialization handshake returned a non-zero status.
    /// Fatal for the connection attempt; not retried automatically.
    #[error("protocol engine initialization failed with status {status}")]
    InitFailed { status: i32 },

    /// The board lacks the requested module, or the module cannot produce
    /// the requested signal.
    #[error("signal unavailable: {0}")]
    SignalUnavailable(String),

    /// An asynchronous engine exchange (logger/timer/macro) failed.
    #[error("engine request failed: {0}")]
    RequestFailed(String),

    /// A persisted engine state blob could not be restored.
    #[error("engine state restore failed: {0}")]
    RestoreFailed(String),
}

// ----------------------------------------------------------------------------
// Board Error
// ----------------------------------------------------------------------------

/// Top-level error for every public operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoardError {
    /// Operation requires the session to be in the ready state.
    #[error("session is not ready")]
    NotReady,

    /// User-initiated cancellation, distinct from transport faults so
    /// callers can special-case it.
    #[error("operation cancelled")]
    Cancelled,

    /// The board lacks the requested module or signal.
    #[error("unsupported signal: {0}")]
    UnsupportedSignal(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Internal channel failure (session task gone).
    #[error("session channel closed: {0}")]
    Channel(&'static str),
}

impl BoardError {
    /// Convenience for transport link-loss errors.
    pub fn link_lost<T: Into<String>>(detail: T) -> Self {
        BoardError::Transport(TransportError::LinkLost(detail.into()))
    }

    /// Whether this error is the user-cancellation variant.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BoardError::Cancelled)
    }
}

pub type Result<T> = core::result::Result<T, BoardError>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_distinct_from_faults() {
        assert!(BoardError::Cancelled.is_cancelled());
        assert!(!BoardError::link_lost("peer reset").is_cancelled());
        assert!(!BoardError::NotReady.is_cancelled());
    }

    #[test]
    fn conversions_wrap_concern_errors() {
        let err: BoardError = EngineError::InitFailed { status: 16 }.into();
        assert_eq!(
            err,
            BoardError::Engine(EngineError::InitFailed { status: 16 })
        );

        let err: BoardError = DecodeError::UnsupportedTag(0xEE).into();
        assert!(matches!(err, BoardError::Decode(_)));
    }
}
