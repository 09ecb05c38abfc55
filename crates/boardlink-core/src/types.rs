//! Core types for the boardlink protocol
//!
//! This module defines the fundamental types used throughout the session
//! layer, using newtype patterns for semantic validation and type safety.
//! Board-side resources (signals, loggers, timers, macros) are addressed by
//! arena-indexed opaque identifiers rather than raw engine pointers.

use core::fmt;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Signal Handle
// ----------------------------------------------------------------------------

/// Opaque identifier for a logical data source on the board (a sensor
/// channel, a logger output, a timer, a processor node).
///
/// Handles are minted by the protocol engine; the session layer only tracks
/// subscriptions against them and never interprets the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SignalHandle(u32);

impl SignalHandle {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for SignalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "signal#{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Board-side Resource Handles
// ----------------------------------------------------------------------------

/// Identifier for a board-side persistent logger created via
/// [`ProtocolEngine::create_logger`](crate::engine::ProtocolEngine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoggerHandle(u8);

impl LoggerHandle {
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u8 {
        self.0
    }
}

/// Identifier for a board-side timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerHandle(u8);

impl TimerHandle {
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u8 {
        self.0
    }
}

/// Identifier for a recorded board-side macro.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacroId(u8);

impl MacroId {
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u8 {
        self.0
    }
}

// ----------------------------------------------------------------------------
// Request Token
// ----------------------------------------------------------------------------

/// Correlation token for asynchronous engine exchanges (logger creation,
/// timer creation, macro recording). Each outstanding call registers a
/// single-shot completion keyed by its token; the engine resolves it exactly
/// once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken(u64);

impl RequestToken {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Absolute timestamp with millisecond precision, reconstructed from the
/// board's epoch-millisecond clock. UTC-based arithmetic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Reconstruct from a raw milliseconds-since-epoch value as reported by
    /// the board's internal clock.
    pub fn from_epoch_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Whole seconds since the UNIX epoch.
    pub fn epoch_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// Millisecond remainder below one second.
    pub fn subsec_millis(&self) -> u16 {
        (self.0 % 1000) as u16
    }

    /// Raw milliseconds since the UNIX epoch.
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Milliseconds elapsed from `earlier` to `self` (saturating).
    pub fn millis_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}", self.epoch_secs(), self.subsec_millis())
    }
}

// ----------------------------------------------------------------------------
// Mac Address
// ----------------------------------------------------------------------------

/// Board MAC address, resolved once per device and cached across sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Parse the colon-separated form the board reports (`AA:BB:CC:DD:EE:FF`).
    pub fn parse(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 6];
        let mut count = 0;
        for part in s.split(':') {
            if count == 6 || part.len() != 2 {
                return None;
            }
            bytes[count] = u8::from_str_radix(part, 16).ok()?;
            count += 1;
        }
        (count == 6).then_some(Self(bytes))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = hex::encode_upper(self.0);
        write!(
            f,
            "{}:{}:{}:{}:{}:{}",
            &h[0..2],
            &h[2..4],
            &h[4..6],
            &h[6..8],
            &h[8..10],
            &h[10..12]
        )
    }
}

// ----------------------------------------------------------------------------
// Device Identity
// ----------------------------------------------------------------------------

/// Identifiers and revisions for a board, resolved once after setup and
/// cached for the lifetime of the device handle (identity survives session
/// teardown; persistence between processes belongs to the caller).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// MAC address. `None` for bootloader-mode sessions with no prior cache.
    pub mac: Option<MacAddress>,
    pub manufacturer: Option<String>,
    pub model_number: Option<String>,
    pub serial_number: Option<String>,
    pub firmware_revision: Option<String>,
    pub hardware_revision: Option<String>,
}

impl DeviceIdentity {
    /// Whether every device-information field has been resolved.
    pub fn is_complete(&self) -> bool {
        self.manufacturer.is_some()
            && self.model_number.is_some()
            && self.serial_number.is_some()
            && self.firmware_revision.is_some()
            && self.hardware_revision.is_some()
    }
}

// ----------------------------------------------------------------------------
// Write Mode
// ----------------------------------------------------------------------------

/// Delivery mode for an outbound transport write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Link-layer acknowledged write.
    WithResponse,
    /// Unacknowledged write; cheaper, but subject to flow control.
    WithoutResponse,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
