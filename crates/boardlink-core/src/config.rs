//! Session configuration

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Flow Control
// ----------------------------------------------------------------------------

/// Write pacing policy for the outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowControlPolicy {
    /// The transport reports readiness explicitly. While unready, writes are
    /// forced to acknowledged delivery; a readiness grant restores the
    /// requested mode for the next unacknowledged write.
    ReadinessCallback,
    /// No readiness signal: every `ack_every`-th write (1-indexed) is forced
    /// to acknowledged delivery to bound unacknowledged in-flight writes.
    CountedFallback { ack_every: u32 },
}

impl FlowControlPolicy {
    /// The fallback used by transports with no readiness callback.
    pub const DEFAULT_COUNTED: Self = Self::CountedFallback { ack_every: 10 };
}

// ----------------------------------------------------------------------------
// Session Config
// ----------------------------------------------------------------------------

/// Tunables for one device session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Write pacing when the transport lacks a readiness callback. When the
    /// transport supports one, the readiness policy always wins.
    pub fallback_flow_control: FlowControlPolicy,
    /// Capacity of the facade command channel.
    pub command_capacity: usize,
    /// Samples retained for RSSI averaging.
    pub rssi_history: usize,
    /// Default averaging window for smoothed RSSI queries, in milliseconds.
    pub rssi_window_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fallback_flow_control: FlowControlPolicy::DEFAULT_COUNTED,
            command_capacity: 64,
            rssi_history: 10,
            rssi_window_ms: 5_000,
        }
    }
}

impl SessionConfig {
    pub fn with_fallback_flow_control(mut self, policy: FlowControlPolicy) -> Self {
        self.fallback_flow_control = policy;
        self
    }

    pub fn with_command_capacity(mut self, capacity: usize) -> Self {
        self.command_capacity = capacity;
        self
    }

    pub fn with_rssi_history(mut self, samples: usize) -> Self {
        self.rssi_history = samples;
        self
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
