//! BLE transport configuration

use std::time::Duration;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the BLE transport
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BtleConfig {
    /// Maximum time to wait for the link to come up
    pub connection_timeout: Duration,
    /// Maximum time to wait for a GATT operation
    pub operation_timeout: Duration,
}

impl Default for BtleConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(5),
        }
    }
}

impl BtleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set per-operation timeout
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}
