//! Error mapping between btleplug and the boardlink transport contract

use boardlink_core::errors::TransportError;

/// BLE-layer failures before they are folded into [`TransportError`].
#[derive(Debug, thiserror::Error)]
pub enum BtleError {
    #[error("BLE stack error: {0}")]
    Stack(#[from] btleplug::Error),

    #[error("characteristic {0} not present on device")]
    MissingCharacteristic(uuid::Uuid),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl BtleError {
    /// Fold into the transport-capability error vocabulary.
    pub fn into_write_error(self) -> TransportError {
        TransportError::WriteFailed(self.to_string())
    }

    pub fn into_read_error(self) -> TransportError {
        TransportError::ReadFailed(self.to_string())
    }

    pub fn into_discovery_error(self) -> TransportError {
        TransportError::DiscoveryFailed(self.to_string())
    }

    pub fn into_connect_error(self) -> TransportError {
        TransportError::ConnectFailed(self.to_string())
    }

    pub fn into_notify_error(self) -> TransportError {
        TransportError::NotifyFailed(self.to_string())
    }
}
