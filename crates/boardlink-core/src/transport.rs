//! Transport capability consumed by the session layer
//!
//! The physical link (BLE or otherwise) is an external collaborator: the
//! session calls the [`BoardTransport`] methods and receives everything
//! asynchronous back as [`TransportEvent`]s on the event channel attached at
//! session start. One transport instance serves exactly one physical device.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::gatt::{CharacteristicId, ServiceId};
use crate::types::WriteMode;

// ----------------------------------------------------------------------------
// Transport Events
// ----------------------------------------------------------------------------

/// Asynchronous activity reported by the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Link established; service discovery may begin.
    Connected,
    /// Connection attempt failed before the link came up.
    ConnectFailed(TransportError),
    /// Result of a `discover_services` request.
    ServicesDiscovered(Result<Vec<ServiceId>, TransportError>),
    /// Result of a `discover_characteristics` request for one service.
    CharacteristicsDiscovered {
        service: ServiceId,
        result: Result<Vec<CharacteristicId>, TransportError>,
    },
    /// Response to a `read_value` request.
    ValueUpdated {
        characteristic: CharacteristicId,
        result: Result<Vec<u8>, TransportError>,
    },
    /// Result of a `set_notify` request.
    NotifyStateChanged {
        characteristic: CharacteristicId,
        error: Option<TransportError>,
    },
    /// Unsolicited notification on a subscribed characteristic.
    NotificationReceived {
        characteristic: CharacteristicId,
        data: Vec<u8>,
    },
    /// The transport can accept another unacknowledged write.
    ReadyToSend,
    /// Response to a `read_rssi` request.
    RssiRead(Result<i16, TransportError>),
    /// Link went down. `error` is `None` for a locally requested disconnect.
    Disconnected { error: Option<TransportError> },
}

/// Sender half handed to a transport so it can report events into the
/// session's serialized context.
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

// ----------------------------------------------------------------------------
// Transport Capability
// ----------------------------------------------------------------------------

/// Minimal contract the session layer needs from a physical link.
///
/// All methods are triggers: completion and unsolicited activity arrive as
/// [`TransportEvent`]s. Implementations must deliver events for one device
/// in arrival order.
#[async_trait]
pub trait BoardTransport: Send {
    /// Attach the event channel. Called exactly once, before any trigger.
    fn attach(&mut self, events: TransportEventSender);

    /// Begin connecting to the device.
    async fn begin_connection(&mut self) -> Result<(), TransportError>;

    /// Abort an in-progress connection attempt.
    async fn cancel_connection(&mut self) -> Result<(), TransportError>;

    /// Tear down an established link.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Discover which of the given services the device exposes.
    async fn discover_services(&mut self, services: &[ServiceId]) -> Result<(), TransportError>;

    /// Discover characteristics within one service.
    async fn discover_characteristics(
        &mut self,
        service: ServiceId,
        characteristics: &[CharacteristicId],
    ) -> Result<(), TransportError>;

    /// Write bytes to a characteristic with the given delivery mode.
    async fn write(
        &mut self,
        characteristic: CharacteristicId,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError>;

    /// Request the current value of a characteristic.
    async fn read_value(&mut self, characteristic: CharacteristicId)
        -> Result<(), TransportError>;

    /// Enable or disable notifications on a characteristic.
    async fn set_notify(
        &mut self,
        characteristic: CharacteristicId,
        enabled: bool,
    ) -> Result<(), TransportError>;

    /// Request a signal-strength reading.
    async fn read_rssi(&mut self) -> Result<(), TransportError>;

    /// Whether this transport emits [`TransportEvent::ReadyToSend`]. When
    /// false the write scheduler falls back to counted pacing.
    fn supports_ready_callback(&self) -> bool;
}
