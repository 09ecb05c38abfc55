//! btleplug-backed implementation of the boardlink transport capability
//!
//! Wraps one discovered peripheral plus the adapter that found it. GATT
//! triggers run inline on the session task; unsolicited activity (value
//! notifications, link loss) is pumped from btleplug's event streams into
//! the session's event channel by background tasks.
//!
//! btleplug exposes no "ready to send without response" callback on any
//! platform, so this transport reports no readiness support and the write
//! scheduler paces with the counted fallback.

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use boardlink_core::errors::TransportError;
use boardlink_core::gatt::{CharacteristicId, ServiceId};
use boardlink_core::transport::{BoardTransport, TransportEvent, TransportEventSender};
use boardlink_core::types::WriteMode;

use crate::config::BtleConfig;
use crate::error::BtleError;

// ----------------------------------------------------------------------------
// BLE Transport
// ----------------------------------------------------------------------------

/// One board's BLE link.
pub struct BtleTransport {
    adapter: Adapter,
    peripheral: Peripheral,
    config: BtleConfig,
    events: Option<TransportEventSender>,
    notification_pump: Option<JoinHandle<()>>,
    disconnect_pump: Option<JoinHandle<()>>,
}

impl BtleTransport {
    /// Wrap a peripheral previously discovered on `adapter`. Scanning and
    /// peripheral selection are the caller's concern.
    pub fn new(adapter: Adapter, peripheral: Peripheral, config: BtleConfig) -> Self {
        Self {
            adapter,
            peripheral,
            config,
            events: None,
            notification_pump: None,
            disconnect_pump: None,
        }
    }

    fn sender(&self) -> TransportEventSender {
        self.events.clone().expect("transport not attached")
    }

    fn find_characteristic(
        &self,
        characteristic: CharacteristicId,
    ) -> Result<Characteristic, BtleError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid())
            .ok_or(BtleError::MissingCharacteristic(characteristic.uuid()))
    }

    /// Watch adapter events for this peripheral dropping off the link.
    async fn spawn_disconnect_pump(&mut self) -> Result<(), BtleError> {
        if self.disconnect_pump.is_some() {
            return Ok(());
        }
        let mut events = self.adapter.events().await?;
        let id = self.peripheral.id();
        let sender = self.sender();
        self.disconnect_pump = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(peripheral_id) = event {
                    if peripheral_id == id {
                        info!("peripheral disconnected");
                        let _ = sender.send(TransportEvent::Disconnected {
                            error: Some(TransportError::LinkLost("peripheral disconnected".into())),
                        });
                        break;
                    }
                }
            }
        }));
        Ok(())
    }

    /// Forward value notifications into the session's event channel.
    async fn spawn_notification_pump(&mut self) -> Result<(), BtleError> {
        if self.notification_pump.is_some() {
            return Ok(());
        }
        let mut notifications = self.peripheral.notifications().await?;
        let sender = self.sender();
        self.notification_pump = Some(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let event = TransportEvent::NotificationReceived {
                    characteristic: CharacteristicId::new(notification.uuid),
                    data: notification.value,
                };
                if sender.send(event).is_err() {
                    break;
                }
            }
            debug!("notification pump ended");
        }));
        Ok(())
    }

    fn stop_pumps(&mut self) {
        if let Some(pump) = self.notification_pump.take() {
            pump.abort();
        }
        if let Some(pump) = self.disconnect_pump.take() {
            pump.abort();
        }
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        self.stop_pumps();
    }
}

#[async_trait]
impl BoardTransport for BtleTransport {
    fn attach(&mut self, events: TransportEventSender) {
        self.events = Some(events);
    }

    async fn begin_connection(&mut self) -> Result<(), TransportError> {
        let sender = self.sender();
        let connect = timeout(self.config.connection_timeout, self.peripheral.connect()).await;
        match connect {
            Ok(Ok(())) => {
                info!("connected");
                if let Err(err) = self.spawn_disconnect_pump().await {
                    return Err(err.into_connect_error());
                }
                let _ = sender.send(TransportEvent::Connected);
                Ok(())
            }
            Ok(Err(err)) => {
                warn!(%err, "connect failed");
                let _ = sender.send(TransportEvent::ConnectFailed(
                    BtleError::Stack(err).into_connect_error(),
                ));
                Ok(())
            }
            Err(_) => {
                let _ = sender.send(TransportEvent::ConnectFailed(
                    BtleError::Timeout(self.config.connection_timeout).into_connect_error(),
                ));
                Ok(())
            }
        }
    }

    async fn cancel_connection(&mut self) -> Result<(), TransportError> {
        self.disconnect().await
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.stop_pumps();
        if let Err(err) = self.peripheral.disconnect().await {
            debug!(%err, "disconnect trigger failed");
        }
        let _ = self
            .sender()
            .send(TransportEvent::Disconnected { error: None });
        Ok(())
    }

    async fn discover_services(&mut self, services: &[ServiceId]) -> Result<(), TransportError> {
        let sender = self.sender();
        let result = timeout(
            self.config.operation_timeout,
            self.peripheral.discover_services(),
        )
        .await;

        let result = match result {
            Ok(Ok(())) => {
                let wanted: Vec<uuid::Uuid> = services.iter().map(|s| s.uuid()).collect();
                let found: Vec<ServiceId> = self
                    .peripheral
                    .services()
                    .into_iter()
                    .filter(|service| wanted.contains(&service.uuid))
                    .map(|service| ServiceId::new(service.uuid))
                    .collect();
                Ok(found)
            }
            Ok(Err(err)) => Err(BtleError::Stack(err).into_discovery_error()),
            Err(_) => Err(BtleError::Timeout(self.config.operation_timeout).into_discovery_error()),
        };
        let _ = sender.send(TransportEvent::ServicesDiscovered(result));
        Ok(())
    }

    async fn discover_characteristics(
        &mut self,
        service: ServiceId,
        characteristics: &[CharacteristicId],
    ) -> Result<(), TransportError> {
        // btleplug resolves every characteristic during service discovery;
        // this just reports which of the requested set the device carries
        let wanted: Vec<uuid::Uuid> = characteristics.iter().map(|c| c.uuid()).collect();
        let found: Vec<CharacteristicId> = self
            .peripheral
            .characteristics()
            .into_iter()
            .filter(|c| c.service_uuid == service.uuid() && wanted.contains(&c.uuid))
            .map(|c| CharacteristicId::new(c.uuid))
            .collect();
        let _ = self
            .sender()
            .send(TransportEvent::CharacteristicsDiscovered {
                service,
                result: Ok(found),
            });
        Ok(())
    }

    async fn write(
        &mut self,
        characteristic: CharacteristicId,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let target = self
            .find_characteristic(characteristic)
            .map_err(BtleError::into_write_error)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        self.peripheral
            .write(&target, data, write_type)
            .await
            .map_err(|err| BtleError::Stack(err).into_write_error())
    }

    async fn read_value(
        &mut self,
        characteristic: CharacteristicId,
    ) -> Result<(), TransportError> {
        let sender = self.sender();
        let result = match self.find_characteristic(characteristic) {
            Ok(target) => match timeout(self.config.operation_timeout, self.peripheral.read(&target))
                .await
            {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(BtleError::Stack(err).into_read_error()),
                Err(_) => Err(BtleError::Timeout(self.config.operation_timeout).into_read_error()),
            },
            Err(err) => Err(err.into_read_error()),
        };
        let _ = sender.send(TransportEvent::ValueUpdated {
            characteristic,
            result,
        });
        Ok(())
    }

    async fn set_notify(
        &mut self,
        characteristic: CharacteristicId,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let error = match self.find_characteristic(characteristic) {
            Ok(target) => {
                let op = if enabled {
                    self.peripheral.subscribe(&target).await
                } else {
                    self.peripheral.unsubscribe(&target).await
                };
                match op {
                    Ok(()) => {
                        if enabled {
                            self.spawn_notification_pump()
                                .await
                                .err()
                                .map(BtleError::into_notify_error)
                        } else {
                            None
                        }
                    }
                    Err(err) => Some(BtleError::Stack(err).into_notify_error()),
                }
            }
            Err(err) => Some(err.into_notify_error()),
        };
        let _ = self.sender().send(TransportEvent::NotifyStateChanged {
            characteristic,
            error,
        });
        Ok(())
    }

    async fn read_rssi(&mut self) -> Result<(), TransportError> {
        // btleplug reports RSSI through peripheral properties refreshed by
        // advertisements, not an on-demand read
        let result = match self.peripheral.properties().await {
            Ok(Some(properties)) => match properties.rssi {
                Some(rssi) => Ok(rssi),
                None => Err(TransportError::NotSupported(
                    "no RSSI reported by this peripheral",
                )),
            },
            Ok(None) => Err(TransportError::NotSupported("peripheral properties absent")),
            Err(err) => Err(BtleError::Stack(err).into_read_error()),
        };
        let _ = self.sender().send(TransportEvent::RssiRead(result));
        Ok(())
    }

    fn supports_ready_callback(&self) -> bool {
        false
    }
}
