//! GATT identities for the board's service table
//!
//! The board exposes a fixed set of services: the primary protocol service
//! (command + notification characteristics), an optional bootloader service
//! advertised only in firmware-recovery mode, and the standard battery and
//! device-information services.

use core::fmt;
use serde::{Deserialize, Serialize};
use uuid::{uuid, Uuid};

// ----------------------------------------------------------------------------
// Identity Newtypes
// ----------------------------------------------------------------------------

/// Identity of a transport service group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId(Uuid);

impl ServiceId {
    pub const fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a characteristic within a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicId(Uuid);

impl CharacteristicId {
    pub const fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Board Service Table
// ----------------------------------------------------------------------------

/// Primary protocol service.
pub const BOARD_SERVICE: ServiceId = ServiceId::new(uuid!("54b60000-9a3b-42e6-9c6b-d2e7c8e0aa01"));
/// Command ingress characteristic (host → board).
pub const COMMAND_CHAR: CharacteristicId =
    CharacteristicId::new(uuid!("54b60001-9a3b-42e6-9c6b-d2e7c8e0aa01"));
/// Notification characteristic (board → host, single multiplexed channel).
pub const NOTIFY_CHAR: CharacteristicId =
    CharacteristicId::new(uuid!("54b60002-9a3b-42e6-9c6b-d2e7c8e0aa01"));

/// Bootloader (firmware recovery) service; advertised instead of full
/// protocol support when the board is in recovery mode.
pub const BOOTLOADER_SERVICE: ServiceId =
    ServiceId::new(uuid!("54b6f000-9a3b-42e6-9c6b-d2e7c8e0aa01"));

/// Standard battery service.
pub const BATTERY_SERVICE: ServiceId =
    ServiceId::new(uuid!("0000180f-0000-1000-8000-00805f9b34fb"));
pub const BATTERY_LEVEL_CHAR: CharacteristicId =
    CharacteristicId::new(uuid!("00002a19-0000-1000-8000-00805f9b34fb"));

/// Standard device-information service.
pub const DEVICE_INFO_SERVICE: ServiceId =
    ServiceId::new(uuid!("0000180a-0000-1000-8000-00805f9b34fb"));
pub const MODEL_NUMBER_CHAR: CharacteristicId =
    CharacteristicId::new(uuid!("00002a24-0000-1000-8000-00805f9b34fb"));
pub const SERIAL_NUMBER_CHAR: CharacteristicId =
    CharacteristicId::new(uuid!("00002a25-0000-1000-8000-00805f9b34fb"));
pub const FIRMWARE_REV_CHAR: CharacteristicId =
    CharacteristicId::new(uuid!("00002a26-0000-1000-8000-00805f9b34fb"));
pub const HARDWARE_REV_CHAR: CharacteristicId =
    CharacteristicId::new(uuid!("00002a27-0000-1000-8000-00805f9b34fb"));
pub const MANUFACTURER_CHAR: CharacteristicId =
    CharacteristicId::new(uuid!("00002a29-0000-1000-8000-00805f9b34fb"));

/// The classification a discovered service falls into during setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Board,
    Bootloader,
    Battery,
    DeviceInfo,
}

/// Classify a discovered service against the board's known table.
pub fn classify_service(service: ServiceId) -> Option<ServiceKind> {
    if service == BOARD_SERVICE {
        Some(ServiceKind::Board)
    } else if service == BOOTLOADER_SERVICE {
        Some(ServiceKind::Bootloader)
    } else if service == BATTERY_SERVICE {
        Some(ServiceKind::Battery)
    } else if service == DEVICE_INFO_SERVICE {
        Some(ServiceKind::DeviceInfo)
    } else {
        None
    }
}

/// The service id a classification corresponds to.
pub fn service_for(kind: ServiceKind) -> ServiceId {
    match kind {
        ServiceKind::Board => BOARD_SERVICE,
        ServiceKind::Bootloader => BOOTLOADER_SERVICE,
        ServiceKind::Battery => BATTERY_SERVICE,
        ServiceKind::DeviceInfo => DEVICE_INFO_SERVICE,
    }
}

/// Characteristics the setup sequence discovers for a known service.
pub fn characteristics_for(kind: ServiceKind) -> &'static [CharacteristicId] {
    match kind {
        ServiceKind::Board => &[COMMAND_CHAR, NOTIFY_CHAR],
        // Recovery mode exposes no protocol characteristics worth probing
        ServiceKind::Bootloader => &[],
        ServiceKind::Battery => &[BATTERY_LEVEL_CHAR],
        ServiceKind::DeviceInfo => &[
            MANUFACTURER_CHAR,
            MODEL_NUMBER_CHAR,
            SERIAL_NUMBER_CHAR,
            FIRMWARE_REV_CHAR,
            HARDWARE_REV_CHAR,
        ],
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
