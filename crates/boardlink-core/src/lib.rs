//! boardlink core protocol types
//!
//! This crate provides the foundational pieces of the boardlink sensor-board
//! session layer: the typed payload codec, the error taxonomy, and the two
//! capability traits ([`BoardTransport`](transport::BoardTransport) for the
//! physical link, [`ProtocolEngine`](engine::ProtocolEngine) for the board's
//! command vocabulary). Stateful orchestration lives in `boardlink-session`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod engine;
pub mod errors;
pub mod gatt;
pub mod payload;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{FlowControlPolicy, SessionConfig};
pub use engine::{
    DataFrame, EngineBridge, EngineEvent, EngineWrite, ModulePreset, ProtocolEngine, TimerSpec,
};
pub use errors::{BoardError, DecodeError, EngineError, Result, TransportError};
pub use gatt::{CharacteristicId, ServiceId, ServiceKind};
pub use payload::{decode, decode_sample, DecodedSample, DecodedValue, TypeTag};
pub use transport::{BoardTransport, TransportEvent, TransportEventSender};
pub use types::{
    DeviceIdentity, LoggerHandle, MacAddress, MacroId, RequestToken, SignalHandle, TimerHandle,
    Timestamp, WriteMode,
};
