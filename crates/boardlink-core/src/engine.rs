//! Protocol engine capability
//!
//! The vendor protocol engine owns the board's command vocabulary and wire
//! format; the session layer never interprets either. It sequences engine
//! calls and routes the engine's asynchronous output: outbound writes flow
//! through the [`EngineBridge`] into the write scheduler, and completions,
//! data frames, and init status arrive as [`EngineEvent`]s.
//!
//! Exchanges that complete asynchronously (logger creation, timer creation,
//! macro recording) are correlated by [`RequestToken`]: the caller registers
//! a single-shot completion under the token and the engine resolves it
//! exactly once.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::EngineError;
use crate::gatt::CharacteristicId;
use crate::types::{LoggerHandle, MacroId, RequestToken, SignalHandle, TimerHandle, WriteMode};

// ----------------------------------------------------------------------------
// Module Presets
// ----------------------------------------------------------------------------

/// Sensor modules a board may carry. Presets are configuration data handed
/// opaquely to the engine to obtain signal handles; the session layer never
/// interprets them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModulePreset {
    Accelerometer,
    Gyroscope,
    Magnetometer,
    Barometer,
    Thermometer,
    AmbientLight,
    Hygrometer,
    Color,
    SensorFusion,
    Battery,
}

/// Parameters for a board-side timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSpec {
    /// Firing period in milliseconds.
    pub period_ms: u32,
    /// Number of firings; `u16::MAX` repeats indefinitely.
    pub repetitions: u16,
    /// Fire once immediately instead of waiting a full period.
    pub immediate_fire: bool,
}

impl TimerSpec {
    pub fn repeating(period_ms: u32) -> Self {
        Self {
            period_ms,
            repetitions: u16::MAX,
            immediate_fire: false,
        }
    }
}

// ----------------------------------------------------------------------------
// Engine Output
// ----------------------------------------------------------------------------

/// One tagged data frame emitted by the engine after it deserializes a
/// notification. Decoding into a typed value is the payload codec's job.
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub handle: SignalHandle,
    pub type_tag: u8,
    pub epoch_millis: u64,
    pub payload: Vec<u8>,
}

/// Raw outbound write the engine wants delivered to the board.
#[derive(Debug, Clone)]
pub struct EngineWrite {
    pub characteristic: CharacteristicId,
    pub data: Vec<u8>,
    pub mode: WriteMode,
}

/// Asynchronous engine activity.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Initialization handshake finished. Zero status means compatible.
    Initialized { status: i32 },
    /// A subscribed signal produced data.
    Data(DataFrame),
    /// Board assigned a logger for an earlier `create_logger` call.
    LoggerCreated {
        request: RequestToken,
        result: Result<LoggerHandle, EngineError>,
    },
    /// Board assigned a timer for an earlier `create_timer` call.
    TimerCreated {
        request: RequestToken,
        result: Result<TimerHandle, EngineError>,
    },
    /// Recording ended for an earlier `macro_end_record` call.
    MacroRecorded {
        request: RequestToken,
        result: Result<MacroId, EngineError>,
    },
}

/// Channels handed to the engine at session start. The write half feeds the
/// session's write scheduler; the event half feeds its serialized loop.
#[derive(Debug, Clone)]
pub struct EngineBridge {
    pub writes: mpsc::UnboundedSender<EngineWrite>,
    pub events: mpsc::UnboundedSender<EngineEvent>,
}

// ----------------------------------------------------------------------------
// Engine Capability
// ----------------------------------------------------------------------------

/// Contract of the vendor protocol engine.
///
/// Methods are synchronous against in-memory engine state; anything touching
/// the board materializes as bridge writes and later [`EngineEvent`]s. The
/// engine is driven only from the session's serialized context.
pub trait ProtocolEngine: Send {
    /// Attach the bridge. Called exactly once, before any other call.
    fn attach(&mut self, bridge: EngineBridge);

    /// Begin the initialization handshake with the board. Completion arrives
    /// as [`EngineEvent::Initialized`].
    fn initialize(&mut self);

    /// Feed a notification received on the board's notify characteristic.
    fn handle_notification(&mut self, data: &[u8]);

    /// Feed the response to a characteristic read the engine requested.
    fn handle_read_response(&mut self, characteristic: CharacteristicId, data: &[u8]);

    /// Inform the engine the link dropped so it can reset wire state.
    fn handle_disconnect(&mut self);

    /// Dump engine state for caller-side persistence.
    fn serialize(&self) -> Vec<u8>;

    /// Restore previously serialized engine state. Must be called before
    /// `initialize`.
    fn deserialize(&mut self, state: &[u8]) -> Result<(), EngineError>;

    /// Obtain the signal handle for a module's data source.
    fn signal(&mut self, preset: ModulePreset) -> Result<SignalHandle, EngineError>;

    /// Signal carrying the board's MAC address, readable once.
    fn identity_signal(&mut self) -> Result<SignalHandle, EngineError>;

    /// Route a signal's data to the notification channel.
    fn subscribe(&mut self, handle: SignalHandle);

    /// Stop routing a signal's data.
    fn unsubscribe(&mut self, handle: SignalHandle);

    /// Trigger a one-shot read of a readable signal.
    fn read_signal(&mut self, handle: SignalHandle);

    /// Ask the board to log a signal; resolves via
    /// [`EngineEvent::LoggerCreated`] under `request`.
    fn create_logger(&mut self, handle: SignalHandle, request: RequestToken);

    /// Ask the board to create a timer; resolves via
    /// [`EngineEvent::TimerCreated`] under `request`.
    fn create_timer(&mut self, spec: TimerSpec, request: RequestToken);

    /// Start a created timer.
    fn start_timer(&mut self, timer: TimerHandle);

    /// Stop a running timer.
    fn stop_timer(&mut self, timer: TimerHandle);

    /// Remove a timer and free its board-side slot.
    fn remove_timer(&mut self, timer: TimerHandle);

    /// Record a timed read of `handle` against `timer`, the polled-stream
    /// primitive.
    fn record_timed_read(&mut self, timer: TimerHandle, handle: SignalHandle);

    /// Enter macro recording mode.
    fn macro_record(&mut self, execute_on_boot: bool);

    /// Leave macro recording mode; resolves via
    /// [`EngineEvent::MacroRecorded`] under `request`.
    fn macro_end_record(&mut self, request: RequestToken);

    /// Replay a recorded macro.
    fn macro_execute(&mut self, id: MacroId);
}
