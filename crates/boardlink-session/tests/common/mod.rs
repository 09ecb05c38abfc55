//! Mock transport and engine used by the integration suites
//!
//! The mocks answer every trigger synchronously over the session's event
//! channels, which keeps scenarios deterministic: an awaited facade call
//! resolves only after the session task has walked the full exchange.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use boardlink_core::engine::{
    DataFrame, EngineBridge, EngineEvent, EngineWrite, ModulePreset, ProtocolEngine, TimerSpec,
};
use boardlink_core::errors::{EngineError, TransportError};
use boardlink_core::gatt::{
    self, CharacteristicId, ServiceId, FIRMWARE_REV_CHAR, HARDWARE_REV_CHAR, MANUFACTURER_CHAR,
    MODEL_NUMBER_CHAR, SERIAL_NUMBER_CHAR,
};
use boardlink_core::transport::{BoardTransport, TransportEvent, TransportEventSender};
use boardlink_core::types::{
    LoggerHandle, MacroId, RequestToken, SignalHandle, TimerHandle, WriteMode,
};

// ----------------------------------------------------------------------------
// Shared Journal
// ----------------------------------------------------------------------------

/// Interleaved record of transport writes and engine calls, for asserting
/// cross-component ordering (e.g. cleanup write before unsubscribe).
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn index_of(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn count_of(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }
}

// ----------------------------------------------------------------------------
// Mock Transport
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct TransportShared {
    events: Option<TransportEventSender>,
    writes: Vec<(CharacteristicId, Vec<u8>, WriteMode)>,
    begin_connection_calls: usize,
}

/// Test-side handle onto the mock transport's state and event channel.
#[derive(Clone)]
pub struct TransportProbe {
    shared: Arc<Mutex<TransportShared>>,
}

impl TransportProbe {
    pub fn begin_connection_calls(&self) -> usize {
        self.shared.lock().unwrap().begin_connection_calls
    }

    pub fn writes(&self) -> Vec<(CharacteristicId, Vec<u8>, WriteMode)> {
        self.shared.lock().unwrap().writes.clone()
    }

    pub fn command_writes(&self) -> Vec<Vec<u8>> {
        self.writes()
            .into_iter()
            .filter(|(c, _, _)| *c == gatt::COMMAND_CHAR)
            .map(|(_, data, _)| data)
            .collect()
    }

    /// Inject a transport event, e.g. a notification or an unexpected
    /// disconnect.
    pub fn emit(&self, event: TransportEvent) {
        let sender = self
            .shared
            .lock()
            .unwrap()
            .events
            .clone()
            .expect("transport not attached");
        sender.send(event).expect("session task gone");
    }

    /// Inject a board notification framed for [`MockEngine`]:
    /// `[handle: u32 le][tag: u8][epoch: u64 le][payload]`.
    pub fn emit_frame(&self, handle: SignalHandle, tag: u8, epoch_millis: u64, payload: &[u8]) {
        let mut data = handle.raw().to_le_bytes().to_vec();
        data.push(tag);
        data.extend_from_slice(&epoch_millis.to_le_bytes());
        data.extend_from_slice(payload);
        self.emit(TransportEvent::NotificationReceived {
            characteristic: gatt::NOTIFY_CHAR,
            data,
        });
    }
}

pub struct MockTransport {
    shared: Arc<Mutex<TransportShared>>,
    journal: Journal,
    /// Services reported by discovery.
    services: Vec<ServiceId>,
    /// Device-information values served to `read_value`.
    dis_values: HashMap<CharacteristicId, Vec<u8>>,
    fail_connect: Option<TransportError>,
    supports_ready: bool,
    /// When set, `begin_connection` does nothing until the test emits
    /// `Connected` itself; used for cancellation scenarios.
    manual_connect: bool,
}

impl MockTransport {
    pub fn new(journal: Journal) -> (Self, TransportProbe) {
        let shared = Arc::new(Mutex::new(TransportShared {
            events: None,
            writes: Vec::new(),
            begin_connection_calls: 0,
        }));
        let probe = TransportProbe {
            shared: shared.clone(),
        };
        let mut dis_values = HashMap::new();
        dis_values.insert(MANUFACTURER_CHAR, b"SensorWorks\0".to_vec());
        dis_values.insert(MODEL_NUMBER_CHAR, b"7\0".to_vec());
        dis_values.insert(SERIAL_NUMBER_CHAR, b"04A1F2\0".to_vec());
        dis_values.insert(FIRMWARE_REV_CHAR, b"1.7.3\0".to_vec());
        dis_values.insert(HARDWARE_REV_CHAR, b"0.4\0".to_vec());
        (
            Self {
                shared,
                journal,
                services: vec![
                    gatt::BOARD_SERVICE,
                    gatt::BATTERY_SERVICE,
                    gatt::DEVICE_INFO_SERVICE,
                ],
                dis_values,
                fail_connect: None,
                supports_ready: false,
                manual_connect: false,
            },
            probe,
        )
    }

    pub fn with_services(mut self, services: Vec<ServiceId>) -> Self {
        self.services = services;
        self
    }

    pub fn with_connect_failure(mut self, err: TransportError) -> Self {
        self.fail_connect = Some(err);
        self
    }

    pub fn with_ready_callback(mut self) -> Self {
        self.supports_ready = true;
        self
    }

    pub fn with_manual_connect(mut self) -> Self {
        self.manual_connect = true;
        self
    }

    fn send(&self, event: TransportEvent) {
        let sender = self.shared.lock().unwrap().events.clone();
        if let Some(sender) = sender {
            let _ = sender.send(event);
        }
    }
}

#[async_trait]
impl BoardTransport for MockTransport {
    fn attach(&mut self, events: TransportEventSender) {
        self.shared.lock().unwrap().events = Some(events);
    }

    async fn begin_connection(&mut self) -> Result<(), TransportError> {
        self.shared.lock().unwrap().begin_connection_calls += 1;
        if self.manual_connect {
            return Ok(());
        }
        match &self.fail_connect {
            Some(err) => self.send(TransportEvent::ConnectFailed(err.clone())),
            None => self.send(TransportEvent::Connected),
        }
        Ok(())
    }

    async fn cancel_connection(&mut self) -> Result<(), TransportError> {
        self.send(TransportEvent::Disconnected { error: None });
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.send(TransportEvent::Disconnected { error: None });
        Ok(())
    }

    async fn discover_services(&mut self, _services: &[ServiceId]) -> Result<(), TransportError> {
        self.send(TransportEvent::ServicesDiscovered(Ok(self.services.clone())));
        Ok(())
    }

    async fn discover_characteristics(
        &mut self,
        service: ServiceId,
        characteristics: &[CharacteristicId],
    ) -> Result<(), TransportError> {
        self.send(TransportEvent::CharacteristicsDiscovered {
            service,
            result: Ok(characteristics.to_vec()),
        });
        Ok(())
    }

    async fn write(
        &mut self,
        characteristic: CharacteristicId,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        self.journal.record(format!("write:{}", hex::encode(data)));
        self.shared
            .lock()
            .unwrap()
            .writes
            .push((characteristic, data.to_vec(), mode));
        Ok(())
    }

    async fn read_value(
        &mut self,
        characteristic: CharacteristicId,
    ) -> Result<(), TransportError> {
        let result = self
            .dis_values
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| TransportError::ReadFailed("no value configured".into()));
        self.send(TransportEvent::ValueUpdated {
            characteristic,
            result,
        });
        Ok(())
    }

    async fn set_notify(
        &mut self,
        characteristic: CharacteristicId,
        _enabled: bool,
    ) -> Result<(), TransportError> {
        self.send(TransportEvent::NotifyStateChanged {
            characteristic,
            error: None,
        });
        Ok(())
    }

    async fn read_rssi(&mut self) -> Result<(), TransportError> {
        self.send(TransportEvent::RssiRead(Ok(-55)));
        Ok(())
    }

    fn supports_ready_callback(&self) -> bool {
        self.supports_ready
    }
}

// ----------------------------------------------------------------------------
// Mock Engine
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct EngineShared {
    bridge: Option<EngineBridge>,
    subscribed: Vec<SignalHandle>,
}

/// Test-side handle onto the mock engine.
#[derive(Clone)]
pub struct EngineProbe {
    shared: Arc<Mutex<EngineShared>>,
}

impl EngineProbe {
    pub fn subscribed(&self) -> Vec<SignalHandle> {
        self.shared.lock().unwrap().subscribed.clone()
    }

    /// Inject an engine event directly (e.g. a data frame bypassing the
    /// notification wire format).
    pub fn emit(&self, event: EngineEvent) {
        let bridge = self
            .shared
            .lock()
            .unwrap()
            .bridge
            .clone()
            .expect("engine not attached");
        bridge.events.send(event).expect("session task gone");
    }
}

pub struct MockEngine {
    shared: Arc<Mutex<EngineShared>>,
    journal: Journal,
    init_status: i32,
    mac: String,
    signals: HashMap<ModulePreset, SignalHandle>,
    unsupported: Vec<ModulePreset>,
    next_handle: u32,
    next_resource: u8,
    restored_state: Option<Vec<u8>>,
}

/// Handle the mock mints for the MAC identity signal.
pub const IDENTITY_HANDLE: SignalHandle = SignalHandle::new(900);

impl MockEngine {
    pub fn new(journal: Journal) -> (Self, EngineProbe) {
        let shared = Arc::new(Mutex::new(EngineShared {
            bridge: None,
            subscribed: Vec::new(),
        }));
        let probe = EngineProbe {
            shared: shared.clone(),
        };
        (
            Self {
                shared,
                journal,
                init_status: 0,
                mac: "C8:4B:10:02:EF:50".to_string(),
                signals: HashMap::new(),
                unsupported: Vec::new(),
                next_handle: 1,
                next_resource: 1,
                restored_state: None,
            },
            probe,
        )
    }

    pub fn with_init_status(mut self, status: i32) -> Self {
        self.init_status = status;
        self
    }

    pub fn with_unsupported(mut self, preset: ModulePreset) -> Self {
        self.unsupported.push(preset);
        self
    }

    fn bridge(&self) -> EngineBridge {
        self.shared
            .lock()
            .unwrap()
            .bridge
            .clone()
            .expect("engine not attached")
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.bridge().events.send(event);
    }

    fn emit_write(&self, data: Vec<u8>) {
        let _ = self.bridge().writes.send(EngineWrite {
            characteristic: gatt::COMMAND_CHAR,
            data,
            mode: WriteMode::WithoutResponse,
        });
    }
}

impl ProtocolEngine for MockEngine {
    fn attach(&mut self, bridge: EngineBridge) {
        self.shared.lock().unwrap().bridge = Some(bridge);
    }

    fn initialize(&mut self) {
        self.journal.record("engine:initialize");
        // Handshake write, then the init status
        self.emit_write(vec![0xF0, 0x01]);
        self.emit(EngineEvent::Initialized {
            status: self.init_status,
        });
    }

    fn handle_notification(&mut self, data: &[u8]) {
        // Test framing: [handle: u32 le][tag: u8][epoch: u64 le][payload]
        if data.len() < 13 {
            return;
        }
        let handle = SignalHandle::new(u32::from_le_bytes(data[0..4].try_into().unwrap()));
        let type_tag = data[4];
        let epoch_millis = u64::from_le_bytes(data[5..13].try_into().unwrap());
        self.emit(EngineEvent::Data(DataFrame {
            handle,
            type_tag,
            epoch_millis,
            payload: data[13..].to_vec(),
        }));
    }

    fn handle_read_response(&mut self, _characteristic: CharacteristicId, _data: &[u8]) {}

    fn handle_disconnect(&mut self) {
        self.journal.record("engine:disconnect");
        self.shared.lock().unwrap().subscribed.clear();
    }

    fn serialize(&self) -> Vec<u8> {
        self.restored_state.clone().unwrap_or_else(|| vec![0xAB; 4])
    }

    fn deserialize(&mut self, state: &[u8]) -> Result<(), EngineError> {
        if state.is_empty() {
            return Err(EngineError::RestoreFailed("empty state blob".into()));
        }
        self.restored_state = Some(state.to_vec());
        Ok(())
    }

    fn signal(&mut self, preset: ModulePreset) -> Result<SignalHandle, EngineError> {
        if self.unsupported.contains(&preset) {
            return Err(EngineError::SignalUnavailable(format!("{:?}", preset)));
        }
        if let Some(handle) = self.signals.get(&preset) {
            return Ok(*handle);
        }
        let handle = SignalHandle::new(self.next_handle);
        self.next_handle += 1;
        self.signals.insert(preset, handle);
        Ok(handle)
    }

    fn identity_signal(&mut self) -> Result<SignalHandle, EngineError> {
        Ok(IDENTITY_HANDLE)
    }

    fn subscribe(&mut self, handle: SignalHandle) {
        self.journal.record(format!("engine:subscribe:{}", handle));
        self.shared.lock().unwrap().subscribed.push(handle);
        self.emit_write(vec![0xE1, handle.raw() as u8]);
    }

    fn unsubscribe(&mut self, handle: SignalHandle) {
        self.journal.record(format!("engine:unsubscribe:{}", handle));
        self.shared
            .lock()
            .unwrap()
            .subscribed
            .retain(|h| *h != handle);
        self.emit_write(vec![0xE2, handle.raw() as u8]);
    }

    fn read_signal(&mut self, handle: SignalHandle) {
        self.journal.record(format!("engine:read:{}", handle));
        self.emit_write(vec![0xE3, handle.raw() as u8]);
        if handle == IDENTITY_HANDLE {
            let mut payload = self.mac.as_bytes().to_vec();
            payload.push(0);
            self.emit(EngineEvent::Data(DataFrame {
                handle,
                type_tag: boardlink_core::payload::TypeTag::String as u8,
                epoch_millis: 0,
                payload,
            }));
        }
    }

    fn create_logger(&mut self, handle: SignalHandle, request: RequestToken) {
        self.journal.record(format!("engine:log:{}", handle));
        let logger = LoggerHandle::new(self.next_resource);
        self.next_resource += 1;
        self.emit(EngineEvent::LoggerCreated {
            request,
            result: Ok(logger),
        });
    }

    fn create_timer(&mut self, spec: TimerSpec, request: RequestToken) {
        self.journal
            .record(format!("engine:timer:{}", spec.period_ms));
        let timer = TimerHandle::new(self.next_resource);
        self.next_resource += 1;
        self.emit(EngineEvent::TimerCreated {
            request,
            result: Ok(timer),
        });
    }

    fn start_timer(&mut self, timer: TimerHandle) {
        self.journal.record(format!("engine:timer-start:{}", timer.raw()));
    }

    fn stop_timer(&mut self, timer: TimerHandle) {
        self.journal.record(format!("engine:timer-stop:{}", timer.raw()));
    }

    fn remove_timer(&mut self, timer: TimerHandle) {
        self.journal
            .record(format!("engine:timer-remove:{}", timer.raw()));
    }

    fn record_timed_read(&mut self, timer: TimerHandle, handle: SignalHandle) {
        self.journal
            .record(format!("engine:timed-read:{}:{}", timer.raw(), handle));
    }

    fn macro_record(&mut self, execute_on_boot: bool) {
        self.journal
            .record(format!("engine:macro-record:{}", execute_on_boot));
    }

    fn macro_end_record(&mut self, request: RequestToken) {
        self.journal.record("engine:macro-end");
        let id = MacroId::new(self.next_resource);
        self.next_resource += 1;
        self.emit(EngineEvent::MacroRecorded {
            request,
            result: Ok(id),
        });
    }

    fn macro_execute(&mut self, id: MacroId) {
        self.journal.record(format!("engine:macro-execute:{}", id.raw()));
    }
}

// ----------------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------------

pub struct Harness {
    pub journal: Journal,
    pub transport_probe: TransportProbe,
    pub engine_probe: EngineProbe,
}

/// Spawn a board on default mocks.
pub fn spawn_board() -> (boardlink_session::Board, Harness) {
    let journal = Journal::new();
    let (transport, transport_probe) = MockTransport::new(journal.clone());
    let (engine, engine_probe) = MockEngine::new(journal.clone());
    let board = boardlink_session::Board::spawn(
        Box::new(transport),
        Box::new(engine),
        boardlink_core::SessionConfig::default(),
    );
    (
        board,
        Harness {
            journal,
            transport_probe,
            engine_probe,
        },
    )
}
