//! Per-device session task
//!
//! One [`SessionTask`] per physical board is the single serialized execution
//! context the protocol engine requires: every engine call, registry/queue
//! mutation, and transport callback for the device funnels through this
//! task's loop. The task consumes facade commands, transport events, and
//! engine output, drives the pure lifecycle machine, and executes its
//! effects.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use boardlink_core::config::{FlowControlPolicy, SessionConfig};
use boardlink_core::engine::{DataFrame, EngineEvent, EngineWrite, ModulePreset, ProtocolEngine, TimerSpec};
use boardlink_core::errors::{BoardError, EngineError, Result};
use boardlink_core::gatt::{
    self, CharacteristicId, FIRMWARE_REV_CHAR, HARDWARE_REV_CHAR, MANUFACTURER_CHAR,
    MODEL_NUMBER_CHAR, NOTIFY_CHAR, SERIAL_NUMBER_CHAR,
};
use boardlink_core::payload::{decode_sample, DecodedValue};
use boardlink_core::transport::{BoardTransport, TransportEvent};
use boardlink_core::types::{
    DeviceIdentity, LoggerHandle, MacAddress, MacroId, RequestToken, SignalHandle, TimerHandle,
    Timestamp, WriteMode,
};

use crate::registry::{ListenerMode, ListenerToken, SignalEvent, SignalRegistry};
use crate::scheduler::{PendingWrite, WriteScheduler};
use crate::state::{
    SessionEffect, SessionEvent, SessionPhase, SessionState, TeardownReason, Transition,
};

// ----------------------------------------------------------------------------
// Facade Commands
// ----------------------------------------------------------------------------

/// Side-effect writes bracketing a stream's life: `configure` before the
/// subscription, `start` after it, `cleanup` on cancellation before the
/// unsubscribe takes effect. Each entry is an opaque command payload for the
/// board's command characteristic.
#[derive(Debug, Clone, Default)]
pub struct StreamActions {
    pub configure: Vec<Vec<u8>>,
    pub start: Vec<Vec<u8>>,
    pub cleanup: Vec<Vec<u8>>,
}

/// Commands sent from [`Board`](crate::board::Board) handles into the task.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    Connect {
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    AcquireSignal {
        preset: ModulePreset,
        reply: oneshot::Sender<Result<SignalHandle>>,
    },
    IssueCommand {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    ReadOnce {
        handle: SignalHandle,
        reply: oneshot::Sender<Result<mpsc::UnboundedReceiver<SignalEvent>>>,
    },
    StartStream {
        handle: SignalHandle,
        actions: StreamActions,
        reply: StreamReply,
    },
    StartPolledStream {
        handle: SignalHandle,
        timer: TimerHandle,
        reply: StreamReply,
    },
    StopStream {
        token: ListenerToken,
    },
    CreateLogger {
        handle: SignalHandle,
        reply: oneshot::Sender<Result<LoggerHandle>>,
    },
    CreateTimer {
        spec: TimerSpec,
        reply: oneshot::Sender<Result<TimerHandle>>,
    },
    StartTimer {
        timer: TimerHandle,
        reply: oneshot::Sender<Result<()>>,
    },
    StopTimer {
        timer: TimerHandle,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveTimer {
        timer: TimerHandle,
        reply: oneshot::Sender<Result<()>>,
    },
    RecordMacro {
        execute_on_boot: bool,
        actions: Vec<Vec<u8>>,
        reply: oneshot::Sender<Result<MacroId>>,
    },
    ExecuteMacro {
        id: MacroId,
        reply: oneshot::Sender<Result<()>>,
    },
    ReadRssi {
        reply: oneshot::Sender<Result<i16>>,
    },
    AverageRssi {
        window_ms: Option<u64>,
        reply: oneshot::Sender<Option<f64>>,
    },
    SerializeEngine {
        reply: oneshot::Sender<Vec<u8>>,
    },
    RestoreEngine {
        state: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
}

pub(crate) type StreamReply =
    oneshot::Sender<Result<(ListenerToken, mpsc::UnboundedReceiver<SignalEvent>)>>;

// ----------------------------------------------------------------------------
// Internal Bookkeeping
// ----------------------------------------------------------------------------

/// Single-shot completions for asynchronous engine exchanges, keyed by
/// request token.
#[derive(Debug)]
enum PendingRequest {
    Logger(oneshot::Sender<Result<LoggerHandle>>),
    Timer(oneshot::Sender<Result<TimerHandle>>),
    Macro(oneshot::Sender<Result<MacroId>>),
}

impl PendingRequest {
    fn fail(self, err: BoardError) {
        match self {
            PendingRequest::Logger(tx) => drop(tx.send(Err(err))),
            PendingRequest::Timer(tx) => drop(tx.send(Err(err))),
            PendingRequest::Macro(tx) => drop(tx.send(Err(err))),
        }
    }
}

/// What stopping a stream must do before its registry entry goes away.
#[derive(Debug)]
enum StreamCleanup {
    /// Issue these command writes.
    Commands(Vec<Vec<u8>>),
    /// Stop and remove the board timer driving a polled stream.
    Polled(TimerHandle),
}

#[derive(Debug)]
struct StreamEntry {
    handle: SignalHandle,
    cleanup: StreamCleanup,
}

/// Outstanding identity reads for the current attempt.
#[derive(Debug)]
struct IdentityProgress {
    pending_reads: Vec<CharacteristicId>,
    mac_pending: bool,
}

impl IdentityProgress {
    fn complete(&self) -> bool {
        self.pending_reads.is_empty() && !self.mac_pending
    }
}

// ----------------------------------------------------------------------------
// Session Task
// ----------------------------------------------------------------------------

pub(crate) struct SessionTask {
    config: SessionConfig,
    flow_policy: FlowControlPolicy,
    transport: Box<dyn BoardTransport>,
    engine: Box<dyn ProtocolEngine>,

    state: SessionState,
    scheduler: WriteScheduler,
    registry: SignalRegistry,

    commands: mpsc::Receiver<SessionCommand>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    engine_writes: mpsc::UnboundedReceiver<EngineWrite>,
    engine_events: mpsc::UnboundedReceiver<EngineEvent>,

    phase_tx: watch::Sender<SessionPhase>,
    identity_tx: watch::Sender<Option<DeviceIdentity>>,

    /// Survives teardown; only the MAC read is skipped on reconnection once
    /// cached.
    identity: DeviceIdentity,
    identity_progress: Option<IdentityProgress>,
    mac_handle: Option<SignalHandle>,

    connect_waiters: Vec<oneshot::Sender<Result<()>>>,
    disconnect_waiters: Vec<oneshot::Sender<Result<()>>>,
    pending_requests: HashMap<u64, PendingRequest>,
    next_request: u64,
    streams: HashMap<ListenerToken, StreamEntry>,
    rssi_waiters: Vec<oneshot::Sender<Result<i16>>>,
    rssi_history: VecDeque<(Timestamp, i16)>,
}

impl SessionTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: SessionConfig,
        transport: Box<dyn BoardTransport>,
        engine: Box<dyn ProtocolEngine>,
        commands: mpsc::Receiver<SessionCommand>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        engine_writes: mpsc::UnboundedReceiver<EngineWrite>,
        engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        phase_tx: watch::Sender<SessionPhase>,
        identity_tx: watch::Sender<Option<DeviceIdentity>>,
    ) -> Self {
        let flow_policy = if transport.supports_ready_callback() {
            FlowControlPolicy::ReadinessCallback
        } else {
            config.fallback_flow_control
        };
        Self {
            config,
            flow_policy,
            transport,
            engine,
            state: SessionState::Disconnected,
            scheduler: WriteScheduler::new(flow_policy),
            registry: SignalRegistry::new(),
            commands,
            transport_events,
            engine_writes,
            engine_events,
            phase_tx,
            identity_tx,
            identity: DeviceIdentity::default(),
            identity_progress: None,
            mac_handle: None,
            connect_waiters: Vec::new(),
            disconnect_waiters: Vec::new(),
            pending_requests: HashMap::new(),
            next_request: 0,
            streams: HashMap::new(),
            rssi_waiters: Vec::new(),
            rssi_history: VecDeque::new(),
        }
    }

    /// Restore a previously resolved identity so reconnection skips the MAC
    /// read.
    pub(crate) fn with_cached_identity(mut self, identity: DeviceIdentity) -> Self {
        let _ = self.identity_tx.send(Some(identity.clone()));
        self.identity = identity;
        self
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        // Every Board handle dropped: tear down and exit
                        if !matches!(self.state, SessionState::Disconnected) {
                            self.apply(SessionEvent::DisconnectRequested).await;
                        }
                        break;
                    }
                },
                Some(event) = self.transport_events.recv() => {
                    self.handle_transport_event(event).await;
                }
                Some(write) = self.engine_writes.recv() => {
                    self.scheduler.enqueue(PendingWrite {
                        characteristic: write.characteristic,
                        data: write.data,
                        mode: write.mode,
                    });
                    self.flush().await;
                }
                Some(event) = self.engine_events.recv() => {
                    self.handle_engine_event(event).await;
                }
            }
        }
        debug!("session task stopped");
    }

    // ------------------------------------------------------------------
    // Lifecycle machine driving
    // ------------------------------------------------------------------

    async fn apply(&mut self, event: SessionEvent) {
        let mut queue = VecDeque::new();
        queue.push_back(event);

        while let Some(event) = queue.pop_front() {
            match self.state.clone().transition(event) {
                Ok(Transition { state, effects }) => {
                    if state.phase() != self.state.phase() {
                        info!(phase = ?state.phase(), "session phase changed");
                    }
                    self.state = state;
                    let _ = self.phase_tx.send(self.state.phase());
                    for effect in effects {
                        let follow_ups = self.run_effect(effect).await;
                        queue.extend(follow_ups);
                    }
                }
                Err(invalid) => {
                    // Late transport callbacks after teardown land here
                    debug!(%invalid, "ignoring lifecycle event");
                }
            }
        }
    }

    async fn run_effect(&mut self, effect: SessionEffect) -> Vec<SessionEvent> {
        match effect {
            SessionEffect::BeginConnection => {
                if let Err(err) = self.transport.begin_connection().await {
                    return vec![SessionEvent::Failed(err.into())];
                }
                Vec::new()
            }
            SessionEffect::DiscoverServices => {
                let table = [
                    gatt::BOARD_SERVICE,
                    gatt::BOOTLOADER_SERVICE,
                    gatt::BATTERY_SERVICE,
                    gatt::DEVICE_INFO_SERVICE,
                ];
                if let Err(err) = self.transport.discover_services(&table).await {
                    return vec![SessionEvent::Failed(err.into())];
                }
                Vec::new()
            }
            SessionEffect::DiscoverCharacteristics { kind } => {
                let service = gatt::service_for(kind);
                let characteristics = gatt::characteristics_for(kind);
                if let Err(err) = self
                    .transport
                    .discover_characteristics(service, characteristics)
                    .await
                {
                    return vec![SessionEvent::Failed(err.into())];
                }
                Vec::new()
            }
            SessionEffect::EnableNotifications => {
                if let Err(err) = self.transport.set_notify(NOTIFY_CHAR, true).await {
                    return vec![SessionEvent::Failed(err.into())];
                }
                Vec::new()
            }
            SessionEffect::InitializeEngine => {
                self.engine.initialize();
                self.flush().await;
                Vec::new()
            }
            SessionEffect::ResolveIdentity { bootloader } => {
                self.begin_identity_resolution(bootloader).await
            }
            SessionEffect::EnterReady => {
                let _ = self.identity_tx.send(Some(self.identity.clone()));
                info!(identity = ?self.identity.mac, "session ready");
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                Vec::new()
            }
            SessionEffect::BeginTeardown { reason, cancel } => {
                self.begin_teardown(reason, cancel).await
            }
            SessionEffect::FinishDisconnect { reason } => {
                self.finish_disconnect(reason);
                Vec::new()
            }
        }
    }

    async fn begin_identity_resolution(&mut self, bootloader: bool) -> Vec<SessionEvent> {
        let mut progress = IdentityProgress {
            pending_reads: Vec::new(),
            mac_pending: false,
        };

        let reads = [
            (MANUFACTURER_CHAR, self.identity.manufacturer.is_some()),
            (MODEL_NUMBER_CHAR, self.identity.model_number.is_some()),
            (SERIAL_NUMBER_CHAR, self.identity.serial_number.is_some()),
            (FIRMWARE_REV_CHAR, self.identity.firmware_revision.is_some()),
            (HARDWARE_REV_CHAR, self.identity.hardware_revision.is_some()),
        ];
        for (characteristic, cached) in reads {
            if cached {
                continue;
            }
            if let Err(err) = self.transport.read_value(characteristic).await {
                return vec![SessionEvent::Failed(err.into())];
            }
            progress.pending_reads.push(characteristic);
        }

        if !bootloader && self.identity.mac.is_none() {
            match self.engine.identity_signal() {
                Ok(handle) => {
                    self.mac_handle = Some(handle);
                    self.engine.subscribe(handle);
                    self.engine.read_signal(handle);
                    progress.mac_pending = true;
                    self.flush().await;
                }
                Err(err) => return vec![SessionEvent::Failed(err.into())],
            }
        }

        if progress.complete() {
            return vec![SessionEvent::IdentityResolved];
        }
        self.identity_progress = Some(progress);
        Vec::new()
    }

    async fn begin_teardown(&mut self, reason: TeardownReason, cancel: bool) -> Vec<SessionEvent> {
        // Listener terminal events first, then drop everything queued. The
        // registry must hit zero subscriptions on every teardown path.
        self.registry.teardown_all(reason.listener_failure());
        let dropped = self.scheduler.drain();
        if dropped > 0 {
            debug!(dropped, "discarded queued writes at teardown");
        }
        self.streams.clear();
        self.identity_progress = None;
        self.mac_handle = None;

        let waiter_error = reason.waiter_error();
        for (_, request) in self.pending_requests.drain() {
            request.fail(waiter_error.clone());
        }
        for waiter in self.rssi_waiters.drain(..) {
            let _ = waiter.send(Err(waiter_error.clone()));
        }

        self.engine.handle_disconnect();
        // The engine may emit teardown-time writes; they go nowhere now
        while self.engine_writes.try_recv().is_ok() {}

        let result = if cancel {
            self.transport.cancel_connection().await
        } else {
            self.transport.disconnect().await
        };
        if let Err(err) = result {
            // Transport cannot confirm; synthesize the confirmation so the
            // machine still reaches Disconnected
            warn!(%err, "transport teardown trigger failed");
            return vec![SessionEvent::TransportDisconnected { error: None }];
        }
        Vec::new()
    }

    fn finish_disconnect(&mut self, reason: TeardownReason) {
        self.scheduler = WriteScheduler::new(self.flow_policy);

        let waiter_error = reason.waiter_error();
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(waiter_error.clone()));
        }
        for waiter in self.disconnect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        info!(?reason, "session disconnected");
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.apply(SessionEvent::TransportConnected).await,
            TransportEvent::ConnectFailed(err) => {
                self.apply(SessionEvent::Failed(err.into())).await;
            }
            TransportEvent::ServicesDiscovered(result) => match result {
                Ok(services) => {
                    self.apply(SessionEvent::ServicesDiscovered { services }).await;
                }
                Err(err) => self.apply(SessionEvent::Failed(err.into())).await,
            },
            TransportEvent::CharacteristicsDiscovered { service, result } => match result {
                Ok(_) => {
                    self.apply(SessionEvent::CharacteristicsDiscovered { service })
                        .await;
                }
                Err(err) => self.apply(SessionEvent::Failed(err.into())).await,
            },
            TransportEvent::NotifyStateChanged { error, .. } => match error {
                None => self.apply(SessionEvent::NotificationsEnabled).await,
                Some(err) => self.apply(SessionEvent::Failed(err.into())).await,
            },
            TransportEvent::ValueUpdated {
                characteristic,
                result,
            } => {
                self.handle_value_updated(characteristic, result).await;
            }
            TransportEvent::NotificationReceived {
                characteristic,
                data,
            } => {
                if characteristic == NOTIFY_CHAR {
                    self.engine.handle_notification(&data);
                    self.pump_engine().await;
                } else {
                    debug!(%characteristic, "notification on unexpected characteristic");
                }
            }
            TransportEvent::ReadyToSend => {
                let batch = self.scheduler.on_ready_to_send();
                self.transmit(batch).await;
            }
            TransportEvent::RssiRead(result) => {
                if let Ok(rssi) = &result {
                    self.rssi_history.push_front((Timestamp::now(), *rssi));
                    self.rssi_history.truncate(self.config.rssi_history);
                }
                for waiter in self.rssi_waiters.drain(..) {
                    let _ = waiter.send(result.clone().map_err(BoardError::from));
                }
            }
            TransportEvent::Disconnected { error } => {
                self.apply(SessionEvent::TransportDisconnected { error }).await;
            }
        }
    }

    async fn handle_value_updated(
        &mut self,
        characteristic: CharacteristicId,
        result: core::result::Result<Vec<u8>, boardlink_core::errors::TransportError>,
    ) {
        let identity_read = self
            .identity_progress
            .as_ref()
            .is_some_and(|p| p.pending_reads.contains(&characteristic));

        if !identity_read {
            // A read the engine requested for its own exchange
            if let Ok(data) = result {
                self.engine.handle_read_response(characteristic, &data);
                self.pump_engine().await;
            }
            return;
        }

        match result {
            Ok(data) => {
                let text = String::from_utf8_lossy(&data)
                    .trim_end_matches('\0')
                    .to_string();
                self.store_identity_field(characteristic, text);
                let complete = match self.identity_progress.as_mut() {
                    Some(progress) => {
                        progress.pending_reads.retain(|c| *c != characteristic);
                        progress.complete()
                    }
                    None => false,
                };
                if complete {
                    self.identity_progress = None;
                    self.apply(SessionEvent::IdentityResolved).await;
                }
            }
            Err(err) => {
                self.identity_progress = None;
                self.apply(SessionEvent::Failed(err.into())).await;
            }
        }
    }

    fn store_identity_field(&mut self, characteristic: CharacteristicId, text: String) {
        let field = match characteristic {
            c if c == MANUFACTURER_CHAR => &mut self.identity.manufacturer,
            c if c == MODEL_NUMBER_CHAR => &mut self.identity.model_number,
            c if c == SERIAL_NUMBER_CHAR => &mut self.identity.serial_number,
            c if c == FIRMWARE_REV_CHAR => &mut self.identity.firmware_revision,
            c if c == HARDWARE_REV_CHAR => &mut self.identity.hardware_revision,
            _ => return,
        };
        *field = Some(text);
    }

    // ------------------------------------------------------------------
    // Engine events
    // ------------------------------------------------------------------

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Initialized { status } => {
                self.apply(SessionEvent::EngineInitialized { status }).await;
            }
            EngineEvent::Data(frame) => self.handle_data_frame(frame).await,
            EngineEvent::LoggerCreated { request, result } => {
                match self.pending_requests.remove(&request.raw()) {
                    Some(PendingRequest::Logger(tx)) => {
                        let _ = tx.send(result.map_err(BoardError::from));
                    }
                    other => debug!(?other, "logger completion without matching request"),
                }
            }
            EngineEvent::TimerCreated { request, result } => {
                match self.pending_requests.remove(&request.raw()) {
                    Some(PendingRequest::Timer(tx)) => {
                        let _ = tx.send(result.map_err(BoardError::from));
                    }
                    other => debug!(?other, "timer completion without matching request"),
                }
            }
            EngineEvent::MacroRecorded { request, result } => {
                match self.pending_requests.remove(&request.raw()) {
                    Some(PendingRequest::Macro(tx)) => {
                        let _ = tx.send(result.map_err(BoardError::from));
                    }
                    other => debug!(?other, "macro completion without matching request"),
                }
            }
        }
    }

    async fn handle_data_frame(&mut self, frame: DataFrame) {
        if self.mac_handle == Some(frame.handle) {
            self.resolve_mac(frame).await;
            return;
        }

        let report = self.registry.deliver(&frame);
        if report.handle_now_empty {
            // Last listener gone (one-shot read completed or receiver
            // dropped): release the board-level subscription
            self.engine.unsubscribe(frame.handle);
            self.pump_engine().await;
        }
    }

    async fn resolve_mac(&mut self, frame: DataFrame) {
        self.engine.unsubscribe(frame.handle);
        self.mac_handle = None;
        self.flush().await;

        match decode_sample(&frame.payload, frame.type_tag, frame.epoch_millis) {
            Ok(sample) => {
                if let DecodedValue::String(text) = sample.value {
                    match MacAddress::parse(&text) {
                        Some(mac) => self.identity.mac = Some(mac),
                        None => warn!(%text, "board reported unparseable MAC"),
                    }
                }
            }
            Err(err) => warn!(%err, "undecodable identity frame"),
        }

        let complete = match self.identity_progress.as_mut() {
            Some(progress) => {
                progress.mac_pending = false;
                progress.complete()
            }
            None => false,
        };
        if complete {
            self.identity_progress = None;
            self.apply(SessionEvent::IdentityResolved).await;
        }
    }

    // ------------------------------------------------------------------
    // Facade commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect { reply } => match &self.state {
                SessionState::Ready { .. } => {
                    let _ = reply.send(Ok(()));
                }
                SessionState::Disconnected => {
                    self.connect_waiters.push(reply);
                    self.apply(SessionEvent::ConnectRequested).await;
                }
                state if state.is_setup() => {
                    // Join the pending attempt; no second transport request
                    self.connect_waiters.push(reply);
                }
                _ => {
                    let _ = reply.send(Err(BoardError::NotReady));
                }
            },
            SessionCommand::Disconnect { reply } => match &self.state {
                SessionState::Disconnected => {
                    let _ = reply.send(Ok(()));
                }
                _ => {
                    self.disconnect_waiters.push(reply);
                    self.apply(SessionEvent::DisconnectRequested).await;
                }
            },
            SessionCommand::AcquireSignal { preset, reply } => {
                let result = self.engine_op(|task| {
                    task.engine.signal(preset).map_err(|err| match err {
                        EngineError::SignalUnavailable(msg) => BoardError::UnsupportedSignal(msg),
                        other => other.into(),
                    })
                });
                let _ = reply.send(result);
            }
            SessionCommand::IssueCommand { data, reply } => {
                if !self.state.is_ready() {
                    let _ = reply.send(Err(BoardError::NotReady));
                    return;
                }
                self.enqueue_command_write(data);
                self.flush().await;
                // Fire-and-forget: success means accepted into the queue
                let _ = reply.send(Ok(()));
            }
            SessionCommand::ReadOnce { handle, reply } => {
                if let Err(err) = self.require_engine_session() {
                    let _ = reply.send(Err(err));
                    return;
                }
                let subscription = self.registry.subscribe(handle, ListenerMode::OneShot);
                self.engine.subscribe(handle);
                self.engine.read_signal(handle);
                self.flush().await;
                let _ = reply.send(Ok(subscription.events));
            }
            SessionCommand::StartStream {
                handle,
                actions,
                reply,
            } => {
                if let Err(err) = self.require_engine_session() {
                    let _ = reply.send(Err(err));
                    return;
                }
                // Configure on the wire before the subscription exists,
                // start strictly after it
                for data in &actions.configure {
                    self.enqueue_command_write(data.clone());
                }
                self.flush().await;
                let subscription = self.registry.subscribe(handle, ListenerMode::Continuous);
                self.engine.subscribe(handle);
                for data in &actions.start {
                    self.enqueue_command_write(data.clone());
                }
                self.flush().await;
                self.streams.insert(
                    subscription.token,
                    StreamEntry {
                        handle,
                        cleanup: StreamCleanup::Commands(actions.cleanup),
                    },
                );
                let _ = reply.send(Ok((subscription.token, subscription.events)));
            }
            SessionCommand::StartPolledStream {
                handle,
                timer,
                reply,
            } => {
                if let Err(err) = self.require_engine_session() {
                    let _ = reply.send(Err(err));
                    return;
                }
                self.engine.record_timed_read(timer, handle);
                let subscription = self.registry.subscribe(handle, ListenerMode::Continuous);
                self.engine.subscribe(handle);
                self.engine.start_timer(timer);
                self.flush().await;
                self.streams.insert(
                    subscription.token,
                    StreamEntry {
                        handle,
                        cleanup: StreamCleanup::Polled(timer),
                    },
                );
                let _ = reply.send(Ok((subscription.token, subscription.events)));
            }
            SessionCommand::StopStream { token } => self.stop_stream(token).await,
            SessionCommand::CreateLogger { handle, reply } => {
                if let Err(err) = self.require_engine_session() {
                    let _ = reply.send(Err(err));
                    return;
                }
                let token = self.next_request_token();
                self.pending_requests
                    .insert(token.raw(), PendingRequest::Logger(reply));
                self.engine.create_logger(handle, token);
                self.flush().await;
            }
            SessionCommand::CreateTimer { spec, reply } => {
                if let Err(err) = self.require_engine_session() {
                    let _ = reply.send(Err(err));
                    return;
                }
                let token = self.next_request_token();
                self.pending_requests
                    .insert(token.raw(), PendingRequest::Timer(reply));
                self.engine.create_timer(spec, token);
                self.flush().await;
            }
            SessionCommand::StartTimer { timer, reply } => {
                let result = self.engine_op(|task| {
                    task.engine.start_timer(timer);
                    Ok(())
                });
                self.flush().await;
                let _ = reply.send(result);
            }
            SessionCommand::StopTimer { timer, reply } => {
                let result = self.engine_op(|task| {
                    task.engine.stop_timer(timer);
                    Ok(())
                });
                self.flush().await;
                let _ = reply.send(result);
            }
            SessionCommand::RemoveTimer { timer, reply } => {
                let result = self.engine_op(|task| {
                    task.engine.remove_timer(timer);
                    Ok(())
                });
                self.flush().await;
                let _ = reply.send(result);
            }
            SessionCommand::RecordMacro {
                execute_on_boot,
                actions,
                reply,
            } => {
                if let Err(err) = self.require_engine_session() {
                    let _ = reply.send(Err(err));
                    return;
                }
                self.engine.macro_record(execute_on_boot);
                self.pump_engine_writes();
                // Recorded actions are deferred through the scheduler like
                // any other command write
                for data in actions {
                    self.enqueue_command_write(data);
                }
                let token = self.next_request_token();
                self.pending_requests
                    .insert(token.raw(), PendingRequest::Macro(reply));
                self.engine.macro_end_record(token);
                self.flush().await;
            }
            SessionCommand::ExecuteMacro { id, reply } => {
                let result = self.engine_op(|task| {
                    task.engine.macro_execute(id);
                    Ok(())
                });
                self.flush().await;
                let _ = reply.send(result);
            }
            SessionCommand::ReadRssi { reply } => {
                if matches!(self.state, SessionState::Disconnected) {
                    let _ = reply.send(Err(BoardError::NotReady));
                    return;
                }
                match self.transport.read_rssi().await {
                    Ok(()) => self.rssi_waiters.push(reply),
                    Err(err) => {
                        let _ = reply.send(Err(err.into()));
                    }
                }
            }
            SessionCommand::AverageRssi { window_ms, reply } => {
                let window = window_ms.unwrap_or(self.config.rssi_window_ms);
                let _ = reply.send(self.average_rssi(window));
            }
            SessionCommand::SerializeEngine { reply } => {
                let _ = reply.send(self.engine.serialize());
            }
            SessionCommand::RestoreEngine { state, reply } => {
                if !matches!(self.state, SessionState::Disconnected) {
                    let _ = reply.send(Err(BoardError::NotReady));
                    return;
                }
                let _ = reply.send(self.engine.deserialize(&state).map_err(BoardError::from));
            }
        }
    }

    async fn stop_stream(&mut self, token: ListenerToken) {
        let Some(entry) = self.streams.remove(&token) else {
            // Already stopped (teardown raced an explicit stop)
            return;
        };

        // Cleanup strictly before the bookkeeping entry is removed, so a
        // notification racing the cleanup writes is silently ignored rather
        // than delivered after cancellation
        match entry.cleanup {
            StreamCleanup::Commands(writes) => {
                for data in writes {
                    self.enqueue_command_write(data);
                }
                self.flush().await;
            }
            StreamCleanup::Polled(timer) => {
                self.engine.stop_timer(timer);
                self.engine.remove_timer(timer);
                self.flush().await;
            }
        }

        if let Some((handle, now_empty)) = self.registry.unsubscribe(token) {
            if now_empty {
                self.engine.unsubscribe(handle);
                self.flush().await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Engine-backed operations require a fully initialized session: ready
    /// state reached through the protocol path, not bootloader recovery.
    fn require_engine_session(&self) -> Result<()> {
        match self.state {
            SessionState::Ready { bootloader: false } => Ok(()),
            SessionState::Ready { bootloader: true } => Err(EngineError::RequestFailed(
                "protocol engine not initialized in recovery mode".into(),
            )
            .into()),
            _ => Err(BoardError::NotReady),
        }
    }

    fn engine_op<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.require_engine_session()?;
        op(self)
    }

    fn next_request_token(&mut self) -> RequestToken {
        let token = RequestToken::new(self.next_request);
        self.next_request += 1;
        token
    }

    fn enqueue_command_write(&mut self, data: Vec<u8>) {
        self.scheduler.enqueue(PendingWrite {
            characteristic: gatt::COMMAND_CHAR,
            data,
            mode: WriteMode::WithoutResponse,
        });
    }

    fn pump_engine_writes(&mut self) {
        while let Ok(write) = self.engine_writes.try_recv() {
            self.scheduler.enqueue(PendingWrite {
                characteristic: write.characteristic,
                data: write.data,
                mode: write.mode,
            });
        }
    }

    /// Move engine output produced synchronously by an engine call into the
    /// scheduler/loop before anything else happens.
    async fn pump_engine(&mut self) {
        self.pump_engine_writes();
        let batch = self.scheduler.dispatch();
        self.transmit(batch).await;
    }

    async fn flush(&mut self) {
        self.pump_engine().await;
    }

    async fn transmit(&mut self, batch: crate::scheduler::WriteBatch) {
        for write in batch {
            if let Err(err) = self
                .transport
                .write(write.characteristic, &write.data, write.mode)
                .await
            {
                // Link faults surface through a Disconnected event; a single
                // failed write is not itself session-fatal
                warn!(%err, characteristic = %write.characteristic, "write failed");
            }
        }
    }

    fn average_rssi(&self, window_ms: u64) -> Option<f64> {
        let now = Timestamp::now();
        let samples: Vec<i16> = self
            .rssi_history
            .iter()
            .filter(|(at, _)| now.millis_since(*at) <= window_ms)
            .map(|(_, rssi)| *rssi)
            .collect();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().map(|s| f64::from(*s)).sum::<f64>() / samples.len() as f64)
    }
}
