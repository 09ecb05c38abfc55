//! Public operation surface for one board
//!
//! [`Board`] is a cheap, clonable handle over the session task's command
//! channel. Every operation resolves exactly once with a typed value or a
//! typed error; streams yield samples until cancelled or the session tears
//! down, at which point they receive one terminal event.
//!
//! The session applies no timeouts of its own: wire timing varies by
//! transport and firmware, so timeout policy belongs to the caller.

use tokio::sync::{mpsc, oneshot, watch};

use boardlink_core::config::SessionConfig;
use boardlink_core::engine::{EngineBridge, ModulePreset, ProtocolEngine, TimerSpec};
use boardlink_core::errors::{BoardError, Result};
use boardlink_core::payload::DecodedSample;
use boardlink_core::transport::BoardTransport;
use boardlink_core::types::{DeviceIdentity, LoggerHandle, MacroId, SignalHandle, TimerHandle};

use crate::registry::{ListenerToken, SignalEvent};
use crate::session::{SessionCommand, SessionTask, StreamActions};
use crate::state::SessionPhase;

// ----------------------------------------------------------------------------
// Board Handle
// ----------------------------------------------------------------------------

/// Handle to one physical board's session.
///
/// Exactly one session task exists per handle family; cloning shares it.
/// Dropping every clone (and every open stream) tears the session down.
#[derive(Debug, Clone)]
pub struct Board {
    commands: mpsc::Sender<SessionCommand>,
    phase: watch::Receiver<SessionPhase>,
    identity: watch::Receiver<Option<DeviceIdentity>>,
}

impl Board {
    /// Spawn the session task for a device and return its handle.
    ///
    /// The transport and engine are exclusively owned by the spawned task;
    /// all their activity happens on that one serialized context.
    pub fn spawn(
        transport: Box<dyn BoardTransport>,
        engine: Box<dyn ProtocolEngine>,
        config: SessionConfig,
    ) -> Self {
        Self::spawn_inner(transport, engine, config, None)
    }

    /// Like [`Board::spawn`], seeding the identity cache from a previous
    /// session so reconnection skips the MAC read.
    pub fn spawn_with_identity(
        transport: Box<dyn BoardTransport>,
        engine: Box<dyn ProtocolEngine>,
        config: SessionConfig,
        identity: DeviceIdentity,
    ) -> Self {
        Self::spawn_inner(transport, engine, config, Some(identity))
    }

    fn spawn_inner(
        mut transport: Box<dyn BoardTransport>,
        mut engine: Box<dyn ProtocolEngine>,
        config: SessionConfig,
        identity: Option<DeviceIdentity>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity);
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Disconnected);
        let (identity_tx, identity_rx) = watch::channel(None);

        transport.attach(transport_tx);
        engine.attach(EngineBridge {
            writes: write_tx,
            events: engine_tx,
        });

        let mut task = SessionTask::new(
            config,
            transport,
            engine,
            command_rx,
            transport_rx,
            write_rx,
            engine_rx,
            phase_tx,
            identity_tx,
        );
        if let Some(identity) = identity {
            task = task.with_cached_identity(identity);
        }
        tokio::spawn(task.run());

        Self {
            commands: command_tx,
            phase: phase_rx,
            identity: identity_rx,
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Connect and set up the board. Joins the pending attempt if one is in
    /// flight; resolves when the session reaches ready or the attempt
    /// fails. Cancellation surfaces as [`BoardError::Cancelled`], distinct
    /// from transport faults.
    pub async fn connect(&self) -> Result<()> {
        self.round_trip(|reply| SessionCommand::Connect { reply })
            .await?
    }

    /// Disconnect, or cancel an in-flight connection attempt. Resolves when
    /// teardown completes.
    pub async fn disconnect(&self) -> Result<()> {
        self.round_trip(|reply| SessionCommand::Disconnect { reply })
            .await?
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    /// Observable over lifecycle phase changes.
    pub fn watch_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.clone()
    }

    /// Device identity, once resolved. Survives disconnects.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.identity.borrow().clone()
    }

    /// Observable over identity resolution.
    pub fn watch_identity(&self) -> watch::Receiver<Option<DeviceIdentity>> {
        self.identity.clone()
    }

    // ------------------------------------------------------------------
    // Signals and data
    // ------------------------------------------------------------------

    /// Obtain the signal handle for a sensor module's data source.
    pub async fn signal(&self, preset: ModulePreset) -> Result<SignalHandle> {
        self.round_trip(|reply| SessionCommand::AcquireSignal { preset, reply })
            .await?
    }

    /// Issue an opaque protocol command. Fire-and-forget by design: resolves
    /// once the write is accepted into the outbound queue.
    pub async fn issue_command(&self, data: Vec<u8>) -> Result<()> {
        self.round_trip(|reply| SessionCommand::IssueCommand { data, reply })
            .await?
    }

    /// Read one value from a readable signal. The subscription is removed
    /// automatically after the first delivery, success or failure.
    pub async fn read_once(&self, handle: SignalHandle) -> Result<DecodedSample> {
        let mut events = self
            .round_trip(|reply| SessionCommand::ReadOnce { handle, reply })
            .await??;

        match events.recv().await {
            Some(SignalEvent::Sample(sample)) => Ok(sample),
            Some(SignalEvent::Failed(err)) => Err(err),
            // Session tore down before the board answered
            Some(SignalEvent::Finished) | None => Err(BoardError::Cancelled),
        }
    }

    /// Stream a signal continuously. `actions.configure` runs before the
    /// subscription, `actions.start` after it; `actions.cleanup` runs
    /// exactly once when the stream is stopped or dropped, strictly before
    /// the subscription is removed.
    pub async fn stream(&self, handle: SignalHandle, actions: StreamActions) -> Result<SampleStream> {
        let (token, events) = self
            .round_trip(|reply| SessionCommand::StartStream {
                handle,
                actions,
                reply,
            })
            .await??;
        Ok(SampleStream::new(token, events, self.commands.clone()))
    }

    /// Stream a readable signal by polling it with a board timer every
    /// `period_ms`. Stopping the stream stops and removes the timer.
    pub async fn stream_polled(&self, handle: SignalHandle, period_ms: u32) -> Result<SampleStream> {
        let timer = self.create_timer(TimerSpec::repeating(period_ms)).await?;
        let (token, events) = self
            .round_trip(|reply| SessionCommand::StartPolledStream {
                handle,
                timer,
                reply,
            })
            .await??;
        Ok(SampleStream::new(token, events, self.commands.clone()))
    }

    // ------------------------------------------------------------------
    // Loggers, timers, macros
    // ------------------------------------------------------------------

    /// Ask the board to log a signal to onboard storage.
    pub async fn create_logger(&self, handle: SignalHandle) -> Result<LoggerHandle> {
        self.round_trip(|reply| SessionCommand::CreateLogger { handle, reply })
            .await?
    }

    /// Create a board-side timer.
    pub async fn create_timer(&self, spec: TimerSpec) -> Result<TimerHandle> {
        self.round_trip(|reply| SessionCommand::CreateTimer { spec, reply })
            .await?
    }

    pub async fn start_timer(&self, timer: TimerHandle) -> Result<()> {
        self.round_trip(|reply| SessionCommand::StartTimer { timer, reply })
            .await?
    }

    pub async fn stop_timer(&self, timer: TimerHandle) -> Result<()> {
        self.round_trip(|reply| SessionCommand::StopTimer { timer, reply })
            .await?
    }

    pub async fn remove_timer(&self, timer: TimerHandle) -> Result<()> {
        self.round_trip(|reply| SessionCommand::RemoveTimer { timer, reply })
            .await?
    }

    /// Record a macro on the board. `actions` are opaque command payloads
    /// replayed on trigger (or on boot when `execute_on_boot`); they are
    /// deferred onto the write queue during recording, not executed
    /// immediately.
    pub async fn record_macro(
        &self,
        execute_on_boot: bool,
        actions: Vec<Vec<u8>>,
    ) -> Result<MacroId> {
        self.round_trip(|reply| SessionCommand::RecordMacro {
            execute_on_boot,
            actions,
            reply,
        })
        .await?
    }

    /// Replay a recorded macro.
    pub async fn execute_macro(&self, id: MacroId) -> Result<()> {
        self.round_trip(|reply| SessionCommand::ExecuteMacro { id, reply })
            .await?
    }

    // ------------------------------------------------------------------
    // Signal strength and engine state
    // ------------------------------------------------------------------

    /// Read the current signal strength. Valid while connected.
    pub async fn read_rssi(&self) -> Result<i16> {
        self.round_trip(|reply| SessionCommand::ReadRssi { reply })
            .await?
    }

    /// Smoothed signal strength over recent readings. `None` when no
    /// reading falls inside the window.
    pub async fn average_rssi(&self, window_ms: Option<u64>) -> Result<Option<f64>> {
        self.round_trip(|reply| SessionCommand::AverageRssi { window_ms, reply })
            .await
    }

    /// Dump the protocol engine's state for caller-side persistence.
    pub async fn serialize_engine(&self) -> Result<Vec<u8>> {
        self.round_trip(|reply| SessionCommand::SerializeEngine { reply })
            .await
    }

    /// Restore a persisted engine state blob. Valid only while
    /// disconnected, before the next `connect()`.
    pub async fn restore_engine(&self, state: Vec<u8>) -> Result<()> {
        self.round_trip(|reply| SessionCommand::RestoreEngine { state, reply })
            .await?
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    async fn round_trip<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| BoardError::Channel("session task is gone"))?;
        reply_rx
            .await
            .map_err(|_| BoardError::Channel("session task dropped the reply"))
    }
}

// ----------------------------------------------------------------------------
// Sample Stream
// ----------------------------------------------------------------------------

/// Consumer half of a continuous stream.
///
/// Yields decoded samples until [`stop`](SampleStream::stop) is called, the
/// handle is dropped, or the session tears down. Cleanup writes and the
/// registry unsubscribe run exactly once inside the session task, cleanup
/// strictly first.
#[derive(Debug)]
pub struct SampleStream {
    token: ListenerToken,
    events: mpsc::UnboundedReceiver<SignalEvent>,
    commands: mpsc::Sender<SessionCommand>,
    stopped: bool,
}

impl SampleStream {
    fn new(
        token: ListenerToken,
        events: mpsc::UnboundedReceiver<SignalEvent>,
        commands: mpsc::Sender<SessionCommand>,
    ) -> Self {
        Self {
            token,
            events,
            commands,
            stopped: false,
        }
    }

    /// Next sample, or the terminal outcome: `None` after a graceful end,
    /// `Some(Err(_))` once for a faulted one.
    pub async fn next(&mut self) -> Option<Result<DecodedSample>> {
        if self.stopped {
            return None;
        }
        match self.events.recv().await {
            Some(SignalEvent::Sample(sample)) => Some(Ok(sample)),
            Some(SignalEvent::Failed(err)) => {
                self.stopped = true;
                Some(Err(err))
            }
            Some(SignalEvent::Finished) | None => {
                self.stopped = true;
                None
            }
        }
    }

    /// Cancel the stream: cleanup writes are issued, then the subscription
    /// is removed. No sample is observed after this returns.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let _ = self
            .commands
            .send(SessionCommand::StopStream { token: self.token })
            .await;
    }
}

impl Drop for SampleStream {
    fn drop(&mut self) {
        if !self.stopped {
            // Best-effort cancellation when the consumer just drops the
            // stream; the registry also prunes dead listeners on delivery
            let _ = self
                .commands
                .try_send(SessionCommand::StopStream { token: self.token });
        }
    }
}
