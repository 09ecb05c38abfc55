//! Session lifecycle state machine
//!
//! Pure transition logic for the connect/setup/teardown lifecycle. Each
//! event consumes the current state and yields the next state plus the
//! effects the session task must execute (transport triggers, engine calls,
//! waiter completion). Keeping the machine side-effect free makes every
//! lifecycle scenario testable without a transport.

use serde::{Deserialize, Serialize};

use boardlink_core::errors::{BoardError, TransportError};
use boardlink_core::gatt::{classify_service, ServiceId, ServiceKind};

// ----------------------------------------------------------------------------
// States
// ----------------------------------------------------------------------------

/// Lifecycle state of one device session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// No link, no attempt in flight.
    Disconnected,
    /// Transport connection requested, link not yet up.
    Connecting,
    /// Link up; walking the required service/characteristic table.
    /// `pending` counts outstanding characteristic-discovery requests.
    Discovering { bootloader: bool, pending: usize },
    /// Enabling the board's notification channel.
    EnablingNotifications,
    /// Protocol engine handshake in flight.
    Initializing,
    /// Reading device identity (device-information strings, MAC).
    ResolvingIdentity { bootloader: bool },
    /// Session usable. `bootloader` marks the degraded firmware-recovery
    /// variant that skipped engine initialization.
    Ready { bootloader: bool },
    /// Teardown in progress; waiting for the transport to confirm.
    Disconnecting { reason: TeardownReason },
}

/// Why a session is tearing down.
#[derive(Debug, Clone, PartialEq)]
pub enum TeardownReason {
    /// Caller asked for a disconnect from `Ready`, or the board closed the
    /// link cleanly.
    Requested,
    /// Caller cancelled an in-flight connection attempt.
    Cancelled,
    /// Transport or engine fault.
    Faulted(BoardError),
}

impl TeardownReason {
    /// The error surfaced to waiters of the attempt this teardown ends.
    pub fn waiter_error(&self) -> BoardError {
        match self {
            TeardownReason::Requested | TeardownReason::Cancelled => BoardError::Cancelled,
            TeardownReason::Faulted(err) => err.clone(),
        }
    }

    /// The terminal signal listeners receive: `None` means a graceful
    /// `Finished`, `Some` a `Failed`.
    pub fn listener_failure(&self) -> Option<BoardError> {
        match self {
            TeardownReason::Requested | TeardownReason::Cancelled => None,
            TeardownReason::Faulted(err) => Some(err.clone()),
        }
    }
}

/// Public, coarse-grained view of the lifecycle for the state observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    Discovering,
    Initializing,
    ResolvingIdentity,
    Ready,
    Disconnecting,
    Faulted,
}

impl SessionState {
    pub fn phase(&self) -> SessionPhase {
        match self {
            SessionState::Disconnected => SessionPhase::Disconnected,
            SessionState::Connecting => SessionPhase::Connecting,
            SessionState::Discovering { .. } | SessionState::EnablingNotifications => {
                SessionPhase::Discovering
            }
            SessionState::Initializing => SessionPhase::Initializing,
            SessionState::ResolvingIdentity { .. } => SessionPhase::ResolvingIdentity,
            SessionState::Ready { .. } => SessionPhase::Ready,
            SessionState::Disconnecting {
                reason: TeardownReason::Faulted(_),
            } => SessionPhase::Faulted,
            SessionState::Disconnecting { .. } => SessionPhase::Disconnecting,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Ready { .. })
    }

    /// Whether a connection attempt is in flight (between `connect()` and
    /// ready/faulted).
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::Discovering { .. }
                | SessionState::EnablingNotifications
                | SessionState::Initializing
                | SessionState::ResolvingIdentity { .. }
        )
    }

    fn name(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connecting => "Connecting",
            SessionState::Discovering { .. } => "Discovering",
            SessionState::EnablingNotifications => "EnablingNotifications",
            SessionState::Initializing => "Initializing",
            SessionState::ResolvingIdentity { .. } => "ResolvingIdentity",
            SessionState::Ready { .. } => "Ready",
            SessionState::Disconnecting { .. } => "Disconnecting",
        }
    }
}

// ----------------------------------------------------------------------------
// Events and Effects
// ----------------------------------------------------------------------------

/// Inputs that drive the lifecycle.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A caller invoked `connect()`. Joins the pending attempt if one is in
    /// flight.
    ConnectRequested,
    /// Transport reports the link is up.
    TransportConnected,
    /// Transport finished service discovery.
    ServicesDiscovered { services: Vec<ServiceId> },
    /// Transport finished characteristic discovery for one service.
    CharacteristicsDiscovered { service: ServiceId },
    /// Notification channel enabled.
    NotificationsEnabled,
    /// Engine initialization handshake completed with `status`.
    EngineInitialized { status: i32 },
    /// All identity fields this session can resolve are in.
    IdentityResolved,
    /// A caller invoked `disconnect()` (doubles as cancellation during
    /// setup).
    DisconnectRequested,
    /// Transport reports the link is down. `error` is `None` for a clean,
    /// locally requested or peer-initiated close.
    TransportDisconnected { error: Option<TransportError> },
    /// Something failed mid-lifecycle.
    Failed(BoardError),
}

/// Side effects the session task executes after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEffect {
    /// Ask the transport to connect.
    BeginConnection,
    /// Ask the transport to discover the board's service table.
    DiscoverServices,
    /// Ask the transport to discover one service's characteristics.
    DiscoverCharacteristics { kind: ServiceKind },
    /// Enable the board→host notification channel.
    EnableNotifications,
    /// Start the engine initialization handshake.
    InitializeEngine,
    /// Begin identity resolution (device-information reads, MAC).
    ResolveIdentity { bootloader: bool },
    /// Session reached ready: release connect waiters and queued work.
    EnterReady,
    /// Drain registry/scheduler, reset the engine, then drop or cancel the
    /// link. `cancel` distinguishes aborting an attempt from disconnecting
    /// an established link.
    BeginTeardown {
        reason: TeardownReason,
        cancel: bool,
    },
    /// Teardown confirmed: notify waiters, clear per-session bookkeeping.
    FinishDisconnect { reason: TeardownReason },
}

/// Result of applying one event.
#[derive(Debug, Clone)]
pub struct Transition {
    pub state: SessionState,
    pub effects: Vec<SessionEffect>,
}

/// Event arrived in a state that has no transition for it. Harmless for
/// late transport callbacks; the task logs and keeps the prior state.
#[derive(Debug, Clone, thiserror::Error)]
#[error("event {event} is not valid in state {state}")]
pub struct InvalidTransition {
    pub state: &'static str,
    pub event: &'static str,
}

fn event_name(event: &SessionEvent) -> &'static str {
    match event {
        SessionEvent::ConnectRequested => "ConnectRequested",
        SessionEvent::TransportConnected => "TransportConnected",
        SessionEvent::ServicesDiscovered { .. } => "ServicesDiscovered",
        SessionEvent::CharacteristicsDiscovered { .. } => "CharacteristicsDiscovered",
        SessionEvent::NotificationsEnabled => "NotificationsEnabled",
        SessionEvent::EngineInitialized { .. } => "EngineInitialized",
        SessionEvent::IdentityResolved => "IdentityResolved",
        SessionEvent::DisconnectRequested => "DisconnectRequested",
        SessionEvent::TransportDisconnected { .. } => "TransportDisconnected",
        SessionEvent::Failed(_) => "Failed",
    }
}

// ----------------------------------------------------------------------------
// Transition Function
// ----------------------------------------------------------------------------

impl SessionState {
    /// Apply one event, consuming the current state.
    pub fn transition(self, event: SessionEvent) -> Result<Transition, InvalidTransition> {
        use SessionEffect as Effect;
        use SessionEvent as Event;

        let invalid = InvalidTransition {
            state: self.name(),
            event: event_name(&event),
        };

        let (state, effects) = match (self, event) {
            // ---- Connect -----------------------------------------------
            (SessionState::Disconnected, Event::ConnectRequested) => {
                (SessionState::Connecting, vec![Effect::BeginConnection])
            }
            // Idempotent join: the task has already attached the caller to
            // the pending attempt, so no second transport request is issued
            (state, Event::ConnectRequested) if state.is_setup() => (state, Vec::new()),

            (SessionState::Connecting, Event::TransportConnected) => (
                SessionState::Discovering {
                    bootloader: false,
                    pending: 0,
                },
                vec![Effect::DiscoverServices],
            ),

            // ---- Discovery ---------------------------------------------
            (SessionState::Discovering { .. }, Event::ServicesDiscovered { services }) => {
                match plan_discovery(&services) {
                    Ok(plan) => {
                        let pending = plan.characteristic_requests.len();
                        let effects: Vec<Effect> = plan
                            .characteristic_requests
                            .iter()
                            .map(|&kind| Effect::DiscoverCharacteristics { kind })
                            .collect();
                        if pending > 0 {
                            (
                                SessionState::Discovering {
                                    bootloader: plan.bootloader,
                                    pending,
                                },
                                effects,
                            )
                        } else {
                            // Nothing to probe (bare bootloader advertisement)
                            (
                                SessionState::ResolvingIdentity { bootloader: true },
                                vec![Effect::ResolveIdentity { bootloader: true }],
                            )
                        }
                    }
                    Err(err) => fault(err),
                }
            }

            (
                SessionState::Discovering {
                    bootloader,
                    pending,
                },
                Event::CharacteristicsDiscovered { .. },
            ) => {
                let pending = pending.saturating_sub(1);
                if pending > 0 {
                    (
                        SessionState::Discovering {
                            bootloader,
                            pending,
                        },
                        Vec::new(),
                    )
                } else if bootloader {
                    // Recovery mode: no engine handshake, identity only
                    (
                        SessionState::ResolvingIdentity { bootloader: true },
                        vec![Effect::ResolveIdentity { bootloader: true }],
                    )
                } else {
                    (
                        SessionState::EnablingNotifications,
                        vec![Effect::EnableNotifications],
                    )
                }
            }

            (SessionState::EnablingNotifications, Event::NotificationsEnabled) => {
                (SessionState::Initializing, vec![Effect::InitializeEngine])
            }

            // ---- Engine init and identity ------------------------------
            (SessionState::Initializing, Event::EngineInitialized { status }) => {
                if status == 0 {
                    (
                        SessionState::ResolvingIdentity { bootloader: false },
                        vec![Effect::ResolveIdentity { bootloader: false }],
                    )
                } else {
                    fault(boardlink_core::errors::EngineError::InitFailed { status }.into())
                }
            }

            (SessionState::ResolvingIdentity { bootloader }, Event::IdentityResolved) => {
                (SessionState::Ready { bootloader }, vec![Effect::EnterReady])
            }

            // ---- Disconnect and cancellation ---------------------------
            (SessionState::Ready { .. }, Event::DisconnectRequested) => {
                let reason = TeardownReason::Requested;
                (
                    SessionState::Disconnecting {
                        reason: reason.clone(),
                    },
                    vec![Effect::BeginTeardown {
                        reason,
                        cancel: false,
                    }],
                )
            }
            (state, Event::DisconnectRequested) if state.is_setup() => {
                let reason = TeardownReason::Cancelled;
                (
                    SessionState::Disconnecting {
                        reason: reason.clone(),
                    },
                    vec![Effect::BeginTeardown {
                        reason,
                        cancel: true,
                    }],
                )
            }
            // Already tearing down or idle: nothing further to do
            (state @ SessionState::Disconnecting { .. }, Event::DisconnectRequested) => {
                (state, Vec::new())
            }
            (SessionState::Disconnected, Event::DisconnectRequested) => {
                (SessionState::Disconnected, Vec::new())
            }

            // ---- Failures ----------------------------------------------
            (state, Event::Failed(err)) if state.is_setup() || state.is_ready() => fault(err),
            (state @ SessionState::Disconnecting { .. }, Event::Failed(_)) => (state, Vec::new()),

            // ---- Transport-side disconnect -----------------------------
            (SessionState::Disconnecting { reason }, Event::TransportDisconnected { .. }) => (
                SessionState::Disconnected,
                vec![Effect::FinishDisconnect { reason }],
            ),
            (state, Event::TransportDisconnected { error })
                if state.is_setup() || state.is_ready() =>
            {
                // Link dropped out from under us: run the teardown effects
                // and complete in one step since the transport is gone
                let reason = match error {
                    Some(err) => TeardownReason::Faulted(err.into()),
                    None => TeardownReason::Requested,
                };
                (
                    SessionState::Disconnected,
                    vec![
                        Effect::BeginTeardown {
                            reason: reason.clone(),
                            cancel: false,
                        },
                        Effect::FinishDisconnect { reason },
                    ],
                )
            }

            (_, _) => return Err(invalid),
        };

        Ok(Transition { state, effects })
    }
}

/// The discovery outcome for a service list: which characteristic probes to
/// issue and whether the board advertised in bootloader mode.
struct DiscoveryPlan {
    bootloader: bool,
    characteristic_requests: Vec<ServiceKind>,
}

fn plan_discovery(services: &[ServiceId]) -> Result<DiscoveryPlan, BoardError> {
    let mut bootloader = false;
    let mut board_present = false;
    let mut requests = Vec::new();

    for &service in services {
        match classify_service(service) {
            Some(ServiceKind::Board) => {
                board_present = true;
                requests.push(ServiceKind::Board);
            }
            Some(ServiceKind::Bootloader) => bootloader = true,
            Some(kind @ (ServiceKind::Battery | ServiceKind::DeviceInfo)) => requests.push(kind),
            None => {
                return Err(TransportError::UnexpectedService(service).into());
            }
        }
    }

    if bootloader {
        // Recovery flows never touch the protocol service
        requests.retain(|kind| *kind != ServiceKind::Board);
    } else if !board_present {
        return Err(TransportError::DiscoveryFailed(
            "primary protocol service not advertised".into(),
        )
        .into());
    }

    Ok(DiscoveryPlan {
        bootloader,
        characteristic_requests: requests,
    })
}

fn fault(err: BoardError) -> (SessionState, Vec<SessionEffect>) {
    let reason = TeardownReason::Faulted(err);
    (
        SessionState::Disconnecting {
            reason: reason.clone(),
        },
        vec![SessionEffect::BeginTeardown {
            reason,
            cancel: true,
        }],
    )
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
