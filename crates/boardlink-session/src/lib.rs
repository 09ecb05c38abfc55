//! boardlink session orchestration
//!
//! Stateful core of the boardlink stack: the per-device session task (one
//! serialized execution context per board), the outbound write scheduler,
//! the signal subscription registry, the lifecycle state machine, and the
//! [`Board`] facade callers operate through.
//!
//! ```no_run
//! use boardlink_core::{ModulePreset, SessionConfig};
//! use boardlink_session::{Board, StreamActions};
//! # async fn example(transport: Box<dyn boardlink_core::BoardTransport>,
//! #                  engine: Box<dyn boardlink_core::ProtocolEngine>) -> boardlink_core::Result<()> {
//! let board = Board::spawn(transport, engine, SessionConfig::default());
//! board.connect().await?;
//!
//! let accel = board.signal(ModulePreset::Accelerometer).await?;
//! let mut stream = board.stream(accel, StreamActions::default()).await?;
//! while let Some(sample) = stream.next().await {
//!     println!("{:?}", sample?);
//! }
//! # Ok(())
//! # }
//! ```

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod board;
pub mod registry;
pub mod scheduler;
mod session;
pub mod state;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use board::{Board, SampleStream};
pub use registry::{DeliveryReport, ListenerMode, ListenerToken, SignalEvent, SignalRegistry};
pub use scheduler::{OutboundWrite, PendingWrite, WriteScheduler};
pub use session::StreamActions;
pub use state::{SessionPhase, SessionState, TeardownReason};
