//! Bluetooth Low Energy transport for boardlink
//!
//! Adapts a `btleplug` peripheral to the
//! [`BoardTransport`](boardlink_core::transport::BoardTransport) capability
//! consumed by `boardlink-session`. Scanning and peripheral selection stay
//! with the caller:
//!
//! ```no_run
//! use btleplug::api::{Central, Manager as _, ScanFilter};
//! use btleplug::platform::Manager;
//! use boardlink_btle::{BtleConfig, BtleTransport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = Manager::new().await?;
//! let adapter = manager.adapters().await?.into_iter().next().expect("adapter");
//! adapter.start_scan(ScanFilter::default()).await?;
//! // ... pick the peripheral advertising the board service ...
//! # let peripheral = unimplemented!();
//! let transport = BtleTransport::new(adapter, peripheral, BtleConfig::default());
//! # Ok(())
//! # }
//! ```

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod error;
pub mod transport;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::BtleConfig;
pub use error::BtleError;
pub use transport::BtleTransport;
