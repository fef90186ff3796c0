//! Duplex serial transport.
//!
//! Two peers ("A" and "B") exchange short newline-terminated ASCII control
//! messages over a real serial device or, for development without
//! hardware, over a pair of files shared between two local processes.
//!
//! - [`transport`]: the backend abstraction and its physical and simulated
//!   implementations.
//! - [`manager`]: the [`TransportManager`](manager::TransportManager) with
//!   its transmit and receive loops.
//! - [`payload`]: the four-value setpoint messages the control
//!   applications exchange.

pub mod config;
pub mod error;
pub mod manager;
pub mod payload;
pub mod tracing;
pub mod transport;

pub use config::TransportConfig;
pub use error::{Error, Result};
pub use manager::{TransportManager, TransportState};
pub use transport::{PeerIdentity, TransportBackend, TransportMode};
