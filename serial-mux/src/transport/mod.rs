//! Transport backends for the serial link.
//!
//! A backend moves raw, newline-terminated lines between this process and
//! the remote peer. It knows nothing about queues, loops or payloads; the
//! [`TransportManager`](crate::manager::TransportManager) drives it.
//!
//! Two backends exist:
//!
//! - [`PhysicalBackend`]: a real serial device with bounded timeouts.
//! - [`SimulatedFileBackend`]: two lock-protected text files emulating a
//!   full-duplex link between peers A and B on the same machine.
//!
//! [`open_backend`] chooses between them from configuration, falling back
//! to simulation when the device can't be opened.

mod codec;
mod physical;
mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{io, sync::Arc};
use strum::{Display, EnumString};

use crate::{config::TransportConfig, error::Result, tracing::prelude::*};

pub use codec::LineCodec;
pub use physical::PhysicalBackend;
pub use simulated::SimulatedFileBackend;

/// Line terminator appended to every outbound message.
pub const LINE_TERMINATOR: &[u8] = b"\n";

/// Capability set shared by every transport.
///
/// Methods take `&self` so the transmit and receive tasks can drive one
/// backend concurrently; implementations synchronize internally.
#[async_trait]
pub trait TransportBackend: Send + Sync {
    /// Write `bytes` (already terminated) to the link.
    async fn write(&self, bytes: &[u8]) -> io::Result<()>;

    /// Take the next complete line off the link, terminator removed.
    ///
    /// Returns an empty vector when nothing is available. Never blocks
    /// longer than the backend's read timeout.
    async fn read_line(&self) -> io::Result<Vec<u8>>;

    /// Push buffered output to the device.
    async fn flush(&self) -> io::Result<()>;

    /// Release the underlying resource.
    async fn close(&self) -> io::Result<()>;
}

/// One of the two named ends of a link.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Display, EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum PeerIdentity {
    #[serde(alias = "a")]
    A,
    #[serde(alias = "b")]
    B,
}

impl PeerIdentity {
    /// The other end of the link.
    pub fn remote(self) -> Self {
        match self {
            PeerIdentity::A => PeerIdentity::B,
            PeerIdentity::B => PeerIdentity::A,
        }
    }
}

/// Backend kind, requested or effective.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TransportMode {
    Physical,
    Simulated,
}

/// Construct the backend requested by `config`.
///
/// Returns the backend together with the mode actually in effect. A
/// physical device that fails to open is not an error: the failure is
/// logged and a simulated backend for `config.peer` is returned instead.
/// Only failing to set up the simulation files is reported.
pub async fn open_backend(
    config: &TransportConfig,
) -> Result<(Arc<dyn TransportBackend>, TransportMode)> {
    if config.mode == TransportMode::Physical {
        info!(port = %config.port, baud = config.baud_rate, "Opening serial port");
        match PhysicalBackend::open(config).await {
            Ok(backend) => {
                info!(port = %config.port, "Serial port opened");
                return Ok((Arc::new(backend), TransportMode::Physical));
            }
            Err(e) => {
                error!(port = %config.port, error = %e, "Could not open serial port");
                warn!("Falling back to simulation mode");
            }
        }
    }

    info!(peer = %config.peer, dir = %config.sim_dir.display(), "Using simulated serial");
    let backend = SimulatedFileBackend::new(config.peer, &config.sim_dir)?;
    Ok((Arc::new(backend), TransportMode::Simulated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("A", PeerIdentity::A ; "upper a")]
    #[test_case("b", PeerIdentity::B ; "lower b")]
    fn test_peer_from_str(input: &str, expected: PeerIdentity) {
        assert_eq!(input.parse::<PeerIdentity>().unwrap(), expected);
    }

    #[test]
    fn test_peer_remote() {
        assert_eq!(PeerIdentity::A.remote(), PeerIdentity::B);
        assert_eq!(PeerIdentity::B.remote(), PeerIdentity::A);
    }

    #[test_case("physical", TransportMode::Physical ; "physical")]
    #[test_case("SIMULATED", TransportMode::Simulated ; "simulated upper")]
    fn test_mode_from_str(input: &str, expected: TransportMode) {
        assert_eq!(input.parse::<TransportMode>().unwrap(), expected);
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(TransportMode::Simulated.to_string(), "simulated");
    }

    #[tokio::test]
    async fn test_simulated_requested() {
        let dir = tempfile::tempdir().unwrap();
        let config = TransportConfig {
            sim_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let (_, mode) = open_backend(&config).await.unwrap();
        assert_eq!(mode, TransportMode::Simulated);
    }

    #[tokio::test]
    async fn test_physical_open_failure_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = TransportConfig {
            mode: TransportMode::Physical,
            port: dir.path().join("no-such-tty").display().to_string(),
            peer: PeerIdentity::B,
            sim_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let (backend, mode) = open_backend(&config).await.unwrap();
        assert_eq!(mode, TransportMode::Simulated);

        // The fallback speaks as the configured peer: B writes b_to_a.txt.
        backend.write(b"ping\n").await.unwrap();
        let written = std::fs::read_to_string(dir.path().join("b_to_a.txt")).unwrap();
        assert_eq!(written, "ping\n");
    }
}
