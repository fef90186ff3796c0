//! Configuration management for serial-mux.
//!
//! Configuration comes from an optional JSON file plus environment variable
//! overrides. Every field has a default, so an empty object (or no file at
//! all) yields a working simulated peer A.

use serde::{Deserialize, Serialize};
use std::{
    env,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::{
    error::{Error, Result},
    transport::{PeerIdentity, TransportMode},
};

/// Environment variable naming a JSON configuration file.
pub const CONFIG_PATH_ENV: &str = "SERIAL_MUX_CONFIG";

/// Transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Requested backend. Physical may still end up simulated if the
    /// device can't be opened.
    pub mode: TransportMode,

    /// Serial device path
    pub port: String,

    /// Serial baud rate
    pub baud_rate: u32,

    /// Which end of the simulated link this process is
    pub peer: PeerIdentity,

    /// Upper bound on a single physical write or flush
    pub write_timeout_ms: u64,

    /// Upper bound on a single physical line read
    pub read_timeout_ms: u64,

    /// Transmit loop tick
    pub tx_interval_ms: u64,

    /// Receive loop tick
    pub rx_interval_ms: u64,

    /// How long `stop` waits for the loops before aborting them
    pub shutdown_grace_ms: u64,

    /// Pause after opening a physical port, for boards that reset when
    /// the port opens
    pub settle_delay_ms: u64,

    /// Directory holding the simulated channel files
    pub sim_dir: PathBuf,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Simulated,
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 38400,
            peer: PeerIdentity::A,
            write_timeout_ms: 100,
            read_timeout_ms: 100,
            tx_interval_ms: 50,
            rx_interval_ms: 5,
            shutdown_grace_ms: 200,
            settle_delay_ms: 0,
            sim_dir: PathBuf::from("."),
        }
    }
}

impl TransportConfig {
    /// Load configuration from a specific JSON file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Load configuration from the environment.
    ///
    /// Starts from the file named by `SERIAL_MUX_CONFIG` if set, otherwise
    /// from defaults, then applies `SERIAL_MUX_MODE`, `SERIAL_MUX_PORT`,
    /// `SERIAL_MUX_BAUD`, `SERIAL_MUX_PEER` and `SERIAL_MUX_SIM_DIR`.
    pub fn from_env() -> Result<Self> {
        let base = match env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_from(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        base.with_overrides(|key| env::var(key).ok())
    }

    /// Apply overrides looked up through `lookup`.
    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(mode) = lookup("SERIAL_MUX_MODE") {
            self.mode = parse_var("SERIAL_MUX_MODE", &mode)?;
        }
        if let Some(port) = lookup("SERIAL_MUX_PORT") {
            self.port = port;
        }
        if let Some(baud) = lookup("SERIAL_MUX_BAUD") {
            self.baud_rate = parse_var("SERIAL_MUX_BAUD", &baud)?;
        }
        if let Some(peer) = lookup("SERIAL_MUX_PEER") {
            self.peer = parse_var("SERIAL_MUX_PEER", &peer)?;
        }
        if let Some(dir) = lookup("SERIAL_MUX_SIM_DIR") {
            self.sim_dir = PathBuf::from(dir);
        }
        Ok(self)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn tx_interval(&self) -> Duration {
        Duration::from_millis(self.tx_interval_ms)
    }

    pub fn rx_interval(&self) -> Duration {
        Duration::from_millis(self.rx_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{key}={value:?}: {e}")))
}
