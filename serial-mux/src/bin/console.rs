//! Interactive setpoint console.
//!
//! Reads four comma-separated values per line from stdin, normalises them
//! to the wire format (one decimal place) and sends them to the peer.
//! Setpoints reported by the peer are logged. Exits on EOF, SIGINT or
//! SIGTERM.

use anyhow::Result;
use std::env;
use tokio::{
    io::{self, AsyncBufReadExt, BufReader},
    signal::unix::{self, SignalKind},
};

use serial_mux::payload::Setpoint;
use serial_mux::tracing::{self, prelude::*};
use serial_mux::{TransportConfig, TransportManager};

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_with_debug(env::var("SERIAL_MUX_DEBUG").is_ok());

    let config = TransportConfig::from_env()?;
    let manager = TransportManager::open(&config).await?;

    manager.set_receive_callback(|msg| {
        let setpoint: Setpoint = msg.parse()?;
        info!(%setpoint, "Peer position");
        Ok(())
    });
    manager.start()?;
    info!(peer = %config.peer, mode = %manager.mode(), "Started.");
    eprintln!("Enter 4 values separated by commas (val1,val2,val3,val4):");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    let mut lines = BufReader::new(io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<Setpoint>() {
            Ok(setpoint) => {
                let msg = setpoint.to_string();
                manager.send(msg.as_str())?;
                println!("[{} SENT] {}", config.peer, msg);
            }
            Err(e) => eprintln!("Invalid input: {e}"),
        }
    }

    trace!("Shutting down.");
    manager.stop().await;
    info!("Exiting.");
    Ok(())
}
