//! Demo peer for the serial link.
//!
//! Sends `Hello from <peer> <n>` once a second and logs whatever the other
//! end sends back. Configured entirely from the environment (see
//! `TransportConfig::from_env`); set `SERIAL_MUX_DEBUG` to see every TX and
//! RX line.

use anyhow::Result;
use std::{env, time::Duration};
use tokio::{
    signal::unix::{self, SignalKind},
    time,
};

use serial_mux::tracing::{self, prelude::*};
use serial_mux::{TransportConfig, TransportManager};

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_with_debug(env::var("SERIAL_MUX_DEBUG").is_ok());

    let config = TransportConfig::from_env()?;
    let peer = config.peer;
    let manager = TransportManager::open(&config).await?;

    manager.set_receive_callback(move |msg| {
        info!(peer = %peer, msg, "Received");
        Ok(())
    });
    manager.start()?;
    info!(peer = %peer, mode = %manager.mode(), "Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    let mut ticker = time::interval(Duration::from_secs(1));
    let mut counter: u64 = 0;

    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            _ = ticker.tick() => {
                if let Err(e) = manager.send(format!("Hello from {peer} {counter}")) {
                    warn!(error = %e, "Send rejected");
                }
                counter += 1;
            }
        }
    }

    trace!("Shutting down.");
    manager.stop().await;
    info!("Exiting.");
    Ok(())
}
