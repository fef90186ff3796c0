//! Duplex transport manager.
//!
//! The [`TransportManager`] owns one [`TransportBackend`] and moves
//! messages across it with two background tasks:
//!
//! - the **transmit loop** takes one message per tick off the outbound
//!   queue, appends the line terminator and writes it;
//! - the **receive loop** polls the backend for a line each tick, trims it
//!   and hands it to the registered receive callback.
//!
//! Delivery is best-effort and at-most-once: a failed write drops the
//! message, a failed read skips the tick. Messages from one producer leave
//! in the order they were sent.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --start--> Running --stop--> Stopping --> Stopped
//!   \_________________________stop_______________/
//! ```
//!
//! `send` is accepted while Idle (messages wait for `start`) and Running,
//! and rejected once stopping has begun. `stop` cancels both loops, gives
//! them a grace period to finish an in-flight read or write, aborts
//! whatever is still running, and closes the backend exactly once. When
//! `stop` returns the backend is never touched again.
//!
//! # Receive callback
//!
//! The callback runs synchronously on the receive task; a slow callback
//! delays the next read. Errors it returns are logged and panics are
//! caught, so a consumer rejecting a malformed payload never takes the
//! loop down.

use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use strum::Display;
use tokio::{
    runtime::Handle,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::TransportConfig,
    error::{Error, Result},
    tracing::prelude::*,
    transport::{self, TransportBackend, TransportMode, LINE_TERMINATOR},
};

/// Consumer hook invoked with each received, trimmed line.
pub type ReceiveCallback = Arc<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>;

/// Manager lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TransportState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

// State shared with the background loops.
struct Shared {
    backend: Arc<dyn TransportBackend>,
    queue: Mutex<VecDeque<String>>,
    callback: Mutex<Option<ReceiveCallback>>,
}

impl Shared {
    fn dequeue(&self) -> Option<String> {
        self.queue.lock().pop_front()
    }

    fn deliver(&self, line: &str) {
        // Clone out of the slot so the callback may replace itself.
        let callback = self.callback.lock().clone();
        let Some(callback) = callback else {
            debug!(line, "RX (no receiver, dropped)");
            return;
        };

        debug!(line, "RX");
        match panic::catch_unwind(AssertUnwindSafe(|| callback(line))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(line, error = %e, "Receive callback rejected line"),
            Err(_) => error!(line, "Receive callback panicked"),
        }
    }
}

/// Sends and receives newline-terminated ASCII messages over a backend.
pub struct TransportManager {
    shared: Arc<Shared>,
    mode: TransportMode,
    state: Mutex<TransportState>,
    running: CancellationToken,
    tracker: TaskTracker,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    // Serializes stop() so later callers wait for the shutdown in progress
    stopping: tokio::sync::Mutex<()>,
    tx_interval: Duration,
    rx_interval: Duration,
    shutdown_grace: Duration,
}

impl TransportManager {
    /// Create a manager over the backend selected by `config`.
    ///
    /// A physical port that fails to open degrades to simulation; check
    /// [`mode`](Self::mode) for the outcome.
    pub async fn open(config: &TransportConfig) -> Result<Self> {
        let (backend, mode) = transport::open_backend(config).await?;
        Ok(Self::new(backend, mode, config))
    }

    /// Create a manager over an existing backend. The manager takes over
    /// closing it.
    pub fn new(
        backend: Arc<dyn TransportBackend>,
        mode: TransportMode,
        config: &TransportConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                queue: Mutex::new(VecDeque::new()),
                callback: Mutex::new(None),
            }),
            mode,
            state: Mutex::new(TransportState::Idle),
            running: CancellationToken::new(),
            tracker: TaskTracker::new(),
            tasks: Mutex::new(Vec::new()),
            stopping: tokio::sync::Mutex::new(()),
            tx_interval: config.tx_interval(),
            rx_interval: config.rx_interval(),
            shutdown_grace: config.shutdown_grace(),
        }
    }

    /// Effective backend kind.
    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock()
    }

    /// Messages waiting for the transmit loop.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Register the receive callback, replacing any previous one.
    pub fn set_receive_callback<F>(&self, callback: F)
    where
        F: Fn(&str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        *self.shared.callback.lock() = Some(Arc::new(callback));
    }

    /// Remove the receive callback; later lines are logged and dropped.
    pub fn clear_receive_callback(&self) {
        *self.shared.callback.lock() = None;
    }

    /// Spawn the transmit and receive loops.
    ///
    /// Must be called from within a tokio runtime. Calling it again while
    /// running does nothing; calling it after `stop` is an error.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            TransportState::Idle => {}
            TransportState::Running => {
                debug!("Transport already running");
                return Ok(());
            }
            TransportState::Stopping | TransportState::Stopped => {
                return Err(Error::Lifecycle(
                    "transport cannot be restarted after stop".to_string(),
                ));
            }
        }

        let handle = Handle::try_current()
            .map_err(|e| Error::Lifecycle(format!("start requires a tokio runtime: {e}")))?;

        let tx = self.tracker.spawn_on(
            transmit_loop(self.shared.clone(), self.running.clone(), self.tx_interval),
            &handle,
        );
        let rx = self.tracker.spawn_on(
            receive_loop(self.shared.clone(), self.running.clone(), self.rx_interval),
            &handle,
        );
        self.tasks.lock().extend([tx, rx]);

        *state = TransportState::Running;
        info!(mode = %self.mode, "Transport started");
        Ok(())
    }

    /// Stop both loops and close the backend.
    ///
    /// Idempotent. A call made while another is still shutting down waits
    /// for it, so every caller returns with the transport Stopped. If a
    /// `stop` future is dropped partway, the next call finishes the job.
    pub async fn stop(&self) {
        let _stopping = self.stopping.lock().await;
        {
            let mut state = self.state.lock();
            match *state {
                TransportState::Stopped => return,
                TransportState::Idle | TransportState::Running | TransportState::Stopping => {
                    *state = TransportState::Stopping;
                }
            }
        }

        trace!("Stopping transport loops.");
        self.running.cancel();
        self.tracker.close();

        if time::timeout(self.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(grace = ?self.shutdown_grace, "Transport loops still busy, aborting");
            let tasks = std::mem::take(&mut *self.tasks.lock());
            for task in &tasks {
                task.abort();
            }
            for task in tasks {
                let _ = task.await;
            }
        }

        let backend = &self.shared.backend;
        if let Err(e) = backend.flush().await {
            debug!(error = %e, "Ignoring error while flushing backend");
        }
        if let Err(e) = backend.close().await {
            debug!(error = %e, "Ignoring error while closing backend");
        }

        *self.state.lock() = TransportState::Stopped;
        info!("Transport stopped");
    }

    /// Queue `msg` for transmission.
    ///
    /// Never waits on I/O. The message must be non-empty ASCII without a
    /// line terminator; the transmit loop appends one.
    pub fn send(&self, msg: impl Into<String>) -> Result<()> {
        let msg = msg.into();
        validate_message(&msg)?;

        let state = self.state.lock();
        match *state {
            TransportState::Idle | TransportState::Running => {
                self.shared.queue.lock().push_back(msg);
                Ok(())
            }
            TransportState::Stopping | TransportState::Stopped => Err(Error::Lifecycle(
                "send on a stopped transport".to_string(),
            )),
        }
    }
}

impl Drop for TransportManager {
    fn drop(&mut self) {
        // Loops notice on their next tick; the backend closes when they
        // release it.
        self.running.cancel();
    }
}

fn validate_message(msg: &str) -> Result<()> {
    if msg.is_empty() {
        return Err(Error::InvalidMessage("message is empty".to_string()));
    }
    if msg.contains(['\n', '\r']) {
        return Err(Error::InvalidMessage(format!(
            "message contains a line terminator: {msg:?}"
        )));
    }
    if !msg.is_ascii() {
        return Err(Error::InvalidMessage(format!(
            "message is not ASCII: {msg:?}"
        )));
    }
    Ok(())
}

// Keep ASCII bytes and drop the rest, matching what a 7-bit line sends.
fn decode_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| b as char)
        .collect()
}

fn ticker(period: Duration) -> time::Interval {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn transmit_loop(shared: Arc<Shared>, running: CancellationToken, period: Duration) {
    trace!("Transmit loop started.");
    let mut ticker = ticker(period);

    loop {
        tokio::select! {
            biased;
            _ = running.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(msg) = shared.dequeue() else {
            continue;
        };

        let mut line = Vec::with_capacity(msg.len() + LINE_TERMINATOR.len());
        line.extend_from_slice(msg.as_bytes());
        line.extend_from_slice(LINE_TERMINATOR);

        match shared.backend.write(&line).await {
            Ok(()) => debug!(msg = %msg, "TX"),
            Err(e) => error!(msg = %msg, error = %e, "TX failed, message dropped"),
        }
    }

    trace!("Transmit loop stopped.");
}

async fn receive_loop(shared: Arc<Shared>, running: CancellationToken, period: Duration) {
    trace!("Receive loop started.");
    let mut ticker = ticker(period);
    let mut failures: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = running.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let bytes = match shared.backend.read_line().await {
            Ok(bytes) => {
                if failures > 0 {
                    info!(failures, "RX recovered");
                    failures = 0;
                }
                bytes
            }
            Err(e) => {
                // A dead line fails every tick; report the first of a run.
                if failures == 0 {
                    error!(error = %e, "RX failed");
                } else {
                    trace!(error = %e, failures, "RX still failing");
                }
                failures += 1;
                continue;
            }
        };

        if bytes.is_empty() {
            continue;
        }

        let line = decode_ascii(&bytes);
        let line = line.trim();
        if !line.is_empty() {
            shared.deliver(line);
        }
    }

    trace!("Receive loop stopped.");
}
