//! Device session: sole owner of the controller transport.
//!
//! The session serializes command issuance and enforces the per-command
//! acknowledgement/timeout contract. Command ordering is safety-critical on
//! this link, so a second `send` while one is in flight fails fast with
//! [`SessionError::SessionBusy`] instead of queuing: accidental reordering
//! under concurrent callers must be detected, not masked.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::connector::Connector;
use crate::protocol::{parse_ack, Ack, Command, ProtocolError};

/// Session lifecycle, reported by [`DeviceSession::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    /// A command is in flight.
    Busy,
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// Another command is already in flight. Never queued.
    #[error("session busy: another command is in flight")]
    SessionBusy,

    /// No acknowledgement within the command timeout. The device may or may
    /// not have executed the command; that ambiguity is surfaced, not hidden.
    #[error("no acknowledgement for '{command}' within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("session not connected")]
    NotConnected,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Owns the [`Connector`] and issues commands one at a time.
pub struct DeviceSession {
    connector: Mutex<Box<dyn Connector>>,
    connected: AtomicBool,
    busy: AtomicBool,
    timeout: Duration,
    /// Diagnostics only; never used for protocol correctness.
    commands_sent: AtomicU64,
}

/// Clears the busy flag when the in-flight command completes or times out.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl DeviceSession {
    pub fn new(connector: Box<dyn Connector>, timeout: Duration) -> Self {
        Self {
            connector: Mutex::new(connector),
            connected: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            timeout,
            commands_sent: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        if !self.connected.load(Ordering::SeqCst) {
            SessionState::Disconnected
        } else if self.busy.load(Ordering::SeqCst) {
            SessionState::Busy
        } else {
            SessionState::Connected
        }
    }

    /// Number of successfully acknowledged commands since connect.
    pub fn commands_sent(&self) -> u64 {
        self.commands_sent.load(Ordering::SeqCst)
    }

    pub async fn connect(&self) -> Result<(), SessionError> {
        let mut connector = self.connector.lock().await;
        connector
            .connect()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        self.connected.store(true, Ordering::SeqCst);
        debug!(transport = connector.name(), "device session connected");
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let mut connector = self.connector.lock().await;
        connector
            .disconnect()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn acquire(&self) -> Result<BusyGuard<'_>, SessionError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SessionError::NotConnected);
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SessionError::SessionBusy);
        }
        Ok(BusyGuard(&self.busy))
    }

    /// Send one command and wait for its acknowledgement or the timeout.
    ///
    /// On timeout the session returns to `Connected`; whether the device
    /// executed the command is unknown to the caller.
    pub async fn send(&self, command: &Command) -> Result<Ack, SessionError> {
        let _guard = self.acquire()?;
        let line = command.encode();
        let mut connector = self.connector.lock().await;

        let raw = match tokio::time::timeout(self.timeout, connector.send_raw(&line)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Err(SessionError::Transport(e.to_string())),
            Err(_) => {
                warn!(command = %line, timeout = ?self.timeout, "command timed out");
                return Err(SessionError::Timeout {
                    command: line,
                    timeout: self.timeout,
                });
            }
        };

        let ack = parse_ack(&raw)?;
        self.commands_sent.fetch_add(1, Ordering::SeqCst);
        debug!(command = %line, reply = %raw, "command acknowledged");
        Ok(ack)
    }

    /// Send a command the protocol defines as non-acknowledging.
    pub async fn send_fire_and_forget(&self, command: &Command) -> Result<(), SessionError> {
        let _guard = self.acquire()?;
        let line = command.encode();
        let mut connector = self.connector.lock().await;
        connector
            .send_raw_no_reply(&line)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        debug!(command = %line, "command sent (fire and forget)");
        Ok(())
    }
}
