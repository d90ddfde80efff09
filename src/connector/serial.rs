//! Serial transport for the controller hub (RS-232).
//!
//! Blocking `serialport` I/O executed on Tokio's blocking pool. The
//! controller terminates commands with `\r` and replies line-by-line ending
//! in `\n`.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serialport::SerialPort;
use tracing::debug;

use crate::config::SerialSettings;

use super::Connector;

const COMMAND_TERMINATOR: &str = "\r";
const REPLY_DELIMITER: u8 = b'\n';

/// RS-232 connector for the controller hub.
pub struct SerialConnector {
    settings: SerialSettings,
    read_timeout: Duration,
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialConnector {
    pub fn new(settings: SerialSettings, read_timeout: Duration) -> Self {
        Self {
            settings,
            read_timeout,
            port: None,
        }
    }

    fn port(&self) -> Result<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port
            .clone()
            .ok_or_else(|| anyhow!("serial port '{}' not open", self.settings.port))
    }

    fn write_line(port: &Mutex<Box<dyn SerialPort>>, line: &str) -> Result<()> {
        let mut guard = port.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .write_all(format!("{}{}", line, COMMAND_TERMINATOR).as_bytes())
            .context("failed to write to serial port")?;
        guard.flush().context("failed to flush serial port")?;
        Ok(())
    }
}

#[async_trait]
impl Connector for SerialConnector {
    fn name(&self) -> &str {
        "serial"
    }

    async fn connect(&mut self) -> Result<()> {
        let port = serialport::new(&self.settings.port, self.settings.baud_rate)
            // Short internal timeout; the overall deadline is enforced below.
            .timeout(Duration::from_millis(50))
            .open()
            .with_context(|| {
                format!(
                    "failed to open serial port '{}' at {} baud",
                    self.settings.port, self.settings.baud_rate
                )
            })?;
        self.port = Some(Arc::new(Mutex::new(port)));
        debug!(port = %self.settings.port, baud = self.settings.baud_rate, "serial port opened");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!(port = %self.settings.port, "serial port closed");
        }
        Ok(())
    }

    async fn send_raw(&mut self, line: &str) -> Result<String> {
        let port = self.port()?;
        let command = line.to_string();
        let deadline = self.read_timeout;

        tokio::task::spawn_blocking(move || -> Result<String> {
            Self::write_line(&port, &command)?;
            debug!(command = %command, "serial command sent");

            let mut guard = port.lock().unwrap_or_else(|e| e.into_inner());
            let mut reply = String::new();
            let mut byte = [0u8; 1];
            let start = Instant::now();
            loop {
                if start.elapsed() > deadline {
                    return Err(anyhow!("serial read timeout after {:?}", deadline));
                }
                match guard.read(&mut byte) {
                    Ok(1) => {
                        if byte[0] == REPLY_DELIMITER {
                            break;
                        }
                        reply.push(byte[0] as char);
                    }
                    Ok(0) => return Err(anyhow!("unexpected EOF from serial port")),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(anyhow!("serial read error: {}", e)),
                    Ok(_) => unreachable!("single-byte read returned more than one byte"),
                }
            }
            let reply = reply.trim().to_string();
            debug!(reply = %reply, "serial reply");
            Ok(reply)
        })
        .await
        .context("serial I/O task panicked")?
    }

    async fn send_raw_no_reply(&mut self, line: &str) -> Result<()> {
        let port = self.port()?;
        let command = line.to_string();
        tokio::task::spawn_blocking(move || {
            Self::write_line(&port, &command)?;
            debug!(command = %command, "serial command sent (no reply expected)");
            Ok(())
        })
        .await
        .context("serial I/O task panicked")?
    }
}
