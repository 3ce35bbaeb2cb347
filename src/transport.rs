//! Shared serial transport.
//!
//! One physical RS-232 channel carries commands for every axis, so all
//! wire access funnels through a single [`SerialTransport`] guarded by a
//! mutex. A [`query`](Transport::query) holds that guard across the whole
//! write-then-read round trip: two axes may have requests pending at the
//! same time, but their bytes never interleave on the wire.
//!
//! The serial I/O itself is blocking and runs on tokio's blocking pool;
//! the issuing task only awaits, so unrelated axis operations keep making
//! progress between round trips.

use crate::error::TransportError;
use crate::protocol::LINE_TERMINATOR;
use async_trait::async_trait;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Byte-level access to the motor controller.
///
/// Implementations must guarantee that `query`'s write and its matching
/// read form one exclusive region: no other command may be written in
/// between.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one framed command without waiting for a response.
    async fn send(&self, command: &str) -> Result<(), TransportError>;

    /// Write one framed command and read the response line.
    async fn query(&self, command: &str) -> Result<String, TransportError>;
}

/// [`Transport`] over a real serial port.
pub struct SerialTransport {
    port_name: String,
    read_timeout: Duration,
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

impl SerialTransport {
    /// Open the serial port. `read_timeout` bounds every query round trip.
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let port = serialport::new(port_name, baud_rate)
            // Short internal timeout; the query loop owns the real deadline.
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|source| TransportError::PortUnavailable {
                port: port_name.to_string(),
                source,
            })?;

        debug!(port = port_name, baud_rate, "serial port opened");

        Ok(Self {
            port_name: port_name.to_string(),
            read_timeout,
            port: Arc::new(Mutex::new(port)),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&self, command: &str) -> Result<(), TransportError> {
        let framed = format!("{command}{LINE_TERMINATOR}");
        let port = self.port.clone();
        let log_command = command.to_string();

        tokio::task::spawn_blocking(move || -> Result<(), TransportError> {
            let mut guard = port.blocking_lock();
            guard
                .write_all(framed.as_bytes())
                .map_err(TransportError::Write)?;
            guard.flush().map_err(TransportError::Write)?;
            trace!(command = %log_command, "sent");
            Ok(())
        })
        .await
        .map_err(|e| TransportError::TaskJoin(e.to_string()))?
    }

    async fn query(&self, command: &str) -> Result<String, TransportError> {
        let framed = format!("{command}{LINE_TERMINATOR}");
        let port = self.port.clone();
        let log_command = command.to_string();
        let read_timeout = self.read_timeout;

        tokio::task::spawn_blocking(move || -> Result<String, TransportError> {
            // The lock spans write and read so no other axis's command can
            // slip in between and claim this response.
            let mut guard = port.blocking_lock();

            guard
                .write_all(framed.as_bytes())
                .map_err(TransportError::Write)?;
            guard.flush().map_err(TransportError::Write)?;
            trace!(command = %log_command, "sent, awaiting response");

            let deadline = Instant::now() + read_timeout;
            let mut response: Vec<u8> = Vec::with_capacity(64);
            let mut buf = [0u8; 64];

            loop {
                if response.contains(&b'\n') {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(TransportError::Timeout {
                        command: log_command,
                        timeout: read_timeout,
                    });
                }
                match guard.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => response.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(TransportError::Read(e)),
                }
            }

            let text = String::from_utf8_lossy(&response).trim().to_string();
            trace!(command = %log_command, response = %text, "response");
            Ok(text)
        })
        .await
        .map_err(|e| TransportError::TaskJoin(e.to_string()))?
    }
}
