//! The transport owns at most one open connection to the device.
//!
//! Opening a new port closes whatever was open before,
//! so a handle is never leaked when the user switches ports.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    catalog::{HeldPort, Port},
    serial::{error::SerialPortError, SerialMessageBytes},
};

// Lines discarded at once at most, a chatty device can't stall a request.
const MAX_DISCARDED_LINES: usize = 64;

/// An open, line based connection.
#[async_trait]
pub trait Connection: Send {
    /// Read the next line, without its delimiter.
    ///
    /// Fails with [`SerialPortError::Timeout`] if no full line arrived in time.
    async fn read_line(&mut self, timeout: Duration) -> Result<SerialMessageBytes, SerialPortError>;

    /// Put a line on the wire.
    /// A newline is appended unless the line already ends with one.
    async fn write_line(&mut self, line: &[u8]) -> Result<(), SerialPortError>;
}

/// Something which is able to open connections to ports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open the given port.
    async fn connect(&self, port: &Port) -> Result<Box<dyn Connection>, SerialPortError>;
}

/// A single logical device slot.
pub struct Transport {
    connector: Arc<dyn Connector>,
    current: Option<(Port, Box<dyn Connection>)>,
    held: HeldPort,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("port", &self.port())
            .finish()
    }
}

impl Transport {
    /// Create a transport with nothing open.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            current: None,
            held: HeldPort::default(),
        }
    }

    /// Keep `held` up to date with the port open here.
    pub fn with_held(mut self, held: HeldPort) -> Self {
        self.held = held;
        self
    }

    /// Open the given port.
    /// Any connection open before this call is closed first, also if opening fails.
    pub async fn open(&mut self, port: &Port) -> Result<(), SerialPortError> {
        self.close();

        debug!(%port, "Opening");
        let connection = self.connector.connect(port).await?;
        info!(%port, "Opened");

        self.current = Some((port.clone(), connection));
        self.held.set(Some(port.clone()));

        Ok(())
    }

    /// Close the current connection, if any.
    pub fn close(&mut self) {
        if let Some((port, connection)) = self.current.take() {
            // Dropping the connection releases the handle.
            drop(connection);
            self.held.set(None);
            info!(%port, "Closed");
        }
    }

    /// The port currently open.
    pub fn port(&self) -> Option<&Port> {
        self.current.as_ref().map(|(port, _)| port)
    }

    /// Is anything open right now.
    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// See [`Connection::read_line`].
    pub async fn read_line(
        &mut self,
        timeout: Duration,
    ) -> Result<SerialMessageBytes, SerialPortError> {
        match self.current.as_mut() {
            Some((_, connection)) => connection.read_line(timeout).await,
            None => Err(SerialPortError::NotConnected),
        }
    }

    /// Throw away lines which already arrived, without waiting for more.
    /// Returns how many were discarded.
    pub async fn discard_pending(&mut self) -> Result<usize, SerialPortError> {
        for discarded in 0..MAX_DISCARDED_LINES {
            match self.read_line(Duration::ZERO).await {
                Ok(_) => {}
                Err(SerialPortError::Timeout(_)) => return Ok(discarded),
                Err(e) => return Err(e),
            }
        }

        Ok(MAX_DISCARDED_LINES)
    }

    /// See [`Connection::write_line`].
    pub async fn write_line(&mut self, line: &[u8]) -> Result<(), SerialPortError> {
        match self.current.as_mut() {
            Some((_, connection)) => connection.write_line(line).await,
            None => Err(SerialPortError::NotConnected),
        }
    }
}
