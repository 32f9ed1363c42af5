use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tokio_util::codec::{Decoder, Framed};
use tracing::{debug, trace, warn};

use crate::{
    catalog::Port,
    serial::{codecs::lines::LinesCodec, error::SerialPortError, SerialMessage, SerialMessageBytes},
    transport::{Connection, Connector},
};

/// The baud rate used when nothing else is configured.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Opens real serial ports.
#[derive(Debug, Clone)]
pub struct SerialPortBuilder {
    baud: u32,
    max_line_length: Option<usize>,
}

impl Default for SerialPortBuilder {
    fn default() -> Self {
        Self {
            baud: DEFAULT_BAUD,
            max_line_length: None,
        }
    }
}

impl SerialPortBuilder {
    /// Start a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the serial port builder's baud.
    /// Will use 115_200 if not set.
    pub fn set_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    /// See [`LinesCodec::with_max_length`].
    pub fn set_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = Some(max_line_length);
        self
    }

    fn codec(&self) -> LinesCodec {
        let codec = LinesCodec::default();

        match self.max_line_length {
            Some(max) => codec.with_max_length(max),
            None => codec,
        }
    }

    fn open(&self, port: &Port) -> Result<SerialStream, SerialPortError> {
        debug!(%port, baud = self.baud, "Opening port");

        let mut stream = tokio_serial::new(port.as_str(), self.baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|source| SerialPortError::Open {
                port: port.to_string(),
                source,
            })?;

        // USB CDC devices commonly hold back their output until DTR is asserted.
        if let Err(e) = stream.write_data_terminal_ready(true) {
            warn!(%port, ?e, "Could not assert DTR");
        }

        Ok(stream)
    }
}

#[async_trait]
impl Connector for SerialPortBuilder {
    async fn connect(&self, port: &Port) -> Result<Box<dyn Connection>, SerialPortError> {
        let stream = self.open(port)?;

        Ok(Box::new(SerialPortHandle {
            port: port.clone(),
            framed: self.codec().framed(stream),
        }))
    }
}

/// An open serial port, framed into lines.
pub(crate) struct SerialPortHandle {
    port: Port,
    framed: Framed<SerialStream, LinesCodec>,
}

#[async_trait]
impl Connection for SerialPortHandle {
    async fn read_line(&mut self, timeout: Duration) -> Result<SerialMessageBytes, SerialPortError> {
        match tokio::time::timeout(timeout, self.framed.next()).await {
            Err(_elapsed) => Err(SerialPortError::Timeout(timeout)),
            Ok(None) => Err(SerialPortError::Disconnected),
            Ok(Some(Ok(line))) => {
                trace!(port = %self.port, "Line from port: `{}`", SerialMessage::new_lossy(&line));
                Ok(line)
            }
            Ok(Some(Err(e))) => Err(e),
        }
    }

    async fn write_line(&mut self, line: &[u8]) -> Result<(), SerialPortError> {
        trace!(port = %self.port, "Line to port: `{}`", SerialMessage::new_lossy(line));
        self.framed.send(line.to_vec()).await
    }
}
