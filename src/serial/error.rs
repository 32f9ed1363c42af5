use std::{io, time::Duration};

use thiserror::Error;

/// Any error the serial transport might encounter.
#[derive(Debug, Error)]
pub enum SerialPortError {
    /// IO related errors.
    #[error("Underlying IO problem: {0}")]
    IO(#[from] io::Error),

    /// The port could not be opened.
    #[error("Could not open serial port `{port}`")]
    Open {
        /// The port we tried to open.
        port: String,

        /// The reason.
        #[source]
        source: tokio_serial::Error,
    },

    /// Nothing complete arrived within the read timeout.
    #[error("Nothing read within {0:?}")]
    Timeout(Duration),

    /// Serial port disconnected.
    #[error("Serial port disconnected")]
    Disconnected,

    /// No serial port is open.
    #[error("No serial port is open")]
    NotConnected,
}
