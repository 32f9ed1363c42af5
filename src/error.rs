use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::serial::error::SerialPortError;

/// Errors thay may occur in this library.
///
/// Clonable and comparable so they may be published through the
/// [`crate::state::StateStore`] like any other value.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum Error {
    /// A candidate port could not be opened and closed.
    #[error("The port `{port}` is not usable. Problem: {problem}")]
    ProbeFailure {
        /// The port which failed the probe.
        port: String,

        /// Why it failed.
        problem: String,
    },

    /// A line from the device was not a JSON envelope.
    #[error("The line `{line}` could not be decoded. Problem: {problem}")]
    Decode {
        /// The start of the problematic line.
        line: String,

        /// The decoding issue.
        problem: String,
    },

    /// A JSON payload did not have the expected shape.
    #[error("The `{kind}` payload has the wrong shape. Problem: {problem}")]
    Schema {
        /// Which kind of payload was being decoded.
        kind: String,

        /// The deserialization issue.
        problem: String,
    },

    /// The device did not answer in time.
    #[error("No `{expected}` arrived within {millis} ms")]
    Timeout {
        /// What we were waiting for.
        expected: String,

        /// How long we waited.
        millis: u64,
    },

    /// The connection to the device went away.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Some other transport problem.
    #[error("IO problem: {0}")]
    Io(String),

    /// A configuration write could not be put on the wire.
    #[error("Could not write configs: {0}")]
    WriteFailure(String),

    /// The operation needs a connected device.
    #[error("No device is connected")]
    NotConnected,

    /// The configuration is not valid.
    #[error("Bad configuration: {0}")]
    BadConfig(String),
}

impl Error {
    /// Decode and schema problems are expected now and then,
    /// the device sometimes puts malformed frames on the wire.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Decode { .. } | Error::Schema { .. })
    }

    /// Errors after which the current connection can't be trusted anymore.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. } | Error::ConnectionLost(_) | Error::Io(_)
        )
    }

    /// Get the inner problem if this is a bad config error.
    pub fn try_into_bad_config(self) -> Result<String, Self> {
        if let Self::BadConfig(v) = self {
            Ok(v)
        } else {
            Err(self)
        }
    }

    pub(crate) fn decode<S: AsRef<[u8]>>(line: S, problem: impl ToString) -> Self {
        let line = String::from_utf8_lossy(line.as_ref());

        Self::Decode {
            line: line.chars().take(48).collect::<String>().trim().to_owned(),
            problem: problem.to_string(),
        }
    }
}

impl From<SerialPortError> for Error {
    fn from(error: SerialPortError) -> Self {
        match error {
            SerialPortError::IO(e) => Error::Io(e.to_string()),
            SerialPortError::Open { port, source } => {
                Error::Io(format!("could not open `{port}`: {source}"))
            }
            SerialPortError::Timeout(waited) => Error::Timeout {
                expected: "line".into(),
                millis: waited.as_millis() as u64,
            },
            SerialPortError::Disconnected => Error::ConnectionLost("serial port disconnected".into()),
            SerialPortError::NotConnected => Error::NotConnected,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io, time::Duration};

    use super::*;

    #[test]
    fn classification() {
        assert!(Error::decode("garbage", "not json").is_recoverable());
        assert!(Error::Schema {
            kind: "info_request".into(),
            problem: "missing field `key_5`".into()
        }
        .is_recoverable());

        assert!(Error::ConnectionLost("gone".into()).is_connection_fatal());
        assert!(Error::Io("broken pipe".into()).is_connection_fatal());
        assert!(!Error::WriteFailure("nope".into()).is_connection_fatal());
        assert!(!Error::WriteFailure("nope".into()).is_recoverable());
    }

    #[test]
    fn decode_error_truncates_long_lines() {
        let line = "x".repeat(500);
        let Error::Decode { line, .. } = Error::decode(line, "too long") else {
            panic!("Expected a decode error")
        };

        assert_eq!(line.len(), 48);
    }

    #[test]
    fn serial_errors_convert() {
        let timeout: Error = SerialPortError::Timeout(Duration::from_millis(250)).into();
        assert!(matches!(timeout, Error::Timeout { millis: 250, .. }));

        let io: Error = SerialPortError::IO(io::Error::from(io::ErrorKind::BrokenPipe)).into();
        assert!(io.is_connection_fatal());

        let gone: Error = SerialPortError::Disconnected.into();
        assert!(matches!(gone, Error::ConnectionLost(_)));
    }
}
