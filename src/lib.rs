#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

/// The command line interface.
pub mod cli;

/// Relates to config files.
pub mod config;

/// Possible errors in this library.
pub mod error;

/// Logging/tracing setup.
pub mod logging;

/// Serial port driver.
pub mod serial;

/// Finding ports which can be connected to.
pub mod catalog;

/// Watching for ports coming and going.
pub mod watcher;

/// A single open connection to the device.
pub mod transport;

/// Records the device sends and accepts.
pub mod records;

/// Framing and decoding of device messages.
pub mod protocol;

/// Requests and their responses.
pub mod correlator;

/// Where everything the device reports ends up.
pub mod state;

/// Periodically talks to the connected device.
pub mod poller;

/// Mocked device.
pub mod mock;
