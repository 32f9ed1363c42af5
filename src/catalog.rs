//! Which serial ports are there, and which of them can be opened right now.

use std::{
    fmt::Display,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{error::Error, serial::serial_port::DEFAULT_BAUD};

/// A serial port, identified by its platform path.
/// Likely "/dev/ttyACMx" or "COMx".
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct Port(String);

impl Port {
    /// Create a new port identifier.
    pub fn new<S: AsRef<str>>(path: S) -> Self {
        Self(path.as_ref().into())
    }

    /// Borrowed form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Port {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Port {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for Port {
    fn from(path: String) -> Self {
        Self(path)
    }
}

/// The port this process holds open, if any.
///
/// Shared between the [`crate::transport::Transport`] holding it and the [`PortCatalog`],
/// since probing a port we hold open ourselves would fail.
#[derive(Debug, Clone, Default)]
pub struct HeldPort(Arc<Mutex<Option<Port>>>);

impl HeldPort {
    /// Nothing held.
    pub fn new() -> Self {
        Self::default()
    }

    /// The port currently held.
    pub fn get(&self) -> Option<Port> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn set(&self, port: Option<Port>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = port;
    }
}

/// Checks whether a port is free and connectable.
pub trait Probe: Send + Sync {
    /// Succeeds if the port could be opened and closed again.
    fn probe(&self, port: &Port) -> Result<(), Error>;
}

/// Probes by opening the actual serial port.
#[derive(Debug, Clone)]
pub struct SerialProbe {
    baud: u32,
}

impl SerialProbe {
    /// Probe at the given baud rate.
    pub fn new(baud: u32) -> Self {
        Self { baud }
    }
}

impl Default for SerialProbe {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD)
    }
}

impl Probe for SerialProbe {
    fn probe(&self, port: &Port) -> Result<(), Error> {
        tokio_serial::new(port.as_str(), self.baud)
            .timeout(Duration::from_millis(10))
            .open()
            // Dropping the port closes it.
            .map(drop)
            .map_err(|e| Error::ProbeFailure {
                port: port.to_string(),
                problem: e.to_string(),
            })
    }
}

/// Matches device node names, e.g. `tty[A-Za-z]*` or `tty.*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePattern {
    /// The name must start with this.
    pub prefix: String,

    /// The character right after the prefix must be alphabetic.
    pub then_alphabetic: bool,
}

impl NamePattern {
    /// Match anything starting with `prefix`.
    pub fn prefix<S: AsRef<str>>(prefix: S) -> Self {
        Self {
            prefix: prefix.as_ref().into(),
            then_alphabetic: false,
        }
    }

    /// Does the file name match.
    pub fn matches(&self, name: &str) -> bool {
        let Some(rest) = name.strip_prefix(&self.prefix) else {
            return false;
        };

        if self.then_alphabetic {
            rest.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        } else {
            true
        }
    }
}

/// Where port candidates come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateSource {
    /// Numbered names, e.g. `COM1` to `COM256`.
    Numbered {
        /// Name before the number.
        prefix: String,

        /// First number.
        first: u32,

        /// Last number, inclusive.
        last: u32,
    },

    /// Entries of a directory matching a pattern.
    Directory {
        /// Where to look.
        dir: PathBuf,

        /// What to look for.
        pattern: NamePattern,
    },

    /// A fixed list.
    Fixed(Vec<Port>),
}

impl CandidateSource {
    /// The conventional candidates of the platform we're running on.
    pub fn platform() -> Self {
        if cfg!(windows) {
            Self::Numbered {
                prefix: "COM".into(),
                first: 1,
                last: 256,
            }
        } else if cfg!(target_os = "macos") {
            Self::Directory {
                dir: "/dev".into(),
                pattern: NamePattern::prefix("tty."),
            }
        } else {
            // This excludes the current terminal, `/dev/tty`.
            Self::Directory {
                dir: "/dev".into(),
                pattern: NamePattern {
                    prefix: "tty".into(),
                    then_alphabetic: true,
                },
            }
        }
    }

    /// List candidates, in a stable order.
    pub fn candidates(&self) -> Vec<Port> {
        match self {
            CandidateSource::Numbered {
                prefix,
                first,
                last,
            } => (*first..=*last)
                .map(|n| Port::new(format!("{prefix}{n}")))
                .collect(),
            CandidateSource::Directory { dir, pattern } => directory_candidates(dir, pattern),
            CandidateSource::Fixed(ports) => ports.iter().unique().cloned().collect(),
        }
    }
}

fn directory_candidates(dir: &Path, pattern: &NamePattern) -> Vec<Port> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(?dir, ?e, "Could not list device directory");
            return vec![];
        }
    };

    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| pattern.matches(name))
        .sorted()
        .map(|name| Port::new(dir.join(name).to_string_lossy()))
        .collect()
}

/// Answers "what is currently connectable".
#[derive(Clone)]
pub struct PortCatalog {
    source: CandidateSource,
    probe: Arc<dyn Probe>,
    held: HeldPort,
}

impl std::fmt::Debug for PortCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortCatalog")
            .field("source", &self.source)
            .field("held", &self.held.get())
            .finish()
    }
}

impl PortCatalog {
    /// A catalog over the given candidates.
    pub fn new(source: CandidateSource, probe: Arc<dyn Probe>) -> Self {
        Self {
            source,
            probe,
            held: HeldPort::default(),
        }
    }

    /// Don't probe the port held open here, list it as long as it's a candidate.
    pub fn with_held(mut self, held: HeldPort) -> Self {
        self.held = held;
        self
    }

    /// The platform's candidates, probed as actual serial ports.
    pub fn platform(baud: u32) -> Self {
        Self::new(CandidateSource::platform(), Arc::new(SerialProbe::new(baud)))
    }

    /// Borrow the [`CandidateSource`].
    pub fn source(&self) -> &CandidateSource {
        &self.source
    }

    /// Ports which could be opened (and were closed again) just now.
    ///
    /// Ports failing the probe are left out, they are never an error.
    pub fn list_ports(&self) -> Vec<Port> {
        let held = self.held.get();

        self.source
            .candidates()
            .into_iter()
            .filter(|port| {
                if held.as_ref() == Some(port) {
                    trace!(%port, "Held here, not probing");
                    return true;
                }

                match self.probe.probe(port) {
                    Ok(()) => true,
                    Err(e) => {
                        trace!(%e, "Excluding port");
                        false
                    }
                }
            })
            .collect()
    }
}
