use std::{path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    catalog::{CandidateSource, NamePattern},
    error::Error,
    poller::PollerSettings,
    protocol::{ProtocolCodec, BOTTOM_DEADZONE_FIELD},
    serial::serial_port::DEFAULT_BAUD,
};

/// Requests slower than this are never useful for live telemetry.
const MAX_RESPONSE_TIMEOUT_MS: u64 = 10_000;

/// The configuration used for running the link.
///
/// Every field may be omitted from a configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Baud rate used when opening and probing ports.
    pub baud_rate: u32,

    /// Milliseconds between telemetry requests.
    pub poll_interval_ms: u64,

    /// How long the device may take to answer a request, in milliseconds.
    pub response_timeout_ms: u64,

    /// How often the device directory is checked for changes, in milliseconds.
    pub watcher_interval_ms: u64,

    /// Look for ports in this directory instead of the platform default.
    pub device_dir: Option<PathBuf>,

    /// Only consider device nodes starting with this.
    /// Only used together with `device_dir`.
    pub port_prefix: Option<String>,

    /// The wire name of the bottom deadzone setting.
    /// Older firmware uses `bootom_deadzone`.
    pub bottom_deadzone_field: String,

    /// Connect to the first port available while none has been selected.
    pub auto_connect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD,
            poll_interval_ms: 50,
            response_timeout_ms: 250,
            watcher_interval_ms: 50,
            device_dir: None,
            port_prefix: None,
            bottom_deadzone_field: BOTTOM_DEADZONE_FIELD.into(),
            auto_connect: false,
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(format!("Not a valid configuration: {e}")))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            device_dir: Some("/dev".into()),
            port_prefix: Some("ttyACM".into()),
            auto_connect: true,
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String, Error> {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::BadConfig(format!("Could not serialize: {e}")))
    }

    /// Setup a new configuration from a RON file.
    /// The result is validated.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let p = p.as_ref();
        let s = std::fs::read_to_string(p)
            .map_err(|e| Error::BadConfig(format!("Could not read {p:?}: {e}")))?;

        let config = Self::deserialize(&s)?;
        config.validate()?;

        Ok(config)
    }

    fn check_intervals(&self) -> Result<(), Error> {
        for (name, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("response_timeout_ms", self.response_timeout_ms),
            ("watcher_interval_ms", self.watcher_interval_ms),
        ] {
            if value == 0 {
                return Err(Error::BadConfig(format!("`{name}` must be larger than zero")));
            }
        }

        if self.response_timeout_ms > MAX_RESPONSE_TIMEOUT_MS {
            return Err(Error::BadConfig(format!(
                "`response_timeout_ms` is {}, but may be at most {MAX_RESPONSE_TIMEOUT_MS}",
                self.response_timeout_ms
            )));
        }

        Ok(())
    }

    fn check_fields(&self) -> Result<(), Error> {
        if self.baud_rate == 0 {
            return Err(Error::BadConfig("`baud_rate` must be larger than zero".into()));
        }

        if self.bottom_deadzone_field.trim().is_empty() {
            return Err(Error::BadConfig(
                "`bottom_deadzone_field` may not be empty".into(),
            ));
        }

        if self.port_prefix.is_some() && self.device_dir.is_none() {
            return Err(Error::BadConfig(
                "`port_prefix` is only used together with `device_dir`, please set both".into(),
            ));
        }

        Ok(())
    }

    /// Check that the values make sense together.
    pub fn validate(&self) -> Result<(), Error> {
        self.check_intervals()?;
        self.check_fields()?;

        Ok(())
    }

    /// Where port candidates come from.
    pub fn candidate_source(&self) -> CandidateSource {
        match &self.device_dir {
            Some(dir) => CandidateSource::Directory {
                dir: dir.clone(),
                pattern: NamePattern::prefix(self.port_prefix.as_deref().unwrap_or_default()),
            },
            None => CandidateSource::platform(),
        }
    }

    /// The codec matching the device's firmware.
    pub fn codec(&self) -> ProtocolCodec {
        ProtocolCodec::with_bottom_deadzone_field(&self.bottom_deadzone_field)
    }

    /// Timing of the poller.
    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            auto_connect: self.auto_connect,
        }
    }

    /// How often the watcher checks for device events.
    pub fn watcher_interval(&self) -> Duration {
        Duration::from_millis(self.watcher_interval_ms)
    }
}
