//! A mock keypad, useful to test the link without the actual hardware.
//!
//! It answers requests the way the firmware does, applies configuration writes,
//! and lets a test inject noise, read errors and hang-ups.

use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::{
    catalog::{Port, Probe},
    error::Error,
    protocol::{Payload, ProtocolCodec, RequestKind},
    records::{Configs, Info},
    serial::{error::SerialPortError, SerialMessage, SerialMessageBytes},
    transport::{Connection, Connector},
};

/// What the next read on a mock connection produces.
#[derive(Debug)]
enum MockRead {
    Line(SerialMessageBytes),
    Error(io::ErrorKind),
    HangUp,
}

#[derive(Debug)]
struct MockState {
    info: Info,
    configs: Configs,
    codec: ProtocolCodec,

    // Put on the wire before every response.
    noise: Vec<SerialMessageBytes>,
    silent: bool,
    fail_config_writes: bool,

    busy: HashSet<Port>,
    requests: HashMap<RequestKind, usize>,
    written: Vec<SerialMessageBytes>,

    inbox: Option<mpsc::UnboundedSender<MockRead>>,
    open: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            info: Info::example(),
            configs: Configs::example(),
            codec: ProtocolCodec::default(),
            noise: vec![],
            silent: false,
            fail_config_writes: false,
            busy: HashSet::new(),
            requests: HashMap::new(),
            written: vec![],
            inbox: None,
            open: 0,
        }
    }
}

impl MockState {
    fn push(&self, read: MockRead) {
        match &self.inbox {
            Some(inbox) => {
                if inbox.send(read).is_err() {
                    debug!("Mock connection is gone, dropping read");
                }
            }
            None => debug!("No mock connection open, dropping read"),
        }
    }

    fn respond(&mut self, kind: RequestKind) {
        *self.requests.entry(kind).or_default() += 1;

        if self.silent {
            trace!(%kind, "Mock is silent, not responding");
            return;
        }

        let payload = match kind {
            RequestKind::Info => Payload::Info(self.info.clone()),
            RequestKind::Configs => Payload::Configs(self.configs.clone()),
        };

        let response = match self.codec.encode_response(&payload) {
            Ok(mut line) => {
                line.pop();
                line
            }
            Err(e) => {
                warn!(%e, "Mock could not encode response");
                return;
            }
        };

        for line in self.noise.clone() {
            self.push(MockRead::Line(line));
        }
        self.push(MockRead::Line(response));
    }

    fn apply(&mut self, line: &[u8]) {
        let configs = serde_json::from_slice(line)
            .map_err(|e| Error::decode(line, e))
            .and_then(|value| self.codec.decode_configs(value));

        match configs {
            Ok(configs) => {
                info!("Mock applied new configs");
                self.configs = configs;
            }
            Err(e) => debug!(%e, "Mock ignoring line"),
        }
    }
}

/// A mock device, shared between the test and every connection made to it.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    /// A device answering with [`Info::example`] and [`Configs::example`].
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer info requests with this from now on.
    pub fn set_info(&self, info: Info) {
        self.state().info = info;
    }

    /// Answer configs requests with this from now on.
    pub fn set_configs(&self, configs: Configs) {
        self.state().configs = configs;
    }

    /// The configs the device currently holds.
    pub fn configs(&self) -> Configs {
        self.state().configs.clone()
    }

    /// Use another codec, e.g. to act like older firmware.
    pub fn set_codec(&self, codec: ProtocolCodec) {
        self.state().codec = codec;
    }

    /// Put these lines on the wire ahead of every response.
    pub fn set_noise<I, L>(&self, lines: I)
    where
        I: IntoIterator<Item = L>,
        L: AsRef<[u8]>,
    {
        self.state().noise = lines.into_iter().map(|l| l.as_ref().to_vec()).collect();
    }

    /// Stop (or resume) answering requests.
    pub fn set_silent(&self, silent: bool) {
        self.state().silent = silent;
    }

    /// Make writes other than requests fail (or succeed again).
    pub fn set_fail_config_writes(&self, fail: bool) {
        self.state().fail_config_writes = fail;
    }

    /// The port can't be opened or probed.
    pub fn mark_busy(&self, port: Port) {
        self.state().busy.insert(port);
    }

    /// The port is usable again.
    pub fn mark_free(&self, port: &Port) {
        self.state().busy.remove(port);
    }

    /// Put a line on the wire of the open connection.
    pub fn inject_line<L: AsRef<[u8]>>(&self, line: L) {
        self.state().push(MockRead::Line(line.as_ref().to_vec()));
    }

    /// Make the next read of the open connection fail.
    pub fn inject_read_error(&self, kind: io::ErrorKind) {
        self.state().push(MockRead::Error(kind));
    }

    /// Act like the cable was pulled.
    pub fn hang_up(&self) {
        self.state().push(MockRead::HangUp);
    }

    /// How many requests of this kind were received.
    pub fn requests_seen(&self, kind: RequestKind) -> usize {
        self.state().requests.get(&kind).copied().unwrap_or_default()
    }

    /// Every line written to the device so far.
    pub fn written(&self) -> Vec<SerialMessageBytes> {
        self.state().written.clone()
    }

    /// How many connections are open right now.
    pub fn open_connections(&self) -> usize {
        self.state().open
    }
}

#[async_trait]
impl Connector for MockDevice {
    async fn connect(&self, port: &Port) -> Result<Box<dyn Connection>, SerialPortError> {
        let mut state = self.state();

        if state.busy.contains(port) {
            return Err(SerialPortError::Open {
                port: port.to_string(),
                source: tokio_serial::Error::new(
                    tokio_serial::ErrorKind::NoDevice,
                    "Device or resource busy",
                ),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.inbox = Some(tx.clone());
        state.open += 1;

        info!(%port, "Mock connection opened");

        Ok(Box::new(MockConnection {
            state: self.state.clone(),
            inbox: tx,
            rx,
        }))
    }
}

impl Probe for MockDevice {
    fn probe(&self, port: &Port) -> Result<(), Error> {
        if self.state().busy.contains(port) {
            Err(Error::ProbeFailure {
                port: port.to_string(),
                problem: "Device or resource busy".into(),
            })
        } else {
            Ok(())
        }
    }
}

struct MockConnection {
    state: Arc<Mutex<MockState>>,
    inbox: mpsc::UnboundedSender<MockRead>,
    rx: mpsc::UnboundedReceiver<MockRead>,
}

impl MockConnection {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn read_line(&mut self, timeout: Duration) -> Result<SerialMessageBytes, SerialPortError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_elapsed) => Err(SerialPortError::Timeout(timeout)),
            Ok(None) | Ok(Some(MockRead::HangUp)) => Err(SerialPortError::Disconnected),
            Ok(Some(MockRead::Error(kind))) => Err(SerialPortError::IO(kind.into())),
            Ok(Some(MockRead::Line(line))) => Ok(line),
        }
    }

    async fn write_line(&mut self, line: &[u8]) -> Result<(), SerialPortError> {
        let mut state = self.state();

        trace!("Mock got: `{}`", SerialMessage::new_lossy(line));

        let trimmed = line.strip_suffix(b"\n").unwrap_or(line);
        let request = std::str::from_utf8(trimmed)
            .ok()
            .and_then(|text| RequestKind::from_keyword(text.trim()));

        if let Some(kind) = request {
            state.written.push(line.to_vec());
            state.respond(kind);
            return Ok(());
        }

        if state.fail_config_writes {
            return Err(SerialPortError::IO(io::ErrorKind::BrokenPipe.into()));
        }

        state.written.push(line.to_vec());
        state.apply(trimmed);

        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        let mut state = self.state();
        state.open = state.open.saturating_sub(1);

        if state
            .inbox
            .as_ref()
            .is_some_and(|inbox| inbox.same_channel(&self.inbox))
        {
            state.inbox = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const WAIT: Duration = Duration::from_millis(100);

    async fn connect(device: &MockDevice) -> Box<dyn Connection> {
        device.connect(&Port::new("/dev/ttyMOCK0")).await.unwrap()
    }

    #[tokio::test]
    async fn answers_requests() {
        let device = MockDevice::new();
        let mut connection = connect(&device).await;

        connection.write_line(b"info_request\n").await.unwrap();
        let line = connection.read_line(WAIT).await.unwrap();

        let envelope = ProtocolCodec::default().decode_line(&line).unwrap();
        assert!(envelope.is_response_to(RequestKind::Info));
        assert_eq!(device.requests_seen(RequestKind::Info), 1);
        assert_eq!(device.requests_seen(RequestKind::Configs), 0);
    }

    #[tokio::test]
    async fn noise_comes_first() {
        let device = MockDevice::new();
        device.set_noise(["booting...", "{\"message_type\": \"log\"}"]);
        let mut connection = connect(&device).await;

        connection.write_line(b"configs_request\n").await.unwrap();

        assert_eq!(connection.read_line(WAIT).await.unwrap(), b"booting...");
        assert_eq!(
            connection.read_line(WAIT).await.unwrap(),
            b"{\"message_type\": \"log\"}"
        );
        assert!(connection.read_line(WAIT).await.is_ok());
    }

    #[tokio::test]
    async fn applies_config_writes() {
        let device = MockDevice::new();
        let mut connection = connect(&device).await;

        let mut configs = Configs::example();
        configs.general.rapid_trigger = false;

        let line = ProtocolCodec::default().encode_configs(&configs).unwrap();
        connection.write_line(&line).await.unwrap();

        assert_eq!(device.configs(), configs);
        assert_eq!(device.written(), vec![line.clone()]);

        device.set_fail_config_writes(true);
        assert!(connection.write_line(&line).await.is_err());
        assert!(connection.write_line(b"info_request\n").await.is_ok());
    }

    #[tokio::test]
    async fn injected_problems() {
        let device = MockDevice::new();
        let mut connection = connect(&device).await;

        device.inject_read_error(io::ErrorKind::BrokenPipe);
        assert!(matches!(
            connection.read_line(WAIT).await,
            Err(SerialPortError::IO(_))
        ));

        device.hang_up();
        assert!(matches!(
            connection.read_line(WAIT).await,
            Err(SerialPortError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn dropping_closes() {
        let device = MockDevice::new();
        let connection = connect(&device).await;
        assert_eq!(device.open_connections(), 1);

        drop(connection);
        assert_eq!(device.open_connections(), 0);
    }
}
