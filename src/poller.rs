//! The poller owns the transport.
//!
//! It connects when asked to, polls telemetry while connected,
//! and publishes everything it learns into the state store.

use std::{fmt::Display, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{interval, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    catalog::Port,
    correlator::RequestCorrelator,
    error::Error,
    records::Configs,
    state::{props, StoreHandle, Value},
    transport::Transport,
};

/// Where the poller is at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PollerState {
    /// Nothing is open.
    Idle,

    /// A port is being opened.
    Connecting,

    /// Connected, telemetry is requested periodically.
    Polling,

    /// The connection failed. Shortly followed by [`PollerState::Idle`].
    Faulted,
}

impl Display for PollerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PollerState::Idle => "idle",
            PollerState::Connecting => "connecting",
            PollerState::Polling => "polling",
            PollerState::Faulted => "faulted",
        };

        write!(f, "{s}")
    }
}

/// Timing and behaviour of the poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerSettings {
    /// Time between telemetry requests.
    pub poll_interval: Duration,

    /// How long a single request may take.
    pub response_timeout: Duration,

    /// Connect to the first available port while nothing is selected.
    pub auto_connect: bool,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            response_timeout: Duration::from_millis(250),
            auto_connect: false,
        }
    }
}

#[derive(Debug)]
enum Command {
    SelectPort(Port),
    Disconnect,
    RefreshConfigs,
    SaveConfigs {
        configs: Box<Configs>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    PortsChanged(Vec<Port>),
}

/// Talk to a running poller.
#[derive(Debug, Clone)]
pub struct PollerHandle(mpsc::UnboundedSender<Command>);

impl PollerHandle {
    /// Start a poller task.
    /// It runs until `cancel` fires, then closes the transport.
    pub fn spawn(
        transport: Transport,
        correlator: RequestCorrelator,
        settings: PollerSettings,
        store: StoreHandle,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let poller = Poller {
            transport,
            correlator,
            settings,
            store,
            state: PollerState::Idle,
            selected: None,
            removed: None,
            available: vec![],
            commands: rx,
        };

        let task = tokio::spawn(poller.run(cancel).instrument(info_span!("poller")));

        (Self(tx), task)
    }

    fn send(&self, command: Command) {
        if self.0.send(command).is_err() {
            warn!("Poller is not running");
        }
    }

    /// Connect to the given port, closing any current connection first.
    pub fn select_port(&self, port: Port) {
        self.send(Command::SelectPort(port))
    }

    /// Close the current connection.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect)
    }

    /// Request the device's configuration now.
    pub fn refresh_configs(&self) {
        self.send(Command::RefreshConfigs)
    }

    /// The ports available right now.
    pub fn ports_changed(&self, ports: Vec<Port>) {
        self.send(Command::PortsChanged(ports))
    }

    /// Write configs to the connected device.
    ///
    /// Failures are reported here and published to [`props::ERROR`], never retried.
    pub async fn save_configs(&self, configs: Configs) -> Result<(), Error> {
        let (reply, response) = oneshot::channel();

        self.0
            .send(Command::SaveConfigs {
                configs: Box::new(configs),
                reply,
            })
            .map_err(|_| Error::NotConnected)?;

        response.await.unwrap_or(Err(Error::NotConnected))
    }
}

struct Poller {
    transport: Transport,
    correlator: RequestCorrelator,
    settings: PollerSettings,
    store: StoreHandle,
    state: PollerState,

    // The last port asked for.
    selected: Option<Port>,

    // The port whose removal faulted the connection.
    removed: Option<Port>,

    // What the watcher reported last.
    available: Vec<Port>,

    commands: mpsc::UnboundedReceiver<Command>,
}

impl Poller {
    fn set_state(&mut self, state: PollerState) {
        if self.state != state {
            info!(from = %self.state, to = %state, "State change");
        }

        self.state = state;
        self.store.set(props::POLLER_STATE, state);
    }

    async fn connect(&mut self, port: Port, ticker: &mut Interval) {
        if self.transport.is_open() {
            self.store.set(props::INFO, Value::None);
        }

        self.selected = Some(port.clone());
        self.removed = None;
        self.store.set(props::SELECTED_PORT, port.clone());
        self.set_state(PollerState::Connecting);

        match self.transport.open(&port).await {
            Ok(()) => {
                self.set_state(PollerState::Polling);
                self.store.set(props::CONNECTED, true);
                self.store.set(props::ERROR, Value::None);

                ticker.reset();
                self.fetch_configs().await;
            }
            Err(e) => {
                let e = Error::from(e);
                warn!(%port, %e, "Could not connect");

                self.set_state(PollerState::Faulted);
                self.store.set(props::ERROR, e);
                self.set_state(PollerState::Idle);
                self.store.set(props::CONNECTED, false);
                self.store.set(props::INFO, Value::None);
            }
        }
    }

    fn disconnect(&mut self) {
        if !self.transport.is_open() {
            debug!("Nothing to disconnect");
            return;
        }

        self.transport.close();
        self.set_state(PollerState::Idle);
        self.store.set(props::CONNECTED, false);
        self.store.set(props::INFO, Value::None);
    }

    fn fault(&mut self, e: Error) {
        error!(%e, "Connection faulted");

        self.set_state(PollerState::Faulted);
        self.store.set(props::ERROR, e);

        self.transport.close();

        self.set_state(PollerState::Idle);
        self.store.set(props::CONNECTED, false);
        self.store.set(props::INFO, Value::None);
    }

    fn handle_error(&mut self, e: Error) {
        if e.is_recoverable() {
            warn!(%e, "Bad frame, continuing");
        } else if e.is_connection_fatal() {
            self.fault(e);
        } else {
            warn!(%e, "Request failed");
            self.store.set(props::ERROR, e);
        }
    }

    async fn poll_info(&mut self) {
        match self
            .correlator
            .info(&mut self.transport, self.settings.response_timeout)
            .await
        {
            Ok(info) => {
                self.store.set(props::INFO, info);
                self.store.set(props::LAST_UPDATE, Utc::now());
            }
            Err(e) => self.handle_error(e),
        }
    }

    async fn fetch_configs(&mut self) {
        if self.state != PollerState::Polling {
            debug!("Not connected, not fetching configs");
            return;
        }

        match self
            .correlator
            .configs(&mut self.transport, self.settings.response_timeout)
            .await
        {
            Ok(configs) => {
                debug!("Got configs");
                self.store.set(props::CONFIGS, configs);
            }
            Err(e) => self.handle_error(e),
        }
    }

    async fn save(&mut self, configs: Configs) -> Result<(), Error> {
        if !self.transport.is_open() {
            return Err(Error::NotConnected);
        }

        let line = self.correlator.codec().encode_configs(&configs)?;

        if let Err(e) = self.transport.write_line(&line).await {
            let e = Error::WriteFailure(e.to_string());
            warn!(%e, "Could not save configs");

            self.store.set(props::ERROR, e.clone());
            return Err(e);
        }

        info!("Configs saved");
        self.store.set(props::CONFIGS, configs);
        self.store.set(props::LAST_SAVE, Utc::now());

        Ok(())
    }

    async fn ports_changed(&mut self, ports: Vec<Port>, ticker: &mut Interval) {
        let before = std::mem::replace(&mut self.available, ports.clone());

        // Ports outside the candidates (e.g. `/dev/serial/by-id/..`) are never reported,
        // only one which was reported and is not anymore counts as removed.
        if let Some(port) = self.transport.port().cloned() {
            if before.contains(&port) && !ports.contains(&port) {
                self.fault(Error::ConnectionLost(format!("`{port}` was removed")));
                self.removed = Some(port);
            }
        }

        if !self.settings.auto_connect || self.state != PollerState::Idle {
            return;
        }

        let target = match (&self.selected, &self.removed) {
            (None, _) => ports.first().cloned(),
            (Some(_), Some(removed)) if ports.contains(removed) => Some(removed.clone()),
            _ => None,
        };

        if let Some(port) = target {
            info!(%port, "Connecting automatically");
            self.connect(port, ticker).await;
        }
    }

    async fn handle(&mut self, command: Command, ticker: &mut Interval) {
        match command {
            Command::SelectPort(port) => self.connect(port, ticker).await,
            Command::Disconnect => self.disconnect(),
            Command::RefreshConfigs => self.fetch_configs().await,
            Command::SaveConfigs { configs, reply } => {
                let result = self.save(*configs).await;

                if reply.send(result).is_err() {
                    debug!("Nobody waited for the save result");
                }
            }
            Command::PortsChanged(ports) => self.ports_changed(ports, ticker).await,
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        self.set_state(PollerState::Idle);
        self.store.set(props::CONNECTED, false);

        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Cancelled");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command, &mut ticker).await,
                    None => {
                        debug!("No more handles");
                        break;
                    }
                },
                _ = ticker.tick(), if self.state == PollerState::Polling => self.poll_info().await,
            }
        }

        self.transport.close();
    }
}
