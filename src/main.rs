use std::{collections::BTreeSet, path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use itertools::Itertools;
use kzooting_link::{
    catalog::{CandidateSource, HeldPort, Port, PortCatalog, SerialProbe},
    cli::{self, Commands, Examples},
    config::Config,
    correlator::RequestCorrelator,
    logging,
    mock::MockDevice,
    poller::PollerHandle,
    protocol::{Payload, ProtocolCodec},
    records::{Configs, Info},
    serial::serial_port::SerialPortBuilder,
    state::{props, StateStore},
    transport::{Connector, Transport},
    watcher::{platform_events, DeviceEvents, ManualEvents, PortWatcher},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MOCK_PORT: &str = "/dev/ttyMOCK0";

struct Setup {
    connector: Arc<dyn Connector>,
    catalog: PortCatalog,
    events: Box<dyn DeviceEvents>,
    held: HeldPort,
}

impl Setup {
    fn hardware(config: &Config) -> Self {
        let held = HeldPort::new();
        let catalog = PortCatalog::new(
            config.candidate_source(),
            Arc::new(SerialProbe::new(config.baud_rate)),
        )
        .with_held(held.clone());
        let events = platform_events(catalog.source());

        Self {
            connector: Arc::new(SerialPortBuilder::new().set_baud(config.baud_rate)),
            catalog,
            events,
            held,
        }
    }

    fn mock(config: &Config) -> Self {
        let device = MockDevice::new();
        device.set_codec(config.codec());

        // Nothing ever plugs in or out.
        let (events, _trigger) = ManualEvents::new();
        let held = HeldPort::new();

        Self {
            connector: Arc::new(device.clone()),
            catalog: PortCatalog::new(
                CandidateSource::Fixed(vec![Port::new(MOCK_PORT)]),
                Arc::new(device),
            )
            .with_held(held.clone()),
            events: Box::new(events),
            held,
        }
    }
}

fn print_example(example: Examples) -> Result<()> {
    let codec = ProtocolCodec::default();

    let line = match example {
        Examples::Config => {
            println!("{}", Config::example().serialize_pretty()?);
            return Ok(());
        }
        Examples::InfoResponse => codec.encode_response(&Payload::Info(Info::example()))?,
        Examples::ConfigsResponse => {
            codec.encode_response(&Payload::Configs(Configs::example()))?
        }
    };

    print!("{}", String::from_utf8_lossy(&line));

    Ok(())
}

async fn list_ports(catalog: PortCatalog) -> Result<Vec<Port>> {
    Ok(tokio::task::spawn_blocking(move || catalog.list_ports()).await?)
}

/// Open the requested port, or the first one available.
async fn open(setup: &Setup, port: Option<&str>) -> Result<Transport> {
    let port = match port {
        Some(port) => Port::new(port),
        None => list_ports(setup.catalog.clone())
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| eyre!("No ports available, is the device plugged in?"))?,
    };

    let mut transport = Transport::new(setup.connector.clone()).with_held(setup.held.clone());
    transport
        .open(&port)
        .await
        .map_err(kzooting_link::error::Error::from)?;

    Ok(transport)
}

async fn dump_configs(config: &Config, setup: &Setup, port: Option<&str>) -> Result<()> {
    let mut transport = open(setup, port).await?;

    let configs = RequestCorrelator::new(config.codec())
        .configs(&mut transport, config.poller_settings().response_timeout)
        .await?;

    println!("{}", serde_json::to_string_pretty(&configs)?);

    Ok(())
}

async fn save_configs(config: &Config, setup: &Setup, port: Option<&str>, path: &Path) -> Result<()> {
    let configs: Configs = serde_json::from_str(&std::fs::read_to_string(path)?)?;

    let mut transport = open(setup, port).await?;
    let line = config.codec().encode_configs(&configs)?;

    transport
        .write_line(&line)
        .await
        .map_err(|e| kzooting_link::error::Error::WriteFailure(e.to_string()))?;

    info!(?path, "Configs written");

    Ok(())
}

#[cfg(unix)]
async fn hangup() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    signal(SignalKind::hangup())?.recv().await;

    Ok(())
}

#[cfg(not(unix))]
async fn hangup() -> Result<()> {
    std::future::pending().await
}

fn listen(store: &mut StateStore) {
    store.listen(props::AVAILABLE_PORTS, |value| {
        if let Some(ports) = value.as_ports() {
            info!("Available ports: [{}]", ports.iter().join(", "));
        }
    });

    store.listen(props::POLLER_STATE, |value| {
        if let Some(state) = value.as_poller_state() {
            info!(%state, "Poller");
        }
    });

    store.listen(props::ERROR, |value| {
        if let Some(e) = value.as_error() {
            error!(%e, "Device problem");
        }
    });

    store.listen(props::CONFIGS, |value| {
        if let Some(configs) = value.as_configs() {
            let g = &configs.general;
            info!(
                rapid_trigger = g.rapid_trigger,
                actuation_point = g.actuation_point,
                actuation_reset = g.actuation_reset,
                "Configs"
            );
        }
    });

    let view = store.view();
    let mut pressed = BTreeSet::new();

    store.listen(props::INFO, move |value| {
        let Some(info) = value.as_info() else {
            pressed.clear();
            return;
        };

        let now = info
            .keys()
            .iter()
            .enumerate()
            .filter(|(_, key)| key.state)
            .map(|(index, _)| index + 1)
            .collect::<BTreeSet<_>>();

        let distances = info
            .keys()
            .iter()
            .map(|key| format!("{:.2}", key.distance))
            .join(" ");

        if now != pressed {
            let port = view
                .get(props::SELECTED_PORT)
                .and_then(|port| port.as_port().cloned());

            info!(
                ?port,
                temperature = info.temperature,
                "Pressed: {:?}, distances: {distances}",
                now
            );
            pressed = now;
        } else {
            debug!(temperature = info.temperature, "Distances: {distances}");
        }
    });
}

async fn monitor(config: &Config, setup: Setup, port: Option<&str>) -> Result<()> {
    let cancel = CancellationToken::new();
    let mut store = StateStore::new();

    listen(&mut store);

    let (poller, poller_task) = PollerHandle::spawn(
        Transport::new(setup.connector).with_held(setup.held),
        RequestCorrelator::new(config.codec()),
        config.poller_settings(),
        store.handle(),
        cancel.clone(),
    );

    let watcher_task = PortWatcher::new(
        setup.catalog,
        setup.events,
        config.watcher_interval(),
        store.handle(),
    )
    .with_poller(poller.clone())
    .spawn(cancel.clone());

    if let Some(port) = port {
        poller.select_port(Port::new(port));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting")
        }
        result = hangup() => {
            result?;
            info!("Told to hang up, quitting")
        }
        _ = store.run(cancel.clone()) => {
            warn!("State store stopped");
        }
    }

    cancel.cancel();

    poller_task.await?;
    watcher_task.await?;

    store.dispatch_pending();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();
    let command = cli.command.clone().unwrap_or(Commands::Monitor);

    if let Commands::Examples(example) = command {
        return print_example(example);
    }

    logging::init(
        cli.log_level.into(),
        cli.log_dir.clone().map(|dir| (tracing::Level::DEBUG, dir)),
    )
    .await;

    let config = if let Some(config_path) = &cli.config {
        debug!(?config_path, "Config from path");
        Config::new_from_path(config_path)?
    } else {
        debug!("Default config");
        Config::default()
    };

    let setup = if cli.mock {
        info!("Using a mock device");
        Setup::mock(&config)
    } else {
        Setup::hardware(&config)
    };

    let port = cli.port.as_deref();

    let result = match command {
        Commands::Examples(_) => Ok(()),
        Commands::ListPorts => list_ports(setup.catalog).await.map(|ports| {
            for port in ports {
                println!("{port}");
            }
        }),
        Commands::DumpConfigs => dump_configs(&config, &setup, port).await,
        Commands::SaveConfigs { path } => save_configs(&config, &setup, port, &path).await,
        Commands::Monitor => monitor(&config, setup, port).await,
    };

    logging::shutdown();

    result
}
