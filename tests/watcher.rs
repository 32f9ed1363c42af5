use std::{sync::Arc, time::Duration};

use color_eyre::Result;
use common::{wait_connected, wait_for};
use kzooting_link::{
    catalog::{CandidateSource, HeldPort, NamePattern, Port, PortCatalog},
    correlator::RequestCorrelator,
    error::Error,
    mock::MockDevice,
    poller::{PollerHandle, PollerSettings},
    state::{props, StateStore, Value},
    transport::Transport,
    watcher::{ManualEvents, PortWatcher},
};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

mod common;

const INTERVAL: Duration = Duration::from_millis(5);

fn ports(names: &[&str]) -> Vec<Port> {
    names.iter().copied().map(Port::new).collect()
}

fn ports_are(expected: Vec<Port>) -> impl FnMut(&Value) -> bool {
    move |value| value.as_ports() == Some(expected.as_slice())
}

#[tokio::test]
async fn publishes_connectable_ports() -> Result<()> {
    let device = MockDevice::new();
    device.mark_busy(Port::new("/dev/ttyACM2"));

    let catalog = PortCatalog::new(
        CandidateSource::Fixed(ports(&["/dev/ttyACM0", "/dev/ttyACM1", "/dev/ttyACM2"])),
        Arc::new(device.clone()),
    );
    let (events, trigger) = ManualEvents::new();

    let mut store = StateStore::new();
    let cancel = CancellationToken::new();
    let task = PortWatcher::new(catalog, Box::new(events), INTERVAL, store.handle())
        .spawn(cancel.clone());

    wait_for(
        &mut store,
        props::AVAILABLE_PORTS,
        ports_are(ports(&["/dev/ttyACM0", "/dev/ttyACM1"])),
    )
    .await?;

    device.mark_busy(Port::new("/dev/ttyACM0"));
    device.mark_free(&Port::new("/dev/ttyACM2"));
    trigger.trigger();

    wait_for(
        &mut store,
        props::AVAILABLE_PORTS,
        ports_are(ports(&["/dev/ttyACM1", "/dev/ttyACM2"])),
    )
    .await?;

    cancel.cancel();
    task.await?;

    Ok(())
}

#[tokio::test]
async fn unchanged_ports_are_not_republished() -> Result<()> {
    let device = MockDevice::new();
    let catalog = PortCatalog::new(
        CandidateSource::Fixed(ports(&["COM3"])),
        Arc::new(device.clone()),
    );
    let (events, trigger) = ManualEvents::new();

    let mut store = StateStore::new();
    let cancel = CancellationToken::new();
    let task = PortWatcher::new(catalog, Box::new(events), INTERVAL, store.handle())
        .spawn(cancel.clone());

    wait_for(&mut store, props::AVAILABLE_PORTS, ports_are(ports(&["COM3"]))).await?;

    let publications = std::rc::Rc::new(std::cell::Cell::new(0));
    let p = publications.clone();
    store.listen(props::AVAILABLE_PORTS, move |_| p.set(p.get() + 1));

    // The current value.
    assert_eq!(publications.get(), 1);

    for _ in 0..5 {
        trigger.trigger();
        tokio::time::sleep(INTERVAL * 4).await;
    }
    store.dispatch_pending();

    assert_eq!(publications.get(), 1);

    cancel.cancel();
    task.await?;

    Ok(())
}

#[tokio::test]
async fn hot_plug_drives_the_poller() -> Result<()> {
    let dev = tempfile::tempdir()?;
    let node = dev.path().join("ttyACM0");
    std::fs::write(&node, b"")?;
    let port = Port::new(node.to_string_lossy());

    let device = MockDevice::new();
    let held = HeldPort::new();
    let mut store = StateStore::new();
    let cancel = CancellationToken::new();

    let (poller, poller_task) = PollerHandle::spawn(
        Transport::new(Arc::new(device.clone())).with_held(held.clone()),
        RequestCorrelator::default(),
        PollerSettings {
            auto_connect: true,
            ..common::fast()
        },
        store.handle(),
        cancel.clone(),
    );

    let catalog = PortCatalog::new(
        CandidateSource::Directory {
            dir: dev.path().into(),
            pattern: NamePattern::prefix("ttyACM"),
        },
        Arc::new(device.clone()),
    )
    .with_held(held);
    let (events, trigger) = ManualEvents::new();

    let watcher_task = PortWatcher::new(catalog, Box::new(events), INTERVAL, store.handle())
        .with_poller(poller)
        .spawn(cancel.clone());

    // Plugged in from the start, so connected automatically.
    wait_connected(&mut store, true).await?;
    assert_eq!(store.get(props::SELECTED_PORT), Some(Value::Port(port.clone())));

    // Our own connection does not make the port unavailable.
    device.mark_busy(port.clone());
    trigger.trigger();
    tokio::time::sleep(INTERVAL * 10).await;
    store.dispatch_pending();
    assert_eq!(store.get(props::CONNECTED), Some(Value::Bool(true)));
    device.mark_free(&port);

    // Unplugged.
    std::fs::remove_file(&node)?;
    trigger.trigger();

    wait_connected(&mut store, false).await?;
    assert!(matches!(
        store.get(props::ERROR),
        Some(Value::Error(Error::ConnectionLost(_)))
    ));
    assert_eq!(device.open_connections(), 0);

    // Plugged back in.
    std::fs::write(&node, b"")?;
    trigger.trigger();

    wait_connected(&mut store, true).await?;
    assert_eq!(store.get(props::SELECTED_PORT), Some(Value::Port(port)));

    cancel.cancel();
    poller_task.await?;
    watcher_task.await?;

    Ok(())
}

#[cfg(target_os = "linux")]
mod inotify {
    use std::{
        path::PathBuf,
        sync::atomic::{AtomicBool, Ordering},
    };

    use kzooting_link::{catalog::Probe, watcher::InotifyEvents};

    use super::*;

    /// Accepts every port, and plugs in another node during the first probe.
    struct PlugsInWhileProbing {
        node: PathBuf,
        plugged: AtomicBool,
    }

    impl Probe for PlugsInWhileProbing {
        fn probe(&self, _port: &Port) -> Result<(), Error> {
            if !self.plugged.swap(true, Ordering::SeqCst) {
                std::fs::write(&self.node, b"").map_err(|e| Error::Io(e.to_string()))?;
            }

            Ok(())
        }
    }

    #[tokio::test]
    async fn nodes_coming_and_going() -> Result<()> {
        let dev = tempfile::tempdir()?;
        let first = dev.path().join("ttyACM0");
        let second = dev.path().join("ttyACM1");
        std::fs::write(&first, b"")?;

        let first_port = Port::new(first.to_string_lossy());
        let second_port = Port::new(second.to_string_lossy());

        let pattern = NamePattern::prefix("ttyACM");
        let events = InotifyEvents::new(dev.path(), pattern.clone())?;
        let catalog = PortCatalog::new(
            CandidateSource::Directory {
                dir: dev.path().into(),
                pattern,
            },
            Arc::new(PlugsInWhileProbing {
                node: second.clone(),
                plugged: AtomicBool::new(false),
            }),
        );

        let mut store = StateStore::new();
        let cancel = CancellationToken::new();
        let task = PortWatcher::new(catalog, Box::new(events), INTERVAL, store.handle())
            .spawn(cancel.clone());

        // The second node showed up while the first listing was being probed.
        wait_for(
            &mut store,
            props::AVAILABLE_PORTS,
            ports_are(vec![first_port.clone(), second_port.clone()]),
        )
        .await?;

        std::fs::remove_file(&first)?;
        wait_for(
            &mut store,
            props::AVAILABLE_PORTS,
            ports_are(vec![second_port.clone()]),
        )
        .await?;

        std::fs::write(&first, b"")?;
        wait_for(
            &mut store,
            props::AVAILABLE_PORTS,
            ports_are(vec![first_port, second_port]),
        )
        .await?;

        cancel.cancel();
        task.await?;

        Ok(())
    }
}
