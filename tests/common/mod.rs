#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use color_eyre::{eyre::eyre, Result};
use kzooting_link::{
    catalog::Port,
    correlator::RequestCorrelator,
    mock::MockDevice,
    poller::{PollerHandle, PollerSettings},
    state::{props, StateStore, Value},
    transport::Transport,
};
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const MOCK_PORT: &str = "/dev/ttyACM0";

/// Dispatch until the property satisfies `pred`, or give up after a while.
pub async fn wait_for<F>(store: &mut StateStore, name: &str, mut pred: F) -> Result<Value>
where
    F: FnMut(&Value) -> bool,
{
    let wait = async {
        loop {
            if let Some(value) = store.get(name) {
                if pred(&value) {
                    return value;
                }
            }

            store.next_dispatch().await;
        }
    };

    timeout(Duration::from_secs(5), wait)
        .await
        .map_err(|_| eyre!("Timed out waiting for `{name}`"))
}

pub async fn wait_connected(store: &mut StateStore, connected: bool) -> Result<()> {
    wait_for(store, props::CONNECTED, |value| {
        value.as_bool() == Some(connected)
    })
    .await?;

    Ok(())
}

/// A poller talking to a mock device.
pub struct Rig {
    pub device: MockDevice,
    pub store: StateStore,
    pub poller: PollerHandle,
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

impl Rig {
    pub fn new(settings: PollerSettings) -> Self {
        Self::with_device(MockDevice::new(), RequestCorrelator::default(), settings)
    }

    pub fn with_device(
        device: MockDevice,
        correlator: RequestCorrelator,
        settings: PollerSettings,
    ) -> Self {
        let store = StateStore::new();
        let cancel = CancellationToken::new();

        let (poller, task) = PollerHandle::spawn(
            Transport::new(Arc::new(device.clone())),
            correlator,
            settings,
            store.handle(),
            cancel.clone(),
        );

        Self {
            device,
            store,
            poller,
            cancel,
            task,
        }
    }

    /// Select the mock port and wait until connected.
    pub async fn connect(&mut self) -> Result<()> {
        info!("Connecting rig");
        self.poller.select_port(Port::new(MOCK_PORT));

        wait_connected(&mut self.store, true).await
    }

    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.task.await?;

        Ok(())
    }
}

/// Fast polling, so tests don't take long.
pub fn fast() -> PollerSettings {
    PollerSettings {
        poll_interval: Duration::from_millis(10),
        response_timeout: Duration::from_millis(100),
        auto_connect: false,
    }
}
