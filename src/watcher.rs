//! Hot-plug tracking.
//!
//! A [`DeviceEvents`] source tells the watcher that ports may have come or gone.
//! The watcher then asks the [`PortCatalog`] what is connectable and publishes it.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::{
    catalog::{CandidateSource, Port, PortCatalog},
    error::Error,
    poller::PollerHandle,
    state::{props, StoreHandle},
};

/// Reports whether the set of device nodes may have changed.
pub trait DeviceEvents: Send {
    /// Anything changed since last asked.
    /// Must not block.
    fn changed(&mut self) -> Result<bool, Error>;

    /// Called right after ports were probed.
    /// Sources which see the probing itself as a change should forget about it here.
    fn probed(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Debug)]
enum SnapshotKind {
    Candidates(CandidateSource),
    System,
}

/// Compares snapshots of the device namespace.
#[derive(Debug)]
pub struct SnapshotEvents {
    kind: SnapshotKind,
    last: Option<Vec<Port>>,
}

impl SnapshotEvents {
    /// Snapshot the (unprobed) candidates of a source.
    pub fn new(source: CandidateSource) -> Self {
        Self {
            kind: SnapshotKind::Candidates(source),
            last: None,
        }
    }

    /// Snapshot the ports the operating system reports.
    pub fn system() -> Self {
        Self {
            kind: SnapshotKind::System,
            last: None,
        }
    }

    fn snapshot(&self) -> Result<Vec<Port>, Error> {
        match &self.kind {
            SnapshotKind::Candidates(source) => Ok(source.candidates()),
            SnapshotKind::System => {
                let mut ports = tokio_serial::available_ports()
                    .map_err(|e| Error::Io(e.to_string()))?
                    .into_iter()
                    .map(|info| Port::new(info.port_name))
                    .collect::<Vec<_>>();
                ports.sort();

                Ok(ports)
            }
        }
    }
}

impl DeviceEvents for SnapshotEvents {
    fn changed(&mut self) -> Result<bool, Error> {
        let snapshot = self.snapshot()?;

        // The first snapshot is the baseline.
        let changed = self.last.as_ref().is_some_and(|last| *last != snapshot);
        self.last = Some(snapshot);

        Ok(changed)
    }
}

/// Changes only when triggered.
#[derive(Debug)]
pub struct ManualEvents(Arc<AtomicBool>);

/// Triggers a [`ManualEvents`].
#[derive(Debug, Clone)]
pub struct ManualTrigger(Arc<AtomicBool>);

impl ManualEvents {
    /// Create the events and their trigger.
    pub fn new() -> (Self, ManualTrigger) {
        let flag = Arc::new(AtomicBool::new(false));

        (Self(flag.clone()), ManualTrigger(flag))
    }
}

impl ManualTrigger {
    /// Make the next [`DeviceEvents::changed`] return `true`.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl DeviceEvents for ManualEvents {
    fn changed(&mut self) -> Result<bool, Error> {
        Ok(self.0.swap(false, Ordering::SeqCst))
    }
}

#[cfg(target_os = "linux")]
pub use inotify::InotifyEvents;

#[cfg(target_os = "linux")]
mod inotify {
    use std::path::Path;

    use nix::{
        errno::Errno,
        sys::inotify::{AddWatchFlags, InitFlags, Inotify},
    };
    use std::os::unix::io::AsRawFd;
    use tracing::{trace, warn};

    use super::DeviceEvents;
    use crate::{catalog::NamePattern, error::Error};

    /// Device node events from inotify.
    ///
    /// Nodes appearing, disappearing, and closed after writing
    /// (udev does that when it's done setting up a node) count as changes.
    #[derive(Debug)]
    pub struct InotifyEvents {
        inotify: Inotify,
        pattern: NamePattern,

        // Nodes came or went while probing, reported by the next `changed`.
        pending: bool,
    }

    impl InotifyEvents {
        /// Watch `dir` for nodes matching `pattern`.
        pub fn new(dir: &Path, pattern: NamePattern) -> Result<Self, Error> {
            let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
                .map_err(|e| Error::Io(format!("could not init inotify: {e}")))?;

            let events = Self {
                inotify,
                pattern,
                pending: false,
            };

            events
                .inotify
                .add_watch(
                    dir,
                    AddWatchFlags::IN_DELETE
                        | AddWatchFlags::IN_CLOSE_WRITE
                        | AddWatchFlags::IN_CREATE,
                )
                .map_err(|e| Error::Io(format!("could not watch {dir:?}: {e}")))?;

            Ok(events)
        }
    }

    impl InotifyEvents {
        // Drain queued events. Closes after writing only count if `with_closes`.
        fn drain(&mut self, with_closes: bool) -> Result<bool, Error> {
            let mut changed = false;

            loop {
                match self.inotify.read_events() {
                    Ok(events) if events.is_empty() => break,
                    Ok(events) => {
                        for event in events {
                            let Some(name) = event.name.as_ref().and_then(|name| name.to_str())
                            else {
                                continue;
                            };

                            if !self.pattern.matches(name) {
                                continue;
                            }

                            let came_or_went = event
                                .mask
                                .intersects(AddWatchFlags::IN_CREATE | AddWatchFlags::IN_DELETE);

                            if came_or_went || with_closes {
                                trace!(name, mask = ?event.mask, "Device node event");
                                changed = true;
                            }
                        }
                    }
                    Err(Errno::EAGAIN) => break,
                    Err(e) => return Err(Error::Io(format!("could not read inotify events: {e}"))),
                }
            }

            Ok(changed)
        }
    }

    impl DeviceEvents for InotifyEvents {
        fn changed(&mut self) -> Result<bool, Error> {
            let changed = self.drain(true)?;

            Ok(std::mem::take(&mut self.pending) || changed)
        }

        // Probing closes nodes after opening them for writing, which is `IN_CLOSE_WRITE`.
        // Nodes appearing or disappearing meanwhile are kept for the next `changed`.
        fn probed(&mut self) -> Result<(), Error> {
            if self.drain(false)? {
                self.pending = true;
            }

            Ok(())
        }
    }

    impl Drop for InotifyEvents {
        fn drop(&mut self) {
            if let Err(e) = nix::unistd::close(self.inotify.as_raw_fd()) {
                warn!(%e, "Could not close inotify");
            }
        }
    }

}

/// The best events source for watching the given candidates on this platform.
pub fn platform_events(source: &CandidateSource) -> Box<dyn DeviceEvents> {
    match source {
        #[cfg(target_os = "linux")]
        CandidateSource::Directory { dir, pattern } => {
            match InotifyEvents::new(dir, pattern.clone()) {
                Ok(events) => return Box::new(events),
                Err(e) => {
                    tracing::warn!(%e, "Falling back to snapshots");
                }
            }

            Box::new(SnapshotEvents::new(source.clone()))
        }
        CandidateSource::Numbered { .. } => Box::new(SnapshotEvents::system()),
        _ => Box::new(SnapshotEvents::new(source.clone())),
    }
}

/// Publishes the available ports.
pub struct PortWatcher {
    catalog: PortCatalog,
    events: Box<dyn DeviceEvents>,
    interval: Duration,
    store: StoreHandle,
    poller: Option<PollerHandle>,
}

impl std::fmt::Debug for PortWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortWatcher")
            .field("catalog", &self.catalog)
            .field("interval", &self.interval)
            .finish()
    }
}

impl PortWatcher {
    /// Create a watcher, checking `events` every `interval`.
    pub fn new(
        catalog: PortCatalog,
        events: Box<dyn DeviceEvents>,
        interval: Duration,
        store: StoreHandle,
    ) -> Self {
        Self {
            catalog,
            events,
            interval,
            store,
            poller: None,
        }
    }

    /// Also tell this poller about changes.
    pub fn with_poller(mut self, poller: PollerHandle) -> Self {
        self.poller = Some(poller);
        self
    }

    /// Run in a new task.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel).instrument(info_span!("watcher")))
    }

    async fn refresh(catalog: PortCatalog) -> Option<Vec<Port>> {
        // Probing opens ports, which blocks.
        match tokio::task::spawn_blocking(move || catalog.list_ports()).await {
            Ok(ports) => Some(ports),
            Err(e) => {
                error!(?e, "Listing ports failed");
                None
            }
        }
    }

    /// Run until cancelled.
    /// Ports are listed once at start-up and then on every change.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut published: Option<Vec<Port>> = None;
        let mut first = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Cancelled");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let changed = match self.events.changed() {
                Ok(changed) => changed,
                Err(e) => {
                    debug!(%e, "Could not check for device events");
                    false
                }
            };

            if !(changed || first) {
                continue;
            }
            first = false;

            let refreshed = Self::refresh(self.catalog.clone()).await;

            if let Err(e) = self.events.probed() {
                debug!(%e, "Could not check device events after probing");
            }

            let Some(ports) = refreshed else {
                continue;
            };

            if published.as_ref() == Some(&ports) {
                debug!("Ports unchanged");
                continue;
            }

            info!(?ports, "Available ports changed");

            self.store.set(props::AVAILABLE_PORTS, ports.clone());
            if let Some(poller) = &self.poller {
                poller.ports_changed(ports.clone());
            }

            published = Some(ports);
        }
    }
}
