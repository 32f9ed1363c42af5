//! The central state store.
//!
//! Background tasks publish through a [`StoreHandle`], which may be sent anywhere.
//! The [`StateStore`] itself stays on one task (the designated context) and is the only
//! place values are stored and listeners are called.
//! Updates are applied in the order they were enqueued, regardless of which task enqueued them.

use std::{
    cell::RefCell,
    collections::HashMap,
    rc::{Rc, Weak},
};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    catalog::Port,
    error::Error,
    poller::PollerState,
    records::{Configs, Info},
};

/// Names of the well known properties.
pub mod props {
    /// [`super::Value::Ports`]: what can be connected to right now.
    pub const AVAILABLE_PORTS: &str = "available_ports";

    /// [`super::Value::Port`]: the port last selected, if any.
    pub const SELECTED_PORT: &str = "selected_port";

    /// [`super::Value::PollerState`].
    pub const POLLER_STATE: &str = "poller_state";

    /// [`super::Value::Bool`].
    pub const CONNECTED: &str = "connected";

    /// [`super::Value::Info`], or [`super::Value::None`] when there is no telemetry.
    pub const INFO: &str = "info";

    /// [`super::Value::Configs`].
    pub const CONFIGS: &str = "configs";

    /// [`super::Value::Error`], or [`super::Value::None`] once cleared.
    pub const ERROR: &str = "error";

    /// [`super::Value::Timestamp`] of the last telemetry.
    pub const LAST_UPDATE: &str = "last_update";

    /// [`super::Value::Timestamp`] of the last successful configuration write.
    pub const LAST_SAVE: &str = "last_save";
}

/// A property value.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Value {
    /// Explicitly no value.
    None,
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
    Port(Port),
    Ports(Vec<Port>),
    PollerState(PollerState),
    Info(Info),
    Configs(Configs),
    Error(Error),
    Timestamp(DateTime<Utc>),

    /// Anything else.
    Json(serde_json::Value),
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i32 => Integer,
    i64 => Integer,
    f64 => Number,
    String => Text,
    &str => Text,
    Port => Port,
    Vec<Port> => Ports,
    PollerState => PollerState,
    Info => Info,
    Configs => Configs,
    Error => Error,
    DateTime<Utc> => Timestamp,
    serde_json::Value => Json,
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::None, Into::into)
    }
}

impl Value {
    /// Is this [`Value::None`].
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    #[allow(missing_docs)]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_port(&self) -> Option<&Port> {
        match self {
            Value::Port(v) => Some(v),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_ports(&self) -> Option<&[Port]> {
        match self {
            Value::Ports(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_poller_state(&self) -> Option<PollerState> {
        match self {
            Value::PollerState(v) => Some(*v),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_info(&self) -> Option<&Info> {
        match self {
            Value::Info(v) => Some(v),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_configs(&self) -> Option<&Configs> {
        match self {
            Value::Configs(v) => Some(v),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_error(&self) -> Option<&Error> {
        match self {
            Value::Error(v) => Some(v),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Notification {
    name: String,
    value: Value,
}

/// Publishes into a [`StateStore`] from any task or thread.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<Notification>,
}

impl StoreHandle {
    /// Enqueue a new value.
    /// It becomes visible once the store dispatches it.
    pub fn set<N: Into<String>, V: Into<Value>>(&self, name: N, value: V) {
        let notification = Notification {
            name: name.into(),
            value: value.into(),
        };

        if let Err(e) = self.tx.send(notification) {
            trace!(name = %e.0.name, "State store is gone, dropping update");
        }
    }
}

type Values = Rc<RefCell<HashMap<String, Value>>>;

/// Read access to the store's values, for use inside listeners.
#[derive(Debug, Clone)]
pub struct StateView {
    values: Values,
}

impl StateView {
    /// See [`StateStore::get`].
    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.borrow().get(name).cloned()
    }
}

// Returns false once it should never be called again.
type Listener = Box<dyn FnMut(&Value) -> bool>;

/// Named properties with change listeners.
pub struct StateStore {
    values: Values,
    listeners: HashMap<String, Vec<Listener>>,
    tx: mpsc::UnboundedSender<Notification>,
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("values", &self.values)
            .field("listening", &self.listeners.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            values: Values::default(),
            listeners: HashMap::new(),
            tx,
            rx,
        }
    }
}

impl StateStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle for publishing from elsewhere.
    pub fn handle(&self) -> StoreHandle {
        StoreHandle {
            tx: self.tx.clone(),
        }
    }

    /// A read only view, e.g. for listeners combining several properties.
    /// Another property may be stale by one update.
    pub fn view(&self) -> StateView {
        StateView {
            values: self.values.clone(),
        }
    }

    /// The last dispatched value of a property.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.borrow().get(name).cloned()
    }

    /// Enqueue a new value.
    /// Goes through the same queue as [`StoreHandle::set`], so ordering is preserved.
    pub fn set<N: Into<String>, V: Into<Value>>(&self, name: N, value: V) {
        self.handle().set(name, value)
    }

    /// Call `callback` on every change of the property, in registration order.
    /// If the property has a value already, `callback` is called with it right away.
    pub fn listen<N, F>(&mut self, name: N, mut callback: F)
    where
        N: Into<String>,
        F: FnMut(&Value) + 'static,
    {
        self.add_listener(
            name.into(),
            Box::new(move |value| {
                callback(value);
                true
            }),
        );
    }

    /// Like [`StateStore::listen`], but bound to an owner.
    /// Once the owner is dropped the callback is not called anymore.
    pub fn listen_owned<N, O, F>(&mut self, name: N, owner: &Rc<O>, mut callback: F)
    where
        N: Into<String>,
        O: 'static,
        F: FnMut(&O, &Value) + 'static,
    {
        let owner: Weak<O> = Rc::downgrade(owner);

        self.add_listener(
            name.into(),
            Box::new(move |value| match owner.upgrade() {
                Some(owner) => {
                    callback(&owner, value);
                    true
                }
                None => false,
            }),
        );
    }

    fn add_listener(&mut self, name: String, mut listener: Listener) {
        let current = self.get(&name);

        let keep = match current {
            Some(value) => listener(&value),
            None => true,
        };

        if keep {
            self.listeners.entry(name).or_default().push(listener);
        }
    }

    fn dispatch(&mut self, Notification { name, value }: Notification) {
        trace!(%name, "Dispatching");

        self.values.borrow_mut().insert(name.clone(), value.clone());

        if let Some(listeners) = self.listeners.get_mut(&name) {
            let before = listeners.len();
            listeners.retain_mut(|listener| listener(&value));

            if listeners.len() != before {
                debug!(%name, dropped = before - listeners.len(), "Owners gone, listeners dropped");
            }
        }
    }

    /// Apply everything enqueued so far.
    /// Returns how many updates were applied.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut dispatched = 0;

        while let Ok(notification) = self.rx.try_recv() {
            self.dispatch(notification);
            dispatched += 1;
        }

        dispatched
    }

    /// Wait for at least one update, then apply everything enqueued so far.
    /// Returns how many updates were applied.
    pub async fn next_dispatch(&mut self) -> usize {
        // The store holds a sender itself, so this never ends.
        let Some(notification) = self.rx.recv().await else {
            return 0;
        };

        self.dispatch(notification);

        1 + self.dispatch_pending()
    }

    /// Keep dispatching until cancelled.
    pub async fn run(&mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("State store stopping");
                    break;
                }
                _ = self.next_dispatch() => {}
            }
        }

        self.dispatch_pending();
    }
}
