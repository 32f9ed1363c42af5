//! Typed payloads exchanged with the device.
//!
//! These are fixed shapes: a record missing any of its nine keys does not decode.
//! Value ranges are not checked here, that's up to whoever edits them.

use serde::{Deserialize, Serialize};

/// How many keys the device has.
pub const KEY_COUNT: usize = 9;

/// The wire names of the keys, in order.
pub const KEY_NAMES: [&str; KEY_COUNT] = [
    "key_1", "key_2", "key_3", "key_4", "key_5", "key_6", "key_7", "key_8", "key_9",
];

/// Actuation settings shared by all keys.
/// Distances are in millimeters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Actuate on direction change instead of at a fixed point.
    pub rapid_trigger: bool,

    /// Rapid trigger travel needed to change state.
    pub sensitivity: f64,

    /// Travel ignored at the top.
    pub top_deadzone: f64,

    /// Travel ignored at the bottom.
    /// The wire name of this field differs between firmware revisions,
    /// see [`crate::protocol::ProtocolCodec::with_bottom_deadzone_field`].
    pub bottom_deadzone: f64,

    /// Where the key actuates.
    pub actuation_point: f64,

    /// Where the key resets.
    pub actuation_reset: f64,
}

/// Macro slots of a single key, one list of action identifiers per layer.
/// Order is execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyActions {
    /// Per layer, the actions in the order they run.
    pub actions: Vec<Vec<String>>,
}

impl KeyActions {
    /// A single layer with a single action.
    pub fn single<S: AsRef<str>>(action: S) -> Self {
        Self {
            actions: vec![vec![action.as_ref().into()]],
        }
    }
}

/// Everything configurable on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Configs {
    /// Settings shared by all keys.
    pub general: GeneralConfig,

    pub key_1: KeyActions,
    pub key_2: KeyActions,
    pub key_3: KeyActions,
    pub key_4: KeyActions,
    pub key_5: KeyActions,
    pub key_6: KeyActions,
    pub key_7: KeyActions,
    pub key_8: KeyActions,
    pub key_9: KeyActions,
}

impl Configs {
    /// The per key actions, in key order.
    pub fn keys(&self) -> [&KeyActions; KEY_COUNT] {
        [
            &self.key_1,
            &self.key_2,
            &self.key_3,
            &self.key_4,
            &self.key_5,
            &self.key_6,
            &self.key_7,
            &self.key_8,
            &self.key_9,
        ]
    }

    /// Mutably borrow a key's actions by wire name.
    pub fn key_mut(&mut self, name: &str) -> Option<&mut KeyActions> {
        let key = match name {
            "key_1" => &mut self.key_1,
            "key_2" => &mut self.key_2,
            "key_3" => &mut self.key_3,
            "key_4" => &mut self.key_4,
            "key_5" => &mut self.key_5,
            "key_6" => &mut self.key_6,
            "key_7" => &mut self.key_7,
            "key_8" => &mut self.key_8,
            "key_9" => &mut self.key_9,
            _ => return None,
        };

        Some(key)
    }

    /// An example, as shipped by the firmware.
    pub fn example() -> Self {
        let key = |action: &str| KeyActions::single(action);

        Self {
            general: GeneralConfig {
                rapid_trigger: true,
                sensitivity: 0.3,
                top_deadzone: 0.3,
                bottom_deadzone: 0.3,
                actuation_point: 2.0,
                actuation_reset: 0.3,
            },
            key_1: key("KC_1"),
            key_2: key("KC_2"),
            key_3: key("KC_3"),
            key_4: key("KC_4"),
            key_5: key("KC_5"),
            key_6: key("KC_6"),
            key_7: key("KC_7"),
            key_8: key("KC_8"),
            key_9: key("KC_9"),
        }
    }
}

/// Live state of a single key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct KeyState {
    /// Is the key actuated.
    pub state: bool,

    /// How far down the key is, in millimeters.
    pub distance: f64,
}

/// Live telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Info {
    /// Board temperature, degrees Celsius.
    pub temperature: f64,

    pub key_1: KeyState,
    pub key_2: KeyState,
    pub key_3: KeyState,
    pub key_4: KeyState,
    pub key_5: KeyState,
    pub key_6: KeyState,
    pub key_7: KeyState,
    pub key_8: KeyState,
    pub key_9: KeyState,
}

impl Info {
    /// The key states, in key order.
    pub fn keys(&self) -> [&KeyState; KEY_COUNT] {
        [
            &self.key_1,
            &self.key_2,
            &self.key_3,
            &self.key_4,
            &self.key_5,
            &self.key_6,
            &self.key_7,
            &self.key_8,
            &self.key_9,
        ]
    }

    /// Borrow a key's state by wire name, e.g. `key_8`.
    pub fn key(&self, name: &str) -> Option<&KeyState> {
        KEY_NAMES
            .iter()
            .position(|key| *key == name)
            .map(|index| self.keys()[index])
    }

    /// All keys at rest.
    pub fn at_rest(temperature: f64) -> Self {
        let key = KeyState::default();

        Self {
            temperature,
            key_1: key,
            key_2: key,
            key_3: key,
            key_4: key,
            key_5: key,
            key_6: key,
            key_7: key,
            key_8: key,
            key_9: key,
        }
    }

    /// An example with one key pressed.
    pub fn example() -> Self {
        Self {
            key_1: KeyState {
                state: true,
                distance: 1.23,
            },
            ..Self::at_rest(25.0)
        }
    }
}
