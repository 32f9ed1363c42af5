//! The wire protocol.
//!
//! Framing is asymmetric: requests are bare keyword lines (`info_request\n`),
//! responses are JSON objects carrying a `message_type` discriminator
//! (`{"message_type":"info_request_response",...}`).
//! Configuration writes are the bare configs object, no discriminator.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::Error,
    records::{Configs, Info},
};

/// Appended to a request kind to get the kind of its response.
pub const RESPONSE_SUFFIX: &str = "_response";

/// Name of the discriminator field of responses.
pub const MESSAGE_TYPE: &str = "message_type";

/// How current firmware spells the bottom deadzone field.
pub const BOTTOM_DEADZONE_FIELD: &str = "bottom_deadzone";

/// How early firmware spells the bottom deadzone field.
pub const LEGACY_BOTTOM_DEADZONE_FIELD: &str = "bootom_deadzone";

/// Requests the device understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// Live telemetry, answered with [`Info`].
    Info,

    /// Current configuration, answered with [`Configs`].
    Configs,
}

impl RequestKind {
    /// All request kinds.
    pub const ALL: [RequestKind; 2] = [RequestKind::Info, RequestKind::Configs];

    /// The request keyword as put on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Info => "info_request",
            RequestKind::Configs => "configs_request",
        }
    }

    /// The `message_type` a response to this request carries.
    pub fn response_type(&self) -> String {
        format!("{}{RESPONSE_SUFFIX}", self.as_str())
    }

    /// Parse a request keyword.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == keyword)
    }
}

impl Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A decoded JSON line from the device.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// The discriminator.
    pub message_type: String,

    /// Every other field.
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Is this the response to the given request.
    pub fn is_response_to(&self, kind: RequestKind) -> bool {
        self.message_type
            .strip_suffix(RESPONSE_SUFFIX)
            .is_some_and(|request| request == kind.as_str())
    }

    /// The payload as a JSON object.
    pub fn into_value(self) -> Value {
        Value::Object(self.payload)
    }
}

/// A typed response payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Answer to [`RequestKind::Info`].
    Info(Info),

    /// Answer to [`RequestKind::Configs`].
    Configs(Configs),
}

impl Payload {
    /// Which request this answers.
    pub fn kind(&self) -> RequestKind {
        match self {
            Payload::Info(_) => RequestKind::Info,
            Payload::Configs(_) => RequestKind::Configs,
        }
    }

    /// Unwrap as [`Info`], or give the payload back.
    pub fn try_into_info(self) -> Result<Info, Self> {
        if let Self::Info(v) = self {
            Ok(v)
        } else {
            Err(self)
        }
    }

    /// Unwrap as [`Configs`], or give the payload back.
    pub fn try_into_configs(self) -> Result<Configs, Self> {
        if let Self::Configs(v) = self {
            Ok(v)
        } else {
            Err(self)
        }
    }
}

/// Encodes requests and configuration writes, decodes responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolCodec {
    bottom_deadzone_field: String,
}

impl Default for ProtocolCodec {
    fn default() -> Self {
        Self {
            bottom_deadzone_field: BOTTOM_DEADZONE_FIELD.into(),
        }
    }
}

impl ProtocolCodec {
    /// Use another wire name for [`crate::records::GeneralConfig::bottom_deadzone`].
    ///
    /// Firmware revisions disagree on the spelling
    /// (see [`LEGACY_BOTTOM_DEADZONE_FIELD`]), so this is pinned per device.
    pub fn with_bottom_deadzone_field<S: AsRef<str>>(field: S) -> Self {
        Self {
            bottom_deadzone_field: field.as_ref().into(),
        }
    }

    /// The wire name used for the bottom deadzone.
    pub fn bottom_deadzone_field(&self) -> &str {
        &self.bottom_deadzone_field
    }

    /// Decode a line into an [`Envelope`].
    pub fn decode_line(&self, line: &[u8]) -> Result<Envelope, Error> {
        let text = std::str::from_utf8(line).map_err(|e| Error::decode(line, e))?;

        let value: Value = serde_json::from_str(text.trim()).map_err(|e| Error::decode(line, e))?;

        let Value::Object(mut payload) = value else {
            return Err(Error::decode(line, "not a JSON object"));
        };

        match payload.remove(MESSAGE_TYPE) {
            Some(Value::String(message_type)) => Ok(Envelope {
                message_type,
                payload,
            }),
            Some(_) => Err(Error::decode(line, "`message_type` is not a string")),
            None => Err(Error::decode(line, "missing `message_type`")),
        }
    }

    /// The bare request keyword, newline terminated.
    pub fn encode_request(&self, kind: RequestKind) -> Vec<u8> {
        format!("{kind}\n").into_bytes()
    }

    /// Decode a response payload into its typed record.
    pub fn decode_payload(&self, kind: RequestKind, value: Value) -> Result<Payload, Error> {
        let schema = |e: serde_json::Error| Error::Schema {
            kind: kind.to_string(),
            problem: e.to_string(),
        };

        match kind {
            RequestKind::Info => serde_json::from_value(value)
                .map(Payload::Info)
                .map_err(schema),
            RequestKind::Configs => self.decode_configs(value).map(Payload::Configs),
        }
    }

    /// Decode a bare configs object.
    pub fn decode_configs(&self, mut value: Value) -> Result<Configs, Error> {
        rename_general_field(&mut value, &self.bottom_deadzone_field, BOTTOM_DEADZONE_FIELD);

        serde_json::from_value(value).map_err(|e| Error::Schema {
            kind: RequestKind::Configs.to_string(),
            problem: e.to_string(),
        })
    }

    /// The configs as a JSON object, using this codec's field names.
    pub fn configs_to_value(&self, configs: &Configs) -> Result<Value, Error> {
        let mut value = serde_json::to_value(configs).map_err(|e| Error::Schema {
            kind: RequestKind::Configs.to_string(),
            problem: e.to_string(),
        })?;

        rename_general_field(&mut value, BOTTOM_DEADZONE_FIELD, &self.bottom_deadzone_field);

        Ok(value)
    }

    /// The full configs object, newline terminated, ready to be written.
    pub fn encode_configs(&self, configs: &Configs) -> Result<Vec<u8>, Error> {
        let mut line = self.configs_to_value(configs)?.to_string().into_bytes();
        line.push(b'\n');

        Ok(line)
    }

    /// The response line the device would send for this payload.
    pub fn encode_response(&self, payload: &Payload) -> Result<Vec<u8>, Error> {
        let value = match payload {
            Payload::Info(info) => serde_json::to_value(info).map_err(|e| Error::Schema {
                kind: RequestKind::Info.to_string(),
                problem: e.to_string(),
            })?,
            Payload::Configs(configs) => self.configs_to_value(configs)?,
        };

        let Value::Object(fields) = value else {
            return Err(Error::Schema {
                kind: payload.kind().to_string(),
                problem: "not a JSON object".into(),
            });
        };

        let mut object = Map::new();
        object.insert(
            MESSAGE_TYPE.into(),
            Value::String(payload.kind().response_type()),
        );
        object.extend(fields);

        let mut line = Value::Object(object).to_string().into_bytes();
        line.push(b'\n');

        Ok(line)
    }
}

fn rename_general_field(value: &mut Value, from: &str, to: &str) {
    if from == to {
        return;
    }

    if let Some(general) = value.get_mut("general").and_then(Value::as_object_mut) {
        if let Some(field) = general.remove(from) {
            general.insert(to.into(), field);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn configs_json(bottom_field: &str) -> Value {
        let mut value = json!({
            "general": {
                "rapid_trigger": true,
                "sensitivity": 0.3,
                "top_deadzone": 0.2,
                "actuation_point": 2.0,
                "actuation_reset": 0.4
            }
        });
        value["general"][bottom_field] = json!(0.25);

        for (n, key) in crate::records::KEY_NAMES.iter().enumerate() {
            value[*key] = json!({ "actions": [[format!("KC_{n}"), "KC_LSFT"], ["KC_B"]] });
        }

        value
    }

    #[test]
    fn request_framing() {
        let codec = ProtocolCodec::default();

        assert_eq!(codec.encode_request(RequestKind::Info), b"info_request\n");
        assert_eq!(
            codec.encode_request(RequestKind::Configs),
            b"configs_request\n"
        );
    }

    #[test]
    fn response_types() {
        assert_eq!(RequestKind::Info.response_type(), "info_request_response");
        assert_eq!(
            RequestKind::Configs.response_type(),
            "configs_request_response"
        );
        assert_eq!(
            RequestKind::from_keyword("configs_request"),
            Some(RequestKind::Configs)
        );
        assert_eq!(RequestKind::from_keyword("reboot"), None);
    }

    #[test]
    fn decode_envelope() {
        let codec = ProtocolCodec::default();
        let envelope = codec
            .decode_line(br#"{"message_type":"info_request_response","temperature":23.4}"#)
            .unwrap();

        assert_eq!(envelope.message_type, "info_request_response");
        assert!(envelope.is_response_to(RequestKind::Info));
        assert!(!envelope.is_response_to(RequestKind::Configs));
        assert_eq!(envelope.payload["temperature"], json!(23.4));
        assert!(!envelope.payload.contains_key(MESSAGE_TYPE));
    }

    #[test]
    fn malformed_lines_are_decode_errors() {
        let codec = ProtocolCodec::default();

        for line in [
            &b"\xff\xfe garbage"[..],
            b"not json at all",
            b"{\"message_type\": \"info_req",
            b"[1, 2, 3]",
            b"{\"temperature\": 23.4}",
            b"{\"message_type\": 7}",
        ] {
            let error = codec.decode_line(line).unwrap_err();
            assert!(matches!(error, Error::Decode { .. }), "{error:?}");
        }
    }

    #[test]
    fn configs_missing_a_key_is_schema_error() {
        let codec = ProtocolCodec::default();
        let mut value = configs_json(BOTTOM_DEADZONE_FIELD);
        value.as_object_mut().unwrap().remove("key_5");

        let error = codec.decode_payload(RequestKind::Configs, value).unwrap_err();

        assert!(matches!(error, Error::Schema { .. }));
        assert!(error.to_string().contains("key_5"));
    }

    #[test]
    fn info_with_mistyped_key_is_schema_error() {
        let codec = ProtocolCodec::default();
        let mut value = serde_json::to_value(Info::example()).unwrap();
        value["key_3"] = json!({"state": "yes", "distance": 0.1});

        let error = codec.decode_payload(RequestKind::Info, value).unwrap_err();
        assert!(matches!(error, Error::Schema { .. }));
    }

    #[test]
    fn configs_round_trip() {
        let codec = ProtocolCodec::default();
        let value = configs_json(BOTTOM_DEADZONE_FIELD);

        let configs = codec
            .decode_payload(RequestKind::Configs, value.clone())
            .unwrap()
            .try_into_configs()
            .unwrap();

        assert_eq!(configs.general.bottom_deadzone, 0.25);
        assert_eq!(configs.key_2.actions[0], vec!["KC_1", "KC_LSFT"]);

        let encoded = codec.encode_configs(&configs).unwrap();
        assert_eq!(encoded.last(), Some(&b'\n'));

        let reencoded: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(reencoded, value);
        assert!(reencoded.get(MESSAGE_TYPE).is_none());
    }

    #[test]
    fn legacy_deadzone_spelling() {
        let codec = ProtocolCodec::with_bottom_deadzone_field(LEGACY_BOTTOM_DEADZONE_FIELD);
        let value = configs_json(LEGACY_BOTTOM_DEADZONE_FIELD);

        let configs = codec.decode_configs(value).unwrap();
        assert_eq!(configs.general.bottom_deadzone, 0.25);

        let written = codec.configs_to_value(&configs).unwrap();
        assert_eq!(written["general"][LEGACY_BOTTOM_DEADZONE_FIELD], json!(0.25));
        assert!(written["general"].get(BOTTOM_DEADZONE_FIELD).is_none());

        // The default codec does not understand the legacy spelling.
        let error = ProtocolCodec::default()
            .decode_configs(configs_json(LEGACY_BOTTOM_DEADZONE_FIELD))
            .unwrap_err();
        assert!(matches!(error, Error::Schema { .. }));
    }

    #[test]
    fn response_lines_decode_back() {
        let codec = ProtocolCodec::default();
        let line = codec.encode_response(&Payload::Info(Info::example())).unwrap();

        let envelope = codec.decode_line(&line).unwrap();
        assert!(envelope.is_response_to(RequestKind::Info));

        let info = codec
            .decode_payload(RequestKind::Info, envelope.into_value())
            .unwrap()
            .try_into_info()
            .unwrap();
        assert_eq!(info, Info::example());
    }
}
