//! Control-channel envelope and its wire codec.
//!
//! An envelope is JSON, UTF-8, behind a 4-byte big-endian length prefix.
//! Responses and errors name the envelope they answer in `in_reply_to`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

pub mod payload;

pub use payload::{
    Color, ColorChange, ColorChangeAck, ConnectionStatus, ErrorCode, ErrorPayload, FileTransferRequest,
    FileTransferResponse, Handshake, HotspotInfo,
};

/// Protocol version exchanged in the session handshake.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Size of the length prefix in front of every frame.
pub const LEN_PREFIX: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Command,
    Response,
    Request,
    Notification,
    Error,
}

impl MessageType {
    /// Whether the sender expects a correlated reply.
    pub fn expects_reply(&self) -> bool {
        matches!(self, MessageType::Command | MessageType::Request)
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, MessageType::Response | MessageType::Error)
    }
}

/// Which peer produced an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Mobile,
    Desktop,
}

impl Role {
    pub fn peer(&self) -> Role {
        match self {
            Role::Mobile => Role::Desktop,
            Role::Desktop => Role::Mobile,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Mobile => f.write_str("mobile"),
            Role::Desktop => f.write_str("desktop"),
        }
    }
}

/// Action tag of an envelope.
///
/// Unknown tags decode into [`Action::Other`] instead of failing, so new
/// notifications can be handled without a protocol bump.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    Handshake,
    ColorChange,
    ColorChangeAck,
    WifiHotspotInfo,
    WifiConnectionStatus,
    FileTransferRequest,
    FileTransferResponse,
    Error,
    Other(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::Handshake => "handshake",
            Action::ColorChange => "color_change",
            Action::ColorChangeAck => "color_change_ack",
            Action::WifiHotspotInfo => "wifi_hotspot_info",
            Action::WifiConnectionStatus => "wifi_connection_status",
            Action::FileTransferRequest => "file_transfer_request",
            Action::FileTransferResponse => "file_transfer_response",
            Action::Error => "error",
            Action::Other(s) => s,
        }
    }

    /// Action carried by a successful reply to this action.
    pub fn reply_action(&self) -> Action {
        match self {
            Action::ColorChange => Action::ColorChangeAck,
            Action::FileTransferRequest => Action::FileTransferResponse,
            other => other.clone(),
        }
    }
}

impl From<String> for Action {
    fn from(s: String) -> Self {
        match s.as_str() {
            "handshake" => Action::Handshake,
            "color_change" => Action::ColorChange,
            "color_change_ack" => Action::ColorChangeAck,
            "wifi_hotspot_info" => Action::WifiHotspotInfo,
            "wifi_connection_status" => Action::WifiConnectionStatus,
            "file_transfer_request" => Action::FileTransferRequest,
            "file_transfer_response" => Action::FileTransferResponse,
            "error" => Action::Error,
            _ => Action::Other(s),
        }
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        Action::from(s.to_string())
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        action.as_str().to_string()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub action: Action,
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub source: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<Uuid>,
}

impl Envelope {
    pub fn new(kind: MessageType, action: impl Into<Action>, data: Map<String, Value>, source: Role) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            kind,
            action: action.into(),
            data,
            timestamp: Utc::now(),
            source,
            in_reply_to: None,
        }
    }

    /// Build an envelope whose `data` is a serialized payload struct.
    pub fn with_payload<T: Serialize>(
        kind: MessageType,
        action: impl Into<Action>,
        payload: &T,
        source: Role,
    ) -> Result<Self> {
        Ok(Self::new(kind, action, to_data(payload)?, source))
    }

    pub fn command(action: impl Into<Action>, data: Map<String, Value>, source: Role) -> Self {
        Self::new(MessageType::Command, action, data, source)
    }

    pub fn request(action: impl Into<Action>, data: Map<String, Value>, source: Role) -> Self {
        Self::new(MessageType::Request, action, data, source)
    }

    pub fn notification(action: impl Into<Action>, data: Map<String, Value>, source: Role) -> Self {
        Self::new(MessageType::Notification, action, data, source)
    }

    /// Successful response correlated to `self`.
    pub fn reply_to(&self, data: Map<String, Value>, source: Role) -> Self {
        let mut reply = Self::new(MessageType::Response, self.action.reply_action(), data, source);
        reply.in_reply_to = Some(self.message_id);
        reply
    }

    /// Error response correlated to `self`.
    pub fn error_reply(&self, payload: &ErrorPayload, source: Role) -> Self {
        // ErrorPayload is plain strings; serialization cannot fail.
        let data = to_data(payload).unwrap_or_default();
        let mut reply = Self::new(MessageType::Error, Action::Error, data, source);
        reply.in_reply_to = Some(self.message_id);
        reply
    }

    pub fn color_change(color: Color, source: Role) -> Result<Self> {
        Self::with_payload(MessageType::Command, Action::ColorChange, &ColorChange { color }, source)
    }

    pub fn wifi_hotspot_info(info: &HotspotInfo, source: Role) -> Result<Self> {
        Self::with_payload(MessageType::Notification, Action::WifiHotspotInfo, info, source)
    }

    pub fn wifi_connection_status(status: &ConnectionStatus, source: Role) -> Result<Self> {
        Self::with_payload(MessageType::Notification, Action::WifiConnectionStatus, status, source)
    }

    pub fn file_transfer_request(offer: &FileTransferRequest, source: Role) -> Result<Self> {
        Self::with_payload(MessageType::Request, Action::FileTransferRequest, offer, source)
    }

    /// Response to a `file_transfer_request` envelope.
    pub fn file_transfer_response(&self, answer: &FileTransferResponse, source: Role) -> Result<Self> {
        Ok(self.reply_to(to_data(answer)?, source))
    }

    /// Deserialize the whole `data` map into a handler payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.data.clone()))
            .map_err(|e| Error::Decode(format!("{} payload: {e}", self.action)))
    }

    /// Deserialize a single required field of `data`.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .data
            .get(key)
            .ok_or_else(|| Error::Decode(format!("{} is missing field `{key}`", self.action)))?;
        serde_json::from_value(value.clone())
            .map_err(|e| Error::Decode(format!("{}.{key}: {e}", self.action)))
    }

    /// Serialize to the JSON body (no length prefix).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Protocol(format!("encode envelope: {e}")))
    }

    /// Deserialize from a JSON body (no length prefix).
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::Decode(e.to_string()))
    }
}

/// Serialize a payload struct into an envelope `data` map.
pub fn to_data<T: Serialize>(payload: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(payload).map_err(|e| Error::Protocol(e.to_string()))? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Protocol(format!("payload must be an object, got {other}"))),
    }
}

/// Encode an envelope into a self-delimiting frame.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    let body = envelope.to_bytes()?;
    let mut out = Vec::with_capacity(LEN_PREFIX + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode one complete frame produced by [`encode`].
pub fn decode(frame: &[u8]) -> Result<Envelope> {
    if frame.len() < LEN_PREFIX {
        return Err(Error::Decode("frame shorter than its length prefix".into()));
    }
    let (prefix, body) = frame.split_at(LEN_PREFIX);
    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if len != body.len() {
        return Err(Error::Decode(format!(
            "length prefix says {len} bytes, frame carries {}",
            body.len()
        )));
    }
    Envelope::from_bytes(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;

    fn sample() -> Envelope {
        Envelope::color_change(Color::Red, Role::Mobile).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let envelope = sample();
        let frame = encode(&envelope).unwrap();
        assert_eq!(decode(&frame).unwrap(), envelope);

        let reply = envelope.reply_to(Map::new(), Role::Desktop);
        assert_eq!(decode(&encode(&reply).unwrap()).unwrap(), reply);
    }

    #[test]
    fn test_float_data_survives_roundtrip() {
        let floats = [
            1.0715660391465826e-75,
            0.1,
            5e-324,
            2.2250738585072014e-308,
            1.7976931348623157e308,
            -123456.789012345,
        ];
        for f in floats {
            let mut data = Map::new();
            data.insert("v".into(), json!(f));
            let envelope = Envelope::notification("telemetry", data, Role::Desktop);
            let back = decode(&encode(&envelope).unwrap()).unwrap();
            assert_eq!(back.data["v"].as_f64(), Some(f));
            assert_eq!(back, envelope);
        }
    }

    fn kind_strategy() -> impl Strategy<Value = MessageType> {
        prop_oneof![
            Just(MessageType::Command),
            Just(MessageType::Response),
            Just(MessageType::Request),
            Just(MessageType::Notification),
            Just(MessageType::Error),
        ]
    }

    fn action_strategy() -> impl Strategy<Value = Action> {
        prop_oneof![
            Just(Action::Handshake),
            Just(Action::ColorChange),
            Just(Action::WifiHotspotInfo),
            Just(Action::FileTransferRequest),
            Just(Action::Error),
            "x_[a-z_]{1,12}".prop_map(Action::Other),
        ]
    }

    fn value_strategy() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            any::<u64>().prop_map(Value::from),
            any::<f64>()
                .prop_filter("JSON numbers are finite", |f| f.is_finite())
                .prop_map(Value::from),
            ".{0,16}".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    fn envelope_strategy() -> impl Strategy<Value = Envelope> {
        (
            any::<u128>(),
            kind_strategy(),
            action_strategy(),
            prop::collection::btree_map("[a-z_]{1,8}", value_strategy(), 0..5),
            0i64..4_000_000_000,
            0u32..1_000_000_000,
            any::<bool>(),
            proptest::option::of(any::<u128>()),
        )
            .prop_map(|(id, kind, action, data, secs, nanos, mobile, reply)| Envelope {
                message_id: Uuid::from_u128(id),
                kind,
                action,
                data: data.into_iter().collect(),
                timestamp: Utc
                    .timestamp_opt(secs, nanos)
                    .single()
                    .unwrap_or_else(Utc::now),
                source: if mobile { Role::Mobile } else { Role::Desktop },
                in_reply_to: reply.map(Uuid::from_u128),
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

        #[test]
        fn roundtrip_any_envelope(envelope in envelope_strategy()) {
            let frame = encode(&envelope).unwrap();
            prop_assert_eq!(decode(&frame).unwrap(), envelope);
        }
    }

    #[test]
    fn test_wire_shape() {
        let envelope = sample();
        let value: Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "command");
        assert_eq!(value["action"], "color_change");
        assert_eq!(value["data"]["color"], "RED");
        assert_eq!(value["source"], "mobile");
        assert!(value.get("in_reply_to").is_none());
    }

    #[test]
    fn test_reply_correlates() {
        let request = sample();
        let reply = request.reply_to(Map::new(), Role::Desktop);
        assert_eq!(reply.in_reply_to, Some(request.message_id));
        assert_ne!(reply.message_id, request.message_id);
        assert_eq!(reply.action, Action::ColorChangeAck);
        assert_eq!(reply.kind, MessageType::Response);

        let err = request.error_reply(&ErrorPayload::new(ErrorCode::E008, "nope"), Role::Desktop);
        assert_eq!(err.kind, MessageType::Error);
        assert_eq!(err.in_reply_to, Some(request.message_id));
    }

    #[test]
    fn test_unknown_action_is_surfaced() {
        let body = json!({
            "message_id": Uuid::new_v4(),
            "type": "notification",
            "action": "battery_level",
            "data": {"percent": 40},
            "timestamp": "2025-01-01T12:00:00+00:00",
            "source": "desktop"
        });
        let envelope = Envelope::from_bytes(body.to_string().as_bytes()).unwrap();
        assert_eq!(envelope.action, Action::Other("battery_level".into()));
        assert_eq!(envelope.field::<u32>("percent").unwrap(), 40);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let body = json!({
            "message_id": Uuid::new_v4(),
            "type": "broadcast",
            "action": "color_change",
            "data": {},
            "timestamp": "2025-01-01T12:00:00Z",
            "source": "mobile"
        });
        let err = Envelope::from_bytes(body.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(decode(&[0, 0]), Err(Error::Decode(_))));
        assert!(matches!(decode(&[0, 0, 0, 9, b'{']), Err(Error::Decode(_))));
        assert!(matches!(decode(&[0, 0, 0, 1, b'{']), Err(Error::Decode(_))));
    }

    #[test]
    fn test_missing_handler_field() {
        let envelope = Envelope::command(Action::ColorChange, Map::new(), Role::Mobile);
        assert!(matches!(envelope.payload::<ColorChange>(), Err(Error::Decode(_))));
        assert!(matches!(envelope.field::<String>("color"), Err(Error::Decode(_))));
    }
}
