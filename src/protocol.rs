//! Wire Protocol
//!
//! Every WebSocket text frame carries one JSON envelope `{"event", "data"}`.
//! Business payloads stay opaque `serde_json::Value`s; only the routing fields
//! (store code, client id, operation key) are ever read.
//!
//! Uses Sans-IO pattern: encoding/decoding is separated from I/O for testability.

use crate::domain::value_objects::{ConnectionId, PresenceStatus, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

// Backend -> relay
pub const REGISTER_STORE: &str = "register_store";
pub const HEARTBEAT: &str = "heartbeat";
pub const LOGIN_RESULT: &str = "login_result";
pub const LOGIN_RESPONSE_LEGACY: &str = "login_response";

// Relay -> backend
pub const REGISTER_STORE_RESPONSE: &str = "register_store_response";
pub const HEARTBEAT_RESPONSE: &str = "heartbeat_response";
pub const LOGIN_REQUEST: &str = "login_request";

// Client -> relay
pub const REGISTER_CLIENT: &str = "register_client";
pub const LOGIN: &str = "login";

// Relay -> client
pub const REGISTER_CLIENT_RESPONSE: &str = "register_client_response";
pub const STORE_STATUS: &str = "store_status";

/// Field carrying the explicit client identifier.
pub const CLIENT_ID: &str = "client_id";
/// Legacy spelling of [`CLIENT_ID`].
pub const CLIENT_SID: &str = "client_sid";

/// One framed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Encode an envelope into a text frame.
pub fn encode(envelope: &Envelope) -> serde_json::Result<String> {
    serde_json::to_string(envelope)
}

/// Decode a text frame into an envelope.
pub fn decode(frame: &str) -> serde_json::Result<Envelope> {
    serde_json::from_str(frame)
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterStore {
    #[serde(default, alias = "tenant_id")]
    pub store_code: Option<String>,
    #[serde(default)]
    pub auth_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterClient {
    #[serde(default, alias = "tenant_id")]
    pub store_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Login {
    #[serde(default, alias = "tenant_id")]
    pub store_code: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Verdict of a store backend on a relayed login.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResult {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_sid: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, alias = "user_payload")]
    pub user_info: Option<Value>,
}

impl LoginResult {
    /// The client the verdict is addressed to.
    pub fn client(&self) -> Option<ConnectionId> {
        self.client_id
            .as_deref()
            .or(self.client_sid.as_deref())
            .filter(|s| !s.is_empty())
            .map(ConnectionId::new)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Heartbeat {
    #[serde(default, alias = "tenant_id")]
    pub store_code: Option<String>,
}

/// Parse a typed payload, treating a missing `data` as an empty object.
pub fn parse_payload<T: serde::de::DeserializeOwned>(data: &Value) -> serde_json::Result<T> {
    match data {
        Value::Null => serde_json::from_value(Value::Object(Map::new())),
        other => T::deserialize(other),
    }
}

/// Read a non-empty string routing field.
pub fn string_field<'a>(data: &'a Value, field: &str) -> Option<&'a str> {
    data.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Read a routing field as text, accepting numbers too (sale ids often are).
pub fn key_field(data: &Value, field: &str) -> Option<String> {
    match data.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The explicit client identifier a backend attached to a response, if any.
pub fn explicit_client_id(data: &Value) -> Option<ConnectionId> {
    string_field(data, CLIENT_ID)
        .or_else(|| string_field(data, CLIENT_SID))
        .map(ConnectionId::new)
}

/// Attach the requesting client's identifier to a payload forwarded to a backend.
///
/// Non-object payloads are wrapped so the identifier always has a place to live.
pub fn with_client_id(data: Value, client: &ConnectionId) -> Value {
    let mut map = match data {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("payload".to_string(), other);
            map
        }
    };
    map.insert(CLIENT_ID.to_string(), Value::String(client.to_string()));
    map.insert(CLIENT_SID.to_string(), Value::String(client.to_string()));
    Value::Object(map)
}

pub fn error_payload(error: impl std::fmt::Display) -> Value {
    json!({ "success": false, "error": error.to_string() })
}

pub fn presence_event(tenant: &TenantId, status: PresenceStatus) -> Envelope {
    Envelope::new(
        STORE_STATUS,
        json!({ "store_code": tenant.as_str(), "status": status.as_str() }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_envelope() {
        let env = decode(r#"{"event":"get_products","data":{"page":2}}"#).unwrap();
        assert_eq!(env.event, "get_products");
        assert_eq!(env.data["page"], 2);
    }

    #[test]
    fn test_decode_envelope_without_data() {
        let env = decode(r#"{"event":"get_products"}"#).unwrap();
        assert_eq!(env.data, Value::Null);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"data":{}}"#).is_err());
    }

    #[test]
    fn test_encode_keeps_payload_opaque() {
        let env = Envelope::new("products_data", json!({"items": [1, 2, 3]}));
        let text = encode(&env).unwrap();
        assert_eq!(decode(&text).unwrap(), env);
    }

    #[test]
    fn test_register_store_accepts_tenant_id_alias() {
        let reg: RegisterStore =
            parse_payload(&json!({"tenant_id": "S1", "auth_code": "x"})).unwrap();
        assert_eq!(reg.store_code.as_deref(), Some("S1"));
        assert_eq!(reg.auth_code.as_deref(), Some("x"));
    }

    #[test]
    fn test_parse_payload_null_data() {
        let reg: RegisterClient = parse_payload(&Value::Null).unwrap();
        assert!(reg.store_code.is_none());
    }

    #[test]
    fn test_login_result_legacy_client_sid() {
        let res: LoginResult = parse_payload(&json!({
            "client_sid": "abc",
            "success": true,
            "user_info": {"name": "alice"}
        }))
        .unwrap();
        assert_eq!(res.client(), Some(ConnectionId::new("abc")));
        assert!(res.success);
        assert_eq!(res.user_info.unwrap()["name"], "alice");
    }

    #[test]
    fn test_explicit_client_id_prefers_new_field() {
        let data = json!({"client_id": "new", "client_sid": "old"});
        assert_eq!(explicit_client_id(&data), Some(ConnectionId::new("new")));
        let legacy = json!({"client_sid": "old"});
        assert_eq!(explicit_client_id(&legacy), Some(ConnectionId::new("old")));
        assert_eq!(explicit_client_id(&json!({"client_id": ""})), None);
    }

    #[test]
    fn test_key_field_accepts_numbers() {
        assert_eq!(key_field(&json!({"sale_id": 42}), "sale_id").as_deref(), Some("42"));
        assert_eq!(key_field(&json!({"np": "P-1"}), "np").as_deref(), Some("P-1"));
        assert_eq!(key_field(&json!({"np": null}), "np"), None);
    }

    #[test]
    fn test_with_client_id_injects_both_spellings() {
        let client = ConnectionId::new("c1");
        let data = with_client_id(json!({"np": "P-1"}), &client);
        assert_eq!(data["np"], "P-1");
        assert_eq!(data["client_id"], "c1");
        assert_eq!(data["client_sid"], "c1");

        let wrapped = with_client_id(json!([1, 2]), &client);
        assert_eq!(wrapped["payload"], json!([1, 2]));
        assert_eq!(wrapped["client_id"], "c1");
    }

    #[test]
    fn test_presence_event_shape() {
        let env = presence_event(&TenantId::new("S1"), PresenceStatus::Offline);
        assert_eq!(env.event, STORE_STATUS);
        assert_eq!(env.data, json!({"store_code": "S1", "status": "offline"}));
    }
}
