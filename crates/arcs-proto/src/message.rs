//! JSON control plane: message kinds, structural validation, server-emitted
//! replies, and log sanitization.
//!
//! Inbound control commands are parsed once at the connection boundary and
//! forwarded byte-for-byte after validation; only server-originated messages
//! are built from the typed structs here.

use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Field names whose values never reach a log or audit record.
const SENSITIVE_KEYS: [&str; 4] = ["jwt_token", "secret", "password", "device_secret"];

/// Every recognized `"type"` string on the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    AuthRequest,
    AuthResponse,
    DeviceHello,
    SessionCreated,
    SessionJoined,
    JoinSession,
    JoinResponse,
    ControllerConnected,
    ControllerDisconnected,
    DeviceDisconnected,
    Touch,
    Key,
    System,
    AppControl,
    Macro,
    Ai,
    CommandResult,
    Ping,
    Pong,
    Status,
    Error,
}

impl MessageKind {
    pub fn from_type_str(s: &str) -> Option<Self> {
        Some(match s {
            "auth_request" => Self::AuthRequest,
            "auth_response" => Self::AuthResponse,
            "device_hello" => Self::DeviceHello,
            "session_created" => Self::SessionCreated,
            "session_joined" => Self::SessionJoined,
            "join_session" => Self::JoinSession,
            "join_response" => Self::JoinResponse,
            "controller_connected" => Self::ControllerConnected,
            "controller_disconnected" => Self::ControllerDisconnected,
            "device_disconnected" => Self::DeviceDisconnected,
            "touch" => Self::Touch,
            "key" => Self::Key,
            "system" => Self::System,
            "app_control" => Self::AppControl,
            "macro" => Self::Macro,
            "ai" => Self::Ai,
            "command_result" => Self::CommandResult,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "status" => Self::Status,
            "error" => Self::Error,
            _ => return None,
        })
    }

    pub fn as_type_str(&self) -> &'static str {
        match self {
            Self::AuthRequest => "auth_request",
            Self::AuthResponse => "auth_response",
            Self::DeviceHello => "device_hello",
            Self::SessionCreated => "session_created",
            Self::SessionJoined => "session_joined",
            Self::JoinSession => "join_session",
            Self::JoinResponse => "join_response",
            Self::ControllerConnected => "controller_connected",
            Self::ControllerDisconnected => "controller_disconnected",
            Self::DeviceDisconnected => "device_disconnected",
            Self::Touch => "touch",
            Self::Key => "key",
            Self::System => "system",
            Self::AppControl => "app_control",
            Self::Macro => "macro",
            Self::Ai => "ai",
            Self::CommandResult => "command_result",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Status => "status",
            Self::Error => "error",
        }
    }

    /// Control commands a controller may send for relay to the device.
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            Self::Touch | Self::Key | Self::System | Self::AppControl | Self::Macro | Self::Ai
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_type_str())
    }
}

/// Structural validation failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidateError {
    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("missing \"type\" field")]
    MissingType,

    #[error("unrecognized message type: {0}")]
    UnknownType(String),

    #[error("{kind}: missing required field \"{field}\"")]
    MissingField { kind: &'static str, field: &'static str },

    #[error("{kind}: field \"{field}\" has the wrong shape")]
    BadField { kind: &'static str, field: &'static str },

    #[error("{kind}: unsupported action \"{action}\"")]
    BadAction { kind: &'static str, action: String },
}

const TOUCH_ACTIONS: [&str; 4] = ["tap", "swipe", "long_press", "pinch"];
const KEY_ACTIONS: [&str; 3] = ["text", "press", "combination"];
const SYSTEM_ACTIONS: [&str; 7] = [
    "home",
    "back",
    "recents",
    "notifications",
    "quick_settings",
    "lock",
    "screenshot",
];

/// Validate a parsed message against its kind's required fields.
///
/// Returns the kind so callers can demultiplex without re-reading `type`.
pub fn validate_message(value: &Value) -> Result<MessageKind, ValidateError> {
    let obj = value.as_object().ok_or(ValidateError::NotAnObject)?;
    let type_str = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ValidateError::MissingType)?;
    let kind = MessageKind::from_type_str(type_str)
        .ok_or_else(|| ValidateError::UnknownType(type_str.to_string()))?;

    match kind {
        MessageKind::AuthRequest => {
            require_str(obj, "auth_request", "device_id")?;
            require_str(obj, "auth_request", "secret")?;
        }
        MessageKind::DeviceHello => {
            require_str(obj, "device_hello", "device_id")?;
        }
        MessageKind::JoinSession => {
            require_str(obj, "join_session", "session_id")?;
            require_str(obj, "join_session", "jwt_token")?;
        }
        MessageKind::Touch => {
            let action = require_action(obj, "touch", &TOUCH_ACTIONS)?;
            match action {
                "tap" | "long_press" | "pinch" => {
                    require_int(obj, "touch", "x")?;
                    require_int(obj, "touch", "y")?;
                }
                "swipe" => {
                    require_int(obj, "touch", "start_x")?;
                    require_int(obj, "touch", "start_y")?;
                    require_int(obj, "touch", "end_x")?;
                    require_int(obj, "touch", "end_y")?;
                }
                _ => unreachable!(),
            }
        }
        MessageKind::Key => {
            let action = require_action(obj, "key", &KEY_ACTIONS)?;
            match action {
                "text" => require_str(obj, "key", "text")?,
                "press" => require_int(obj, "key", "keycode")?,
                "combination" => require_array(obj, "key", "keys")?,
                _ => unreachable!(),
            }
        }
        MessageKind::System => {
            require_action(obj, "system", &SYSTEM_ACTIONS)?;
        }
        MessageKind::AppControl => {
            require_str(obj, "app_control", "action")?;
        }
        MessageKind::Macro => {
            require_array(obj, "macro", "actions")?;
        }
        MessageKind::Ai => {
            require_str(obj, "ai", "action")?;
        }
        MessageKind::CommandResult => {
            require_str(obj, "command_result", "original_type")?;
            require_bool(obj, "command_result", "success")?;
        }
        MessageKind::Error => {
            require_str(obj, "error", "code")?;
        }
        // Server-emitted kinds and keepalives carry no client obligations
        // beyond `type` itself.
        _ => {}
    }

    Ok(kind)
}

fn require_str(
    obj: &Map<String, Value>,
    kind: &'static str,
    field: &'static str,
) -> Result<(), ValidateError> {
    match obj.get(field) {
        None => Err(ValidateError::MissingField { kind, field }),
        Some(Value::String(_)) => Ok(()),
        Some(_) => Err(ValidateError::BadField { kind, field }),
    }
}

fn require_int(
    obj: &Map<String, Value>,
    kind: &'static str,
    field: &'static str,
) -> Result<(), ValidateError> {
    match obj.get(field) {
        None => Err(ValidateError::MissingField { kind, field }),
        Some(v) if v.is_i64() || v.is_u64() => Ok(()),
        Some(_) => Err(ValidateError::BadField { kind, field }),
    }
}

fn require_bool(
    obj: &Map<String, Value>,
    kind: &'static str,
    field: &'static str,
) -> Result<(), ValidateError> {
    match obj.get(field) {
        None => Err(ValidateError::MissingField { kind, field }),
        Some(Value::Bool(_)) => Ok(()),
        Some(_) => Err(ValidateError::BadField { kind, field }),
    }
}

fn require_array(
    obj: &Map<String, Value>,
    kind: &'static str,
    field: &'static str,
) -> Result<(), ValidateError> {
    match obj.get(field) {
        None => Err(ValidateError::MissingField { kind, field }),
        Some(Value::Array(_)) => Ok(()),
        Some(_) => Err(ValidateError::BadField { kind, field }),
    }
}

fn require_action<'a>(
    obj: &'a Map<String, Value>,
    kind: &'static str,
    allowed: &[&str],
) -> Result<&'a str, ValidateError> {
    let action = match obj.get("action") {
        None => return Err(ValidateError::MissingField { kind, field: "action" }),
        Some(Value::String(s)) => s.as_str(),
        Some(_) => return Err(ValidateError::BadField { kind, field: "action" }),
    };
    if allowed.contains(&action) {
        Ok(action)
    } else {
        Err(ValidateError::BadAction {
            kind,
            action: action.to_string(),
        })
    }
}

/// Protocol error codes. Opaque strings to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    AuthFailed,
    PermissionDenied,
    DeviceBusy,
    UnsupportedOperation,
    InvalidCommand,
    RateLimit,
    Internal,
    SessionNotFound,
    InvalidToken,
    Unauthorized,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthFailed => "ERR_AUTH_FAILED",
            Self::PermissionDenied => "ERR_PERMISSION_DENIED",
            Self::DeviceBusy => "ERR_DEVICE_BUSY",
            Self::UnsupportedOperation => "ERR_UNSUPPORTED_OPERATION",
            Self::InvalidCommand => "ERR_INVALID_COMMAND",
            Self::RateLimit => "ERR_RATE_LIMIT",
            Self::Internal => "ERR_INTERNAL",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::Unauthorized => "UNAUTHORIZED",
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// `error` envelope sent to a misbehaving or unlucky peer.
#[derive(Debug, Serialize)]
pub struct ErrorMessage {
    #[serde(rename = "type")]
    ty: &'static str,
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorMessage {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ty: "error",
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("error message serializes")
    }
}

/// `auth_response`, the reply to a successful `auth_request`.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    #[serde(rename = "type")]
    ty: &'static str,
    pub success: bool,
    pub session_id: String,
    pub jwt_token: String,
    pub expires_at: i64,
    pub server_time: i64,
}

impl AuthResponse {
    pub fn new(session_id: String, jwt_token: String, expires_at: i64, server_time: i64) -> Self {
        Self {
            ty: "auth_response",
            success: true,
            session_id,
            jwt_token,
            expires_at,
            server_time,
        }
    }
}

/// `session_created`, the reply to a `device_hello`.
#[derive(Debug, Serialize)]
pub struct SessionCreated {
    #[serde(rename = "type")]
    ty: &'static str,
    pub session_id: String,
    pub jwt_token: String,
    pub expires_at: i64,
    pub server_time: i64,
}

impl SessionCreated {
    pub fn new(session_id: String, jwt_token: String, expires_at: i64, server_time: i64) -> Self {
        Self {
            ty: "session_created",
            session_id,
            jwt_token,
            expires_at,
            server_time,
        }
    }
}

/// `join_response`, the reply to a successful `join_session`.
#[derive(Debug, Serialize)]
pub struct JoinResponse {
    #[serde(rename = "type")]
    ty: &'static str,
    pub success: bool,
    pub session_id: String,
    pub device_info: Value,
    pub video_config: Value,
}

impl JoinResponse {
    pub fn new(session_id: String, device_info: Value, video_config: Value) -> Self {
        Self {
            ty: "join_response",
            success: true,
            session_id,
            device_info,
            video_config,
        }
    }
}

/// Peer lifecycle notification (`controller_connected` and friends).
pub fn peer_event(kind: MessageKind, session_id: &str, peer_id: &str) -> Value {
    json!({
        "type": kind.as_type_str(),
        "session_id": session_id,
        "peer_id": peer_id,
    })
}

/// Local `pong` reply.
pub fn pong() -> Value {
    json!({ "type": "pong" })
}

/// Deep copy with every sensitive field redacted to `"***"`.
///
/// Applied to any message before it reaches a log or audit sink.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, val) in map {
                if SENSITIVE_KEYS.contains(&key.as_str()) {
                    out.insert(key.clone(), Value::String("***".to_string()));
                } else {
                    out.insert(key.clone(), sanitize(val));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for s in [
            "auth_request",
            "device_hello",
            "join_session",
            "touch",
            "key",
            "system",
            "app_control",
            "macro",
            "ai",
            "command_result",
            "ping",
            "pong",
            "status",
            "error",
        ] {
            let kind = MessageKind::from_type_str(s).unwrap();
            assert_eq!(kind.as_type_str(), s);
        }
        assert!(MessageKind::from_type_str("reboot").is_none());
    }

    #[test]
    fn test_validate_auth_request() {
        let good = json!({
            "type": "auth_request",
            "device_id": "d1",
            "secret": "s1",
            "device_info": {"model": "P7"},
            "timestamp": 1
        });
        assert_eq!(validate_message(&good), Ok(MessageKind::AuthRequest));

        let missing_secret = json!({"type": "auth_request", "device_id": "d1"});
        assert_eq!(
            validate_message(&missing_secret),
            Err(ValidateError::MissingField {
                kind: "auth_request",
                field: "secret"
            })
        );
    }

    #[test]
    fn test_validate_touch_variants() {
        let tap = json!({"type": "touch", "action": "tap", "x": 540, "y": 1200});
        assert_eq!(validate_message(&tap), Ok(MessageKind::Touch));

        let swipe = json!({
            "type": "touch", "action": "swipe",
            "start_x": 0, "start_y": 0, "end_x": 100, "end_y": 400
        });
        assert_eq!(validate_message(&swipe), Ok(MessageKind::Touch));

        let bad_action = json!({"type": "touch", "action": "hover", "x": 1, "y": 2});
        assert!(matches!(
            validate_message(&bad_action),
            Err(ValidateError::BadAction { .. })
        ));

        let missing_coord = json!({"type": "touch", "action": "tap", "x": 1});
        assert!(matches!(
            validate_message(&missing_coord),
            Err(ValidateError::MissingField { field: "y", .. })
        ));

        let string_coord = json!({"type": "touch", "action": "tap", "x": "1", "y": 2});
        assert!(matches!(
            validate_message(&string_coord),
            Err(ValidateError::BadField { field: "x", .. })
        ));
    }

    #[test]
    fn test_validate_key_and_system() {
        let text = json!({"type": "key", "action": "text", "text": "hello"});
        assert_eq!(validate_message(&text), Ok(MessageKind::Key));

        let press = json!({"type": "key", "action": "press", "keycode": 66});
        assert_eq!(validate_message(&press), Ok(MessageKind::Key));

        let combo = json!({"type": "key", "action": "combination", "keys": [113, 29]});
        assert_eq!(validate_message(&combo), Ok(MessageKind::Key));

        let home = json!({"type": "system", "action": "home"});
        assert_eq!(validate_message(&home), Ok(MessageKind::System));

        let bad = json!({"type": "system", "action": "reboot"});
        assert!(matches!(
            validate_message(&bad),
            Err(ValidateError::BadAction { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_junk() {
        assert_eq!(
            validate_message(&json!("hello")),
            Err(ValidateError::NotAnObject)
        );
        assert_eq!(
            validate_message(&json!({"kind": "touch"})),
            Err(ValidateError::MissingType)
        );
        assert_eq!(
            validate_message(&json!({"type": "launch_missiles"})),
            Err(ValidateError::UnknownType("launch_missiles".to_string()))
        );
    }

    #[test]
    fn test_command_kinds() {
        for s in ["touch", "key", "system", "app_control", "macro", "ai"] {
            assert!(MessageKind::from_type_str(s).unwrap().is_command());
        }
        assert!(!MessageKind::Ping.is_command());
        assert!(!MessageKind::CommandResult.is_command());
    }

    #[test]
    fn test_error_message_shape() {
        let bytes = ErrorMessage::new(ErrorCode::RateLimit, "slow down").to_bytes();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "ERR_RATE_LIMIT");
        assert_eq!(value["message"], "slow down");
        assert!(value.get("details").is_none());
    }

    #[test]
    fn test_sanitize_redacts_nested() {
        let message = json!({
            "type": "join_session",
            "session_id": "ABCD2345",
            "jwt_token": "eyJhbGciOi...",
            "extra": {
                "secret": "hunter2",
                "nested": [{"password": "pw", "x": 1}]
            }
        });
        let clean = sanitize(&message);
        assert_eq!(clean["jwt_token"], "***");
        assert_eq!(clean["extra"]["secret"], "***");
        assert_eq!(clean["extra"]["nested"][0]["password"], "***");
        assert_eq!(clean["extra"]["nested"][0]["x"], 1);
        assert_eq!(clean["session_id"], "ABCD2345");

        let rendered = clean.to_string();
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("eyJhbGciOi"));
    }
}
