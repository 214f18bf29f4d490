//! Wire envelopes exchanged with the control server.
//!
//! ## Inbound (server → agent)
//!
//! ```json
//! {"resource": "pod", "action": "list", "request_id": "r1", "params": {"namespace": "default"}}
//! ```
//!
//! Every field is optional on the wire; missing fields decode to their zero
//! value. `request_id` is echoed verbatim and never interpreted.
//!
//! ## Outbound (agent → server)
//!
//! ```json
//! {"res_type": "request", "request_id": "r1", "data": {"code": "Success", "msg": "Success", "data": [...]}}
//! {"res_type": "watch",   "request_id": "",   "data": {"event": "add", "obj": "pods", "resource": {...}}}
//! {"res_type": "exec",    "request_id": "<session id>", "data": "<base64 bytes>"}
//! {"res_type": "log",     "request_id": "<session id>", "data": "<base64 bytes>"}
//! ```

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A decoded request frame.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Request {
    pub resource: String,
    pub action: String,
    pub request_id: String,
    pub params: Value,
}

impl Request {
    /// Decode handler params into `T`, falling back to `T::default()` when the
    /// params are absent or do not match `T`'s shape.
    pub fn params<T: DeserializeOwned + Default>(&self) -> T {
        decode_params(&self.params)
    }
}

/// Decode opaque request params into a handler-specific struct.
///
/// Decoding is per field: a field of the wrong type falls back to its zero
/// value and the remaining fields are kept. Params that are not a JSON object
/// decode to `T::default()`.
pub fn decode_params<T: DeserializeOwned + Default>(params: &Value) -> T {
    if let Ok(decoded) = T::deserialize(params) {
        return decoded;
    }
    let Value::Object(fields) = params else {
        return T::default();
    };
    let usable: Map<String, Value> = fields
        .iter()
        .filter(|(key, value)| {
            let single = Map::from_iter([((*key).clone(), (*value).clone())]);
            T::deserialize(&Value::Object(single)).is_ok()
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    T::deserialize(&Value::Object(usable)).unwrap_or_default()
}

/// Symbolic result codes. Anything other than `Success` is an error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Code {
    Success,
    /// Missing or invalid request params.
    ParamsError,
    /// Lookup by name/namespace failed.
    GetError,
    /// Upstream enumeration failed.
    ListError,
    /// Upstream mutation rejected, including exhausted conflict retries.
    UpdateError,
    DeleteError,
    /// Serialization to a display format failed.
    MarshalError,
    /// No handler registered for the resource/action pair.
    ActionError,
    /// A handler panicked. Produced only by the dispatcher.
    UnknownError,
}

impl Code {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::ParamsError => "ParamsError",
            Self::GetError => "GetError",
            Self::ListError => "ListError",
            Self::UpdateError => "UpdateError",
            Self::DeleteError => "DeleteError",
            Self::MarshalError => "MarshalError",
            Self::ActionError => "ActionError",
            Self::UnknownError => "UnknownError",
        }
    }
}

/// The `Result` payload of a `request` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub code: Code,
    pub msg: String,
    #[serde(default)]
    pub data: Value,
}

impl Response {
    pub fn success(data: Value) -> Self {
        Self {
            code: Code::Success,
            msg: "Success".to_string(),
            data,
        }
    }

    pub fn ok() -> Self {
        Self::success(Value::Null)
    }

    /// Success carrying a message instead of data.
    pub fn ok_with_message(msg: impl Into<String>) -> Self {
        Self {
            code: Code::Success,
            msg: msg.into(),
            data: Value::Null,
        }
    }

    pub fn error(code: Code, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Code::Success
    }
}

/// Discriminates the four outbound stream types sharing the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResType {
    Request,
    Watch,
    Exec,
    Log,
}

/// Resource change kind carried by a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

/// Payload of a `watch` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub event: EventKind,
    /// Resource-kind label, e.g. `pods` or `deployment`.
    pub obj: String,
    pub resource: Value,
}

/// One outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub res_type: ResType,
    pub request_id: String,
    pub data: Value,
}

impl Envelope {
    /// Correlated response to a request.
    pub fn response(request_id: impl Into<String>, response: &Response) -> Self {
        Self {
            res_type: ResType::Request,
            request_id: request_id.into(),
            data: serde_json::to_value(response).unwrap_or(Value::Null),
        }
    }

    /// Unsolicited resource change; never correlated.
    pub fn watch(event: &WatchEvent) -> Self {
        Self {
            res_type: ResType::Watch,
            request_id: String::new(),
            data: serde_json::to_value(event).unwrap_or(Value::Null),
        }
    }

    /// Interactive shell output chunk for `session_id`.
    pub fn exec(session_id: impl Into<String>, bytes: &[u8]) -> Self {
        Self::chunk(ResType::Exec, session_id.into(), bytes)
    }

    /// Log stream chunk for `session_id`.
    pub fn log(session_id: impl Into<String>, bytes: &[u8]) -> Self {
        Self::chunk(ResType::Log, session_id.into(), bytes)
    }

    fn chunk(res_type: ResType, request_id: String, bytes: &[u8]) -> Self {
        Self {
            res_type,
            request_id,
            data: Value::String(BASE64.encode(bytes)),
        }
    }

    /// Decoded bytes of an `exec`/`log` chunk.
    pub fn chunk_bytes(&self) -> Option<Vec<u8>> {
        self.data.as_str().and_then(|s| BASE64.decode(s).ok())
    }

    /// The `Result` payload of a `request` envelope.
    pub fn response_payload(&self) -> Option<Response> {
        if self.res_type != ResType::Request {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }
}
