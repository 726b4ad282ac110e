// ============================================================================
// SECTION 12: CONTROL PROTOCOL
// ============================================================================
// JSON text frames over the control channel:
//
//   in   {id, action: "domain.action", params}
//   out  {type:"response", id, success, data?, error?}
//        {type:"stream",   id, stream, data}
//        {type:"error",    id, success:false, error}
//
// Stream chunks carry data = {kind, ...}. There is no end-of-stream message.
// ============================================================================

use serde::Serialize;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tokio::sync::mpsc;

use crate::error::ProtocolError;

// ----------------------------------------------------------------------------
// 12.1 Inbound
// ----------------------------------------------------------------------------

/// A decoded request
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub id: String,
    pub action: String,
    pub params: JsonValue,
}

/// Decode one text frame. On failure the request id is returned alongside
/// the error when it could be recovered, so the error can be correlated.
pub fn parse_inbound(text: &str) -> Result<Inbound, (Option<String>, ProtocolError)> {
    let value: JsonValue =
        serde_json::from_str(text).map_err(|e| (None, ProtocolError::malformed(e.to_string())))?;
    let JsonValue::Object(mut object) = value else {
        return Err((None, ProtocolError::malformed("request must be a JSON object")));
    };

    let id = match object.remove("id") {
        Some(JsonValue::String(s)) if !s.is_empty() => Some(s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    let action = match object.remove("action") {
        Some(JsonValue::String(s)) => s,
        _ => return Err((id, ProtocolError::malformed("missing action"))),
    };
    let Some(id) = id else {
        return Err((None, ProtocolError::MissingId));
    };

    let params = match object.remove("params") {
        None | Some(JsonValue::Null) => JsonValue::Object(JsonMap::new()),
        Some(p @ JsonValue::Object(_)) => p,
        Some(_) => {
            return Err((
                Some(id),
                ProtocolError::invalid_params(action, "params must be an object"),
            ))
        }
    };

    Ok(Inbound { id, action, params })
}

// ----------------------------------------------------------------------------
// 12.2 Outbound
// ----------------------------------------------------------------------------

/// A message to the console
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Response {
        id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<JsonValue>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Stream {
        id: String,
        stream: String,
        data: JsonValue,
    },
    Error {
        id: Option<String>,
        success: bool,
        error: String,
    },
}

impl Outbound {
    pub fn ok(id: impl Into<String>, data: JsonValue) -> Self {
        Outbound::Response {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Outbound::Response {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn chunk(id: impl Into<String>, stream: impl Into<String>, data: JsonValue) -> Self {
        Outbound::Stream {
            id: id.into(),
            stream: stream.into(),
            data,
        }
    }

    pub fn error(id: Option<String>, error: impl Into<String>) -> Self {
        Outbound::Error {
            id,
            success: false,
            error: error.into(),
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Outbound::Response { id, .. } | Outbound::Stream { id, .. } => Some(id),
            Outbound::Error { id, .. } => id.as_deref(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            json!({ "type": "error", "id": self.id(), "success": false, "error": e.to_string() })
                .to_string()
        })
    }
}

/// Queue feeding a connection's writer task.
pub type OutboundSender = mpsc::Sender<Outbound>;

// ----------------------------------------------------------------------------
// 12.3 Stream Emitter
// ----------------------------------------------------------------------------

/// Stamps chunks with the request id and stream name of one streaming
/// request and queues them for the writer. Queueing waits when the
/// connection is slow.
#[derive(Debug, Clone)]
pub struct StreamEmitter {
    id: String,
    stream: String,
    tx: OutboundSender,
}

impl StreamEmitter {
    pub fn new(id: impl Into<String>, stream: impl Into<String>, tx: OutboundSender) -> Self {
        Self {
            id: id.into(),
            stream: stream.into(),
            tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Queue `{kind, ...body}`. Non-object bodies are carried under `value`.
    /// Returns false once the connection is gone.
    pub async fn emit(&self, kind: &str, body: JsonValue) -> bool {
        let data = match body {
            JsonValue::Object(mut map) => {
                map.insert("kind".into(), JsonValue::String(kind.to_string()));
                JsonValue::Object(map)
            }
            other => json!({ "kind": kind, "value": other }),
        };
        self.tx
            .send(Outbound::chunk(&self.id, &self.stream, data))
            .await
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
