//! Wire types for the command bridge.
//!
//! Every frame is one JSON document followed by `\n`. Clients send
//! [`Request`]s and receive exactly one [`Response`] per request id; responses
//! on a multiplexed connection may arrive in any order.

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Correlation token chosen by the client. Must be a JSON number or string.
pub type RequestId = Value;

/// Request sent by a client to invoke a registered command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Echoed back in the matching response.
    pub id: RequestId,
    /// Registered command name.
    pub command: String,
    /// Command-defined payload; the bridge never looks inside.
    #[serde(default = "empty_parameters")]
    pub parameters: Value,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, command: impl Into<String>, parameters: Value) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            parameters,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
}

/// Response written for each request. Exactly one of `result`/`error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// `None` only when the request was too broken to recover its id.
    pub id: Option<RequestId>,
    pub status: Status,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Response {
    /// A null handler result is reported as an empty object so `result` stays populated.
    pub fn success(id: RequestId, result: Value) -> Self {
        let result = match result {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        Self {
            id: Some(id),
            status: Status::Success,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: &BridgeError) -> Self {
        Self {
            id,
            status: Status::Failure,
            result: None,
            error: Some(error.wire_message()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// A frame that could not be turned into a [`Request`].
#[derive(Debug)]
pub struct Rejected {
    /// The id, when it could be recovered from the broken frame.
    pub id: Option<RequestId>,
    pub error: BridgeError,
}

impl Rejected {
    fn new(id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self {
            id,
            error: BridgeError::MalformedRequest(message.into()),
        }
    }
}

/// Decode one frame, recovering the id where possible so the error can be correlated.
pub fn decode_request(frame: &[u8]) -> Result<Request, Rejected> {
    let document: Value = serde_json::from_slice(frame)
        .map_err(|err| Rejected::new(None, format!("invalid JSON: {err}")))?;

    let Value::Object(mut fields) = document else {
        return Err(Rejected::new(None, "request must be a JSON object"));
    };

    let id = match fields.remove("id") {
        Some(id @ (Value::Number(_) | Value::String(_))) => id,
        Some(Value::Null) | None => return Err(Rejected::new(None, "missing request id")),
        Some(_) => return Err(Rejected::new(None, "request id must be a number or a string")),
    };

    let command = match fields.remove("command") {
        Some(Value::String(command)) if !command.trim().is_empty() => command,
        Some(Value::String(_)) => return Err(Rejected::new(Some(id), "command name is empty")),
        Some(_) => return Err(Rejected::new(Some(id), "command must be a string")),
        None => return Err(Rejected::new(Some(id), "missing command")),
    };

    let parameters = match fields.remove("parameters") {
        None | Some(Value::Null) => empty_parameters(),
        Some(parameters) => parameters,
    };

    Ok(Request {
        id,
        command,
        parameters,
    })
}

/// Serialize a response as a single frame, trailing newline included.
pub fn encode_response(response: &Response) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(response)?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn empty_parameters() -> Value {
    Value::Object(Map::new())
}
