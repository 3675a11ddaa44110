//! Wire protocol
//!
//! JSON text frames, each an object tagged by `op`.
//!
//! ```text
//! C→S  hello {session_id?, token?}        S→C  hello_ack {ok, session_id, error?}
//! C→S  list_tools                         S→C  list_tools_res {tools}
//! C→S  call_tool {request_id, name, arguments}
//!                                         S→C  call_tool_ack {request_id, accepted, timeout, name}
//!                                         S→C  progress {request_id, name, t, note?}
//!                                         S→C  call_tool_res {request_id, outputs?, error?}
//! C→S  rotate_token {old, new}            S→C  rotate_token_res {ok, error?}
//! C→S  health                             S→C  health_res {sessions, inflight, capacity, uptime_secs}
//!                                         S→C  error {message}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::admission::Capacity;
use crate::error::ErrorBody;
use crate::tools::{OutputItem, ToolDescriptor};

/// Close codes sent when the handshake fails
pub mod close_code {
    /// Token did not match
    pub const UNAUTHORIZED: u16 = 4001;
    /// First frame was not a well-formed `hello`
    pub const INVALID_HELLO: u16 = 4002;
    /// First frame was some other operation
    pub const MISSING_HELLO: u16 = 4003;
    /// No frame arrived within the hello timeout
    pub const HELLO_TIMEOUT: u16 = 4004;
}

/// A frame that could not be turned into a [`ClientMessage`]
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Not JSON, not an object, or fields of the wrong shape
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Object without a recognised `op`
    #[error("unknown op '{0}'")]
    UnknownOp(String),
}

/// Client → server operations
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake
    Hello {
        /// Ignored; the server always mints its own id
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Shared secret
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Enumerate tools
    ListTools,
    /// Invoke a tool
    CallTool(CallToolRequest),
    /// Swap the shared secret
    RotateToken {
        /// Current token
        #[serde(default)]
        old: String,
        /// Replacement
        #[serde(default)]
        new: String,
    },
    /// Load summary
    Health,
}

/// Payload of `call_tool`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallToolRequest {
    /// Client-chosen id; minted when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Tool name
    pub name: String,
    /// Tool arguments
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

const OPS: [&str; 5] = ["hello", "list_tools", "call_tool", "rotate_token", "health"];

impl ClientMessage {
    /// Decode one text frame
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownOp`] for an unrecognised `op`, otherwise
    /// [`ProtocolError::Malformed`].
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let op = value
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing 'op'".into()))?;
        if !OPS.contains(&op) {
            return Err(ProtocolError::UnknownOp(op.to_string()));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Wire name of the operation
    pub fn op(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::ListTools => "list_tools",
            Self::CallTool(_) => "call_tool",
            Self::RotateToken { .. } => "rotate_token",
            Self::Health => "health",
        }
    }
}

/// Server → client messages
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake result
    HelloAck {
        /// Whether the session is open
        ok: bool,
        /// Server-issued session id
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Why the handshake failed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Registered tools
    ListToolsRes {
        /// Descriptors in registration order
        tools: Vec<ToolDescriptor>,
    },
    /// Heartbeat for a running call
    Progress {
        /// Call being reported
        request_id: String,
        /// Tool name
        name: String,
        /// Seconds since the call started
        t: f64,
        /// Human-readable status
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    /// Call admitted and started
    CallToolAck {
        /// Call id
        request_id: String,
        /// Always true; rejected calls get `call_tool_res` with an error
        accepted: bool,
        /// Hard deadline in seconds
        timeout: f64,
        /// Tool name
        name: String,
    },
    /// Terminal response for a call
    CallToolRes {
        /// Call id
        request_id: String,
        /// Normalised output on success
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outputs: Option<Vec<OutputItem>>,
        /// Failure description
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    /// Token rotation result
    RotateTokenRes {
        /// Whether the token changed
        ok: bool,
        /// Why not
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Load summary
    HealthRes {
        /// Live sessions
        sessions: usize,
        /// Calls holding a global permit
        inflight: usize,
        /// Configured caps
        capacity: Capacity,
        /// Seconds since the server started
        uptime_secs: f64,
    },
    /// Non-terminal protocol complaint
    Error {
        /// Description
        message: String,
    },
}

impl ServerMessage {
    /// Successful `call_tool_res`
    pub fn outputs(request_id: impl Into<String>, outputs: Vec<OutputItem>) -> Self {
        Self::CallToolRes {
            request_id: request_id.into(),
            outputs: Some(outputs),
            error: None,
        }
    }

    /// Failed `call_tool_res`
    pub fn call_error(request_id: impl Into<String>, error: ErrorBody) -> Self {
        Self::CallToolRes {
            request_id: request_id.into(),
            outputs: None,
            error: Some(error),
        }
    }

    /// Same message addressed to a different `request_id`
    ///
    /// Used when replaying a result cached under a call key.
    #[must_use]
    pub fn readdressed(self, request_id: &str) -> Self {
        match self {
            Self::CallToolRes { outputs, error, .. } => Self::CallToolRes {
                request_id: request_id.to_string(),
                outputs,
                error,
            },
            other => other,
        }
    }

    /// Encode as a JSON text frame
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to encode server message");
            r#"{"op":"error","message":"internal encoding error"}"#.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    #[test]
    fn test_parse_client_ops() {
        assert_eq!(
            ClientMessage::parse(r#"{"op":"hello","token":"t"}"#).unwrap(),
            ClientMessage::Hello {
                session_id: None,
                token: Some("t".into())
            }
        );
        assert_eq!(ClientMessage::parse(r#"{"op":"health"}"#).unwrap(), ClientMessage::Health);

        let call = ClientMessage::parse(r#"{"op":"call_tool","request_id":"r1","name":"chat"}"#).unwrap();
        let ClientMessage::CallTool(request) = call else {
            panic!("expected call_tool");
        };
        assert_eq!(request.request_id.as_deref(), Some("r1"));
        assert_eq!(request.arguments, json!({}));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(ClientMessage::parse("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(ClientMessage::parse(r#"{"no_op":1}"#), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            ClientMessage::parse(r#"{"op":"launch_rockets"}"#),
            Err(ProtocolError::UnknownOp(op)) if op == "launch_rockets"
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"op":"call_tool"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_server_message_shapes() {
        let ack = serde_json::to_value(ServerMessage::CallToolAck {
            request_id: "r1".into(),
            accepted: true,
            timeout: 90.0,
            name: "chat".into(),
        })
        .unwrap();
        assert_eq!(ack["op"], "call_tool_ack");
        assert_eq!(ack["timeout"], 90.0);

        let err = serde_json::to_value(ServerMessage::call_error(
            "r2",
            ErrorBody::new(ErrorCode::OverCapacity, "full"),
        ))
        .unwrap();
        assert_eq!(err, json!({"op": "call_tool_res", "request_id": "r2", "error": {"code": "OVER_CAPACITY", "message": "full"}}));

        let hello = serde_json::to_value(ServerMessage::HelloAck {
            ok: true,
            session_id: Some("s".into()),
            error: None,
        })
        .unwrap();
        assert!(hello.get("error").is_none());
    }

    #[test]
    fn test_readdressed_keeps_payload() {
        let original = ServerMessage::outputs("old", vec![OutputItem::text("x")]);
        assert_eq!(
            original.readdressed("new"),
            ServerMessage::outputs("new", vec![OutputItem::text("x")])
        );
    }
}
