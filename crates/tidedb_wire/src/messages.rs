//! Request, response, and server-push message shapes.
//!
//! The backend speaks a JSON envelope protocol: client requests carry a
//! request number, an action code, and a body; responses correlate by
//! request number and carry a status plus data; asynchronous pushes carry
//! an action and body without a request number. Data and control messages
//! share an outer `{"t": ..., "d": ...}` envelope.

use crate::error::{WireError, WireResult};
use tidedb_core::{Node, Path};

/// Actions a client request can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    /// Start a (possibly tagged) listen.
    Listen,
    /// Stop a listen.
    Unlisten,
    /// Overwrite data at a path.
    Put,
    /// Merge children at a path.
    Merge,
    /// One-shot read.
    Get,
    /// Register a put to run when the connection drops.
    OnDisconnectPut,
    /// Register a merge to run when the connection drops.
    OnDisconnectMerge,
    /// Cancel on-disconnect registrations at a path.
    OnDisconnectCancel,
    /// Present an auth credential.
    Auth,
    /// Clear the auth credential.
    Unauth,
    /// Present an app-check credential.
    AppCheck,
    /// Report client stats.
    Stats,
}

impl Action {
    /// The wire code for this action.
    pub fn code(&self) -> &'static str {
        match self {
            Action::Listen => "q",
            Action::Unlisten => "n",
            Action::Put => "p",
            Action::Merge => "m",
            Action::Get => "g",
            Action::OnDisconnectPut => "o",
            Action::OnDisconnectMerge => "om",
            Action::OnDisconnectCancel => "oc",
            Action::Auth => "auth",
            Action::Unauth => "unauth",
            Action::AppCheck => "appcheck",
            Action::Stats => "s",
        }
    }
}

/// Status codes the backend returns for requests and revocations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// Request succeeded.
    Ok,
    /// Security rules rejected the request.
    PermissionDenied,
    /// The hash sent with a conditional put no longer matches.
    DataStale,
    /// The write was canceled by a disconnect.
    Disconnect,
    /// The presented token has expired.
    ExpiredToken,
    /// The presented token was rejected.
    InvalidToken,
    /// The request payload was too large.
    TooBig,
    /// Local-only: no connection was available in time.
    Offline,
    /// Any other backend status.
    Other(String),
}

impl Status {
    /// Parses a wire status string.
    pub fn from_wire(s: &str) -> Status {
        match s {
            "ok" => Status::Ok,
            "permission_denied" => Status::PermissionDenied,
            "datastale" => Status::DataStale,
            "disconnect" => Status::Disconnect,
            "expired_token" => Status::ExpiredToken,
            "invalid_token" => Status::InvalidToken,
            "too_big" => Status::TooBig,
            other => Status::Other(other.to_owned()),
        }
    }

    /// The wire string for this status.
    pub fn as_wire(&self) -> &str {
        match self {
            Status::Ok => "ok",
            Status::PermissionDenied => "permission_denied",
            Status::DataStale => "datastale",
            Status::Disconnect => "disconnect",
            Status::ExpiredToken => "expired_token",
            Status::InvalidToken => "invalid_token",
            Status::TooBig => "too_big",
            Status::Offline => "offline",
            Status::Other(s) => s,
        }
    }

    /// True for the success status.
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// True for the conditional-write conflict status.
    pub fn is_stale(&self) -> bool {
        matches!(self, Status::DataStale)
    }

    /// True when the status invalidates the presented credential.
    pub fn is_token_failure(&self) -> bool {
        matches!(self, Status::ExpiredToken | Status::InvalidToken)
    }
}

/// A numbered client request.
#[derive(Clone, Debug)]
pub struct Request {
    /// Request number, unique per connection.
    pub number: u64,
    /// The action to perform.
    pub action: Action,
    /// Action-specific body.
    pub body: serde_json::Value,
}

impl Request {
    /// Builds a request.
    pub fn new(number: u64, action: Action, body: serde_json::Value) -> Self {
        Self {
            number,
            action,
            body,
        }
    }

    /// The full wire form, including the data-envelope wrapper.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "t": "d",
            "d": {
                "r": self.number,
                "a": self.action.code(),
                "b": self.body,
            }
        })
    }
}

/// A response correlated to a request by number.
#[derive(Clone, Debug)]
pub struct Response {
    /// The request number this responds to.
    pub number: u64,
    /// Backend status.
    pub status: Status,
    /// Status-specific data (error detail or read result).
    pub data: serde_json::Value,
}

/// One update inside a range merge.
#[derive(Clone, Debug, PartialEq)]
pub struct RangeMergeUpdate {
    /// Exclusive lower boundary path, or unbounded.
    pub start: Option<Path>,
    /// Inclusive upper boundary path, or unbounded.
    pub end: Option<Path>,
    /// Replacement data for the range.
    pub node: Node,
}

/// An asynchronous server push.
#[derive(Clone, Debug)]
pub enum ServerPush {
    /// Authoritative data for a path (overwrite or merge).
    DataUpdate {
        /// Location the update applies to.
        path: Path,
        /// Update payload.
        data: serde_json::Value,
        /// True for a merge of children, false for an overwrite.
        is_merge: bool,
        /// Query tag for query-scoped pushes.
        tag: Option<u64>,
    },
    /// A merge of path ranges, used for partial hash mismatches.
    RangeMerge {
        /// Location the merge applies to.
        path: Path,
        /// Ordered range updates.
        updates: Vec<RangeMergeUpdate>,
        /// Query tag for query-scoped pushes.
        tag: Option<u64>,
    },
    /// The server revoked a listen (e.g. permission change).
    ListenRevoked {
        /// Location of the revoked listen.
        path: Path,
        /// Raw query descriptions, when provided.
        queries: Option<serde_json::Value>,
    },
    /// The auth credential was revoked.
    AuthRevoked {
        /// Revocation status.
        status: Status,
        /// Human-readable reason.
        reason: String,
    },
    /// The app-check credential was revoked.
    AppCheckRevoked {
        /// Revocation status.
        status: Status,
        /// Human-readable reason.
        reason: String,
    },
    /// Security-rules debug information; log only.
    SecurityDebug {
        /// Debug message text.
        message: String,
    },
}

/// A control message from the server.
#[derive(Clone, Debug)]
pub enum ControlMessage {
    /// Connection established; carries the server clock and session id.
    Hello {
        /// Server timestamp in milliseconds.
        timestamp_ms: f64,
        /// Session identifier.
        session_id: String,
        /// Host to use for subsequent connections.
        host: Option<String>,
    },
    /// The server asks the client to reconnect, possibly to another host.
    Reset {
        /// Host to reconnect to.
        host: Option<String>,
    },
    /// The server is shutting the connection down permanently.
    Shutdown {
        /// Reason for the shutdown.
        reason: String,
    },
}

/// Any inbound server message.
#[derive(Clone, Debug)]
pub enum ServerMessage {
    /// A response to a numbered request.
    Response(Response),
    /// An asynchronous push.
    Push(ServerPush),
    /// A connection-level control message.
    Control(ControlMessage),
}

/// Parses a raw inbound frame into a server message.
pub fn parse_server_message(frame: &serde_json::Value) -> WireResult<ServerMessage> {
    let envelope_type = frame
        .get("t")
        .and_then(|v| v.as_str())
        .ok_or_else(|| WireError::Malformed("missing envelope type".into()))?;
    let body = frame
        .get("d")
        .ok_or_else(|| WireError::Malformed("missing envelope body".into()))?;
    match envelope_type {
        "d" => parse_data_message(body),
        "c" => parse_control_message(body).map(ServerMessage::Control),
        other => Err(WireError::Malformed(format!(
            "unknown envelope type {other:?}"
        ))),
    }
}

fn parse_data_message(body: &serde_json::Value) -> WireResult<ServerMessage> {
    if let Some(number) = body.get("r").and_then(|v| v.as_u64()) {
        let response = body
            .get("b")
            .ok_or_else(|| WireError::Malformed("response without body".into()))?;
        let status = response
            .get("s")
            .and_then(|v| v.as_str())
            .map(Status::from_wire)
            .ok_or_else(|| WireError::Malformed("response without status".into()))?;
        let data = response
            .get("d")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        return Ok(ServerMessage::Response(Response {
            number,
            status,
            data,
        }));
    }

    let action = body
        .get("a")
        .and_then(|v| v.as_str())
        .ok_or_else(|| WireError::Malformed("push without action".into()))?;
    let push_body = body
        .get("b")
        .ok_or_else(|| WireError::Malformed("push without body".into()))?;
    let push = match action {
        "d" | "m" => ServerPush::DataUpdate {
            path: push_path(push_body)?,
            data: push_body
                .get("d")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
            is_merge: action == "m",
            tag: push_body.get("t").and_then(|v| v.as_u64()),
        },
        "rm" => ServerPush::RangeMerge {
            path: push_path(push_body)?,
            updates: parse_range_merge(push_body)?,
            tag: push_body.get("t").and_then(|v| v.as_u64()),
        },
        "c" => ServerPush::ListenRevoked {
            path: push_path(push_body)?,
            queries: push_body.get("q").cloned(),
        },
        "ac" => ServerPush::AuthRevoked {
            status: revocation_status(push_body),
            reason: revocation_reason(push_body),
        },
        "apc" => ServerPush::AppCheckRevoked {
            status: revocation_status(push_body),
            reason: revocation_reason(push_body),
        },
        "sd" => ServerPush::SecurityDebug {
            message: push_body
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_owned(),
        },
        other => {
            return Err(WireError::Malformed(format!(
                "unknown push action {other:?}"
            )))
        }
    };
    Ok(ServerMessage::Push(push))
}

fn push_path(body: &serde_json::Value) -> WireResult<Path> {
    body.get("p")
        .and_then(|v| v.as_str())
        .map(Path::new)
        .ok_or_else(|| WireError::Malformed("push without path".into()))
}

fn revocation_status(body: &serde_json::Value) -> Status {
    body.get("s")
        .and_then(|v| v.as_str())
        .map(Status::from_wire)
        .unwrap_or(Status::PermissionDenied)
}

fn revocation_reason(body: &serde_json::Value) -> String {
    body.get("d")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_owned()
}

fn parse_range_merge(body: &serde_json::Value) -> WireResult<Vec<RangeMergeUpdate>> {
    let items = body
        .get("d")
        .and_then(|v| v.as_array())
        .ok_or_else(|| WireError::Malformed("range merge without updates".into()))?;
    items
        .iter()
        .map(|item| {
            let start = item.get("s").and_then(|v| v.as_str()).map(Path::new);
            let end = item.get("e").and_then(|v| v.as_str()).map(Path::new);
            let node = item
                .get("m")
                .map(Node::from_json)
                .ok_or_else(|| WireError::Malformed("range update without data".into()))?;
            Ok(RangeMergeUpdate { start, end, node })
        })
        .collect()
}

fn parse_control_message(body: &serde_json::Value) -> WireResult<ControlMessage> {
    let kind = body
        .get("t")
        .and_then(|v| v.as_str())
        .ok_or_else(|| WireError::Malformed("control without type".into()))?;
    let data = body.get("d").cloned().unwrap_or(serde_json::Value::Null);
    match kind {
        "h" => Ok(ControlMessage::Hello {
            timestamp_ms: data.get("ts").and_then(|v| v.as_f64()).unwrap_or(0.0),
            session_id: data
                .get("s")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_owned(),
            host: data
                .get("h")
                .and_then(|v| v.as_str())
                .map(str::to_owned),
        }),
        "r" => Ok(ControlMessage::Reset {
            host: data.as_str().map(str::to_owned),
        }),
        "s" => Ok(ControlMessage::Shutdown {
            reason: data.as_str().unwrap_or_default().to_owned(),
        }),
        other => Err(WireError::Malformed(format!(
            "unknown control type {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_form() {
        let req = Request::new(7, Action::Put, serde_json::json!({"p": "/x", "d": 1}));
        let wire = req.to_wire();
        assert_eq!(wire["t"], "d");
        assert_eq!(wire["d"]["r"], 7);
        assert_eq!(wire["d"]["a"], "p");
        assert_eq!(wire["d"]["b"]["p"], "/x");
    }

    #[test]
    fn response_parsing() {
        let frame = serde_json::json!({
            "t": "d",
            "d": {"r": 3, "b": {"s": "ok", "d": null}}
        });
        match parse_server_message(&frame).unwrap() {
            ServerMessage::Response(r) => {
                assert_eq!(r.number, 3);
                assert!(r.status.is_ok());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn data_update_push() {
        let frame = serde_json::json!({
            "t": "d",
            "d": {"a": "d", "b": {"p": "/rooms/a", "d": {"name": "x"}, "t": 4}}
        });
        match parse_server_message(&frame).unwrap() {
            ServerMessage::Push(ServerPush::DataUpdate {
                path,
                is_merge,
                tag,
                ..
            }) => {
                assert_eq!(path, Path::new("/rooms/a"));
                assert!(!is_merge);
                assert_eq!(tag, Some(4));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn range_merge_push() {
        let frame = serde_json::json!({
            "t": "d",
            "d": {"a": "rm", "b": {"p": "/x", "d": [
                {"s": "/a", "e": "/b", "m": {"k": 1}},
                {"m": 2}
            ]}}
        });
        match parse_server_message(&frame).unwrap() {
            ServerMessage::Push(ServerPush::RangeMerge { updates, .. }) => {
                assert_eq!(updates.len(), 2);
                assert_eq!(updates[0].start, Some(Path::new("/a")));
                assert!(updates[1].start.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn control_messages() {
        let hello = serde_json::json!({
            "t": "c",
            "d": {"t": "h", "d": {"ts": 1000.0, "s": "abc", "h": "host1"}}
        });
        match parse_server_message(&hello).unwrap() {
            ServerMessage::Control(ControlMessage::Hello {
                timestamp_ms,
                session_id,
                host,
            }) => {
                assert_eq!(timestamp_ms, 1000.0);
                assert_eq!(session_id, "abc");
                assert_eq!(host.as_deref(), Some("host1"));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let reset = serde_json::json!({"t": "c", "d": {"t": "r", "d": "host2"}});
        assert!(matches!(
            parse_server_message(&reset).unwrap(),
            ServerMessage::Control(ControlMessage::Reset { .. })
        ));
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(parse_server_message(&serde_json::json!({})).is_err());
        assert!(parse_server_message(&serde_json::json!({"t": "x", "d": {}})).is_err());
        assert!(
            parse_server_message(&serde_json::json!({"t": "d", "d": {"a": "??", "b": {}}}))
                .is_err()
        );
    }

    #[test]
    fn status_round_trip() {
        for s in ["ok", "permission_denied", "datastale", "disconnect"] {
            assert_eq!(Status::from_wire(s).as_wire(), s);
        }
        assert!(Status::from_wire("datastale").is_stale());
        assert!(Status::from_wire("expired_token").is_token_failure());
    }
}
