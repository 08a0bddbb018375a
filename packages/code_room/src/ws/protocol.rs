//! WebSocket Protocol Types
//!
//! Every frame is a JSON object `{"type": ..., "data": ...}`. Client frames are
//! decoded in two steps so that unknown kinds can be skipped while malformed
//! payloads of known kinds are reported.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SessionError;

/// First frame of a connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    /// The room the client believes it is joining (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Preferred language, used only when the room is created by this join
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Replace the half-open character range `[range_start, range_end)` of the
/// document at `base_version` with `text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edit {
    pub base_version: u64,
    pub range_start: usize,
    pub range_end: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub language: String,
    pub code: String,
}

/// Authoritative document state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocSnapshot {
    pub text: String,
    pub version: u64,
}

/// Reply to a successful join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitSnapshot {
    pub session_id: String,
    pub doc: DocSnapshot,
    pub language: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitReport {
    pub code: i32,
    pub timed_out: bool,
}

/// Frames sent FROM the client TO the server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Init(InitRequest),
    Edit(Edit),
    /// Requested language id
    Language(String),
    Run(RunRequest),
    /// Relayed to the other participants untouched
    Cursor(Value),
    /// Relayed to the other participants untouched
    Chat(Value),
}

/// Frames sent FROM the server TO the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    Init(InitSnapshot),
    Doc(DocSnapshot),
    Language(String),
    /// Incremental chunk, not the accumulated output
    Stdout(String),
    Stderr(String),
    Exit(ExitReport),
    /// Reason code, see [`SessionError::reason_code`]
    Error(String),
    Cursor(Value),
    Chat(Value),
}

impl ServerFrame {
    pub fn error(err: &SessionError) -> Self {
        ServerFrame::Error(err.reason_code().to_string())
    }

    /// Frame kind, used for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Init(_) => "init",
            ServerFrame::Doc(_) => "doc",
            ServerFrame::Language(_) => "language",
            ServerFrame::Stdout(_) => "stdout",
            ServerFrame::Stderr(_) => "stderr",
            ServerFrame::Exit(_) => "exit",
            ServerFrame::Error(_) => "error",
            ServerFrame::Cursor(_) => "cursor",
            ServerFrame::Chat(_) => "chat",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not a JSON object with a string `type`: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("malformed `{kind}` payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl From<FrameError> for SessionError {
    fn from(err: FrameError) -> Self {
        SessionError::InvalidRequest(err.to_string())
    }
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Decode one text frame from a client.
///
/// Returns `Ok(None)` for frame kinds this server does not know about.
pub fn decode_client_frame(text: &str) -> Result<Option<ClientFrame>, FrameError> {
    let raw: RawFrame = serde_json::from_str(text).map_err(FrameError::Envelope)?;

    let frame = match raw.kind.as_str() {
        "init" if raw.data.is_null() => ClientFrame::Init(InitRequest::default()),
        "init" => ClientFrame::Init(payload("init", raw.data)?),
        "edit" => ClientFrame::Edit(payload("edit", raw.data)?),
        "language" => ClientFrame::Language(payload("language", raw.data)?),
        "run" => ClientFrame::Run(payload("run", raw.data)?),
        "cursor" => ClientFrame::Cursor(raw.data),
        "chat" => ClientFrame::Chat(raw.data),
        _ => return Ok(None),
    };

    Ok(Some(frame))
}

fn payload<T: DeserializeOwned>(kind: &'static str, data: Value) -> Result<T, FrameError> {
    serde_json::from_value(data).map_err(|source| FrameError::Payload { kind, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_init() {
        let frame = decode_client_frame(
            r#"{"type":"init","data":{"sessionId":"room-1","language":"python"}}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            Some(ClientFrame::Init(InitRequest {
                session_id: Some("room-1".into()),
                language: Some("python".into()),
            }))
        );
    }

    #[test]
    fn test_decode_init_without_data() {
        let frame = decode_client_frame(r#"{"type":"init"}"#).unwrap();
        assert_eq!(frame, Some(ClientFrame::Init(InitRequest::default())));
    }

    #[test]
    fn test_decode_edit() {
        let frame = decode_client_frame(
            r#"{"type":"edit","data":{"baseVersion":0,"rangeStart":6,"rangeEnd":7,"text":"2"}}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            Some(ClientFrame::Edit(Edit {
                base_version: 0,
                range_start: 6,
                range_end: 7,
                text: "2".into(),
            }))
        );
    }

    #[test]
    fn test_decode_language_and_run() {
        assert_eq!(
            decode_client_frame(r#"{"type":"language","data":"java"}"#).unwrap(),
            Some(ClientFrame::Language("java".into()))
        );
        assert_eq!(
            decode_client_frame(
                r#"{"type":"run","data":{"language":"python","code":"print(1)"}}"#
            )
            .unwrap(),
            Some(ClientFrame::Run(RunRequest {
                language: "python".into(),
                code: "print(1)".into(),
            }))
        );
    }

    #[test]
    fn test_cursor_and_chat_pass_through() {
        let frame =
            decode_client_frame(r#"{"type":"cursor","data":{"line":3,"ch":7}}"#).unwrap();
        assert_eq!(frame, Some(ClientFrame::Cursor(json!({"line": 3, "ch": 7}))));

        let frame = decode_client_frame(r#"{"type":"chat","data":"hi"}"#).unwrap();
        assert_eq!(frame, Some(ClientFrame::Chat(json!("hi"))));
    }

    #[test]
    fn test_unknown_kind_is_ignored() {
        assert_eq!(
            decode_client_frame(r#"{"type":"telemetry","data":{"x":1}}"#).unwrap(),
            None
        );
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        let err = decode_client_frame(r#"{"type":"edit","data":{"baseVersion":"zero"}}"#)
            .unwrap_err();
        assert!(matches!(err, FrameError::Payload { kind: "edit", .. }));

        let err = decode_client_frame(r#"{"type":"edit","data":{"baseVersion":-1,"rangeStart":0,"rangeEnd":0,"text":""}}"#)
            .unwrap_err();
        assert!(matches!(err, FrameError::Payload { .. }));
    }

    #[test]
    fn test_not_json_is_an_error() {
        assert!(matches!(
            decode_client_frame("hello"),
            Err(FrameError::Envelope(_))
        ));
        assert!(matches!(
            decode_client_frame(r#"{"data":1}"#),
            Err(FrameError::Envelope(_))
        ));
    }

    #[test]
    fn test_frame_error_maps_to_invalid_request() {
        let err: SessionError = decode_client_frame("[]").unwrap_err().into();
        assert_eq!(err.reason_code(), "invalid_request");
    }

    #[test]
    fn test_encode_init_snapshot() {
        let frame = ServerFrame::Init(InitSnapshot {
            session_id: "room-1".into(),
            doc: DocSnapshot {
                text: "print(1)".into(),
                version: 0,
            },
            language: "python".into(),
        });
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "type": "init",
                "data": {
                    "sessionId": "room-1",
                    "doc": {"text": "print(1)", "version": 0},
                    "language": "python"
                }
            })
        );
    }

    #[test]
    fn test_encode_exit_and_error() {
        let exit = ServerFrame::Exit(ExitReport {
            code: -1,
            timed_out: true,
        });
        assert_eq!(
            serde_json::to_value(&exit).unwrap(),
            json!({"type": "exit", "data": {"code": -1, "timedOut": true}})
        );

        let error = ServerFrame::error(&SessionError::RunInProgress);
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"type": "error", "data": "run_in_progress"})
        );
    }

    #[test]
    fn test_encode_output_chunks() {
        assert_eq!(
            serde_json::to_string(&ServerFrame::Stdout("1\n".into())).unwrap(),
            r#"{"type":"stdout","data":"1\n"}"#
        );
        assert_eq!(ServerFrame::Stderr(String::new()).kind(), "stderr");
    }
}
