//! Session-level error taxonomy.
//!
//! Every variant is recoverable: the server reports it to the participant as
//! an `error` frame carrying [`SessionError::reason_code`] and keeps going.
//! Only `RoomFull` also ends the participant's connection. A run that hits its
//! deadline is not an error; it is reported through an `exit` frame.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("room is full")]
    RoomFull,

    #[error("edit was based on version {base} but the document is at {current}")]
    VersionMismatch { base: u64, current: u64 },

    #[error("language '{0}' cannot be executed")]
    ExecutionUnavailable(String),

    #[error("a run is already in progress")]
    RunInProgress,

    #[error("edit range {start}..{end} is outside a document of {len} characters")]
    InvalidEdit { start: usize, end: usize, len: usize },

    #[error("document would grow to {size} bytes (limit {limit})")]
    DocumentTooLarge { size: usize, limit: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("connection has not joined a room yet")]
    NotJoined,

    #[error("connection already joined this room")]
    AlreadyJoined,

    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Wire reason code sent in `error` frames
    pub fn reason_code(&self) -> &'static str {
        match self {
            SessionError::RoomFull => "room_full",
            SessionError::VersionMismatch { .. } => "version_mismatch",
            SessionError::ExecutionUnavailable(_) => "execution_unavailable",
            SessionError::RunInProgress => "run_in_progress",
            SessionError::InvalidEdit { .. } => "invalid_edit",
            SessionError::DocumentTooLarge { .. } => "document_too_large",
            SessionError::InvalidRequest(_) => "invalid_request",
            SessionError::NotJoined => "not_joined",
            SessionError::AlreadyJoined => "already_joined",
            SessionError::Internal(_) => "internal_error",
        }
    }

    /// Whether the participant loses its place in the room
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::RoomFull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_match_wire_names() {
        assert_eq!(SessionError::RoomFull.reason_code(), "room_full");
        assert_eq!(
            SessionError::VersionMismatch {
                base: 1,
                current: 0
            }
            .reason_code(),
            "version_mismatch"
        );
        assert_eq!(
            SessionError::ExecutionUnavailable("markdown".into()).reason_code(),
            "execution_unavailable"
        );
        assert_eq!(SessionError::RunInProgress.reason_code(), "run_in_progress");
        assert_eq!(
            SessionError::Internal("boom".into()).reason_code(),
            "internal_error"
        );
    }

    #[test]
    fn only_room_full_is_fatal() {
        assert!(SessionError::RoomFull.is_fatal());
        assert!(!SessionError::RunInProgress.is_fatal());
        assert!(!SessionError::InvalidRequest("x".into()).is_fatal());
    }

    #[test]
    fn display_is_human_readable() {
        let err = SessionError::VersionMismatch {
            base: 1,
            current: 0,
        };
        assert_eq!(
            err.to_string(),
            "edit was based on version 1 but the document is at 0"
        );
    }
}
