use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use log::error;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use jukebox_collab::{
    AuthError, CollabError, DatabaseError, DjError, InputError, PlaybackError, QueueError,
    RoomError, VoteError,
};
use jukebox_core::StoreError;

pub type ServerResult<T> = Result<T, ServerError>;

/// Every failure a client can see, keyed by a stable kind tag.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("{message}")]
    UpstreamUnavailable {
        message: String,
        reason: &'static str,
    },
    #[error("Room is at member capacity")]
    RoomFull,
    #[error("Room is not active")]
    RoomInactive,
    #[error("Could not generate an unused room code")]
    RoomCodeExhausted,
    #[error("Internal error, correlation id {0}")]
    Internal(Uuid),
}

/// The wire shape of an error, shared by REST responses and gateway frames.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct ExceptionFrame {
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub context: Option<Value>,
}

impl ServerError {
    /// Wraps an unclassifiable error, logging it under a correlation id.
    pub fn internal<E: std::fmt::Display>(error: E) -> Self {
        let correlation_id = Uuid::new_v4();
        error!("Internal error {correlation_id}: {error}");

        Self::Internal(correlation_id)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InvalidInput(_) => "invalid_input",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::RoomFull => "room_full",
            Self::RoomInactive => "room_inactive",
            Self::RoomCodeExhausted => "room_code_exhausted",
            Self::Internal(_) => "internal",
        }
    }

    fn as_status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::RoomCodeExhausted => StatusCode::CONFLICT,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::RoomFull | Self::RoomInactive => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_frame(&self) -> ExceptionFrame {
        let context = match self {
            Self::UpstreamUnavailable { reason, .. } => {
                Some(serde_json::json!({ "reason": reason }))
            }
            Self::Internal(correlation_id) => {
                Some(serde_json::json!({ "correlation_id": correlation_id }))
            }
            _ => None,
        };

        ExceptionFrame {
            message_type: "exception",
            kind: self.kind(),
            message: self.to_string(),
            context,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (self.as_status_code(), Json(self.to_frame())).into_response()
    }
}

impl From<AuthError> for ServerError {
    fn from(value: AuthError) -> Self {
        match value {
            AuthError::InvalidCredentials => Self::Unauthorized(value.to_string()),
            AuthError::Db(e) => e.into(),
            e => Self::internal(e),
        }
    }
}

impl From<DatabaseError> for ServerError {
    fn from(value: DatabaseError) -> Self {
        match value {
            DatabaseError::NotFound { .. } => Self::NotFound(value.to_string()),
            DatabaseError::Conflict { .. } => Self::Conflict(value.to_string()),
            e => Self::internal(e),
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(value: StoreError) -> Self {
        Self::internal(value)
    }
}

impl From<RoomError> for ServerError {
    fn from(value: RoomError) -> Self {
        match value {
            RoomError::RoomNotFound(_) => Self::NotFound(value.to_string()),
            RoomError::RoomNotActive => Self::RoomInactive,
            RoomError::RoomFull => Self::RoomFull,
            RoomError::WrongPassword | RoomError::UserNotInRoom => {
                Self::Unauthorized(value.to_string())
            }
            RoomError::AlreadyMember => Self::Conflict(value.to_string()),
            RoomError::CodeSpaceExhausted => Self::RoomCodeExhausted,
            RoomError::InvalidSettings(_) => Self::InvalidInput(value.to_string()),
            RoomError::Database(e) => e.into(),
            RoomError::HashError(e) => Self::internal(e),
        }
    }
}

impl From<InputError> for ServerError {
    fn from(value: InputError) -> Self {
        let reason = match value {
            InputError::Invalid(_) => return Self::InvalidInput(value.to_string()),
            InputError::NotFound => "not_found",
            InputError::RateLimited => "rate_limited",
            InputError::QuotaExceeded => "quota_exceeded",
            InputError::Timeout => "timeout",
            InputError::FetchError(_) | InputError::ParseError(_) => "upstream_error",
        };

        Self::UpstreamUnavailable {
            message: value.to_string(),
            reason,
        }
    }
}

impl From<QueueError> for ServerError {
    fn from(value: QueueError) -> Self {
        match value {
            QueueError::EntryNotFound => Self::NotFound(value.to_string()),
            QueueError::OwnVote => Self::Conflict(value.to_string()),
            QueueError::NotAllowed => Self::Forbidden(value.to_string()),
            QueueError::Room(e) => e.into(),
            QueueError::Input(e) => e.into(),
            QueueError::Store(e) => e.into(),
            QueueError::Database(e) => e.into(),
        }
    }
}

impl From<VoteError> for ServerError {
    fn from(value: VoteError) -> Self {
        match value {
            VoteError::NoPendingVote => Self::NotFound(value.to_string()),
            VoteError::NotEligible | VoteError::DjCannotMutiny => {
                Self::Forbidden(value.to_string())
            }
            VoteError::InvalidChoice => Self::InvalidInput(value.to_string()),
            VoteError::VoteInProgress
            | VoteError::AlreadyVoted
            | VoteError::NeedsMoreMembers
            | VoteError::NoDjToMutiny
            | VoteError::MutinyCooldown
            | VoteError::Contention => Self::Conflict(value.to_string()),
            VoteError::Room(e) => e.into(),
            VoteError::Store(e) => e.into(),
            VoteError::Dj(e) => e.into(),
        }
    }
}

impl From<DjError> for ServerError {
    fn from(value: DjError) -> Self {
        match value {
            DjError::NotOwner | DjError::NotAllowed => Self::Forbidden(value.to_string()),
            DjError::TargetNotInRoom => Self::NotFound(value.to_string()),
            DjError::OnCooldown | DjError::SlotContention => Self::Conflict(value.to_string()),
            DjError::Room(e) => e.into(),
            DjError::Store(e) => e.into(),
            DjError::Database(e) => e.into(),
            DjError::Playback(e) => e.into(),
        }
    }
}

impl From<PlaybackError> for ServerError {
    fn from(value: PlaybackError) -> Self {
        match value {
            PlaybackError::NotDriver => Self::Forbidden(value.to_string()),
            PlaybackError::EntryNotFound | PlaybackError::NothingPlaying => {
                Self::NotFound(value.to_string())
            }
            PlaybackError::Room(e) => e.into(),
            PlaybackError::Store(e) => e.into(),
            PlaybackError::Queue(e) => e.into(),
        }
    }
}

impl From<CollabError> for ServerError {
    fn from(value: CollabError) -> Self {
        match value {
            CollabError::InvalidMessage(message) => Self::InvalidInput(message),
            CollabError::Room(e) => e.into(),
            CollabError::Queue(e) => e.into(),
            CollabError::Vote(e) => e.into(),
            CollabError::Dj(e) => e.into(),
            CollabError::Playback(e) => e.into(),
            CollabError::Store(e) => e.into(),
            CollabError::Database(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_stable() {
        let cases: Vec<(ServerError, &str)> = vec![
            (ServerError::Unauthorized("".into()), "unauthorized"),
            (ServerError::Forbidden("".into()), "forbidden"),
            (ServerError::NotFound("".into()), "not_found"),
            (ServerError::Conflict("".into()), "conflict"),
            (ServerError::InvalidInput("".into()), "invalid_input"),
            (ServerError::RoomFull, "room_full"),
            (ServerError::RoomInactive, "room_inactive"),
            (ServerError::RoomCodeExhausted, "room_code_exhausted"),
        ];

        for (error, kind) in cases {
            assert_eq!(error.kind(), kind);
        }
    }

    #[test]
    fn test_upstream_failures_carry_a_reason() {
        let error: ServerError = InputError::NotFound.into();

        let frame = error.to_frame();
        assert_eq!(frame.kind, "upstream_unavailable");
        assert_eq!(
            frame.context,
            Some(serde_json::json!({ "reason": "not_found" }))
        );

        let error: ServerError = InputError::Invalid("no scheme".into()).into();
        assert_eq!(error.kind(), "invalid_input", "bad URLs are client errors");
    }
}
